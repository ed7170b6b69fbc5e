//! The privileged side of the bridge: file dialogs, file reads, script catalogue and
//! process lifecycle. A [`HostHandler`] only ever sees decoded [`HostRequest`]s; the
//! relays in [`crate::relay`] take care of envelopes.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{HostFailure, HostFailureKind};
use crate::message::{FileRef, HostRequest, LoadFilesParams, LoadedFile, ScriptCatalogue};

pub const SCRIPT_EXTENSION: &str = "rhai";

#[async_trait]
pub trait HostHandler: Send + Sync + 'static {
    /// Files the user picked. An empty list means the dialog was dismissed.
    async fn pick_files(&self) -> Result<Vec<FileRef>, HostFailure>;
    /// Contents of the directories the user picked, expanded to files.
    async fn pick_directories(&self) -> Result<Vec<FileRef>, HostFailure>;
    async fn load_files(&self, params: LoadFilesParams) -> Result<Vec<LoadedFile>, HostFailure>;
    async fn request_scripts(&self) -> Result<ScriptCatalogue, HostFailure>;
    /// Begin process termination. Nothing is returned to the caller.
    async fn exit_app(&self);

    async fn handle(&self, request: HostRequest) -> Result<Value, HostFailure> {
        let value = match request {
            HostRequest::PickFiles => to_value(self.pick_files().await?)?,
            HostRequest::PickDirectories => to_value(self.pick_directories().await?)?,
            HostRequest::LoadFiles(params) => to_value(self.load_files(params).await?)?,
            HostRequest::RequestScripts => to_value(self.request_scripts().await?)?,
            HostRequest::ExitApp => {
                self.exit_app().await;
                Value::Null
            }
        };
        Ok(value)
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, HostFailure> {
    serde_json::to_value(value).map_err(|e| HostFailure::new(HostFailureKind::Internal, e.to_string()))
}

/// What a non-interactive host answers to the pick dialogs.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub files: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// Every `*.rhai` file in the directory, keyed by file stem.
    Dir(PathBuf),
    Inline(ScriptCatalogue),
}

/// Filesystem-backed host. Dialog answers come from a preset [`Selection`].
#[derive(Debug, Clone)]
pub struct FsHost {
    selection: Selection,
    scripts: ScriptSource,
    shutdown: CancellationToken,
}

impl FsHost {
    pub fn new(selection: Selection, scripts: ScriptSource) -> Self {
        Self {
            selection,
            scripts,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled once `exit-app` has been handled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

fn file_ref(path: &Path) -> FileRef {
    FileRef {
        filepath: path.to_string_lossy().into_owned(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, HostFailure> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| HostFailure::io(format!("cannot read {}: {e}", dir.display())))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| HostFailure::io(format!("cannot read {}: {e}", dir.display())))?
    {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn file_metadata(path: &Path) -> Map<String, Value> {
    let mut meta = Map::new();
    match tokio::fs::metadata(path).await {
        Ok(m) => {
            meta.insert("size".into(), json!(m.len()));
            if let Some(secs) = m
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
            {
                meta.insert("modified".into(), json!(secs));
            }
        }
        Err(e) => warn!(path = %path.display(), "no metadata: {e}"),
    }
    meta
}

#[async_trait]
impl HostHandler for FsHost {
    async fn pick_files(&self) -> Result<Vec<FileRef>, HostFailure> {
        Ok(self.selection.files.iter().map(|p| file_ref(p)).collect())
    }

    async fn pick_directories(&self) -> Result<Vec<FileRef>, HostFailure> {
        let mut refs = Vec::new();
        for dir in &self.selection.directories {
            refs.extend(list_files(dir).await?.iter().map(|p| file_ref(p)));
        }
        Ok(refs)
    }

    async fn load_files(&self, params: LoadFilesParams) -> Result<Vec<LoadedFile>, HostFailure> {
        if let Some(encoding) = &params.options.encoding {
            let enc = encoding.to_ascii_lowercase();
            if enc != "utf-8" && enc != "utf8" {
                return Err(HostFailure::new(
                    HostFailureKind::Unsupported,
                    format!("encoding `{encoding}` is not supported"),
                ));
            }
        }

        let mut loaded = Vec::with_capacity(params.filepaths.len());
        for filepath in params.filepaths {
            let path = PathBuf::from(&filepath);
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| HostFailure::io(format!("cannot read {filepath}: {e}")))?;
            let reference = file_ref(&path);
            loaded.push(LoadedFile {
                filepath,
                filename: reference.filename,
                metadata: file_metadata(&path).await,
                data,
                extension: extension_of(&path),
            });
        }
        info!(count = loaded.len(), "loaded files");
        Ok(loaded)
    }

    async fn request_scripts(&self) -> Result<ScriptCatalogue, HostFailure> {
        match &self.scripts {
            ScriptSource::Inline(catalogue) => Ok(catalogue.clone()),
            ScriptSource::Dir(dir) => {
                let mut catalogue = ScriptCatalogue::new();
                for path in list_files(dir).await? {
                    if extension_of(&path) != SCRIPT_EXTENSION {
                        continue;
                    }
                    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                        continue;
                    };
                    let source = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| HostFailure::io(format!("cannot read {}: {e}", path.display())))?;
                    catalogue.insert(stem, source);
                }
                Ok(catalogue)
            }
        }
    }

    async fn exit_app(&self) {
        info!("exit requested");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LoadOptions;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn directories_expand_to_sorted_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), "x").unwrap();
        fs::write(dir.path().join("a.csv"), "y").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let host = FsHost::new(
            Selection { files: vec![], directories: vec![dir.path().to_path_buf()] },
            ScriptSource::Inline(ScriptCatalogue::new()),
        );
        let refs = host.pick_directories().await.unwrap();
        let names: Vec<_> = refs.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
    }

    #[tokio::test]
    async fn load_files_reads_contents_and_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.CSV");
        fs::write(&path, ",a\nr1,1\n").unwrap();

        let host = FsHost::new(Selection::default(), ScriptSource::Inline(ScriptCatalogue::new()));
        let loaded = host
            .load_files(LoadFilesParams {
                filepaths: vec![path.to_string_lossy().into_owned()],
                options: LoadOptions::default(),
            })
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].filename, "flows.CSV");
        assert_eq!(loaded[0].extension, "csv");
        assert_eq!(loaded[0].data, ",a\nr1,1\n");
        assert_eq!(loaded[0].metadata["size"], json!(8));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_failure() {
        let host = FsHost::new(Selection::default(), ScriptSource::Inline(ScriptCatalogue::new()));
        let err = host
            .load_files(LoadFilesParams {
                filepaths: vec!["/definitely/not/here.csv".into()],
                options: LoadOptions::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, HostFailureKind::Io);

        let err = host
            .load_files(LoadFilesParams {
                filepaths: vec![],
                options: LoadOptions { encoding: Some("latin-1".into()) },
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, HostFailureKind::Unsupported);
    }

    #[tokio::test]
    async fn script_dir_is_keyed_by_stem() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("df.rhai"), "let DFS = #{};").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let host = FsHost::new(Selection::default(), ScriptSource::Dir(dir.path().to_path_buf()));
        let catalogue = host.request_scripts().await.unwrap();
        assert_eq!(catalogue.len(), 1);
        assert_eq!(catalogue["df"], "let DFS = #{};");
    }

    #[tokio::test]
    async fn exit_cancels_shutdown_token() {
        let host = FsHost::new(Selection::default(), ScriptSource::Inline(ScriptCatalogue::new()));
        let token = host.shutdown_token();
        assert!(!token.is_cancelled());
        let v = host.handle(HostRequest::ExitApp).await.unwrap();
        assert_eq!(v, Value::Null);
        assert!(token.is_cancelled());
    }
}

//! Typed client for the privileged host. Every call goes through the shared
//! [`CorrelationChannel`], so replies are matched by id and bounded by its timeout.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::correlation::CorrelationChannel;
use crate::error::BridgeError;
use crate::message::{FileRef, HostAction, LoadOptions, LoadedFile, ScriptCatalogue};

/// Source id the client stamps on its requests unless told otherwise.
pub const DEFAULT_SOURCE: &str = "dataviser";

/// A reusable `(args) -> reply` closure bound to one `(source, action)` pair.
pub type RequestSender = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BridgeError>> + Send + Sync>;

#[derive(Clone)]
pub struct BridgeClient {
    channel: Arc<CorrelationChannel>,
    source: String,
}

impl BridgeClient {
    pub fn new(channel: Arc<CorrelationChannel>) -> Self {
        Self::with_source(channel, DEFAULT_SOURCE)
    }

    pub fn with_source(channel: Arc<CorrelationChannel>, source: impl Into<String>) -> Self {
        Self {
            channel,
            source: source.into(),
        }
    }

    pub fn channel(&self) -> &Arc<CorrelationChannel> {
        &self.channel
    }

    /// Bind `(source, action)` once and reuse the closure for every call.
    pub fn request_sender(&self, action: HostAction) -> RequestSender {
        let channel = Arc::clone(&self.channel);
        let source = self.source.clone();
        let action = action.to_string();
        Arc::new(move |args: Value| {
            let channel = Arc::clone(&channel);
            let source = source.clone();
            let action = action.clone();
            Box::pin(async move { channel.send(&source, &action, args).await })
        })
    }

    async fn call<T: DeserializeOwned>(&self, action: HostAction, args: Value) -> Result<T, BridgeError> {
        let reply = self.channel.send(&self.source, action.as_ref(), args).await?;
        serde_json::from_value(reply)
            .map_err(|e| BridgeError::Protocol(format!("`{action}` reply has the wrong shape: {e}")))
    }

    /// Files chosen in the host's dialog. Nothing chosen is [`BridgeError::Cancelled`].
    pub async fn pick_files(&self) -> Result<Vec<FileRef>, BridgeError> {
        non_empty(self.call(HostAction::PickFiles, Value::Null).await?)
    }

    pub async fn pick_directories(&self) -> Result<Vec<FileRef>, BridgeError> {
        non_empty(self.call(HostAction::PickDirectories, Value::Null).await?)
    }

    pub async fn load_files(&self, filepaths: Vec<String>, options: LoadOptions) -> Result<Vec<LoadedFile>, BridgeError> {
        let count = filepaths.len();
        let files: Vec<LoadedFile> = self
            .call(HostAction::LoadFiles, json!({ "filepaths": filepaths, "options": options }))
            .await?;
        if files.len() != count {
            return Err(BridgeError::Protocol(format!(
                "asked for {count} files, host returned {}",
                files.len()
            )));
        }
        Ok(files)
    }

    pub async fn request_scripts(&self) -> Result<ScriptCatalogue, BridgeError> {
        self.call(HostAction::RequestScripts, Value::Null).await
    }

    /// Ask the host to terminate. There is no reply to wait for.
    pub fn exit_app(&self) {
        debug!("sending exit-app");
        self.channel.notify(&self.source, HostAction::ExitApp.as_ref(), Value::Null);
    }
}

fn non_empty(files: Vec<FileRef>) -> Result<Vec<FileRef>, BridgeError> {
    if files.is_empty() {
        Err(BridgeError::Cancelled)
    } else {
        Ok(files)
    }
}

/// Anything that can hand out the script catalogue.
#[async_trait]
pub trait CatalogueProvider: Send + Sync {
    async fn scripts(&self) -> Result<ScriptCatalogue, BridgeError>;
}

#[async_trait]
impl CatalogueProvider for BridgeClient {
    async fn scripts(&self) -> Result<ScriptCatalogue, BridgeError> {
        self.request_scripts().await
    }
}

#[async_trait]
impl CatalogueProvider for ScriptCatalogue {
    async fn scripts(&self) -> Result<ScriptCatalogue, BridgeError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::Bus;
    use crate::host::{FsHost, ScriptSource, Selection};
    use crate::relay::Relay;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn client_for(selection: Selection) -> (BridgeClient, Relay, Arc<FsHost>) {
        let bus = Bus::new(64);
        let host = Arc::new(FsHost::new(selection, ScriptSource::Inline(ScriptCatalogue::new())));
        let relay = Relay::in_process(bus.clone(), "relay", host.clone());
        let channel = CorrelationChannel::new(bus, "relay", Some(Duration::from_secs(2)));
        (BridgeClient::new(channel), relay, host)
    }

    #[tokio::test]
    async fn empty_pick_is_cancelled_not_io() {
        let (client, _relay, _) = client_for(Selection::default());
        assert!(matches!(client.pick_files().await, Err(BridgeError::Cancelled)));
        assert!(matches!(client.pick_directories().await, Err(BridgeError::Cancelled)));
    }

    #[tokio::test]
    async fn unreadable_file_is_io() {
        let (client, _relay, _) = client_for(Selection::default());
        let err = client
            .load_files(vec!["/nonexistent/x.csv".into()], LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn pick_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.csv");
        fs::write(&path, ",A\nr1,2\n").unwrap();
        let (client, _relay, _) = client_for(Selection { files: vec![path.clone()], directories: vec![] });

        let picked = client.pick_files().await.unwrap();
        assert_eq!(picked[0].filename, "a.csv");
        let loaded = client
            .load_files(picked.into_iter().map(|f| f.filepath).collect(), LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(loaded[0].data, ",A\nr1,2\n");
        assert_eq!(loaded[0].extension, "csv");
    }

    #[tokio::test]
    async fn request_sender_is_reusable() {
        let (client, _relay, _) = client_for(Selection { files: vec!["/tmp/q.json".into()], directories: vec![] });
        let pick = client.request_sender(HostAction::PickFiles);
        for _ in 0..3 {
            let reply = pick(Value::Null).await.unwrap();
            assert_eq!(reply[0]["filename"], "q.json");
        }
    }

    #[tokio::test]
    async fn exit_app_reaches_the_host() {
        let (client, _relay, host) = client_for(Selection::default());
        let token = host.shutdown_token();
        client.exit_app();
        tokio::time::timeout(Duration::from_secs(2), token.cancelled()).await.unwrap();
    }
}

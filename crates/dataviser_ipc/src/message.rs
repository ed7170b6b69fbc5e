use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::HostFailure;

/// Actions the privileged host understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum HostAction {
    PickFiles,
    PickDirectories,
    LoadFiles,
    RequestScripts,
    ExitApp,
}

/// A file the user chose, before its contents are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub filepath: String,
    pub filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Only `utf-8` is understood; anything else is rejected by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadFilesParams {
    pub filepaths: Vec<String>,
    #[serde(default)]
    pub options: LoadOptions,
}

/// A file read by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedFile {
    pub filepath: String,
    pub filename: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub data: String,
    pub extension: String,
}

/// Script name (file stem) to source.
pub type ScriptCatalogue = BTreeMap<String, String>;

/// A host request decoded from `(action, args)` at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    PickFiles,
    PickDirectories,
    LoadFiles(LoadFilesParams),
    RequestScripts,
    ExitApp,
}

impl HostRequest {
    pub fn action(&self) -> HostAction {
        match self {
            HostRequest::PickFiles => HostAction::PickFiles,
            HostRequest::PickDirectories => HostAction::PickDirectories,
            HostRequest::LoadFiles(_) => HostAction::LoadFiles,
            HostRequest::RequestScripts => HostAction::RequestScripts,
            HostRequest::ExitApp => HostAction::ExitApp,
        }
    }

    pub fn from_parts(action: &str, args: Value) -> Result<Self, HostFailure> {
        let action: HostAction = action
            .parse()
            .map_err(|_| HostFailure::invalid(format!("unknown action `{action}`")))?;
        Ok(match action {
            HostAction::PickFiles => HostRequest::PickFiles,
            HostAction::PickDirectories => HostRequest::PickDirectories,
            HostAction::RequestScripts => HostRequest::RequestScripts,
            HostAction::ExitApp => HostRequest::ExitApp,
            HostAction::LoadFiles => {
                let params = serde_json::from_value(args)
                    .map_err(|e| HostFailure::invalid(format!("bad load-files args: {e}")))?;
                HostRequest::LoadFiles(params)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_names_are_kebab_case() {
        assert_eq!(HostAction::PickDirectories.as_ref(), "pick-directories");
        assert_eq!("exit-app".parse::<HostAction>().unwrap(), HostAction::ExitApp);
        assert!("exitApp".parse::<HostAction>().is_err());
    }

    #[test]
    fn load_files_args_are_validated() {
        let req = HostRequest::from_parts(
            "load-files",
            json!({"filepaths": ["/tmp/a.csv"], "options": {"encoding": "utf-8"}}),
        )
        .unwrap();
        match req {
            HostRequest::LoadFiles(p) => {
                assert_eq!(p.filepaths, vec!["/tmp/a.csv".to_string()]);
                assert_eq!(p.options.encoding.as_deref(), Some("utf-8"));
            }
            other => panic!("unexpected request {other:?}"),
        }

        let bad = HostRequest::from_parts("load-files", json!({"paths": 3}));
        assert!(bad.is_err());
        assert!(HostRequest::from_parts("format-disk", Value::Null).is_err());
    }
}

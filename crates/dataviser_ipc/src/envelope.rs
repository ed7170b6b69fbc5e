use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HostFailure;

/// Wire envelope shared by every actor on the bus.
///
/// The transport is broadcast-like and makes no ordering promise, so each envelope
/// names who sent it (`source`) and who should act on it (`target`). Replies carry the
/// id of the request they answer; that id is the only thing used to match them.
///
/// ```ignore
/// let req = Envelope::request("fs", "relay", "pick-files", json!([]));
/// let line = serde_json::to_string(&req)?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Body {
    /// Expects exactly one `Reply` carrying the same id.
    Request {
        action: String,
        #[serde(default)]
        args: Value,
    },
    /// Fire-and-forget; no reply is produced or awaited.
    Notify {
        action: String,
        #[serde(default)]
        args: Value,
    },
    Reply { outcome: Outcome },
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Result(Value),
    Error(HostFailure),
}

impl Envelope {
    pub fn request(
        source: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            body: Body::Request {
                action: action.into(),
                args,
            },
        }
    }

    pub fn notify(
        source: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            body: Body::Notify {
                action: action.into(),
                args,
            },
        }
    }

    /// Build the reply to `self`, addressed back to whoever sent it.
    pub fn reply(&self, outcome: Outcome) -> Self {
        Self {
            id: self.id.clone(),
            source: self.target.clone(),
            target: self.source.clone(),
            body: Body::Reply { outcome },
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.body, Body::Reply { .. })
    }

    pub fn action(&self) -> Option<&str> {
        match &self.body {
            Body::Request { action, .. } | Body::Notify { action, .. } => Some(action),
            Body::Reply { .. } => None,
        }
    }
}

impl From<Result<Value, HostFailure>> for Outcome {
    fn from(res: Result<Value, HostFailure>) -> Self {
        match res {
            Ok(v) => Outcome::Result(v),
            Err(e) => Outcome::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostFailureKind;
    use serde_json::json;

    #[test]
    fn reply_swaps_source_and_target() {
        let req = Envelope::request("fs", "relay", "pick-files", json!([]));
        let rsp = req.reply(Outcome::Result(json!([])));
        assert_eq!(rsp.id, req.id);
        assert_eq!(rsp.source, "relay");
        assert_eq!(rsp.target, "fs");
        assert!(rsp.is_reply());
        assert_eq!(rsp.action(), None);
    }

    #[test]
    fn wire_shape_is_flat() {
        let req = Envelope::request("fs", "relay", "load-files", json!({"filepaths": ["a.csv"]}));
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["kind"], "request");
        assert_eq!(v["action"], "load-files");
        assert_eq!(v["target"], "relay");

        let err = req.reply(Outcome::Error(HostFailure::new(HostFailureKind::Io, "denied")));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["outcome"]["error"]["kind"], "io");
        let back: Envelope = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }
}

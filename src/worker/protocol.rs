use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{id, action: "process-dispatch", script}` or `{id, action: "context-set", context}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    #[serde(flatten)]
    pub action: WorkerAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WorkerAction {
    ProcessDispatch { script: String },
    ContextSet { context: Map<String, Value> },
}

impl WorkerAction {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerAction::ProcessDispatch { .. } => "process-dispatch",
            WorkerAction::ContextSet { .. } => "context-set",
        }
    }
}

/// `{id, result}` on success, `{id, error}` on failure; never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReply {
    pub fn new(id: u64, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => Self { id, result: Some(result), error: None },
            Err(error) => Self { id, result: None, error: Some(error) },
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = WorkerRequest { id: 7, action: WorkerAction::ProcessDispatch { script: "1 + 1".into() } };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"id": 7, "action": "process-dispatch", "script": "1 + 1"})
        );
        let parsed: WorkerRequest =
            serde_json::from_value(json!({"id": 8, "action": "context-set", "context": {"x": 1}})).unwrap();
        assert_eq!(parsed.action.name(), "context-set");
    }

    #[test]
    fn reply_carries_result_or_error() {
        let ok = WorkerReply::new(1, Ok(json!(3)));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"id": 1, "result": 3}));
        let err = WorkerReply::new(2, Err("boom".into()));
        assert_eq!(serde_json::to_value(&err).unwrap(), json!({"id": 2, "error": "boom"}));
        assert_eq!(err.into_result(), Err("boom".to_string()));
        let unit: WorkerReply = serde_json::from_value(json!({"id": 3})).unwrap();
        assert_eq!(unit.into_result(), Ok(Value::Null));
    }
}

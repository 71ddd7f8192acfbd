use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

use crate::http::FailureKind;

/// Named workflow inputs or outputs.
pub type Fields = Map<String, Value>;

/// How the service delivers its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// One JSON document once the workflow finishes
    Blocking,
    /// Incremental event stream
    #[default]
    Streaming,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Blocking => "blocking",
            DeliveryMode::Streaming => "streaming",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(DeliveryMode::Blocking),
            "streaming" => Ok(DeliveryMode::Streaming),
            other => Err(format!(
                "Invalid delivery mode '{}'. Expected 'blocking' or 'streaming'.",
                other
            )),
        }
    }
}

/// One workflow run as submitted by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    inputs: Fields,
    delivery_mode: DeliveryMode,
    caller_identity: String,
}

impl WorkflowRequest {
    pub fn new(
        inputs: Fields,
        delivery_mode: DeliveryMode,
        caller_identity: impl Into<String>,
    ) -> Self {
        Self {
            inputs,
            delivery_mode,
            caller_identity: caller_identity.into(),
        }
    }

    pub fn inputs(&self) -> &Fields {
        &self.inputs
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn caller_identity(&self) -> &str {
        &self.caller_identity
    }

    /// JSON body sent to the run endpoint.
    pub fn payload(&self) -> Value {
        json!({
            "inputs": self.inputs,
            "response_mode": self.delivery_mode,
            "user": self.caller_identity,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        self.payload().to_string().into_bytes()
    }
}

/// A decoded frame of the event stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub const TEXT_CHUNK: &'static str = "text_chunk";

    /// Text carried by a `text_chunk` event, `None` for any other event.
    pub fn text_chunk(&self) -> Option<&str> {
        if self.event != Self::TEXT_CHUNK {
            return None;
        }
        self.data.get("text").and_then(Value::as_str)
    }
}

/// What a successful invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    /// Streaming mode: all text chunks concatenated in arrival order
    Text(String),
    /// Blocking mode: the `data.outputs` object
    Outputs(Fields),
}

impl InvocationResult {
    /// The value handed to callers that do not want to see failures.
    pub fn empty(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::Streaming => InvocationResult::Text(String::new()),
            DeliveryMode::Blocking => InvocationResult::Outputs(Fields::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            InvocationResult::Text(text) => text.is_empty(),
            InvocationResult::Outputs(outputs) => outputs.is_empty(),
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            InvocationResult::Text(text) => Some(text),
            InvocationResult::Outputs(_) => None,
        }
    }

    pub fn into_outputs(self) -> Option<Fields> {
        match self {
            InvocationResult::Outputs(outputs) => Some(outputs),
            InvocationResult::Text(_) => None,
        }
    }
}

/// Why an invocation produced no result.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationError {
    /// A non-retryable failure: an HTTP error other than 504, or a closed client
    Fatal {
        status: Option<StatusCode>,
        detail: String,
    },
    /// Every allowed attempt failed with a retryable error
    Exhausted { attempts: u32, last: FailureKind },
    /// The caller cancelled the invocation
    Cancelled,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationError::Fatal {
                status: Some(status),
                detail,
            } => write!(f, "Workflow request failed with HTTP {}: {}", status, detail),
            InvocationError::Fatal {
                status: None,
                detail,
            } => write!(f, "Workflow request failed: {}", detail),
            InvocationError::Exhausted { attempts, last } => write!(
                f,
                "Workflow request failed after {} attempts, last error: {}",
                attempts, last
            ),
            InvocationError::Cancelled => write!(f, "Workflow request was cancelled"),
        }
    }
}

impl std::error::Error for InvocationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> Fields {
        let mut inputs = Fields::new();
        inputs.insert("repo".to_string(), json!("https://github.com/owner/repo"));
        inputs.insert("start_date".to_string(), json!("2025-10-22"));
        inputs
    }

    #[test]
    fn test_payload_shape() {
        let request = WorkflowRequest::new(inputs(), DeliveryMode::Streaming, "insight-bot");
        assert_eq!(
            request.payload(),
            json!({
                "inputs": {
                    "repo": "https://github.com/owner/repo",
                    "start_date": "2025-10-22"
                },
                "response_mode": "streaming",
                "user": "insight-bot"
            })
        );
    }

    #[test]
    fn test_body_is_payload_json() {
        let request = WorkflowRequest::new(Fields::new(), DeliveryMode::Blocking, "u");
        let body: Value = serde_json::from_slice(&request.to_body()).unwrap();
        assert_eq!(body["response_mode"], "blocking");
        assert_eq!(body["inputs"], json!({}));
    }

    #[test]
    fn test_delivery_mode_parsing() {
        assert_eq!("blocking".parse::<DeliveryMode>(), Ok(DeliveryMode::Blocking));
        assert_eq!("Streaming".parse::<DeliveryMode>(), Ok(DeliveryMode::Streaming));
        assert!("batch".parse::<DeliveryMode>().is_err());
        assert_eq!(DeliveryMode::default(), DeliveryMode::Streaming);
    }

    #[test]
    fn test_text_chunk_only_for_text_chunk_events() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"event":"text_chunk","data":{"text":"Hi"}}"#).unwrap();
        assert_eq!(event.text_chunk(), Some("Hi"));

        let event: StreamEvent =
            serde_json::from_str(r#"{"event":"node_finished","data":{"text":"Hi"}}"#).unwrap();
        assert_eq!(event.text_chunk(), None);

        let event: StreamEvent = serde_json::from_str(r#"{"event":"text_chunk"}"#).unwrap();
        assert_eq!(event.text_chunk(), None);
    }

    #[test]
    fn test_empty_result_per_mode() {
        assert_eq!(
            InvocationResult::empty(DeliveryMode::Streaming),
            InvocationResult::Text(String::new())
        );
        assert_eq!(
            InvocationResult::empty(DeliveryMode::Blocking),
            InvocationResult::Outputs(Fields::new())
        );
        assert!(InvocationResult::empty(DeliveryMode::Blocking).is_empty());
        assert!(!InvocationResult::Text("x".to_string()).is_empty());
    }

    #[test]
    fn test_result_accessors() {
        assert_eq!(
            InvocationResult::Text("x".to_string()).into_text(),
            Some("x".to_string())
        );
        assert_eq!(InvocationResult::Text("x".to_string()).into_outputs(), None);
        assert_eq!(
            InvocationResult::Outputs(inputs()).into_outputs(),
            Some(inputs())
        );
    }

    #[test]
    fn test_invocation_error_display() {
        let err = InvocationError::Fatal {
            status: Some(StatusCode::INTERNAL_SERVER_ERROR),
            detail: "boom".to_string(),
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));

        let err = InvocationError::Exhausted {
            attempts: 6,
            last: FailureKind::Timeout,
        };
        assert!(err.to_string().contains("6 attempts"));
        assert!(err.to_string().contains("timed out"));
    }
}

//! Wire messages exchanged with runners.
//!
//! Four JSON messages, discriminated by their `type` field, make up the
//! request/reply protocol: a runner asks for work with `query_get_task` and
//! reports an outcome with `query_set_result`; the core answers with the
//! matching `reply_*`. Alongside the request/reply channel the core owns a
//! publish-only channel on which it emits a fixed [`EVENT_CHANGED`] marker
//! whenever the queue observably changed — subscribers use it purely as a
//! hint that re-querying is worthwhile.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runner::RunnerId;

/// Payload published on the event channel when the queue changed.
pub const EVENT_CHANGED: &str = "event";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The peer sent something that is not a known message.
    #[error("undecodable message: {0}")]
    Decode(#[source] serde_json::Error),

    /// A message could not be serialized for sending.
    #[error("unencodable message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// All messages of the runner protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// runner → core: "give me a task I can execute".
    QueryGetTask { runner: RunnerId },

    /// core → runner: the picked task and its project's SCM descriptor, or
    /// nulls when nothing matched.
    ReplyGetTask {
        runner: RunnerId,
        scm: Option<Value>,
        task: Option<Value>,
    },

    /// runner → core: outcome for a previously dispatched task.
    QuerySetResult {
        runner: RunnerId,
        task: Value,
        success: bool,
    },

    /// core → runner: acknowledgement of a result.
    ReplySetResult { runner: RunnerId },
}

impl Message {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_get_task_round_trips() {
        let raw = r#"{"type":"query_get_task","runner":{"name":"fast","arch":"x86_64"}}"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(
            msg,
            Message::QueryGetTask {
                runner: RunnerId::new(Some("fast".into()), Some("x86_64".into())),
            }
        );
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn reply_get_task_serializes_nulls_explicitly() {
        let msg = Message::ReplyGetTask {
            runner: RunnerId::default(),
            scm: None,
            task: None,
        };
        let encoded = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "reply_get_task");
        assert_eq!(value["scm"], Value::Null);
        assert_eq!(value["task"], Value::Null);
    }

    #[test]
    fn query_set_result_round_trips() {
        let msg = Message::QuerySetResult {
            runner: RunnerId::new(Some("fast".into()), None),
            task: json!({"project": "demo", "run": "make"}),
            success: false,
        };
        let back = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let err = Message::decode(r#"{"type":"query_dance","runner":{}}"#);
        assert!(matches!(err, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            Message::decode("not even json"),
            Err(ProtocolError::Decode(_))
        ));
    }
}

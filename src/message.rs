//! Wire messages exchanged with the visual-programming client
//!
//! Every WebSocket text message is one [`Envelope`]: `{"type": ..., "data": ...}`.
//! Payload field names follow the client's camelCase vocabulary.

use crate::capability::TypeDescriptor;
use crate::program::Program;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Inbound message types
pub const MSG_CALL: &str = "call";
pub const MSG_SAVE: &str = "save";
pub const MSG_TEST: &str = "test";

/// Outbound message types
pub const MSG_DEFINE_BLOCKS: &str = "DefineBlocks";
pub const MSG_SYNC_CODE: &str = "SyncCode";
pub const MSG_SET_TARGET: &str = "SetTarget";
pub const MSG_TRIGGER_EVENT: &str = "TriggerEvent";
pub const MSG_BLOCK_FINISHED: &str = "BlockFinished";

/// The `{type, data}` wrapper around every message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Wrap a serializable payload
    pub fn wrap<T: Serialize>(kind: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Decode `data` as a typed payload
    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// `call`: invoke a capability on a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(rename = "methodName")]
    pub method_name: String,
    /// Opaque correlation token, echoed verbatim in `BlockFinished`
    #[serde(rename = "threadID", default)]
    pub thread_id: JsonValue,
    #[serde(rename = "targetID")]
    pub target_id: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
}

/// `save`: store a target's program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    #[serde(rename = "targetID")]
    pub target_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(rename = "varMap", default)]
    pub var_map: Option<String>,
}

// ============================================================================
// Outbound payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: TypeDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMethod {
    pub name: String,
    pub category: String,
    /// None for methods that return nothing
    #[serde(rename = "returnType")]
    pub return_type: Option<TypeDescriptor>,
    pub parameters: Vec<BlockParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub name: String,
    pub category: String,
    #[serde(rename = "isStackable")]
    pub is_stackable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockCategory {
    pub name: String,
    pub color: i32,
}

/// `DefineBlocks`: the capability catalog, sent on every connect
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefineBlocks {
    pub methods: Vec<BlockMethod>,
    pub events: Vec<BlockEvent>,
    pub categories: Vec<BlockCategory>,
}

/// `SetTarget`: select the target the client edits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTarget {
    #[serde(rename = "targetID")]
    pub target_id: String,
    #[serde(rename = "targetName")]
    pub target_name: String,
    pub code: Option<String>,
    #[serde(rename = "varMap")]
    pub var_map: Option<String>,
}

/// `TriggerEvent`: host-originated event notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(rename = "eventName")]
    pub event_name: String,
    #[serde(rename = "targetID")]
    pub target_id: String,
}

/// `BlockFinished`: completion of a `call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFinished {
    #[serde(rename = "targetID")]
    pub target_id: String,
    #[serde(rename = "threadID")]
    pub thread_id: JsonValue,
    #[serde(rename = "returnValue")]
    pub return_value: JsonValue,
}

/// `SyncCode`: the full program list
pub type SyncCode = Vec<Program>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // TEST400: Call requests decode with an opaque thread id of any JSON shape
    #[test]
    fn test_parse_call() {
        let env = Envelope::parse(
            r#"{"type":"call","data":{"methodName":"turn","threadID":{"t":7},"targetID":"A","args":["Left",2]}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, MSG_CALL);
        let call: CallRequest = env.payload().unwrap();
        assert_eq!(call.method_name, "turn");
        assert_eq!(call.thread_id, json!({"t": 7}));
        assert_eq!(call.target_id, "A");
        assert_eq!(call.args, vec![json!("Left"), json!(2)]);
    }

    // TEST401: Missing data and missing optional fields are tolerated
    #[test]
    fn test_missing_fields_tolerated() {
        let env = Envelope::parse(r#"{"type":"test"}"#).unwrap();
        assert_eq!(env.kind, MSG_TEST);
        assert_eq!(env.data, JsonValue::Null);

        let save: SaveRequest = Envelope::parse(r#"{"type":"save","data":{"targetID":"A","extra":1}}"#)
            .unwrap()
            .payload()
            .unwrap();
        assert_eq!(save.code, None);
        assert_eq!(save.var_map, None);

        let call: CallRequest = Envelope::parse(r#"{"type":"call","data":{"methodName":"m","targetID":"A"}}"#)
            .unwrap()
            .payload()
            .unwrap();
        assert!(call.args.is_empty());
        assert_eq!(call.thread_id, JsonValue::Null);
    }

    // TEST402: Outbound payloads use the client's field names
    #[test]
    fn test_outbound_field_names() {
        let finished = Envelope::wrap(
            MSG_BLOCK_FINISHED,
            &BlockFinished {
                target_id: "A".into(),
                thread_id: json!(3),
                return_value: JsonValue::Null,
            },
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&finished).unwrap(),
            json!({"type": "BlockFinished", "data": {"targetID": "A", "threadID": 3, "returnValue": null}})
        );

        let event = serde_json::to_value(TriggerEvent {
            event_name: "onBump".into(),
            target_id: "A".into(),
        })
        .unwrap();
        assert_eq!(event, json!({"eventName": "onBump", "targetID": "A"}));

        let set = serde_json::to_value(SetTarget {
            target_id: "A".into(),
            target_name: "Turtle".into(),
            code: Some("<xml/>".into()),
            var_map: None,
        })
        .unwrap();
        assert_eq!(
            set,
            json!({"targetID": "A", "targetName": "Turtle", "code": "<xml/>", "varMap": null})
        );
    }

    // TEST403: Non-JSON text and JSON without a type are rejected
    #[test]
    fn test_malformed_envelopes() {
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"data":{}}"#).is_err());
        assert!(Envelope::parse("[1,2]").is_err());
    }
}

//! Control-protocol messages understood by the daemon.

use serde_json::{Map, Value};

pub const CAPABILITIES_COMMAND: &[u8] = b"{\"execute\":\"qmp_capabilities\"}\n";
pub const QUERY_STATUS_COMMAND: &[u8] = b"{\"execute\":\"query-status\"}\n";
pub const QUIT_COMMAND: &[u8] = b"{\"execute\":\"quit\"}\n";

pub const SHUTDOWN_EVENT: &str = "SHUTDOWN";

/// One decoded top-level object, classified by its first recognised key.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `{"QMP": {...}}` greeting sent by the VM process on connect.
    Greeting,
    /// `{"event": "...", "data": {...}}`.
    Event { name: String, data: Option<Value> },
    /// `{"return": ...}` answering our last command.
    Return(Value),
    /// `{"error": {"class": ..., "desc": ...}}`.
    Error { desc: Option<String> },
    /// `{"vzdump": {"vmid": "..."}}` sent by a backup coordinator.
    BackupHandshake(Value),
}

impl Message {
    /// Returns `None` for values the daemon does not act on.
    pub fn classify(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };

        if object.contains_key("QMP") {
            return Some(Message::Greeting);
        }
        if let Some(event) = object.remove("event") {
            let name = match event {
                Value::String(name) => name,
                other => other.to_string(),
            };
            return Some(Message::Event {
                name,
                data: object.remove("data"),
            });
        }
        if let Some(ret) = object.remove("return") {
            return Some(Message::Return(ret));
        }
        if let Some(error) = object.remove("error") {
            return Some(Message::Error {
                desc: error_desc(&error),
            });
        }
        if let Some(data) = object.remove("vzdump") {
            return Some(Message::BackupHandshake(data));
        }
        None
    }
}

fn error_desc(error: &Value) -> Option<String> {
    error
        .get("desc")
        .map(|desc| desc.as_str().map(str::to_string).unwrap_or_else(|| desc.to_string()))
}

/// `data.guest` of a shutdown event; absent or non-boolean reads as `None`.
pub fn shutdown_guest_flag(data: Option<&Value>) -> Option<bool> {
    data?.get("guest")?.as_bool()
}

/// `true` when a `query-status` return reports a running or paused VM.
pub fn status_is_active(ret: &Value) -> bool {
    matches!(
        ret.get("status").and_then(Value::as_str),
        Some("running") | Some("paused")
    )
}

/// Extracts the target identity of a backup handshake. Only strings count.
pub fn backup_target(data: &Value) -> Option<&str> {
    data.as_object()
        .and_then(|object: &Map<String, Value>| object.get("vmid"))
        .and_then(Value::as_str)
}

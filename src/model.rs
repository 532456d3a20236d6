//! Data model shared by the router, supervisor, and workers: peripheral and
//! automation definitions, the broker wire envelope, and the internal
//! `Message` used to route commands between components.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote transport selected for a peripheral's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Scp,
}

/// Connection parameters for a single peripheral, as stored in
/// `connection_params_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub passive: bool,
    /// Optional default local root recognized in `connection_params`;
    /// per-command `local_path` values are resolved against
    /// `Peripheral::server_side_path` instead, so this is carried through
    /// for round-tripping configuration only.
    #[serde(default)]
    pub local_path: Option<String>,
}

fn default_port() -> u16 {
    21
}
fn default_protocol() -> Protocol {
    Protocol::Ftp
}
fn default_timeout() -> u64 {
    30
}

/// A configured remote endpoint. `channel_to_virtual_index` mirrors the
/// source system's habit of naming the virtual index field loosely; the
/// first value whose key contains the substring "index" is taken as the
/// peripheral's stable queue-naming id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peripheral {
    pub id: i64,
    pub name: String,
    pub interface: String,
    pub connection_params: ConnectionParams,
    pub channel_to_virtual_index: HashMap<String, String>,
    pub server_side_path: String,
    pub remote_side_path: String,
}

impl Peripheral {
    /// Returns the stable virtual index used to name this peripheral's
    /// broker queues, or `None` if no key in `channel_to_virtual_index`
    /// mentions "index".
    pub fn virtual_index(&self) -> Option<&str> {
        self.channel_to_virtual_index
            .iter()
            .find(|(k, _)| k.to_lowercase().contains("index"))
            .map(|(_, v)| v.as_str())
    }

    pub fn recv_queue_name(&self) -> Option<String> {
        self.virtual_index().map(|vi| format!("recv_queue_index_{vi}"))
    }

    pub fn send_queue_name(&self) -> Option<String> {
        self.virtual_index().map(|vi| format!("send_queue_index_{vi}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: i64,
    pub automation_id: i64,
    pub description: String,
    pub queue_name: String,
}

/// An automation action. `description` is the action-type discriminator;
/// `action_config` is interpreted according to it. Unknown descriptions are
/// preserved here but never matched by `ActionKind::parse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: i64,
    pub automation_id: i64,
    pub description: String,
    pub action_config: Value,
}

/// Closed set of recognized action types. Extending behavior means adding a
/// variant here and a handler in the router, not registering a callback at
/// runtime.
#[derive(Debug, Clone)]
pub enum ActionKind {
    ForwardToRabbitmq { targets: Vec<String> },
    MultiplexPeripherals { peripheral_ids: Vec<i64> },
}

impl ActionKind {
    pub fn parse(action: &Action) -> Option<Self> {
        match action.description.as_str() {
            "forward_to_rabbitmq" => {
                let targets = action
                    .action_config
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.get("sent_to")?.as_str().map(str::to_owned))
                    .collect();
                Some(ActionKind::ForwardToRabbitmq { targets })
            }
            "multiplex_peripherals" => {
                let peripheral_ids = action
                    .action_config
                    .get("peripheral_ids")?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .collect();
                Some(ActionKind::MultiplexPeripherals { peripheral_ids })
            }
            _ => None,
        }
    }
}

/// Closed set of broker envelope action tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionTag {
    GetServerFileTree,
    ServerFileTree,
    GetRemoteFileTree,
    ClientFileTree,
    StreamFile,
    StreamDirectory,
    StartStreamFile,
    ProgressSendFile,
    FinishStreamFile,
    DownloadFile,
    DownloadDirectory,
    StartDownloadFile,
    FinishDownloadFile,
    ErrorDownloadFile,
    DeleteRemoteFile,
    DeleteRemoteDirectory,
    Error,
}

impl ActionTag {
    pub fn as_str(self) -> &'static str {
        use ActionTag::*;
        match self {
            GetServerFileTree => "GET_SERVER_FILE_TREE",
            ServerFileTree => "SERVER_FILE_TREE",
            GetRemoteFileTree => "GET_REMOTE_FILE_TREE",
            ClientFileTree => "CLIENT_FILE_TREE",
            StreamFile => "STREAM_FILE",
            StreamDirectory => "STREAM_DIRECTORY",
            StartStreamFile => "START_STREAM_FILE",
            ProgressSendFile => "PROGRESS_SEND_FILE",
            FinishStreamFile => "FINISH_STREAM_FILE",
            DownloadFile => "DOWNLOAD_FILE",
            DownloadDirectory => "DOWNLOAD_DIRECTORY",
            StartDownloadFile => "START_DOWNLOAD_FILE",
            FinishDownloadFile => "FINISH_DOWNLOAD_FILE",
            ErrorDownloadFile => "ERROR_DOWNLOAD_FILE",
            DeleteRemoteFile => "DELETE_REMOTE_FILE",
            DeleteRemoteDirectory => "DELETE_REMOTE_DIRECTORY",
            Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use ActionTag::*;
        Some(match s {
            "GET_SERVER_FILE_TREE" => GetServerFileTree,
            "SERVER_FILE_TREE" => ServerFileTree,
            "GET_REMOTE_FILE_TREE" => GetRemoteFileTree,
            "CLIENT_FILE_TREE" => ClientFileTree,
            "STREAM_FILE" => StreamFile,
            "STREAM_DIRECTORY" => StreamDirectory,
            "START_STREAM_FILE" => StartStreamFile,
            "PROGRESS_SEND_FILE" => ProgressSendFile,
            "FINISH_STREAM_FILE" => FinishStreamFile,
            "DOWNLOAD_FILE" => DownloadFile,
            "DOWNLOAD_DIRECTORY" => DownloadDirectory,
            "START_DOWNLOAD_FILE" => StartDownloadFile,
            "FINISH_DOWNLOAD_FILE" => FinishDownloadFile,
            "ERROR_DOWNLOAD_FILE" => ErrorDownloadFile,
            "DELETE_REMOTE_FILE" => DeleteRemoteFile,
            "DELETE_REMOTE_DIRECTORY" => DeleteRemoteDirectory,
            "ERROR" => Error,
            _ => return None,
        })
    }
}

/// Inbound command envelope, as published on a peripheral's recv queue or an
/// automation trigger queue.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub action: String,
    pub data: CommandData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandData {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Outbound reply envelope, published on a peripheral's send queue.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyEnvelope {
    pub action: &'static str,
    pub data: ReplyData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyData {
    pub index: String,
    pub value: Value,
    pub timestamp: i64,
}

impl ReplyEnvelope {
    pub fn new(action: ActionTag, index: impl Into<String>, value: Value) -> Self {
        ReplyEnvelope {
            action: action.as_str(),
            data: ReplyData {
                index: index.into(),
                value,
                timestamp: chrono::Utc::now().timestamp(),
            },
        }
    }
}

/// Internal routing message, produced either by the automation router or the
/// management layer and consumed by a peripheral's command channel.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub index: Option<String>,
    pub cmd: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub reply_q: Option<String>,
}

impl Message {
    /// Parses a broker delivery body into a `Message`. Accepts a JSON object,
    /// a JSON-encoded string, or raw bytes that aren't valid JSON at all -- in
    /// which case the whole body becomes `cmd` verbatim. This mirrors the
    /// layered fallback of the system this replaces: object > string > raw.
    pub fn from_bytes(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Self::from_object(map),
            Ok(Value::String(s)) => Message { cmd: s, ..Default::default() },
            Ok(other) => Message { cmd: other.to_string(), ..Default::default() },
            Err(_) => Message { cmd: text.into_owned(), ..Default::default() },
        }
    }

    fn from_object(map: serde_json::Map<String, Value>) -> Self {
        let index = map.get("index").and_then(|v| v.as_str()).map(str::to_owned);
        let cmd = map
            .get("cmd")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_default();
        let args = map
            .get("args")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let kwargs = map
            .get("kwargs")
            .and_then(|v| v.as_object())
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        let reply_q = map.get("reply_q").and_then(|v| v.as_str()).map(str::to_owned);
        Message { index, cmd, args, kwargs, reply_q }
    }
}

/// Append-only audit record persisted by `ConfigStore::log_operation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: i64,
    pub operation_type: String,
    pub status: String,
    pub details: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_from_object() {
        let body = br#"{"index":"7","cmd":"STREAM_FILE","args":[1,2],"kwargs":{"a":true}}"#;
        let msg = Message::from_bytes(body);
        assert_eq!(msg.index.as_deref(), Some("7"));
        assert_eq!(msg.cmd, "STREAM_FILE");
        assert_eq!(msg.args.len(), 2);
        assert_eq!(msg.kwargs.get("a").unwrap(), &Value::Bool(true));
    }

    #[test]
    fn message_from_plain_string() {
        let msg = Message::from_bytes(br#""ativar""#);
        assert_eq!(msg.cmd, "ativar");
        assert!(msg.index.is_none());
    }

    #[test]
    fn message_from_unparsable_bytes_falls_back_to_cmd() {
        let msg = Message::from_bytes(b"not json at all");
        assert_eq!(msg.cmd, "not json at all");
    }

    #[test]
    fn virtual_index_matches_any_key_containing_index() {
        let mut channel_to_virtual_index = HashMap::new();
        channel_to_virtual_index.insert("main_index".to_string(), "42".to_string());
        let p = Peripheral {
            id: 1,
            name: "p".into(),
            interface: "eth0".into(),
            connection_params: ConnectionParams {
                host: "h".into(),
                port: 21,
                user: String::new(),
                password: String::new(),
                protocol: Protocol::Ftp,
                timeout: 30,
                passive: true,
                local_path: None,
            },
            channel_to_virtual_index,
            server_side_path: "/srv".into(),
            remote_side_path: "/".into(),
        };
        assert_eq!(p.virtual_index(), Some("42"));
        assert_eq!(p.recv_queue_name().as_deref(), Some("recv_queue_index_42"));
        assert_eq!(p.send_queue_name().as_deref(), Some("send_queue_index_42"));
    }

    #[test]
    fn action_kind_parses_forward_to_rabbitmq() {
        let action = Action {
            id: 1,
            automation_id: 1,
            description: "forward_to_rabbitmq".into(),
            action_config: serde_json::json!([{"sent_to": "q_out_a"}, {"sent_to": "q_out_b"}]),
        };
        match ActionKind::parse(&action) {
            Some(ActionKind::ForwardToRabbitmq { targets }) => {
                assert_eq!(targets, vec!["q_out_a", "q_out_b"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn action_kind_unknown_description_is_none() {
        let action = Action {
            id: 1,
            automation_id: 1,
            description: "something_else".into(),
            action_config: Value::Null,
        };
        assert!(ActionKind::parse(&action).is_none());
    }
}

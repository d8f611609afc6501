//! Wire protocol (spec §4.6, §6.1): JSON messages exchanged over one
//! per-document connection, plus the encode/decode boundary between
//! [`docsync_doc::Transaction`] and its wire form.
//!
//! `Transaction` already serializes the way the wire format wants it
//! (`id`, `ops: [{kind, path, payload}]`, `timestamp`) since
//! [`docsync_schema::OperationPath`] is a newtype over `Vec<String>` and
//! [`docsync_schema::Value`] is untagged, so `EncodedTransaction` is just
//! that type under the name the protocol uses.

use docsync_base::{err_kind, ErrorKind, Result};
use docsync_doc::Transaction;
use serde::{Deserialize, Serialize};

pub type EncodedTransaction = Transaction;

pub fn encode_transaction(tx: &Transaction) -> Result<String> {
    serde_json::to_string(tx).map_err(|e| err_kind(ErrorKind::Validation, format!("encode transaction: {e}")))
}

pub fn decode_transaction(json: &str) -> Result<Transaction> {
    serde_json::from_str(json).map_err(|e| err_kind(ErrorKind::Validation, format!("decode transaction: {e}")))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

/// Messages sent client → server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth { token: String },
    Submit { transaction: EncodedTransaction },
    RequestSnapshot,
    Ping,
    PresenceSet { data: docsync_schema::Value },
    PresenceClear,
}

/// Messages sent server → client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResult {
        success: bool,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission: Option<Permission>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Snapshot {
        state: docsync_schema::Value,
        version: u64,
    },
    Transaction {
        transaction: EncodedTransaction,
        version: u64,
    },
    Error {
        #[serde(rename = "transactionId")]
        transaction_id: String,
        reason: String,
    },
    Pong,
    PresenceSnapshot {
        #[serde(rename = "selfId")]
        self_id: String,
        presences: std::collections::BTreeMap<String, PresenceEntry>,
    },
    PresenceUpdate {
        id: String,
        data: docsync_schema::Value,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    PresenceRemove {
        id: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub data: docsync_schema::Value,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| err_kind(ErrorKind::Validation, format!("encode client message: {e}")))
}

pub fn decode_client_message(json: &str) -> Result<ClientMessage> {
    serde_json::from_str(json).map_err(|e| err_kind(ErrorKind::Validation, format!("decode client message: {e}")))
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| err_kind(ErrorKind::Validation, format!("encode server message: {e}")))
}

pub fn decode_server_message(json: &str) -> Result<ServerMessage> {
    serde_json::from_str(json).map_err(|e| err_kind(ErrorKind::Validation, format!("decode server message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_schema::{Operation, OperationPath, Value};

    #[test]
    fn transaction_round_trips_through_json() {
        let tx = Transaction {
            id: "t1".to_string(),
            ops: vec![Operation::new("string.set", OperationPath(vec!["title".into()]), Value::from("hi"))],
            timestamp: 42,
        };
        let encoded = encode_transaction(&tx).unwrap();
        assert!(encoded.contains("\"title\""));
        let decoded = decode_transaction(&encoded).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn client_message_auth_uses_type_tag() {
        let msg = ClientMessage::Auth { token: "abc".to_string() };
        let encoded = encode_client_message(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"auth\""));
        assert_eq!(decode_client_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn server_auth_result_omits_absent_optionals() {
        let msg = ServerMessage::AuthResult { success: true, user_id: None, permission: Some(Permission::Write), error: None };
        let encoded = encode_server_message(&msg).unwrap();
        assert!(!encoded.contains("user_id"));
        assert!(encoded.contains("\"permission\":\"write\""));
    }

    #[test]
    fn presence_snapshot_decodes() {
        let json = r#"{"type":"presence_snapshot","selfId":"c1","presences":{"c2":{"data":{"x":1}}}}"#;
        let msg = decode_server_message(json).unwrap();
        match msg {
            ServerMessage::PresenceSnapshot { self_id, presences } => {
                assert_eq!(self_id, "c1");
                assert_eq!(presences.len(), 1);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

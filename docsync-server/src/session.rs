//! `Session`: the per-connection collaborator that ties wire messages
//! (spec §4.6) to the auth service, the presence channel, and the engine.
//! One instance per open connection; it holds no transport of its own —
//! `handle` takes a message and returns the messages to send straight
//! back, while broadcast traffic (other transactions, other connections'
//! presence) arrives separately through [`crate::Engine::subscribe`] and
//! [`docsync_presence::PresenceChannel::subscribe`].

use std::sync::Arc;

use docsync_auth::{AuthService, Credentials, Grant};
use docsync_base::{err_kind, ErrorKind, Result};
use docsync_presence::PresenceRegistry;
use docsync_wire::{ClientMessage, Permission, PresenceEntry, ServerMessage};

use crate::Engine;

enum SessionState {
    AwaitingAuth,
    Authenticated(Grant),
}

pub struct Session {
    document_id: String,
    connection_id: String,
    engine: Arc<Engine>,
    auth: Arc<dyn AuthService>,
    presence: Arc<PresenceRegistry>,
    state: SessionState,
}

impl Session {
    pub fn new(
        document_id: impl Into<String>,
        connection_id: impl Into<String>,
        engine: Arc<Engine>,
        auth: Arc<dyn AuthService>,
        presence: Arc<PresenceRegistry>,
    ) -> Self {
        Session {
            document_id: document_id.into(),
            connection_id: connection_id.into(),
            engine,
            auth,
            presence,
            state: SessionState::AwaitingAuth,
        }
    }

    fn require(&self, required: Permission) -> Result<&Grant> {
        match &self.state {
            SessionState::Authenticated(grant) if satisfies(grant.permission, required) => Ok(grant),
            SessionState::Authenticated(_) => Err(err_kind(ErrorKind::Authentication, "insufficient permission")),
            SessionState::AwaitingAuth => Err(err_kind(ErrorKind::Authentication, "auth must be the first message")),
        }
    }

    fn current_user_id(&self) -> Option<String> {
        match &self.state {
            SessionState::Authenticated(grant) => grant.user_id.clone(),
            SessionState::AwaitingAuth => None,
        }
    }

    /// Handle one inbound message, returning the reply (or replies) to
    /// send directly back to this connection. An `Err` here is a protocol
    /// violation or an authorization failure severe enough that the
    /// caller should consider closing the connection.
    pub async fn handle(&mut self, msg: ClientMessage, now: u64) -> Result<Vec<ServerMessage>> {
        match msg {
            ClientMessage::Auth { token } => Ok(vec![self.handle_auth(token).await]),
            ClientMessage::Submit { transaction } => {
                self.require(Permission::Write)?;
                let result = self.engine.submit(&self.document_id, transaction.clone(), now).await?;
                if result.success {
                    Ok(Vec::new())
                } else {
                    Ok(vec![ServerMessage::Error {
                        transaction_id: transaction.id,
                        reason: result.reason.unwrap_or_else(|| "rejected".to_string()),
                    }])
                }
            }
            ClientMessage::RequestSnapshot => {
                self.require(Permission::Read)?;
                let (state, version) = self.engine.get_snapshot(&self.document_id, now).await?;
                Ok(vec![ServerMessage::Snapshot { state, version }])
            }
            ClientMessage::Ping => Ok(vec![ServerMessage::Pong]),
            ClientMessage::PresenceSet { data } => {
                self.require(Permission::Read)?;
                let user_id = self.current_user_id();
                self.presence.get_or_create(&self.document_id).set(&self.connection_id, PresenceEntry { data, user_id });
                Ok(Vec::new())
            }
            ClientMessage::PresenceClear => {
                self.require(Permission::Read)?;
                self.presence.get_or_create(&self.document_id).remove(&self.connection_id);
                Ok(Vec::new())
            }
        }
    }

    async fn handle_auth(&mut self, token: String) -> ServerMessage {
        let credentials = Credentials::from(token);
        match self.auth.authorize(&credentials, &self.document_id).await {
            Ok(Some(grant)) => {
                let reply = ServerMessage::AuthResult {
                    success: true,
                    user_id: grant.user_id.clone(),
                    permission: Some(grant.permission),
                    error: None,
                };
                self.state = SessionState::Authenticated(grant);
                reply
            }
            Ok(None) => ServerMessage::AuthResult {
                success: false,
                user_id: None,
                permission: None,
                error: Some("not authorized".to_string()),
            },
            Err(e) => {
                ServerMessage::AuthResult { success: false, user_id: None, permission: None, error: Some(e.to_string()) }
            }
        }
    }

    /// A full snapshot of everyone's presence, including this connection's
    /// own entry if set; the client filters itself out by `selfId`.
    pub fn presence_snapshot(&self) -> ServerMessage {
        let presences = self.presence.get_or_create(&self.document_id).snapshot();
        ServerMessage::PresenceSnapshot { self_id: self.connection_id.clone(), presences }
    }

    /// The transport layer must call this on connection close (spec
    /// §4.5) so this connection's presence entry doesn't linger.
    pub fn disconnect(&self) {
        self.presence.get_or_create(&self.document_id).remove(&self.connection_id);
    }
}

fn satisfies(held: Permission, required: Permission) -> bool {
    match required {
        Permission::Read => matches!(held, Permission::Read | Permission::Write),
        Permission::Write => matches!(held, Permission::Write),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_auth::{AllowAll, TokenMapAuth};
    use docsync_doc::Transaction;
    use docsync_schema::{initial_state, Operation, OperationPath, Schema, Value};
    use docsync_storage::{InMemoryColdStorage, InMemoryHotStorage};
    use test_log::test;

    fn title_schema() -> Schema {
        Schema::struct_of([("title", Schema::String)])
    }

    fn engine() -> Arc<Engine> {
        let schema = title_schema();
        Arc::new(Engine::new(
            schema.clone(),
            crate::EngineConfig::default(),
            Arc::new(crate::ConstantInitial(initial_state(&schema))),
            Arc::new(InMemoryColdStorage::new()),
            Arc::new(InMemoryHotStorage::new()),
        ))
    }

    #[tokio::test]
    async fn messages_before_auth_are_rejected() {
        let mut session =
            Session::new("doc1", "conn1", engine(), Arc::new(AllowAll), Arc::new(PresenceRegistry::new()));
        let err = session.handle(ClientMessage::Ping, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn auth_then_submit_succeeds_and_read_only_grant_rejects_submit() {
        let auth = Arc::new(TokenMapAuth::new().grant("readonly", "bob", Permission::Read));
        let mut session = Session::new("doc1", "conn1", engine(), auth, Arc::new(PresenceRegistry::new()));
        let reply = session.handle(ClientMessage::Auth { token: "readonly".to_string() }, 0).await.unwrap();
        match &reply[0] {
            ServerMessage::AuthResult { success: true, permission: Some(Permission::Read), .. } => {}
            other => panic!("unexpected reply: {other:?}"),
        }

        let tx = Transaction {
            id: "tx1".to_string(),
            ops: vec![Operation::new("string.set", OperationPath::single("title"), Value::from("x"))],
            timestamp: 0,
        };
        let err = session.handle(ClientMessage::Submit { transaction: tx }, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn write_grant_can_submit_and_request_snapshot() {
        let mut session = Session::new("doc1", "conn1", engine(), Arc::new(AllowAll), Arc::new(PresenceRegistry::new()));
        session.handle(ClientMessage::Auth { token: String::new() }, 0).await.unwrap();

        let tx = Transaction {
            id: "tx1".to_string(),
            ops: vec![Operation::new("string.set", OperationPath::single("title"), Value::from("hi"))],
            timestamp: 0,
        };
        let reply = session.handle(ClientMessage::Submit { transaction: tx }, 0).await.unwrap();
        assert!(reply.is_empty());

        let reply = session.handle(ClientMessage::RequestSnapshot, 0).await.unwrap();
        match &reply[0] {
            ServerMessage::Snapshot { version, .. } => assert_eq!(*version, 1),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_set_then_snapshot_includes_self_entry() {
        let presence = Arc::new(PresenceRegistry::new());
        let mut session = Session::new("doc1", "conn1", engine(), Arc::new(AllowAll), presence);
        session.handle(ClientMessage::Auth { token: String::new() }, 0).await.unwrap();
        session.handle(ClientMessage::PresenceSet { data: Value::from("cursor:1") }, 0).await.unwrap();

        match session.presence_snapshot() {
            ServerMessage::PresenceSnapshot { self_id, presences } => {
                assert_eq!(self_id, "conn1");
                assert!(presences.contains_key("conn1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_removes_presence_entry() {
        let presence = Arc::new(PresenceRegistry::new());
        let mut session = Session::new("doc1", "conn1", engine(), Arc::new(AllowAll), presence);
        session.handle(ClientMessage::Auth { token: String::new() }, 0).await.unwrap();
        session.handle(ClientMessage::PresenceSet { data: Value::from("x") }, 0).await.unwrap();
        session.disconnect();

        match session.presence_snapshot() {
            ServerMessage::PresenceSnapshot { presences, .. } => assert!(!presences.contains_key("conn1")),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

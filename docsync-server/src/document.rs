//! `ServerDocument` (spec §4.4.1): the authoritative in-memory state for
//! one document id. Submits are serialized by a fair async mutex rather
//! than a dedicated actor mailbox, which gets the same "one at a time, in
//! arrival order" guarantee with far less plumbing.

use std::collections::VecDeque;

use docsync_doc::{Document, Transaction};
use docsync_schema::{Schema, Value};
use docsync_wire::ServerMessage;
use tokio::sync::{broadcast, Mutex};

const EVENT_CAPACITY: usize = 1024;

/// Outcome of [`ServerDocument::submit`].
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitResult {
    pub success: bool,
    pub version: Option<u64>,
    pub reason: Option<String>,
}

impl SubmitResult {
    fn accepted(version: u64) -> Self {
        SubmitResult { success: true, version: Some(version), reason: None }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        SubmitResult { success: false, version: None, reason: Some(reason.into()) }
    }
}

struct State {
    document: Document,
    version: u64,
    history: VecDeque<Transaction>,
}

pub struct ServerDocument {
    state: Mutex<State>,
    events: broadcast::Sender<ServerMessage>,
    max_transaction_history: usize,
}

impl ServerDocument {
    pub fn new(schema: Schema, state: Value, version: u64, max_transaction_history: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ServerDocument {
            state: Mutex::new(State { document: Document::with_state(schema, state), version, history: VecDeque::new() }),
            events,
            max_transaction_history,
        }
    }

    /// Accept or reject a submitted transaction. Duplicate ids (already in
    /// history) are rejected without re-applying. On success the version
    /// advances and the transaction is broadcast to subscribers.
    pub async fn submit(&self, t: Transaction) -> SubmitResult {
        let mut state = self.state.lock().await;
        if state.history.iter().any(|h| h.id == t.id) {
            return SubmitResult::rejected("duplicate");
        }
        match state.document.apply(&t.ops) {
            Ok(()) => {
                state.version += 1;
                let version = state.version;
                Self::push_history(&mut state.history, t.clone(), self.max_transaction_history);
                let _ = self.events.send(ServerMessage::Transaction { transaction: t, version });
                SubmitResult::accepted(version)
            }
            Err(e) => SubmitResult::rejected(e.to_string()),
        }
    }

    /// Replay an already-accepted transaction from the write-ahead log at
    /// startup: applies the ops and trusts `entry_version` rather than
    /// incrementing, and does not broadcast.
    pub(crate) async fn replay(&self, t: Transaction, entry_version: u64) -> docsync_base::Result<()> {
        let mut state = self.state.lock().await;
        state.document.apply(&t.ops)?;
        state.version = entry_version;
        Self::push_history(&mut state.history, t, self.max_transaction_history);
        Ok(())
    }

    fn push_history(history: &mut VecDeque<Transaction>, t: Transaction, cap: usize) {
        history.push_back(t);
        while history.len() > cap {
            history.pop_front();
        }
    }

    pub async fn get_snapshot(&self) -> (Value, u64) {
        let state = self.state.lock().await;
        (state.document.state(), state.version)
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    /// A multi-consumer broadcast of every transaction accepted after the
    /// subscriber joined; overflowing subscribers see a lagged-receiver
    /// error on their next `recv`, which the caller treats as a disconnect.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }
}

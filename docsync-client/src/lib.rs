//! `ClientDocument` (spec §4.3): optimistic local state, a pending-queue of
//! in-flight transactions, rebase on foreign server transactions and on
//! rejection, and the init-buffering state machine that lets messages
//! arrive before the initial snapshot without being lost.
//!
//! The client is single-threaded cooperative (spec §5): nothing here
//! spawns a task or holds a lock across an await point. Timers are modeled
//! as explicit `now: u64` (milliseconds) parameters rather than host
//! timers, so callers drive the clock (a real event loop ticks it from
//! `SystemTime`; tests tick it by hand).

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

use docsync_base::{err_kind, ErrorKind, Result};
use docsync_doc::{Document, Transaction};
use docsync_schema::{Operation, OperationPath, Proxy, ProxyEnv, Schema, Value};
use docsync_wire::{ClientMessage, PresenceEntry, ServerMessage};
use uuid::Uuid;

/// Everything outbound: encoding and framing are the transport's job, the
/// client only ever hands it a typed [`ClientMessage`].
pub trait Transport {
    fn send(&self, msg: &ClientMessage) -> Result<()>;
}

/// Observer hooks. All have no-op defaults; implementors override the ones
/// they care about.
pub trait ClientCallbacks {
    fn on_state_change(&self) {}
    fn on_ready(&self) {}
    fn on_rejection(&self, _original: &Transaction, _reason: &str) {}
    fn on_connection_change(&self, _connected: bool) {}
}

#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    pub transaction_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig { transaction_timeout_ms: 30_000, init_timeout_ms: 10_000, history_capacity: 100 }
    }
}

#[derive(Clone, Debug)]
struct PendingEntry {
    transaction: Transaction,
    original: Transaction,
    sent_at: u64,
}

enum InitState {
    Uninitialized,
    Initializing { buffer: Vec<ServerMessage> },
    Ready,
}

pub struct ClientDocument<T, C> {
    schema: Schema,
    config: ClientConfig,
    transport: T,
    callbacks: C,
    server_state: RefCell<Value>,
    server_version: Cell<u64>,
    pending: RefCell<VecDeque<PendingEntry>>,
    server_tx_history: RefCell<VecDeque<Transaction>>,
    optimistic_doc: RefCell<Document>,
    init_state: RefCell<InitState>,
    init_deadline: Cell<Option<u64>>,
    presence_self_id: RefCell<Option<String>>,
    presence_others: RefCell<BTreeMap<String, PresenceEntry>>,
    /// Live drafts, oldest first (spec §4.3.6: "layered on top of each
    /// other deterministically by creation order"). Weak so a dropped
    /// (committed or discarded) draft disappears on its own.
    drafts: RefCell<Vec<Weak<DraftState>>>,
}

impl<T: Transport, C: ClientCallbacks> ClientDocument<T, C> {
    pub fn new(schema: Schema, config: ClientConfig, transport: T, callbacks: C) -> Self {
        let state = docsync_schema::initial_state(&schema);
        ClientDocument {
            optimistic_doc: RefCell::new(Document::with_state(schema.clone(), state.clone())),
            schema,
            config,
            transport,
            callbacks,
            server_state: RefCell::new(state),
            server_version: Cell::new(0),
            pending: RefCell::new(VecDeque::new()),
            server_tx_history: RefCell::new(VecDeque::new()),
            init_state: RefCell::new(InitState::Uninitialized),
            init_deadline: Cell::new(None),
            presence_self_id: RefCell::new(None),
            presence_others: RefCell::new(BTreeMap::new()),
            drafts: RefCell::new(Vec::new()),
        }
    }

    /// Connect with no initial state: enters `initializing`, starts the
    /// init timeout, and requests a snapshot.
    pub fn connect(&self, now: u64) -> Result<()> {
        self.callbacks.on_connection_change(true);
        *self.init_state.borrow_mut() = InitState::Initializing { buffer: Vec::new() };
        self.init_deadline.set(Some(now.saturating_add(self.config.init_timeout_ms)));
        self.transport.send(&ClientMessage::RequestSnapshot)
    }

    /// Connect with a caller-supplied initial state: goes straight to
    /// `ready`, skipping the snapshot round-trip.
    pub fn connect_with_initial(&self, state: Value) {
        self.callbacks.on_connection_change(true);
        *self.server_state.borrow_mut() = state.clone();
        self.optimistic_doc.borrow().reset(state);
        *self.init_state.borrow_mut() = InitState::Ready;
        self.callbacks.on_ready();
    }

    pub fn disconnect(&self) {
        self.init_deadline.set(None);
        *self.init_state.borrow_mut() = InitState::Uninitialized;
        self.pending.borrow_mut().clear();
        self.presence_self_id.borrow_mut().take();
        self.presence_others.borrow_mut().clear();
        self.callbacks.on_connection_change(false);
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.init_state.borrow(), InitState::Ready)
    }

    pub fn server_state(&self) -> Value {
        self.server_state.borrow().clone()
    }

    pub fn server_version(&self) -> u64 {
        self.server_version.get()
    }

    pub fn optimistic_state(&self) -> Value {
        self.optimistic_doc.borrow().state()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn presence_others(&self) -> BTreeMap<String, PresenceEntry> {
        self.presence_others.borrow().clone()
    }

    pub fn set_presence(&self, data: Value) -> Result<()> {
        self.transport.send(&ClientMessage::PresenceSet { data })
    }

    pub fn clear_presence(&self) -> Result<()> {
        self.transport.send(&ClientMessage::PresenceClear)
    }

    /// Run `f` against the optimistic document's proxy and submit the
    /// resulting ops as a transaction. No-ops if `f` didn't mutate
    /// anything. Only callable once `ready`.
    pub fn transaction(&self, now: u64, f: impl FnOnce(&Proxy)) -> Result<()> {
        self.ensure_ready()?;
        self.optimistic_doc.borrow().transaction(f);
        let tx = self.optimistic_doc.borrow().flush();
        if tx.is_empty() {
            return Ok(());
        }
        self.enqueue_pending(tx, now)
    }

    /// Open a draft: an accumulating, not-yet-submitted batch of ops where
    /// repeated writes to the same path collapse into one.
    pub fn draft(&self) -> Draft<'_, T, C> {
        Draft::new(self)
    }

    fn ensure_ready(&self) -> Result<()> {
        match &*self.init_state.borrow() {
            InitState::Ready => Ok(()),
            InitState::Uninitialized => Err(err_kind(ErrorKind::NotConnected, "called before connect()")),
            InitState::Initializing { .. } => Err(err_kind(ErrorKind::InvalidState, "called before ready")),
        }
    }

    fn enqueue_pending(&self, tx: Transaction, now: u64) -> Result<()> {
        self.pending.borrow_mut().push_back(PendingEntry { transaction: tx.clone(), original: tx.clone(), sent_at: now });
        self.transport.send(&ClientMessage::Submit { transaction: tx })?;
        self.callbacks.on_state_change();
        Ok(())
    }

    /// Dispatch one server message. Presence messages are processed
    /// immediately regardless of init state; everything else is buffered
    /// while `initializing` and handled only once `ready`.
    pub fn handle_message(&self, msg: ServerMessage, now: u64) -> Result<()> {
        if is_presence_message(&msg) {
            self.handle_presence(msg);
            return Ok(());
        }

        let should_buffer = matches!(&*self.init_state.borrow(), InitState::Initializing { .. }) && !matches!(msg, ServerMessage::Snapshot { .. });
        if should_buffer {
            if let InitState::Initializing { buffer } = &mut *self.init_state.borrow_mut() {
                buffer.push(msg);
            }
            return Ok(());
        }

        if let ServerMessage::Snapshot { state, version } = &msg {
            if matches!(&*self.init_state.borrow(), InitState::Initializing { .. }) {
                return self.finish_initializing(state.clone(), *version, now);
            }
        }

        self.handle_ready_message(msg)
    }

    fn finish_initializing(&self, state: Value, version: u64, now: u64) -> Result<()> {
        let buffered = match std::mem::replace(&mut *self.init_state.borrow_mut(), InitState::Ready) {
            InitState::Initializing { buffer } => buffer,
            other => {
                *self.init_state.borrow_mut() = other;
                Vec::new()
            }
        };
        self.init_deadline.set(None);
        *self.server_state.borrow_mut() = state.clone();
        self.server_version.set(version);
        self.optimistic_doc.borrow().reset(state);
        let _ = now;

        for msg in buffered {
            if let ServerMessage::Transaction { version: v, .. } = &msg {
                if *v <= version {
                    continue;
                }
            }
            self.handle_ready_message(msg)?;
        }
        self.callbacks.on_ready();
        Ok(())
    }

    fn handle_ready_message(&self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Transaction { transaction, version } => self.on_server_transaction(transaction, version),
            ServerMessage::Snapshot { state, version } => self.reset_from_snapshot(state, version),
            ServerMessage::Error { transaction_id, reason } => {
                self.reject(&transaction_id, &reason);
                Ok(())
            }
            ServerMessage::AuthResult { success, error, .. } => {
                if !success {
                    self.callbacks.on_connection_change(false);
                    return Err(err_kind(ErrorKind::Authentication, error.unwrap_or_else(|| "authentication failed".to_string())));
                }
                Ok(())
            }
            ServerMessage::Pong => Ok(()),
            ServerMessage::PresenceSnapshot { .. } | ServerMessage::PresenceUpdate { .. } | ServerMessage::PresenceRemove { .. } => {
                unreachable!("presence messages are intercepted before dispatch")
            }
        }
    }

    fn on_server_transaction(&self, t: Transaction, version: u64) -> Result<()> {
        let ack_index = self.pending.borrow().iter().position(|p| p.transaction.id == t.id);
        if let Some(idx) = ack_index {
            self.pending.borrow_mut().remove(idx);
            self.apply_to_server_state(&t)?;
            self.server_version.set(version);
        } else {
            self.apply_to_server_state(&t)?;
            self.push_history(t.clone());
            for entry in self.pending.borrow_mut().iter_mut() {
                entry.transaction.ops = docsync_schema::transform_transaction_ops(&entry.transaction.ops, &t.ops);
            }
            self.rebase_drafts(&t);
            self.server_version.set(version);
        }
        self.recompute_optimistic();
        self.callbacks.on_state_change();
        Ok(())
    }

    fn apply_to_server_state(&self, t: &Transaction) -> Result<()> {
        let mut cur = self.server_state.borrow().clone();
        for op in &t.ops {
            cur = docsync_schema::apply_operation(&self.schema, &cur, op)?;
        }
        *self.server_state.borrow_mut() = cur;
        Ok(())
    }

    fn push_history(&self, t: Transaction) {
        let mut hist = self.server_tx_history.borrow_mut();
        hist.push_back(t);
        while hist.len() > self.config.history_capacity {
            hist.pop_front();
        }
    }

    /// Transform every live draft's accumulated ops against a foreign
    /// server transaction, the same way pending transactions are rebased
    /// (spec §4.3.6). Drops registry entries for drafts already committed
    /// or discarded.
    fn rebase_drafts(&self, t: &Transaction) {
        let mut drafts = self.drafts.borrow_mut();
        drafts.retain(|weak| weak.strong_count() > 0);
        for weak in drafts.iter() {
            if let Some(state) = weak.upgrade() {
                let rebased = docsync_schema::transform_transaction_ops(&state.ops.borrow(), &t.ops);
                *state.ops.borrow_mut() = rebased;
            }
        }
    }

    /// Optimistic state layered with every live draft's current ops
    /// applied in creation order — the base a newly-opened draft starts
    /// from, and what each existing draft's view is rebuilt against
    /// whenever the optimistic state changes underneath it.
    fn layered_draft_state(&self) -> Value {
        let mut value = self.optimistic_state();
        for weak in self.drafts.borrow().iter() {
            if let Some(state) = weak.upgrade() {
                let ops = state.ops.borrow().clone();
                if ops.is_empty() {
                    continue;
                }
                let doc = Document::with_state(self.schema.clone(), value.clone());
                if doc.apply(&ops).is_ok() {
                    value = doc.state();
                }
            }
        }
        value
    }

    /// Rebuild every live draft's private view from the current optimistic
    /// state layered with earlier drafts' ops, in creation order.
    fn recompute_draft_views(&self) {
        let mut base = self.optimistic_state();
        let drafts = self.drafts.borrow();
        for weak in drafts.iter() {
            if let Some(state) = weak.upgrade() {
                let doc = Document::with_state(self.schema.clone(), base.clone());
                let ops = state.ops.borrow().clone();
                if doc.apply(&ops).is_ok() {
                    base = doc.state();
                }
                *state.view.borrow_mut() = doc;
            }
        }
    }

    fn reset_from_snapshot(&self, state: Value, version: u64) -> Result<()> {
        let rejected: Vec<PendingEntry> = self.pending.borrow_mut().drain(..).collect();
        self.server_tx_history.borrow_mut().clear();
        *self.server_state.borrow_mut() = state;
        self.server_version.set(version);
        self.recompute_optimistic();
        for entry in &rejected {
            self.callbacks.on_rejection(&entry.original, "resync");
        }
        self.callbacks.on_state_change();
        Ok(())
    }

    /// Reject the pending transaction identified by `transaction_id`
    /// (spec §4.3.4) and rebase every remaining pending entry against
    /// `server_tx_history` starting from its untransformed `original`.
    fn reject(&self, transaction_id: &str, reason: &str) {
        let idx = match self.pending.borrow().iter().position(|p| p.transaction.id == transaction_id) {
            Some(i) => i,
            None => return,
        };
        let rejected = self.pending.borrow_mut().remove(idx).expect("index just located");

        let history = self.server_tx_history.borrow().clone();
        for entry in self.pending.borrow_mut().iter_mut() {
            let mut ops = entry.original.ops.clone();
            for server_tx in &history {
                ops = docsync_schema::transform_transaction_ops(&ops, &server_tx.ops);
            }
            entry.transaction.ops = ops;
        }

        self.recompute_optimistic();
        self.callbacks.on_rejection(&rejected.original, reason);
        self.callbacks.on_state_change();
    }

    /// Per-transaction and init timers are explicit: callers tick this
    /// with the current time (spec §5 "Cancellation and timeouts").
    pub fn check_timeouts(&self, now: u64) {
        if let Some(deadline) = self.init_deadline.get() {
            if now >= deadline && matches!(&*self.init_state.borrow(), InitState::Initializing { .. }) {
                self.init_deadline.set(None);
                *self.init_state.borrow_mut() = InitState::Uninitialized;
                self.callbacks.on_connection_change(false);
            }
        }

        let timeout = self.config.transaction_timeout_ms;
        let expired: Vec<String> = self
            .pending
            .borrow()
            .iter()
            .filter(|e| now.saturating_sub(e.sent_at) >= timeout)
            .map(|e| e.transaction.id.clone())
            .collect();
        for id in expired {
            self.reject(&id, "timeout");
        }
    }

    /// Rebuild `optimistic_doc` from `server_state` plus every pending
    /// transaction's ops, in order. A pending entry that no longer applies
    /// (rebase left it invalid) is dropped with a synthetic rejection and
    /// recomputation restarts from scratch.
    fn recompute_optimistic(&self) {
        loop {
            let base = self.server_state.borrow().clone();
            let doc = Document::with_state(self.schema.clone(), base);
            let invalid = self.pending.borrow().iter().find_map(|entry| doc.apply(&entry.transaction.ops).err().map(|e| (entry.transaction.id.clone(), e)));

            match invalid {
                Some((id, e)) => {
                    tracing::warn!(target: "docsync", error = %e, transaction_id = %id, "dropping pending transaction invalid after rebase");
                    let idx = self.pending.borrow().iter().position(|p| p.transaction.id == id);
                    if let Some(idx) = idx {
                        let removed = self.pending.borrow_mut().remove(idx).expect("index just located");
                        self.callbacks.on_rejection(&removed.original, "invalid after rebase");
                    }
                }
                None => {
                    *self.optimistic_doc.borrow_mut() = doc;
                    break;
                }
            }
        }
        self.recompute_draft_views();
    }

    fn handle_presence(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::PresenceSnapshot { self_id, mut presences } => {
                presences.remove(&self_id);
                *self.presence_self_id.borrow_mut() = Some(self_id);
                *self.presence_others.borrow_mut() = presences;
            }
            ServerMessage::PresenceUpdate { id, data, user_id } => {
                if Some(&id) == self.presence_self_id.borrow().as_ref() {
                    return;
                }
                self.presence_others.borrow_mut().insert(id, PresenceEntry { data, user_id });
            }
            ServerMessage::PresenceRemove { id } => {
                self.presence_others.borrow_mut().remove(&id);
            }
            _ => unreachable!("is_presence_message gated the call"),
        }
        self.callbacks.on_state_change();
    }
}

fn is_presence_message(msg: &ServerMessage) -> bool {
    matches!(msg, ServerMessage::PresenceSnapshot { .. } | ServerMessage::PresenceUpdate { .. } | ServerMessage::PresenceRemove { .. })
}

/// A draft's private, shareable state: its accumulated ops and the
/// document view they're applied against. Held behind an `Rc` so the
/// owning [`ClientDocument`] can keep a weak handle to it in `drafts` —
/// that's how a foreign server transaction reaches every live draft
/// without the draft needing to register/unregister itself explicitly.
struct DraftState {
    view: RefCell<Document>,
    ops: RefCell<Vec<Operation>>,
}

/// An open, uncommitted batch of ops (spec §4.3.6). Writes to the same
/// exact path within one draft replace the prior op there instead of
/// accumulating; writes to different paths stack. Reads made through the
/// draft's proxy see "optimistic state plus this draft's ops so far",
/// where "optimistic state" already includes every earlier still-open
/// draft's ops, layered in creation order. When a foreign server
/// transaction arrives, this draft's ops are transformed the same way a
/// pending transaction's are.
pub struct Draft<'a, T, C> {
    client: &'a ClientDocument<T, C>,
    state: Rc<DraftState>,
}

impl<'a, T: Transport, C: ClientCallbacks> Draft<'a, T, C> {
    fn new(client: &'a ClientDocument<T, C>) -> Self {
        let view = Document::with_state(client.schema.clone(), client.layered_draft_state());
        let state = Rc::new(DraftState { view: RefCell::new(view), ops: RefCell::new(Vec::new()) });
        let mut drafts = client.drafts.borrow_mut();
        drafts.retain(|weak| weak.strong_count() > 0);
        drafts.push(Rc::downgrade(&state));
        drop(drafts);
        Draft { client, state }
    }

    /// Run `f` against this draft's proxy, recording its ops. `commit`/
    /// `discard` take the draft by value, so the borrow checker rules out
    /// calling `update` again after either.
    pub fn update(&self, f: impl FnOnce(&Proxy)) {
        let proxy = Proxy::new(self.client.schema.clone(), OperationPath::root(), self);
        f(&proxy);
    }

    /// Package the accumulated ops into one transaction and submit it.
    /// A no-op if nothing was recorded. Consumes the draft.
    pub fn commit(self, now: u64) -> Result<()> {
        let ops = self.state.ops.borrow().clone();
        if ops.is_empty() {
            return Ok(());
        }
        self.client.optimistic_doc.borrow().apply(&ops)?;
        let tx = Transaction { id: Uuid::new_v4().to_string(), ops, timestamp: now };
        self.client.enqueue_pending(tx, now)
    }

    /// Drop the accumulated ops without submitting. The shared optimistic
    /// document was never written through (only this draft's private
    /// view was), so there is nothing to revert there. Consumes the draft.
    pub fn discard(self) {}
}

impl<'a, T: Transport, C: ClientCallbacks> ProxyEnv for Draft<'a, T, C> {
    fn emit(&self, op: Operation) {
        if let Err(e) = self.state.view.borrow().apply(std::slice::from_ref(&op)) {
            tracing::warn!(target: "docsync", error = %e, "draft mutation rejected by schema");
            return;
        }
        let mut ops = self.state.ops.borrow_mut();
        match ops.iter_mut().find(|existing| existing.path == op.path) {
            Some(existing) => *existing = op,
            None => ops.push(op),
        }
    }

    fn read(&self, path: &OperationPath) -> Value {
        <Document as ProxyEnv>::read(&*self.state.view.borrow(), path)
    }

    fn fresh_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

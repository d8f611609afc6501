//! `Document`: owns current state plus a buffer of operations recorded
//! since the last flush, and implements [`docsync_schema::ProxyEnv`] so a
//! `transaction` closure can mutate it through a [`docsync_schema::Proxy`].

use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

use docsync_base::Result;
use docsync_schema::{apply_operation, initial_state, Operation, OperationPath, Proxy, ProxyEnv, Schema, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A flushed batch of operations: the unit the client sends to the server
/// and the server assigns a version to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub ops: Vec<Operation>,
    pub timestamp: u64,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub struct Document {
    schema: Schema,
    state: RefCell<Value>,
    buffer: RefCell<Vec<Operation>>,
}

impl Document {
    pub fn new(schema: Schema) -> Self {
        let state = initial_state(&schema);
        Document { schema, state: RefCell::new(state), buffer: RefCell::new(Vec::new()) }
    }

    pub fn with_state(schema: Schema, state: Value) -> Self {
        Document { schema, state: RefCell::new(state), buffer: RefCell::new(Vec::new()) }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn state(&self) -> Value {
        self.state.borrow().clone()
    }

    /// Run `f` against a proxy rooted at this document. Every mutation `f`
    /// performs is applied to the buffer-view state immediately, so a read
    /// later in the same closure sees earlier writes.
    pub fn transaction<R>(&self, f: impl FnOnce(&Proxy) -> R) -> R {
        let proxy = Proxy::new(self.schema.clone(), OperationPath::root(), self);
        f(&proxy)
    }

    /// Package the accumulated buffer into a `Transaction` and clear it.
    /// Returns a transaction even when `ops` is empty; callers decide
    /// whether an empty transaction is worth sending.
    pub fn flush(&self) -> Transaction {
        let ops = self.buffer.borrow_mut().drain(..).collect();
        Transaction { id: Uuid::new_v4().to_string(), ops, timestamp: now_millis() }
    }

    /// Replay `ops` atomically: on the first failing op the state rolls
    /// back to what it was before this call.
    pub fn apply(&self, ops: &[Operation]) -> Result<()> {
        let before = self.state.borrow().clone();
        let mut cur = before.clone();
        for op in ops {
            match apply_operation(&self.schema, &cur, op) {
                Ok(next) => cur = next,
                Err(e) => {
                    *self.state.borrow_mut() = before;
                    return Err(e);
                }
            }
        }
        *self.state.borrow_mut() = cur;
        Ok(())
    }

    /// Replace the document's state wholesale (used when resetting to a
    /// server snapshot). Also clears any buffered-but-unflushed ops.
    pub fn reset(&self, state: Value) {
        *self.state.borrow_mut() = state;
        self.buffer.borrow_mut().clear();
    }
}

impl ProxyEnv for Document {
    fn emit(&self, op: Operation) {
        let cur = self.state.borrow().clone();
        match apply_operation(&self.schema, &cur, &op) {
            Ok(next) => {
                *self.state.borrow_mut() = next;
                self.buffer.borrow_mut().push(op);
            }
            Err(e) => {
                tracing::error!(target: "docsync", error = %e, kind = "proxy_mutation", "mutation rejected by schema");
            }
        }
    }

    fn read(&self, path: &OperationPath) -> Value {
        let mut cur = self.state.borrow().clone();
        for tok in &path.0 {
            cur = cur.get(tok).cloned().unwrap_or(Value::Null);
        }
        cur
    }

    fn fresh_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

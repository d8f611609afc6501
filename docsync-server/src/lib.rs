//! The server side of the synchronization engine (spec §4.4): one
//! [`ServerDocument`] per document id (version, history, broadcast), an
//! [`Engine`] that lazily creates and persists them, and a [`Session`]
//! that ties a single connection's wire messages to auth, presence, and
//! the engine.

mod document;
mod engine;
mod session;

pub use document::{ServerDocument, SubmitResult};
pub use engine::{now_millis, ConstantInitial, Engine, EngineConfig, InitialState, Metrics, MetricsSnapshot, SnapshotConfig};
pub use session::Session;

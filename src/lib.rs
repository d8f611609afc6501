//! `docsync` ties the synchronization engine's subsystems together behind
//! one dependency, the way the donor workspace's root crate wrapped its
//! subsystems behind a single `submerge` facade.

pub use docsync_auth as auth;
pub use docsync_base as base;
pub use docsync_client as client;
pub use docsync_doc as doc;
pub use docsync_presence as presence;
pub use docsync_schema as schema;
pub use docsync_server as server;
pub use docsync_storage as storage;
pub use docsync_wire as wire;

pub use docsync_base::{Error, Result};

//! # zyn-sync: Document synchronization engine for the zyn storage protocol
//!
//! Talks to a document server over WebSocket with a tagged text protocol
//! and keeps a local replica of the open document in step with edits made
//! by other clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌────────────────┐
//! │ Client      │ ◄─────────────────► │ DocumentServer │
//! │ (facade)    │   V:1;...;E:;       │ (loopback)     │
//! └──────┬──────┘                     └───────┬────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ Connection  │──►│ Framer       │   │ FileTree         │
//! │ Correlator  │   │ (E:; / size) │   │ NotificationHub  │
//! └──────┬──────┘   └──────────────┘   └──────────────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────────────────┐
//! │ DocumentSession                          │
//! │  PagedRead · EditTransaction · Replica   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire codec: requests, responses, notifications
//! - [`framer`]: Splits the inbound byte stream into frames
//! - [`correlator`]: Single outstanding request and transaction ids
//! - [`reader`]: Page-bounded reads
//! - [`edit`]: Single-step and batched edit transactions
//! - [`replica`]: Local mirror and notification reconciliation
//! - [`connection`]: Live session driving all of the above
//! - [`document`]: Open/edit/save/close lifecycle of one document
//! - [`client`]: Facade with reconnect and resync
//! - [`server`]: In-memory server for end-to-end use

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod document;
pub mod edit;
pub mod error;
pub mod filesystem;
pub mod framer;
pub mod protocol;
pub mod reader;
pub mod replica;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use client::{Client, ClientEvent};
pub use config::{ClientConfig, ServerConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use document::{DocumentSession, DocumentState, NotificationOutcome, ResyncOutcome};
pub use edit::{diff_operations, EditOperation, EditStrategy, EditTransaction};
pub use error::{ClientError, ErrorCode, MalformedMessage};
pub use protocol::{
    Block, EditKind, FileKind, FsElement, NodeId, Notification, OpenMode, OpenedFile, Request,
    Response, ResponseBody, Revision, SystemValue,
};
pub use reader::{PagedRead, ReadResult};
pub use replica::{Reconcile, Replica};
pub use server::{DocumentServer, ServerStats};

//! Real-time collaborative plain-text editing over TCP.
//!
//! Clients register and log in, then create, load, or join documents;
//! every keystroke travels as a small binary message and successful edits
//! are echoed to everyone in the session, so all participants converge on
//! the server's ordering.
//!
//! ```text
//!                    ┌─────────────────────────────┐
//!   client ──TCP──▶  │ supervisor (accept + assign)│
//!   client ──TCP──▶  │      least-connections      │
//!                    └──────┬──────────────┬───────┘
//!                           ▼              ▼
//!                      worker 0   ...   worker N
//!                           │              │
//!                           └──────┬───────┘
//!                                  ▼
//!                          session repository
//!                          (documents, codes)
//!                                  │
//!                                  ▼
//!                          record + blob store
//! ```
//!
//! - [`protocol`]: the binary wire format shared by both ends.
//! - [`server`]: accept loop, worker pool, and reply routing.
//! - [`repository`]: sessions, access codes, and request dispatch.
//! - [`client`]: a typed async client for the same protocol.

pub mod balancer;
pub mod client;
pub mod idgen;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod store;

pub use client::{ClientError, ClientEvent, CollabClient};
pub use protocol::{Cursor, Incoming, MessageKind, ProtocolError, Request, Response};
pub use repository::{Repository, Routing};
pub use server::{CollabServer, ServerConfig, ServerError};

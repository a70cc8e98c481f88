//! vellum-daemon: a self-hostable record store for vellum projects.
//!
//! The daemon holds the authoritative flat record set per project, persisted
//! as JSON on disk, and speaks a small WebSocket protocol: clients subscribe
//! to a project and receive the full snapshot on every change, and submit
//! mutation batches that apply atomically.
//!
//! `RemoteStore` is the client side — a `vellum_core::RecordStore`
//! implementation over the same protocol, usable anywhere the in-memory
//! store is.

pub mod client;
pub mod connection;
pub mod daemon;
pub mod message;
pub mod persistence;
pub mod server;

pub use client::RemoteStore;
pub use daemon::Daemon;
pub use message::{ClientMessage, MAX_MESSAGE_SIZE, ServerMessage};
pub use persistence::ProjectStorage;
pub use server::StoreServer;

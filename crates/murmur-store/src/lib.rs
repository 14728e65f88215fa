//! # murmur-store
//!
//! Backing store for the murmur chat server, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for users,
//! friendships, conversations and messages. Callers that share a handle
//! across tasks are expected to serialize access (the server keeps it
//! behind a mutex), which also makes every helper a linearized
//! read-modify-write.

pub mod conversations;
pub mod database;
pub mod friends;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use murmur_shared::models::{self, *};

//! # parley-store
//!
//! Durable state for the Parley chat engine, backed by SQLite.
//!
//! The crate plays two roles. As the **Identity Directory** it owns user
//! records, `last_seen` and block relations. As the **Message Store** it is
//! the append-only, per-conversation ordered log of messages together with
//! the per-recipient delivery receipts derived from it. A synchronous
//! [`Database`] exposes typed helpers for each table family; [`StoreHandle`]
//! shares one database across async tasks.

pub mod conversations;
pub mod database;
pub mod flags;
pub mod handle;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use handle::StoreHandle;
pub use models::*;

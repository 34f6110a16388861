//! # parley-shared
//!
//! Types shared by the store and the server: identifiers, the message
//! status machine, the client/server frame vocabulary and the error
//! taxonomy surfaced to callers.

pub mod constants;
pub mod error;
pub mod moderation;
pub mod protocol;
pub mod types;

pub use error::{ChatError, ErrorKind};

//! Sharing Common
//!
//! Shared plumbing for the proximity sharing certificate crates:
//! - Component-based structured logging with device id context
//! - `log_*!` macros forwarding to [`Logger`]
//! - Compact hex rendering of certificate ids

pub mod logging;
#[macro_use]
mod macros;

pub use logging::{init_test_logging, Component, Logger};

/// Helpers for rendering opaque ids in logs and dumps
pub mod hex_id {
    /// Number of leading bytes shown by [`short_hex`].
    pub const SHORT_ID_BYTES: usize = 6;

    /// Lowercase hex of the first few bytes of an id, with a trailing ellipsis
    /// when the id was truncated.
    pub fn short_hex(id: &[u8]) -> String {
        if id.len() <= SHORT_ID_BYTES {
            return hex::encode(id);
        }
        format!("{}..", hex::encode(&id[..SHORT_ID_BYTES]))
    }

}

//! Foundational low-level utilities shared across Hazel crates.
//!
//! Provides atomic file-write helpers, timestamp and identifier utilities, and the
//! bounded text clipping used when composing agent context.

pub mod atomic_io;
pub mod text_clip;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use text_clip::{clip_text, TRUNCATION_MARKER};
pub use time_utils::{current_unix_timestamp_nanos, format_base36};

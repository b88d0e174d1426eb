//! HTTP surface for Hazel Nexus chat sessions and usage telemetry.
pub mod gateway_codex;

pub use gateway_codex::*;

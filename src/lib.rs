// ABOUTME: Library root for keyfw - exposes the key forwarder and supporting types.
// ABOUTME: The example driver binary is in main.rs.

pub mod diagnostics;
pub mod error;
pub mod output;
pub mod ssh;

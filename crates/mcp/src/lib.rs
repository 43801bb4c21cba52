//! MCP wire types for the serving side.
//!
//! The transport layer (stdio line framing, HTTP body per message) hands the
//! gateway one JSON-RPC message at a time; everything here is just the typed
//! shape of those messages.

pub mod protocol;

pub use protocol::*;

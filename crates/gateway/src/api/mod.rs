//! Admin HTTP surface: health, Prometheus metrics, and MCP-over-HTTP.

pub mod health;
pub mod router;

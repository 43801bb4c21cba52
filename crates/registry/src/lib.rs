//! Persisted fleet state: device registry, credential vault, snapshot store,
//! health history, and the append-only audit log.
//!
//! Stores hold their working set in memory behind locks and persist to a
//! JSON state directory; the audit log and health history are append-only
//! JSONL files. Swapping in a relational backend would change only this
//! crate.

pub mod audit;
pub mod devices;
pub mod health;
pub mod snapshots;
pub mod vault;

pub use audit::AuditLog;
pub use devices::{DeviceQuery, DeviceRegistry};
pub use health::HealthStore;
pub use snapshots::SnapshotStore;
pub use vault::CredentialVault;

//! Typed RouterOS client.
//!
//! All device interaction flows through a closed catalog of template
//! operations ([`RosOp`]) — never an interpolated user string. REST is the
//! preferred transport; SSH is the fallback on transport-level failure, with
//! a whitelisted command set and typed parameter rendering.

pub mod client;
pub mod probe;
pub mod rest;
pub mod ssh;

pub use client::{CallOutcome, HttpSshTransport, RouterOsClient, Transport};
pub use probe::{FailureReason, ProbeOutcome, ProbeReport};
pub use rest::{RestRequest, RosOp};
pub use ssh::SshCommand;

//! Shared types for the NetWarden defense engine.
//!
//! Event and decision types exchanged between the engine and its host,
//! the common error type, and subnet keying helpers.

pub mod error;
pub mod events;
pub mod net;

pub use error::{WardenError, WardenResult};
pub use events::{
    AdmissionDecision, BanTarget, ConnMeta, DenyReason, ShieldEvent, ViolationKind,
};
pub use net::{subnet16, subnet24, SubnetKey};

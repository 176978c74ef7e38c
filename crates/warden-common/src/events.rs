//! Events exchanged with the host networking layer and collaborators.
//!
//! Inbound connection-lifecycle metadata, the synchronous admission verdict,
//! and the asynchronous events fanned out to alerting/audit/persistence.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::net::SubnetKey;

/// Metadata delivered with a connection-observed event.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub ip: IpAddr,
    pub hostname: String,
    pub port: u16,
    pub protocol_version: i32,
    pub connection_id: u64,
    pub timestamp_ms: u64,
}

/// Violation categories reported by the host or raised internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    RateLimit,
    InvalidHandshake,
    SlowConnection,
    MalformedMetadata,
    ConnectedDuringAttack,
}

/// Why a connection was refused. Ordered to match the admission chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blacklisted,
    TempBanned,
    SubnetBanned,
    SubnetThrottled,
    PendingExhaustion,
    RateLimited,
    VerifiedOnly,
    LockdownPoolFull,
}

/// Synchronous verdict returned for every inbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allow: bool,
    pub reason: Option<DenyReason>,
    /// Message key the host may use when kicking the client.
    pub kick_message_key: Option<String>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            kick_message_key: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        let key = match reason {
            DenyReason::Blacklisted => "kick.blacklisted",
            DenyReason::TempBanned => "kick.temp_banned",
            DenyReason::SubnetBanned | DenyReason::SubnetThrottled => "kick.subnet",
            DenyReason::PendingExhaustion => "kick.slow_connection",
            DenyReason::RateLimited => "kick.rate_limited",
            DenyReason::VerifiedOnly => "kick.verified_only",
            DenyReason::LockdownPoolFull => "kick.lockdown",
        };
        Self {
            allow: false,
            reason: Some(reason),
            kick_message_key: Some(key.to_string()),
        }
    }

    pub fn is_deny(&self) -> bool {
        !self.allow
    }
}

/// Target of an automatic ban.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanTarget {
    Ip(IpAddr),
    Subnet(SubnetKey),
}

impl std::fmt::Display for BanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Subnet(net) => write!(f, "{net}"),
        }
    }
}

/// Asynchronous events dispatched to alerting, audit, and persistence
/// collaborators. Never produced or consumed on the admission path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ShieldEvent {
    LevelChanged {
        previous: String,
        next: String,
        observed_cps: f64,
        at_ms: u64,
    },
    AutoBan {
        id: String,
        target: BanTarget,
        duration_ms: u64,
        reason: String,
        at_ms: u64,
    },
    AttackEnded {
        peak_level: String,
        peak_cps: f64,
        duration_ms: u64,
        at_ms: u64,
    },
    /// Mutable state changed; the persistence collaborator should save.
    SaveRequested { at_ms: u64 },
}

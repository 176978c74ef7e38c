//! Connection admission control.
//!
//! Runs every observed connection through an ordered rejection chain:
//! permanent blacklist, whitelist short-circuit, active temp ban, subnet
//! ban, subnet throttle, pending-exhaustion flag, then the level-gated
//! rate limiter. The first check that rejects wins and its reason is
//! reported back to the caller; the whitelist bypasses everything after
//! the blacklist.

use std::collections::HashMap;
use std::net::IpAddr;

use dashmap::{DashMap, DashSet};
use tracing::info;

use warden_common::{AdmissionDecision, DenyReason};

use crate::pending::PendingTracker;
use crate::subnet::SubnetAnalyzer;
use crate::throttle::{ThrottleEngine, ThrottleVerdict};
use crate::AttackLevel;

pub struct AdmissionController {
    blacklist: DashSet<IpAddr>,
    whitelist: DashSet<IpAddr>,
    /// Temp bans keyed by IP, valued by expiry timestamp.
    temp_bans: DashMap<IpAddr, u64>,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            blacklist: DashSet::new(),
            whitelist: DashSet::new(),
            temp_bans: DashMap::new(),
        }
    }

    pub fn decide(
        &self,
        ip: IpAddr,
        conn_id: u64,
        verified: bool,
        level: AttackLevel,
        subnets: &SubnetAnalyzer,
        pending: &PendingTracker,
        throttle: &ThrottleEngine,
        now_ms: u64,
    ) -> AdmissionDecision {
        if self.blacklist.contains(&ip) {
            return AdmissionDecision::deny(DenyReason::Blacklisted);
        }
        if self.whitelist.contains(&ip) {
            return AdmissionDecision::allow();
        }
        if self.is_temp_banned(ip, now_ms) {
            return AdmissionDecision::deny(DenyReason::TempBanned);
        }
        if subnets.is_banned(ip, now_ms) {
            return AdmissionDecision::deny(DenyReason::SubnetBanned);
        }
        if !verified && subnets.is_throttled(ip, now_ms) {
            if throttle.try_acquire_reduced(ip, now_ms) != ThrottleVerdict::Allowed {
                return AdmissionDecision::deny(DenyReason::SubnetThrottled);
            }
        }
        if pending.is_flagged(ip) {
            return AdmissionDecision::deny(DenyReason::PendingExhaustion);
        }
        match throttle.try_acquire(ip, conn_id, verified, level, now_ms) {
            ThrottleVerdict::Allowed => AdmissionDecision::allow(),
            ThrottleVerdict::Limited => AdmissionDecision::deny(DenyReason::RateLimited),
            ThrottleVerdict::VerifiedOnly => AdmissionDecision::deny(DenyReason::VerifiedOnly),
            ThrottleVerdict::PoolFull => AdmissionDecision::deny(DenyReason::LockdownPoolFull),
        }
    }

    /// Impose a temp ban until the given timestamp. An existing ban is
    /// only extended, never shortened.
    pub fn impose_ban(&self, ip: IpAddr, until_ms: u64) {
        let mut extended = false;
        self.temp_bans
            .entry(ip)
            .and_modify(|e| {
                if until_ms > *e {
                    *e = until_ms;
                    extended = true;
                }
            })
            .or_insert_with(|| {
                extended = true;
                until_ms
            });
        if extended {
            info!(%ip, until_ms, "temp ban imposed");
        }
    }

    pub fn is_temp_banned(&self, ip: IpAddr, now_ms: u64) -> bool {
        let until = match self.temp_bans.get(&ip) {
            Some(entry) => *entry,
            None => return false,
        };
        if until > now_ms {
            true
        } else {
            // Guard from the lookup above is already dropped.
            self.temp_bans.remove(&ip);
            false
        }
    }

    pub fn lift_ban(&self, ip: IpAddr) -> bool {
        self.temp_bans.remove(&ip).is_some()
    }

    pub fn blacklist_add(&self, ip: IpAddr) {
        self.blacklist.insert(ip);
    }

    pub fn blacklist_remove(&self, ip: IpAddr) -> bool {
        self.blacklist.remove(&ip).is_some()
    }

    pub fn whitelist_add(&self, ip: IpAddr) {
        self.whitelist.insert(ip);
    }

    pub fn whitelist_remove(&self, ip: IpAddr) -> bool {
        self.whitelist.remove(&ip).is_some()
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist.contains(&ip)
    }

    pub fn active_ban_count(&self, now_ms: u64) -> usize {
        self.temp_bans.iter().filter(|e| *e.value() > now_ms).count()
    }

    /// Purge expired temp bans.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.temp_bans.len();
        self.temp_bans.retain(|_, until| *until > now_ms);
        before - self.temp_bans.len()
    }

    pub fn export_bans(&self) -> HashMap<IpAddr, u64> {
        self.temp_bans
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    pub fn import_bans(&self, bans: HashMap<IpAddr, u64>, now_ms: u64) {
        for (ip, until) in bans {
            if until > now_ms {
                self.impose_ban(ip, until);
            }
        }
    }

    pub fn export_blacklist(&self) -> Vec<IpAddr> {
        self.blacklist.iter().map(|e| *e).collect()
    }

    pub fn export_whitelist(&self) -> Vec<IpAddr> {
        self.whitelist.iter().map(|e| *e).collect()
    }

    pub fn import_lists(&self, blacklist: Vec<IpAddr>, whitelist: Vec<IpAddr>) {
        for ip in blacklist {
            self.blacklist.insert(ip);
        }
        for ip in whitelist {
            self.whitelist.insert(ip);
        }
    }
}

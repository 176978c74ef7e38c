//! Subnet-level coordination analysis.
//!
//! Mirrors the per-IP reputation at /24 and /16 granularity. Many distinct
//! /24s active under one /16 inside a sliding window reads as a coordinated
//! botnet: the /16 is flagged, every participating /24 is penalized exactly
//! once per flag event, and a /24 whose reputation crosses the ban threshold
//! is banned. Decay is lazy on access; the sweep only evicts idle entries.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use dashmap::DashMap;
use tracing::warn;

use warden_common::{subnet16, subnet24, SubnetKey};

#[derive(Debug, Clone)]
pub struct SubnetConfig {
    /// Sliding window for "active" membership.
    pub window_ms: u64,
    /// Distinct /24s under a /16 that constitute coordination.
    pub coordination_threshold: usize,
    /// Reputation penalty per participating /24 per flag event.
    pub coordination_penalty: f64,
    /// Minimum spacing between flag events for the same /16.
    pub flag_cooldown_ms: u64,
    pub baseline: f64,
    pub decay_per_hour: f64,
    /// /24 reputation at or below this is banned.
    pub ban_threshold: f64,
    pub ban_ms: u64,
    /// Reputation at or below this is throttled.
    pub throttle_threshold: f64,
    pub throttle_ms: u64,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            coordination_threshold: 20,
            coordination_penalty: 15.0,
            flag_cooldown_ms: 5 * 60_000,
            baseline: 50.0,
            decay_per_hour: 5.0,
            ban_threshold: 20.0,
            ban_ms: 60 * 60_000,
            throttle_threshold: 35.0,
            throttle_ms: 10 * 60_000,
        }
    }
}

#[derive(Debug)]
struct SubnetState {
    reputation: f64,
    last_decay_ms: u64,
    throttled_until_ms: u64,
    banned_until_ms: u64,
    recent: VecDeque<u64>,
}

impl SubnetState {
    fn new(baseline: f64, now_ms: u64) -> Self {
        Self {
            reputation: baseline,
            last_decay_ms: now_ms,
            throttled_until_ms: 0,
            banned_until_ms: 0,
            recent: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct GroupState {
    /// Active /24 members keyed to their last-seen timestamp.
    members: HashMap<SubnetKey, u64>,
    /// None until the group has been flagged once; the first flag is not
    /// subject to the cool-down.
    last_flag_ms: Option<u64>,
}

/// Result of recording one connection.
#[derive(Debug, Default)]
pub struct CoordinationOutcome {
    /// The /16 flagged as coordinated on this observation, if any.
    pub flagged: Option<SubnetKey>,
    /// /24 subnets banned by this flag event, with ban duration.
    pub bans: Vec<(SubnetKey, u64)>,
    pub penalized: usize,
}

pub struct SubnetAnalyzer {
    config: SubnetConfig,
    nets24: DashMap<SubnetKey, SubnetState>,
    nets16: DashMap<SubnetKey, SubnetState>,
    groups: DashMap<SubnetKey, GroupState>,
}

impl SubnetAnalyzer {
    pub fn new(config: SubnetConfig) -> Self {
        Self {
            config,
            nets24: DashMap::new(),
            nets16: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    /// Record one observed connection and run coordination detection.
    pub fn record_connection(&self, ip: IpAddr, now_ms: u64) -> CoordinationOutcome {
        let k24 = subnet24(ip);
        let k16 = subnet16(ip);
        let cutoff = now_ms.saturating_sub(self.config.window_ms);

        {
            let mut state = self
                .nets24
                .entry(k24)
                .or_insert_with(|| SubnetState::new(self.config.baseline, now_ms));
            state.recent.push_back(now_ms);
            while state.recent.front().is_some_and(|&t| t < cutoff) {
                state.recent.pop_front();
            }
        }

        let flagged = {
            let mut group = self.groups.entry(k16).or_insert_with(|| GroupState {
                members: HashMap::new(),
                last_flag_ms: None,
            });
            group.members.insert(k24, now_ms);
            group.members.retain(|_, &mut seen| seen >= cutoff);

            let cooled = group
                .last_flag_ms
                .is_none_or(|t| now_ms.saturating_sub(t) >= self.config.flag_cooldown_ms);
            if group.members.len() >= self.config.coordination_threshold && cooled {
                group.last_flag_ms = Some(now_ms);
                Some(group.members.keys().copied().collect::<Vec<_>>())
            } else {
                None
            }
        };

        let Some(members) = flagged else {
            return CoordinationOutcome::default();
        };

        warn!(
            net = %k16,
            subnets = members.len(),
            "coordinated subnet activity flagged"
        );

        let mut outcome = CoordinationOutcome {
            flagged: Some(k16),
            bans: Vec::new(),
            penalized: members.len(),
        };

        for member in &members {
            if let Some(ban_ms) = self.penalize_24(*member, now_ms) {
                outcome.bans.push((*member, ban_ms));
            }
        }
        self.penalize_16(k16, now_ms);

        outcome
    }

    /// Penalize one /24 once; returns a ban duration if it crossed the
    /// ban threshold and was not already banned.
    fn penalize_24(&self, key: SubnetKey, now_ms: u64) -> Option<u64> {
        let cfg = &self.config;
        let mut state = self
            .nets24
            .entry(key)
            .or_insert_with(|| SubnetState::new(cfg.baseline, now_ms));
        Self::credit_decay(&mut state, cfg, now_ms);
        state.reputation = (state.reputation - cfg.coordination_penalty).max(0.0);

        if state.reputation <= cfg.ban_threshold && state.banned_until_ms <= now_ms {
            state.banned_until_ms = now_ms + cfg.ban_ms;
            return Some(cfg.ban_ms);
        }
        if state.reputation <= cfg.throttle_threshold && state.throttled_until_ms <= now_ms {
            state.throttled_until_ms = now_ms + cfg.throttle_ms;
        }
        None
    }

    fn penalize_16(&self, key: SubnetKey, now_ms: u64) {
        let cfg = &self.config;
        let mut state = self
            .nets16
            .entry(key)
            .or_insert_with(|| SubnetState::new(cfg.baseline, now_ms));
        Self::credit_decay(&mut state, cfg, now_ms);
        state.reputation = (state.reputation - cfg.coordination_penalty).max(0.0);
        if state.reputation <= cfg.throttle_threshold && state.throttled_until_ms <= now_ms {
            state.throttled_until_ms = now_ms + cfg.throttle_ms;
        }
    }

    /// Credit decay in whole elapsed hours only, keeping the sub-hour
    /// remainder, so threshold comparisons between closely spaced penalties
    /// are not perturbed by fractional credits.
    fn credit_decay(state: &mut SubnetState, cfg: &SubnetConfig, now_ms: u64) {
        if state.reputation >= cfg.baseline {
            state.last_decay_ms = now_ms;
            return;
        }
        let whole_hours = now_ms.saturating_sub(state.last_decay_ms) / 3_600_000;
        if whole_hours > 0 {
            state.reputation = (state.reputation + cfg.decay_per_hour * whole_hours as f64)
                .min(cfg.baseline);
            state.last_decay_ms += whole_hours * 3_600_000;
        }
    }

    pub fn is_banned(&self, ip: IpAddr, now_ms: u64) -> bool {
        self.banned_until(subnet24(ip))
            .max(self.banned_until(subnet16(ip)))
            > now_ms
    }

    pub fn is_throttled(&self, ip: IpAddr, now_ms: u64) -> bool {
        let t24 = self
            .nets24
            .get(&subnet24(ip))
            .map(|s| s.throttled_until_ms)
            .unwrap_or(0);
        let t16 = self
            .nets16
            .get(&subnet16(ip))
            .map(|s| s.throttled_until_ms)
            .unwrap_or(0);
        t24.max(t16) > now_ms
    }

    fn banned_until(&self, key: SubnetKey) -> u64 {
        self.nets24
            .get(&key)
            .or_else(|| self.nets16.get(&key))
            .map(|s| s.banned_until_ms)
            .unwrap_or(0)
    }

    pub fn reputation_24(&self, ip: IpAddr, now_ms: u64) -> f64 {
        match self.nets24.get_mut(&subnet24(ip)) {
            Some(mut s) => {
                Self::credit_decay(&mut s, &self.config, now_ms);
                s.reputation
            }
            None => self.config.baseline,
        }
    }

    pub fn banned_count(&self, now_ms: u64) -> usize {
        self.nets24
            .iter()
            .filter(|e| e.banned_until_ms > now_ms)
            .count()
    }

    pub fn throttled_count(&self, now_ms: u64) -> usize {
        self.nets24
            .iter()
            .filter(|e| e.throttled_until_ms > now_ms)
            .count()
            + self
                .nets16
                .iter()
                .filter(|e| e.throttled_until_ms > now_ms)
                .count()
    }

    /// Evict aggregates that have returned to a neutral, idle state.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let cfg = self.config.clone();
        let cutoff = now_ms.saturating_sub(cfg.window_ms);
        let before = self.nets24.len() + self.nets16.len() + self.groups.len();

        let healthy = |state: &mut SubnetState| {
            Self::credit_decay(state, &cfg, now_ms);
            while state.recent.front().is_some_and(|&t| t < cutoff) {
                state.recent.pop_front();
            }
            state.recent.is_empty()
                && state.reputation >= cfg.baseline
                && state.banned_until_ms <= now_ms
                && state.throttled_until_ms <= now_ms
        };

        self.nets24.retain(|_, s| !healthy(s));
        self.nets16.retain(|_, s| !healthy(s));
        self.groups.retain(|_, g| {
            g.members.retain(|_, &mut seen| seen >= cutoff);
            !g.members.is_empty()
        });

        before - (self.nets24.len() + self.nets16.len() + self.groups.len())
    }
}

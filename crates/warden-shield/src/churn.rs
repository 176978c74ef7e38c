//! Join/quit churn tracking.
//!
//! A sliding window of join timestamps per IP flags rapid joiners; a
//! decaying quit counter flags frequent quitters. The quit counter decays
//! lazily: a fixed amount is credited for each full quiet interval since
//! the last quit. Both flags feed a weighted combined threat score.

use std::collections::VecDeque;
use std::net::IpAddr;

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct ChurnConfig {
    /// Sliding window for join counting.
    pub join_window_ms: u64,
    /// Joins inside the window before the IP is a rapid joiner.
    pub join_threshold: usize,
    /// Quiet interval after which the quit counter starts decaying.
    pub quit_decay_interval_ms: u64,
    /// Amount removed from the quit counter per elapsed interval.
    pub quit_decay_amount: u32,
    /// Quit count at which the IP is a frequent quitter.
    pub quit_threshold: u32,
    pub rapid_join_weight: f64,
    pub frequent_quit_weight: f64,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            join_window_ms: 60_000,
            join_threshold: 5,
            quit_decay_interval_ms: 30_000,
            quit_decay_amount: 1,
            quit_threshold: 4,
            rapid_join_weight: 2.0,
            frequent_quit_weight: 1.0,
        }
    }
}

#[derive(Debug, Default)]
struct ChurnState {
    joins: VecDeque<u64>,
    quit_count: u32,
    /// None until the IP has quit at least once.
    last_quit_ms: Option<u64>,
}

pub struct ChurnTracker {
    config: ChurnConfig,
    per_ip: DashMap<IpAddr, ChurnState>,
}

impl ChurnTracker {
    pub fn new(config: ChurnConfig) -> Self {
        Self {
            config,
            per_ip: DashMap::new(),
        }
    }

    pub fn on_join(&self, ip: IpAddr, now_ms: u64) {
        let mut state = self.per_ip.entry(ip).or_default();
        let cutoff = now_ms.saturating_sub(self.config.join_window_ms);
        state.joins.push_back(now_ms);
        while state.joins.front().is_some_and(|&t| t < cutoff) {
            state.joins.pop_front();
        }
    }

    pub fn on_quit(&self, ip: IpAddr, now_ms: u64) {
        let mut state = self.per_ip.entry(ip).or_default();
        Self::decay_quits(&mut state, &self.config, now_ms);
        state.quit_count += 1;
        state.last_quit_ms = Some(now_ms);
    }

    fn decay_quits(state: &mut ChurnState, config: &ChurnConfig, now_ms: u64) {
        if state.quit_count == 0 {
            return;
        }
        let Some(last) = state.last_quit_ms else {
            return;
        };
        let intervals = now_ms.saturating_sub(last) / config.quit_decay_interval_ms;
        if intervals > 0 {
            let credit = (intervals as u32).saturating_mul(config.quit_decay_amount);
            state.quit_count = state.quit_count.saturating_sub(credit);
            // Advance by the intervals consumed so repeated reads do not
            // re-credit the same quiet time.
            state.last_quit_ms = Some(last + intervals * config.quit_decay_interval_ms);
        }
    }

    pub fn is_rapid_joiner(&self, ip: IpAddr, now_ms: u64) -> bool {
        let cutoff = now_ms.saturating_sub(self.config.join_window_ms);
        self.per_ip
            .get(&ip)
            .map(|s| s.joins.iter().filter(|&&t| t >= cutoff).count() >= self.config.join_threshold)
            .unwrap_or(false)
    }

    pub fn is_frequent_quitter(&self, ip: IpAddr, now_ms: u64) -> bool {
        self.per_ip
            .get_mut(&ip)
            .map(|mut s| {
                Self::decay_quits(&mut s, &self.config, now_ms);
                s.quit_count >= self.config.quit_threshold
            })
            .unwrap_or(false)
    }

    /// Weighted sum of the churn flags, feeding threat scoring.
    pub fn threat_score(&self, ip: IpAddr, now_ms: u64) -> f64 {
        let mut score = 0.0;
        if self.is_rapid_joiner(ip, now_ms) {
            score += self.config.rapid_join_weight;
        }
        if self.is_frequent_quitter(ip, now_ms) {
            score += self.config.frequent_quit_weight;
        }
        score
    }

    /// Evict IPs with no joins in the window and a fully decayed quit count.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.config.join_window_ms);
        let config = self.config.clone();
        let before = self.per_ip.len();
        self.per_ip.retain(|_, state| {
            Self::decay_quits(state, &config, now_ms);
            while state.joins.front().is_some_and(|&t| t < cutoff) {
                state.joins.pop_front();
            }
            !state.joins.is_empty() || state.quit_count > 0
        });
        before - self.per_ip.len()
    }
}

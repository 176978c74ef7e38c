//! Adaptive connection-admission defense engine.
//!
//! Learns what normal traffic looks like per time-of-week, scores each tick
//! against that baseline and a short rolling window, and escalates through a
//! hysteretic five-level posture that gates per-IP throttling and admission.
//! Per-IP and per-subnet reputation feed automatic tiered banning.
//!
//! The [`Shield`] context is the single entry point: the host networking
//! layer reports connection lifecycle events and receives a synchronous
//! [`AdmissionDecision`] for each inbound connection, while alerting, audit
//! and persistence collaborators subscribe to the asynchronous
//! [`ShieldEvent`] stream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod admission;
pub mod anomaly;
pub mod baseline;
pub mod burst;
pub mod churn;
pub mod classifier;
pub mod fingerprint;
pub mod level;
pub mod pending;
pub mod reputation;
pub mod ring;
pub mod runtime;
pub mod subnet;
pub mod throttle;

pub use warden_common::{
    AdmissionDecision, BanTarget, ConnMeta, DenyReason, ShieldEvent, ViolationKind, WardenError,
    WardenResult,
};

use admission::AdmissionController;
use anomaly::{AnomalyConfig, ShortWindowDetector};
use baseline::{BaselineSnapshot, WeeklyBaseline};
use burst::BurstTracker;
use churn::{ChurnConfig, ChurnTracker};
use classifier::{classify, AttackArchetype, ClassifierConfig};
use fingerprint::{FingerprintConfig, FingerprintTracker};
use level::{LevelConfig, LevelMachine};
use pending::{PendingConfig, PendingTracker};
use reputation::{ReputationConfig, ReputationEngine, ReputationEntry};
use subnet::{SubnetAnalyzer, SubnetConfig};
use throttle::{ThrottleConfig, ThrottleEngine};
use warden_common::net::hostname_is_malformed;

// ============================================================================
// Metric vocabulary
// ============================================================================

/// Number of metrics tracked per baseline slot.
pub const METRIC_COUNT: usize = 6;

/// Index of each tracked metric inside a sample vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cps = 0,
    UniqueIps = 1,
    PacketRate = 2,
    JoinLeaveRatio = 3,
    PendingCount = 4,
    BlockRate = 5,
}

/// One tick's aggregate sample, folded into the weekly baseline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrafficSample {
    pub cps: f64,
    pub unique_ips: f64,
    pub packet_rate: f64,
    pub join_leave_ratio: f64,
    pub pending_count: f64,
    pub block_rate: f64,
}

impl TrafficSample {
    pub fn as_vector(&self) -> [f64; METRIC_COUNT] {
        [
            self.cps,
            self.unique_ips,
            self.packet_rate,
            self.join_leave_ratio,
            self.pending_count,
            self.block_rate,
        ]
    }
}

/// Traffic shape for one tick, consumed by the attack classifier and the
/// dashboard. Rates are per second, which at one tick per second makes them
/// raw per-tick counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TickSnapshot {
    pub cps: f64,
    pub pending_connections: f64,
    pub total_connections: f64,
    pub handshake_completion_rate: f64,
    pub login_rate: f64,
    pub ping_rate: f64,
    pub unique_ips: f64,
    pub avg_response_size: f64,
    pub cps_variance: f64,
}

// ============================================================================
// Attack posture
// ============================================================================

/// Defense posture. Variant order is severity order, so the derived `Ord`
/// compares escalation directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AttackLevel {
    #[default]
    None,
    Elevated,
    High,
    Critical,
    Lockdown,
}

impl AttackLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Lockdown => "lockdown",
        }
    }
}

/// Severity attached to anomaly alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Elevated,
    High,
    Critical,
}

/// A single anomaly finding raised by the short-window detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub level: AlertLevel,
    pub metric: String,
    pub z_score: f64,
    pub current: f64,
    pub mean: f64,
    pub details: String,
    pub at_ms: u64,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ShieldConfig {
    pub anomaly: AnomalyConfig,
    pub classifier: ClassifierConfig,
    pub level: LevelConfig,
    pub reputation: ReputationConfig,
    pub subnet: SubnetConfig,
    pub pending: PendingConfig,
    pub churn: ChurnConfig,
    pub fingerprint: FingerprintConfig,
    pub throttle: ThrottleConfig,
    /// EMA smoothing factor for baseline updates.
    pub baseline_alpha: f64,
    pub baseline_stddev_floor: f64,
    /// Samples a slot needs before its learned mean replaces the static base.
    pub baseline_min_samples: u64,
    /// Fallback base connection rate while the baseline is unreliable.
    pub static_base_cps: f64,
    /// Per-second connection count that raises attack mode immediately.
    pub burst_threshold: u64,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// Recent anomaly alerts retained for the dashboard.
    pub alert_history: usize,
}

impl ShieldConfig {
    /// Reject values that would silently disable a defense layer.
    pub fn validate(&self) -> WardenResult<()> {
        if !(self.baseline_alpha > 0.0 && self.baseline_alpha <= 1.0) {
            return Err(WardenError::Config(format!(
                "baseline_alpha {} outside (0, 1]",
                self.baseline_alpha
            )));
        }
        if self.static_base_cps <= 0.0 {
            return Err(WardenError::Config(
                "static_base_cps must be positive".to_string(),
            ));
        }
        if self.reputation.long_ban_threshold > self.reputation.short_ban_threshold {
            return Err(WardenError::Config(
                "long ban threshold above short ban threshold".to_string(),
            ));
        }
        if self.level.lockdown_mult <= self.level.critical_mult {
            return Err(WardenError::Config(
                "lockdown multiple must exceed critical multiple".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(WardenError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            anomaly: AnomalyConfig::default(),
            classifier: ClassifierConfig::default(),
            level: LevelConfig::default(),
            reputation: ReputationConfig::default(),
            subnet: SubnetConfig::default(),
            pending: PendingConfig::default(),
            churn: ChurnConfig::default(),
            fingerprint: FingerprintConfig::default(),
            throttle: ThrottleConfig::default(),
            baseline_alpha: 0.2,
            baseline_stddev_floor: 1.0,
            baseline_min_samples: 30,
            static_base_cps: 10.0,
            burst_threshold: 100,
            event_capacity: 256,
            alert_history: 32,
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// All mutable state worth persisting across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub reputation: HashMap<IpAddr, ReputationEntry>,
    pub temp_bans: HashMap<IpAddr, u64>,
    pub blacklist: Vec<IpAddr>,
    pub whitelist: Vec<IpAddr>,
    pub baseline: BaselineSnapshot,
}

/// Read-only view served to operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub level: String,
    pub attack_mode: bool,
    pub archetype: String,
    pub base_cps: f64,
    pub window_mean_cps: f64,
    pub window_stddev_cps: f64,
    pub last_tick: TickSnapshot,
    pub pending_connections: usize,
    pub active_connections: usize,
    pub temp_bans: usize,
    pub banned_subnets: usize,
    pub throttled_subnets: usize,
    pub tracked_ips: usize,
    pub lockdown_slots_used: usize,
    pub level_transitions: u64,
    pub worst_ips: Vec<(IpAddr, f64)>,
    pub recent_alerts: Vec<AnomalyAlert>,
}

// Per-tick counters, drained by the aggregator each tick.
#[derive(Default)]
struct TickCounters {
    logins: AtomicU64,
    pings: AtomicU64,
    handshakes: AtomicU64,
    blocked: AtomicU64,
    quits: AtomicU64,
    packets: AtomicU64,
    response_bytes: AtomicU64,
    responses: AtomicU64,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Shield {
    config: ShieldConfig,
    baseline: WeeklyBaseline,
    anomaly: ShortWindowDetector,
    level: LevelMachine,
    reputation: ReputationEngine,
    subnets: SubnetAnalyzer,
    pending: PendingTracker,
    burst: BurstTracker,
    churn: ChurnTracker,
    fingerprints: FingerprintTracker,
    throttle: ThrottleEngine,
    admission: AdmissionController,
    attack_mode: Arc<AtomicBool>,
    events: broadcast::Sender<ShieldEvent>,
    counters: TickCounters,
    tick_ips: Mutex<HashSet<IpAddr>>,
    archetype: Mutex<AttackArchetype>,
    last_tick: Mutex<TickSnapshot>,
    base_cps_bits: AtomicU64,
    recent_alerts: Mutex<VecDeque<AnomalyAlert>>,
}

impl Shield {
    pub fn new(config: ShieldConfig) -> WardenResult<Self> {
        config.validate()?;
        let attack_mode = Arc::new(AtomicBool::new(false));
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            baseline: WeeklyBaseline::new(config.baseline_alpha, config.baseline_stddev_floor),
            anomaly: ShortWindowDetector::new(config.anomaly.clone()),
            level: LevelMachine::new(config.level.clone(), attack_mode.clone()),
            reputation: ReputationEngine::new(config.reputation.clone()),
            subnets: SubnetAnalyzer::new(config.subnet.clone()),
            pending: PendingTracker::new(config.pending.clone()),
            burst: BurstTracker::new(config.burst_threshold, attack_mode.clone()),
            churn: ChurnTracker::new(config.churn.clone()),
            fingerprints: FingerprintTracker::new(config.fingerprint.clone()),
            throttle: ThrottleEngine::new(config.throttle.clone()),
            admission: AdmissionController::new(),
            attack_mode,
            events,
            counters: TickCounters::default(),
            tick_ips: Mutex::new(HashSet::new()),
            archetype: Mutex::new(AttackArchetype::None),
            last_tick: Mutex::new(TickSnapshot::default()),
            base_cps_bits: AtomicU64::new(config.static_base_cps.to_bits()),
            recent_alerts: Mutex::new(VecDeque::new()),
            config,
        })
    }

    /// Subscribe to the asynchronous event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ShieldEvent> {
        self.events.subscribe()
    }

    pub fn attack_level(&self) -> AttackLevel {
        self.level.current()
    }

    /// Legacy boolean posture; true at or above `Elevated` or when the
    /// burst tracker tripped before the state machine caught up.
    pub fn attack_mode(&self) -> bool {
        self.attack_mode.load(Ordering::Relaxed)
    }

    pub fn current_archetype(&self) -> AttackArchetype {
        *self.archetype.lock()
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// The synchronous admission check run for every inbound connection.
    pub fn on_connection_observed(&self, meta: &ConnMeta) -> AdmissionDecision {
        let now_ms = meta.timestamp_ms;
        let ip = meta.ip;

        self.burst.record();
        self.churn.on_join(ip, now_ms);
        self.tick_ips.lock().insert(ip);

        if hostname_is_malformed(&meta.hostname) {
            self.apply_violation(ip, ViolationKind::MalformedMetadata, None, now_ms);
        }

        let outcome = self.subnets.record_connection(ip, now_ms);
        for (net, duration_ms) in &outcome.bans {
            self.emit(ShieldEvent::AutoBan {
                id: Uuid::new_v4().to_string(),
                target: BanTarget::Subnet(*net),
                duration_ms: *duration_ms,
                reason: "coordinated subnet activity".to_string(),
                at_ms: now_ms,
            });
        }

        if self.attack_mode() {
            self.apply_violation(ip, ViolationKind::ConnectedDuringAttack, None, now_ms);
        }

        let verified = self.reputation.is_verified(ip);
        let decision = self.admission.decide(
            ip,
            meta.connection_id,
            verified,
            self.level.current(),
            &self.subnets,
            &self.pending,
            &self.throttle,
            now_ms,
        );

        if decision.allow {
            self.pending.observe(
                ip,
                meta.connection_id,
                meta.protocol_version,
                &meta.hostname,
                now_ms,
            );
        } else {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            if decision.reason == Some(DenyReason::RateLimited) {
                self.apply_violation(ip, ViolationKind::RateLimit, None, now_ms);
            }
            debug!(%ip, reason = ?decision.reason, "connection refused");
        }
        decision
    }

    /// Handshake finished; the connection is now live.
    pub fn on_handshake_complete(&self, ip: IpAddr, conn_id: u64, now_ms: u64) {
        let Some(conn) = self.pending.complete(ip, conn_id) else {
            return;
        };
        self.counters.handshakes.fetch_add(1, Ordering::Relaxed);
        let elapsed = now_ms.saturating_sub(conn.start_ms);
        let flagged = self.fingerprints.record(
            ip,
            conn.protocol_version,
            &conn.hostname,
            elapsed,
            now_ms,
        );
        if flagged {
            debug!(%ip, "handshake fingerprint belongs to a mass cluster");
        }
    }

    pub fn on_connection_closed(&self, ip: IpAddr, conn_id: u64, now_ms: u64) {
        let tracked = self.pending.close(ip, conn_id);
        self.throttle.release(conn_id);
        // A close for an id that was never admitted carries no churn signal.
        if tracked {
            self.churn.on_quit(ip, now_ms);
            self.counters.quits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Successful authentication: the IP becomes verified and earns credit.
    pub fn on_login_success(&self, ip: IpAddr, username: &str, now_ms: u64) {
        self.counters.logins.fetch_add(1, Ordering::Relaxed);
        self.reputation.record_success(ip, now_ms);
        self.reputation.mark_verified(ip, now_ms);
        debug!(%ip, username, "login verified");
    }

    /// Host-reported violation; may yield an automatic ban.
    pub fn on_violation(
        &self,
        ip: IpAddr,
        kind: ViolationKind,
        points: Option<f64>,
        now_ms: u64,
    ) {
        self.apply_violation(ip, kind, points, now_ms);
    }

    pub fn on_status_ping(&self, ip: IpAddr, now_ms: u64) {
        self.counters.pings.fetch_add(1, Ordering::Relaxed);
        if self.pending.keepalive(ip, now_ms) {
            self.apply_violation(ip, ViolationKind::RateLimit, None, now_ms);
        }
    }

    /// Outbound response payload size, for the amplification signature.
    pub fn on_response(&self, bytes: u64) {
        self.counters.response_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.counters.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_packets(&self, count: u64) {
        self.counters.packets.fetch_add(count, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Operator controls
    // ------------------------------------------------------------------

    pub fn blacklist(&self, ip: IpAddr) {
        self.admission.blacklist_add(ip);
    }

    pub fn whitelist(&self, ip: IpAddr) {
        self.admission.whitelist_add(ip);
    }

    pub fn unban(&self, ip: IpAddr) -> bool {
        self.admission.lift_ban(ip)
    }

    pub fn reset_baseline(&self) {
        self.baseline.reset();
        info!("baseline reset by operator");
    }

    /// Combined per-IP threat score from the pattern detectors and
    /// reputation deficit. Higher is worse.
    pub fn threat_score(&self, ip: IpAddr, now_ms: u64) -> f64 {
        let mut score = self.churn.threat_score(ip, now_ms);
        if self.pending.is_flagged(ip) {
            score += 2.0;
        }
        if self.fingerprints.is_flagged(ip, now_ms) {
            score += 3.0;
        }
        let deficit = self.config.reputation.baseline - self.reputation.score(ip, now_ms);
        score + (deficit / 10.0).max(0.0)
    }

    // ------------------------------------------------------------------
    // Periodic aggregation
    // ------------------------------------------------------------------

    /// One aggregation tick: drain the per-tick counters, run detection and
    /// classification, and advance the level state machine. Expected once
    /// per second.
    pub fn tick(&self, now_ms: u64) {
        let cps = self.burst.take() as f64;
        let unique_ips = {
            let mut set = self.tick_ips.lock();
            let n = set.len();
            set.clear();
            n as f64
        };
        let logins = self.counters.logins.swap(0, Ordering::Relaxed) as f64;
        let pings = self.counters.pings.swap(0, Ordering::Relaxed) as f64;
        let handshakes = self.counters.handshakes.swap(0, Ordering::Relaxed) as f64;
        let blocked = self.counters.blocked.swap(0, Ordering::Relaxed) as f64;
        let quits = self.counters.quits.swap(0, Ordering::Relaxed) as f64;
        let packets = self.counters.packets.swap(0, Ordering::Relaxed) as f64;
        let response_bytes = self.counters.response_bytes.swap(0, Ordering::Relaxed) as f64;
        let responses = self.counters.responses.swap(0, Ordering::Relaxed) as f64;

        let alerts = self.anomaly.observe(cps, now_ms);
        for alert in &alerts {
            warn!(
                metric = %alert.metric,
                z = alert.z_score,
                details = %alert.details,
                "anomaly raised"
            );
        }
        if !alerts.is_empty() {
            let mut recent = self.recent_alerts.lock();
            for alert in alerts {
                if recent.len() == self.config.alert_history {
                    recent.pop_front();
                }
                recent.push_back(alert);
            }
        }

        let slot = WeeklyBaseline::slot_for_ms(now_ms);
        let base_cps = if self.baseline.is_reliable(slot, self.config.baseline_min_samples) {
            self.baseline
                .expected(slot, Metric::Cps as usize)
                .mean
                .max(1.0)
        } else {
            self.config.static_base_cps.max(1.0)
        };
        self.base_cps_bits
            .store(base_cps.to_bits(), Ordering::Relaxed);

        let (_, window_stddev) = self.anomaly.window_stats();
        let snapshot = TickSnapshot {
            cps,
            pending_connections: self.pending.pending_count() as f64,
            total_connections: self.pending.active_count() as f64,
            handshake_completion_rate: if cps > 0.0 {
                (handshakes / cps).min(1.0)
            } else {
                1.0
            },
            login_rate: logins,
            ping_rate: pings,
            unique_ips,
            avg_response_size: if responses > 0.0 {
                response_bytes / responses
            } else {
                0.0
            },
            cps_variance: window_stddev * window_stddev,
        };

        let under_duress = self.attack_mode() || self.anomaly.is_anomalous();
        *self.archetype.lock() = if under_duress {
            classify(&snapshot, base_cps, &self.config.classifier)
        } else {
            AttackArchetype::None
        };

        // Attack traffic must not teach the baseline what "normal" is.
        if !under_duress {
            let sample = TrafficSample {
                cps,
                unique_ips,
                packet_rate: packets,
                join_leave_ratio: cps / quits.max(1.0),
                pending_count: snapshot.pending_connections,
                block_rate: blocked,
            };
            self.baseline.update(slot, &sample, now_ms);
        }

        if let Some(transition) = self.level.evaluate(cps, base_cps, now_ms) {
            self.emit(ShieldEvent::LevelChanged {
                previous: transition.previous.label().to_string(),
                next: transition.next.label().to_string(),
                observed_cps: transition.observed_cps,
                at_ms: transition.at_ms,
            });
            if let Some(summary) = transition.ended {
                info!(
                    peak = summary.peak_level.label(),
                    peak_cps = summary.peak_cps,
                    duration_ms = summary.duration_ms,
                    "attack ended"
                );
                self.emit(ShieldEvent::AttackEnded {
                    peak_level: summary.peak_level.label().to_string(),
                    peak_cps: summary.peak_cps,
                    duration_ms: summary.duration_ms,
                    at_ms: now_ms,
                });
            }
        }

        *self.last_tick.lock() = snapshot;
    }

    /// Periodic housekeeping: reclaim stale handshakes, evict idle tracking
    /// state, and nudge the persistence collaborator. Expected once per
    /// minute; never runs on the admission path.
    pub fn sweep(&self, now_ms: u64) {
        for (ip, count) in self.pending.reclaim(now_ms) {
            let points =
                self.reputation.penalty_for(ViolationKind::SlowConnection) * count as f64;
            self.apply_violation(ip, ViolationKind::SlowConnection, Some(points), now_ms);
        }
        let evicted = self.reputation.sweep(now_ms)
            + self.subnets.sweep(now_ms)
            + self.churn.sweep(now_ms)
            + self.fingerprints.sweep(now_ms)
            + self.throttle.sweep(now_ms)
            + self.admission.sweep(now_ms);
        debug!(evicted, "sweep completed");
        self.emit(ShieldEvent::SaveRequested { at_ms: now_ms });
    }

    // ------------------------------------------------------------------
    // State and introspection
    // ------------------------------------------------------------------

    pub fn snapshot(&self, now_ms: u64) -> DashboardSnapshot {
        let (window_mean_cps, window_stddev_cps) = self.anomaly.window_stats();
        DashboardSnapshot {
            level: self.level.current().label().to_string(),
            attack_mode: self.attack_mode(),
            archetype: self.current_archetype().label().to_string(),
            base_cps: f64::from_bits(self.base_cps_bits.load(Ordering::Relaxed)),
            window_mean_cps,
            window_stddev_cps,
            last_tick: *self.last_tick.lock(),
            pending_connections: self.pending.pending_count(),
            active_connections: self.pending.active_count(),
            temp_bans: self.admission.active_ban_count(now_ms),
            banned_subnets: self.subnets.banned_count(now_ms),
            throttled_subnets: self.subnets.throttled_count(now_ms),
            tracked_ips: self.reputation.len(),
            lockdown_slots_used: self.throttle.lockdown_slots_used(),
            level_transitions: self.level.transition_count(),
            worst_ips: self.reputation.worst(10),
            recent_alerts: self.recent_alerts.lock().iter().cloned().collect(),
        }
    }

    pub fn export_state(&self) -> StateSnapshot {
        StateSnapshot {
            reputation: self.reputation.export(),
            temp_bans: self.admission.export_bans(),
            blacklist: self.admission.export_blacklist(),
            whitelist: self.admission.export_whitelist(),
            baseline: self.baseline.export(),
        }
    }

    pub fn import_state(&self, state: StateSnapshot, now_ms: u64) {
        self.reputation.import(&state.reputation, now_ms);
        self.admission.import_bans(state.temp_bans, now_ms);
        self.admission.import_lists(state.blacklist, state.whitelist);
        self.baseline.import(state.baseline);
        info!(tracked_ips = self.reputation.len(), "state restored");
    }

    /// Serialize the persistable state for the storage collaborator.
    pub fn export_state_json(&self) -> WardenResult<String> {
        serde_json::to_string(&self.export_state())
            .map_err(|e| WardenError::Persistence(e.to_string()))
    }

    /// Restore state from a persisted payload. A corrupt payload leaves the
    /// engine on its in-memory state.
    pub fn import_state_json(&self, json: &str, now_ms: u64) -> WardenResult<()> {
        let state: StateSnapshot =
            serde_json::from_str(json).map_err(|e| WardenError::Persistence(e.to_string()))?;
        self.import_state(state, now_ms);
        Ok(())
    }

    // ------------------------------------------------------------------

    fn apply_violation(
        &self,
        ip: IpAddr,
        kind: ViolationKind,
        points: Option<f64>,
        now_ms: u64,
    ) {
        let Some(ban) = self.reputation.penalize(ip, kind, points, now_ms) else {
            return;
        };
        self.admission.impose_ban(ip, now_ms + ban.duration_ms);
        warn!(%ip, score = ban.score, duration_ms = ban.duration_ms, "auto-ban issued");
        self.emit(ShieldEvent::AutoBan {
            id: Uuid::new_v4().to_string(),
            target: BanTarget::Ip(ip),
            duration_ms: ban.duration_ms,
            reason: format!("reputation {:.1} after {kind:?}", ban.score),
            at_ms: now_ms,
        });
    }

    // Dropped send means no subscriber is listening; that is fine.
    fn emit(&self, event: ShieldEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ip: &str, conn_id: u64, now_ms: u64) -> ConnMeta {
        ConnMeta {
            ip: ip.parse().unwrap(),
            hostname: "play.example.net".to_string(),
            port: 25565,
            protocol_version: 760,
            connection_id: conn_id,
            timestamp_ms: now_ms,
        }
    }

    fn shield() -> Shield {
        Shield::new(ShieldConfig::default()).expect("default config is valid")
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = ShieldConfig {
            baseline_alpha: 0.0,
            ..ShieldConfig::default()
        };
        assert!(matches!(Shield::new(cfg), Err(WardenError::Config(_))));
        let cfg = ShieldConfig {
            reputation: ReputationConfig {
                long_ban_threshold: 30.0,
                ..ReputationConfig::default()
            },
            ..ShieldConfig::default()
        };
        assert!(matches!(Shield::new(cfg), Err(WardenError::Config(_))));
    }

    #[test]
    fn test_clean_connection_admitted_and_pending() {
        let s = shield();
        let d = s.on_connection_observed(&meta("1.2.3.4", 1, 1_000));
        assert!(d.allow);
        assert_eq!(s.pending.pending_count(), 1);
        s.on_handshake_complete("1.2.3.4".parse().unwrap(), 1, 1_050);
        assert_eq!(s.pending.pending_count(), 0);
    }

    #[test]
    fn test_close_for_unknown_connection_changes_nothing() {
        let s = shield();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        s.on_connection_observed(&meta("1.2.3.4", 1, 0));
        assert_eq!(s.pending.active_count(), 1);
        // A close for an id that was never admitted must not shrink the
        // active count or register a quit.
        s.on_connection_closed(ip, 999, 100);
        assert_eq!(s.pending.active_count(), 1);
        assert_eq!(s.pending.pending_count(), 1);
        assert_eq!(s.counters.quits.load(Ordering::Relaxed), 0);
        s.on_connection_closed(ip, 1, 200);
        assert_eq!(s.pending.active_count(), 0);
        assert_eq!(s.counters.quits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_violations_escalate_to_ban_and_event() {
        let s = shield();
        let mut rx = s.subscribe();
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        for i in 0..4 {
            s.on_violation(ip, ViolationKind::InvalidHandshake, None, 1_000 + i);
        }
        let d = s.on_connection_observed(&meta("9.9.9.9", 5, 2_000));
        assert_eq!(d.reason, Some(DenyReason::TempBanned));
        let mut saw_ban = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ShieldEvent::AutoBan { .. }) {
                saw_ban = true;
            }
        }
        assert!(saw_ban);
    }

    #[test]
    fn test_sustained_flood_escalates_level() {
        let s = shield();
        // 60 cps against a static base of 10: implies Lockdown after the
        // escalation hold.
        let mut now = 0u64;
        for tick in 0..10u64 {
            for i in 0..60u64 {
                s.on_connection_observed(&meta(
                    &format!("10.{}.{}.7", tick, i % 250),
                    tick * 1000 + i,
                    now,
                ));
            }
            s.tick(now);
            now += 1000;
        }
        assert_eq!(s.attack_level(), AttackLevel::Lockdown);
        assert!(s.attack_mode());
    }

    #[test]
    fn test_verified_ip_admitted_during_lockdown() {
        let s = shield();
        let good: IpAddr = "8.8.8.8".parse().unwrap();
        s.on_login_success(good, "steve", 0);
        let mut now = 0u64;
        for tick in 0..10u64 {
            for i in 0..60u64 {
                s.on_connection_observed(&meta(
                    &format!("10.{}.{}.7", tick, i % 250),
                    tick * 1000 + i,
                    now,
                ));
            }
            s.tick(now);
            now += 1000;
        }
        assert_eq!(s.attack_level(), AttackLevel::Lockdown);
        let d = s.on_connection_observed(&meta("8.8.8.8", 999_999, now));
        assert!(d.allow, "verified IP uses the lockdown slot pool");
        let d = s.on_connection_observed(&meta("200.1.2.3", 999_998, now));
        assert_eq!(d.reason, Some(DenyReason::VerifiedOnly));
    }

    #[test]
    fn test_quiet_traffic_keeps_level_none() {
        let s = shield();
        let mut now = 0u64;
        for tick in 0..30u64 {
            for i in 0..5u64 {
                let d = s.on_connection_observed(&meta("1.2.3.4", tick * 10 + i, now));
                if d.allow {
                    s.on_handshake_complete("1.2.3.4".parse().unwrap(), tick * 10 + i, now);
                    s.on_connection_closed("1.2.3.4".parse().unwrap(), tick * 10 + i, now + 100);
                }
            }
            s.tick(now);
            now += 1000;
        }
        assert_eq!(s.attack_level(), AttackLevel::None);
        assert!(!s.attack_mode());
    }

    #[test]
    fn test_malformed_hostname_penalized() {
        let s = shield();
        let mut m = meta("1.2.3.4", 1, 1_000);
        m.hostname = "bad host\u{0}name".to_string();
        s.on_connection_observed(&m);
        assert!(s.reputation.score("1.2.3.4".parse().unwrap(), 1_000) < 50.0);
    }

    #[test]
    fn test_state_round_trip_preserves_bans_and_scores() {
        let s = shield();
        let bad: IpAddr = "9.9.9.9".parse().unwrap();
        let good: IpAddr = "8.8.8.8".parse().unwrap();
        for i in 0..4 {
            s.on_violation(bad, ViolationKind::InvalidHandshake, None, 1_000 + i);
        }
        s.on_login_success(good, "alex", 1_000);
        s.blacklist("6.6.6.6".parse().unwrap());
        let state = s.export_state();

        let restored = shield();
        restored.import_state(state, 2_000);
        let drift =
            (restored.reputation.score(bad, 2_000) - s.reputation.score(bad, 2_000)).abs();
        assert!(drift < 0.01);
        assert!(restored.reputation.is_verified(good));
        let d = restored.on_connection_observed(&meta("9.9.9.9", 50, 2_000));
        assert_eq!(d.reason, Some(DenyReason::TempBanned));
        let d = restored.on_connection_observed(&meta("6.6.6.6", 51, 2_000));
        assert_eq!(d.reason, Some(DenyReason::Blacklisted));
    }

    #[test]
    fn test_json_state_round_trip_and_corrupt_payload() {
        let s = shield();
        let bad: IpAddr = "9.9.9.9".parse().unwrap();
        s.on_violation(bad, ViolationKind::InvalidHandshake, None, 1_000);
        let json = s.export_state_json().expect("serializable state");

        let restored = shield();
        restored.import_state_json(&json, 1_000).expect("valid payload");
        assert_eq!(restored.reputation.score(bad, 1_000), 35.0);

        let err = restored.import_state_json("{not json", 1_000).unwrap_err();
        assert!(matches!(err, WardenError::Persistence(_)));
    }

    #[test]
    fn test_sweep_penalizes_stalled_handshakes() {
        let s = shield();
        let slow: IpAddr = "7.7.7.7".parse().unwrap();
        s.on_connection_observed(&meta("7.7.7.7", 1, 0));
        assert_eq!(s.pending.pending_count(), 1);
        s.sweep(60_000);
        assert_eq!(s.pending.pending_count(), 0);
        assert!(s.reputation.score(slow, 60_000) < 50.0);
    }

    #[test]
    fn test_dashboard_snapshot_reflects_activity() {
        let s = shield();
        s.on_connection_observed(&meta("1.2.3.4", 1, 0));
        s.tick(1_000);
        let snap = s.snapshot(1_000);
        assert_eq!(snap.level, "none");
        assert_eq!(snap.last_tick.cps, 1.0);
        assert_eq!(snap.pending_connections, 1);
    }

    #[test]
    fn test_save_requested_after_sweep() {
        let s = shield();
        let mut rx = s.subscribe();
        s.sweep(60_000);
        let mut saw_save = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ShieldEvent::SaveRequested { .. }) {
                saw_save = true;
            }
        }
        assert!(saw_save);
    }
}

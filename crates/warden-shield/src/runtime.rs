//! Background task driver.
//!
//! Spawns the aggregation ticker and the housekeeping sweep on the tokio
//! runtime. The admission path stays synchronous; these tasks only drain
//! counters and evict state, so the engine keeps admitting connections even
//! if the host never awaits anything shield-related.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::Shield;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub tick_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Wall-clock milliseconds since the epoch. The whole engine keys time off
/// this so persisted ban expiries survive restarts.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Run one periodic iteration, containing any panic so the loop survives.
fn run_guarded(task: &'static str, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string());
        error!(task, %msg, "periodic task panicked; continuing");
    }
}

pub struct ShieldRuntime {
    tick_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl ShieldRuntime {
    /// Spawn the periodic tasks. Must be called from within a tokio runtime.
    pub fn start(shield: Arc<Shield>, config: RuntimeConfig) -> Self {
        let tick_shield = shield.clone();
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                run_guarded("tick", || tick_shield.tick(now_ms()));
            }
        });

        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                run_guarded("sweep", || shield.sweep(now_ms()));
            }
        });

        info!("shield runtime started");
        Self {
            tick_task,
            sweep_task,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tick_task.is_finished() && !self.sweep_task.is_finished()
    }

    pub fn shutdown(self) {
        self.tick_task.abort();
        self.sweep_task.abort();
        info!("shield runtime stopped");
    }
}

//! Decides, per accelerated path, whether the next call may use the device.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Accelerated,
    /// Too many consecutive failures; the CPU is used until the cooldown has
    /// passed and the device reports healthy again.
    Degraded { since: Instant },
    /// No accelerator for the rest of the session.
    Disabled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FallbackStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub degradations: u64,
    pub recoveries: u64,
}

#[derive(Debug)]
pub struct FallbackOrchestrator {
    name: &'static str,
    state: OrchestratorState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
    stats: FallbackStats,
}

impl FallbackOrchestrator {
    #[must_use]
    pub fn new(name: &'static str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            state: OrchestratorState::Accelerated,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
            stats: FallbackStats::default(),
        }
    }

    /// An orchestrator that never attempts acceleration.
    #[must_use]
    pub fn disabled(name: &'static str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: OrchestratorState::Disabled,
            ..Self::new(name, threshold, cooldown)
        }
    }

    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub fn stats(&self) -> FallbackStats {
        self.stats
    }

    /// Whether the accelerated path should be tried now. While degraded,
    /// `health_check` is only called once the cooldown has elapsed; a healthy check
    /// returns the orchestrator to [`OrchestratorState::Accelerated`].
    pub fn should_attempt(&mut self, now: Instant, health_check: impl FnOnce() -> bool) -> bool {
        let attempt = match self.state {
            OrchestratorState::Accelerated => true,
            OrchestratorState::Disabled => false,
            OrchestratorState::Degraded { since } => {
                if now.saturating_duration_since(since) < self.cooldown {
                    false
                } else if health_check() {
                    tracing::info!(path = self.name, "accelerator healthy again, re-enabling");
                    self.state = OrchestratorState::Accelerated;
                    self.consecutive_failures = 0;
                    self.stats.recoveries += 1;
                    true
                } else {
                    // next check after another full cooldown
                    self.state = OrchestratorState::Degraded { since: now };
                    false
                }
            }
        };
        if attempt {
            self.stats.attempts += 1;
        }
        attempt
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.stats.successes += 1;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.stats.failures += 1;
        self.consecutive_failures += 1;
        if self.state == OrchestratorState::Accelerated
            && self.consecutive_failures >= self.threshold
        {
            tracing::warn!(
                path = self.name,
                failures = self.consecutive_failures,
                cooldown = ?self.cooldown,
                "disabling acceleration after repeated failures"
            );
            self.state = OrchestratorState::Degraded { since: now };
            self.stats.degradations += 1;
        }
    }

    pub fn disable(&mut self) {
        if self.state != OrchestratorState::Disabled {
            tracing::warn!(path = self.name, "acceleration disabled for this session");
        }
        self.state = OrchestratorState::Disabled;
    }
}

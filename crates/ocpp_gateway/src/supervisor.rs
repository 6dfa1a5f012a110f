use crate::mqtt::{ConnectionState, MessageBridge};
use crate::registry::SessionRegistry;
use crate::session::{DrainReason, SessionState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub drain_grace: Duration,
    /// How long the broker may be unreachable before sessions are drained.
    pub outage_tolerance: Duration,
    pub load_report_interval: Duration,
    pub outage_check_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(10),
            outage_tolerance: Duration::from_secs(30),
            load_report_interval: Duration::from_secs(60),
            outage_check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub broker: ConnectionState,
    pub accepting: bool,
    pub sessions: usize,
}

/// Aggregate load, used as the scaling signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub sessions: usize,
    pub draining: usize,
    pub sessions_by_version: BTreeMap<String, usize>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub publish_failures: u64,
    pub dropped_outbound: u64,
    pub broker_connections: u64,
}

/// Process-wide lifecycle: health, load reporting, broker outage handling
/// and graceful shutdown of every session.
pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    bridge: Arc<dyn MessageBridge>,
    accepting: Arc<AtomicBool>,
    tracker: TaskTracker,
    listener_shutdown: CancellationToken,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bridge: Arc<dyn MessageBridge>,
        accepting: Arc<AtomicBool>,
        tracker: TaskTracker,
        listener_shutdown: CancellationToken,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            bridge,
            accepting,
            tracker,
            listener_shutdown,
            settings,
        }
    }

    /// Healthy once the broker is connected and the listener is accepting.
    pub async fn health(&self) -> HealthReport {
        let broker = self.bridge.status().state;
        let accepting = self.accepting.load(Ordering::Acquire);
        HealthReport {
            healthy: broker == ConnectionState::Connected && accepting,
            broker,
            accepting,
            sessions: self.registry.count().await,
        }
    }

    pub async fn stats(&self) -> GatewayStats {
        let mut stats = GatewayStats {
            broker_connections: self.bridge.status().connections,
            ..GatewayStats::default()
        };
        for session in self.registry.snapshot().await {
            stats.sessions += 1;
            if session.state() == SessionState::Draining {
                stats.draining += 1;
            }
            *stats
                .sessions_by_version
                .entry(session.identity().version.to_string())
                .or_default() += 1;

            let counters = session.stats_snapshot();
            stats.frames_in += counters.frames_in;
            stats.frames_out += counters.frames_out;
            stats.publish_failures += counters.publish_failures;
            stats.dropped_outbound += counters.dropped_outbound;
        }
        stats
    }

    /// Periodic load report and broker outage watchdog. Runs until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut report = tokio::time::interval(self.settings.load_report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outage = tokio::time::interval(self.settings.outage_check_interval);
        outage.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut outage_logged = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = report.tick() => {
                    let stats = self.stats().await;
                    info!(
                        sessions = stats.sessions,
                        draining = stats.draining,
                        frames_in = stats.frames_in,
                        frames_out = stats.frames_out,
                        publish_failures = stats.publish_failures,
                        dropped_outbound = stats.dropped_outbound,
                        "gateway load"
                    );
                }
                _ = outage.tick() => {
                    let drained = self.check_broker_outage(&mut outage_logged).await;
                    if drained > 0 {
                        debug!(drained, "sessions drained during broker outage");
                    }
                }
            }
        }
        Ok(())
    }

    /// Drains every session if the broker has been gone longer than tolerated.
    /// Returns the number of sessions moved to `Draining`.
    pub async fn check_broker_outage(&self, logged: &mut bool) -> usize {
        let status = self.bridge.status();
        let Some(outage) = status.outage_duration() else {
            *logged = false;
            return 0;
        };
        if status.state == ConnectionState::Stopped || outage < self.settings.outage_tolerance {
            return 0;
        }

        if !*logged {
            warn!(
                outage_secs = outage.as_secs(),
                tolerance_secs = self.settings.outage_tolerance.as_secs(),
                last_error = status.last_error.as_deref().unwrap_or(""),
                "broker outage exceeded tolerance, draining sessions"
            );
            *logged = true;
        }

        self.registry
            .snapshot()
            .await
            .iter()
            .filter(|session| session.begin_drain(DrainReason::BrokerOutage))
            .count()
    }

    /// Stops accepting, drains all sessions and waits up to the grace period
    /// before forcing the rest closed.
    pub async fn shutdown(&self) {
        self.listener_shutdown.cancel();
        self.accepting.store(false, Ordering::Release);
        self.registry.close().await;

        let sessions = self.registry.drain_all(DrainReason::Shutdown).await;
        info!(sessions = sessions.len(), grace_secs = self.settings.drain_grace.as_secs(), "draining sessions");

        self.tracker.close();
        if tokio::time::timeout(self.settings.drain_grace, self.tracker.wait())
            .await
            .is_ok()
        {
            info!("all sessions drained");
            return;
        }

        let remaining = self.registry.snapshot().await;
        warn!(remaining = remaining.len(), "drain grace expired, forcing sessions closed");
        for session in &remaining {
            session.force_close();
        }
        if tokio::time::timeout(Duration::from_secs(2), self.tracker.wait())
            .await
            .is_err()
        {
            warn!(tasks = self.tracker.len(), "connection tasks still running after force close");
        }
    }
}

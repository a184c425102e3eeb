pub mod pv_throttle;
pub mod safety_monitor;
pub mod scheduler;
pub mod setpoint;

use chrono::{Duration, Local, NaiveDateTime};
use std::future::Future;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::{Config, ControllerConfig};
use crate::hardware::{AvailabilityReport, PointTransport, ServiceRegistry};

pub use pv_throttle::{PvThrottleController, ThrottleDecision, ThrottleInputs, ThrottleState};
pub use safety_monitor::{SafetyMonitor, SafetyStatus, SafetyTrip, SafetyWindow};
pub use scheduler::{ChargePhase, ChargeScheduler};
pub use setpoint::{is_weekend, ChargeCurve, CurveZone, CycleReport, SetpointEngine};

/// Wall-clock time as the controller sees it (local, naive).
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Runs control cycles against the device bus: refresh, decide, emit, and
/// rescan unreachable endpoints on their own cadence.
pub struct SystemController<T: PointTransport> {
    timing: ControllerConfig,
    engine: SetpointEngine,
    registry: ServiceRegistry<T>,
    last_cycle: NaiveDateTime,
    next_rescan: NaiveDateTime,
}

impl<T: PointTransport> SystemController<T> {
    /// Probe all endpoints and prepare the engine. The first rescan is due
    /// on the first cycle.
    pub fn new(cfg: &Config, transport: T, now: NaiveDateTime) -> Self {
        let mut registry = ServiceRegistry::new(cfg, transport);
        let report = registry.connect_all();
        if !report.all_available() {
            warn!(
                unavailable_points = ?report.unavailable_points,
                unavailable_inverters = ?report.unavailable_inverters,
                "Some services are unavailable at startup"
            );
        }

        Self {
            timing: cfg.controller.clone(),
            engine: SetpointEngine::new(cfg),
            registry,
            last_cycle: now,
            next_rescan: now,
        }
    }

    /// One full control cycle.
    pub fn run_cycle(&mut self, now: NaiveDateTime) -> CycleReport {
        self.last_cycle = now;

        let snapshot = self.registry.refresh_snapshot();
        let report = self.engine.compute_cycle(&snapshot, now, &mut self.registry);

        info!(
            soc = report.soc,
            out_power_w = report.out_power_w,
            weekend = report.weekend,
            charging = report.charging,
            safety_active = report.safety.active,
            throttle_active = report.throttle.active,
            power_limit_w = report.throttle.power_limit_w,
            in_surplus_w = report.in_surplus_w,
            ac_setpoint_w = report.ac_setpoint_w,
            "control tick"
        );

        if now >= self.next_rescan {
            self.registry.rescan();
            self.next_rescan = now + self.timing.rescan_interval();
        }

        report
    }

    /// True when no cycle has run for `max_sleep_time - loop_check_time`.
    pub fn watchdog_due(&self, now: NaiveDateTime) -> bool {
        now - self.last_cycle >= self.timing.watchdog_grace()
    }

    /// Force a cycle if the periodic trigger has stalled.
    pub fn watchdog(&mut self, now: NaiveDateTime) -> Option<CycleReport> {
        if !self.watchdog_due(now) {
            return None;
        }
        warn!(
            since_last_cycle_s = (now - self.last_cycle).num_seconds(),
            "Manually running control cycle"
        );
        Some(self.run_cycle(now))
    }

    pub fn availability(&self) -> AvailabilityReport {
        self.registry.availability()
    }

    pub fn next_rescan(&self) -> NaiveDateTime {
        self.next_rescan
    }

    pub fn registry(&self) -> &ServiceRegistry<T> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ServiceRegistry<T> {
        &mut self.registry
    }

    /// Drive cycles every `loop_check_time_s` until `shutdown` resolves. The
    /// watchdog timer fires only if the regular tick has not run in time.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) {
        let period = self
            .timing
            .loop_check_time()
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1));
        let grace = self
            .timing
            .watchdog_grace()
            .max(Duration::seconds(1))
            .to_std()
            .unwrap_or(period);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(loop_check_time_s = self.timing.loop_check_time_s, "Controller loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Controller loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_cycle(local_now());
                }
                _ = tokio::time::sleep(grace) => {
                    self.watchdog(local_now());
                }
            }
        }
    }
}

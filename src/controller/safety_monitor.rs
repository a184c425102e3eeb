//! # Overcurrent Safety Monitor
//!
//! Protects the inverter/charger from carrying too much of the load on its
//! own. Two triggers lower the minimum AC input power floor so the grid takes
//! a larger share:
//! - Critical: a single cycle with load above `critical_threshold_w`
//! - Buildup: enough cycles in the sliding window at or above
//!   `buildup_threshold_w`
//!
//! Once tripped the reduced floor stays in force for `duration_s`; a new trip
//! extends the period.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SafetyConfig;

/// Circular record of which recent cycles had a load over the buildup
/// threshold. Length is fixed at construction; the cursor always stays in
/// `[0, len)`.
#[derive(Debug, Clone)]
pub struct SafetyWindow {
    samples: Vec<bool>,
    cursor: usize,
}

impl SafetyWindow {
    pub fn new(len: usize) -> Self {
        Self {
            samples: vec![false; len.max(1)],
            cursor: 0,
        }
    }

    /// Store this cycle's sample and move the cursor on, wrapping at the end.
    pub fn record(&mut self, over_threshold: bool) {
        self.samples[self.cursor] = over_threshold;
        self.cursor = (self.cursor + 1) % self.samples.len();
    }

    pub fn over_threshold_count(&self) -> usize {
        self.samples.iter().filter(|&&s| s).count()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// What caused the floor reduction this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyTrip {
    Critical,
    Buildup,
    /// No new trip, still inside the safety period of an earlier one
    Holding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub active: bool,
    pub trip: Option<SafetyTrip>,
    pub end_time: Option<NaiveDateTime>,
    pub floor_w: f64,
    pub over_threshold_count: usize,
}

pub struct SafetyMonitor {
    config: SafetyConfig,
    /// Floor applied while no protection is active (MinInPower)
    baseline_floor_w: f64,
    window: SafetyWindow,
    active: bool,
    end_time: Option<NaiveDateTime>,
    floor_w: f64,
    last_trip: Option<SafetyTrip>,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig, baseline_floor_w: f64) -> Self {
        let window = SafetyWindow::new(config.buildup_iterations);
        Self {
            config,
            baseline_floor_w,
            window,
            active: false,
            end_time: None,
            floor_w: baseline_floor_w,
            last_trip: None,
        }
    }

    /// Record this cycle's output power and return the minimum input power
    /// floor to enforce.
    pub fn tick(&mut self, output_power_w: f64, now: NaiveDateTime) -> f64 {
        self.window
            .record(output_power_w >= self.config.buildup_threshold_w);

        let required =
            self.config.buildup_iterations as f64 * self.config.buildup_percentage / 100.0;
        let count = self.window.over_threshold_count();

        let trip = if output_power_w > self.config.critical_threshold_w {
            Some(SafetyTrip::Critical)
        } else if count as f64 >= required {
            Some(SafetyTrip::Buildup)
        } else {
            None
        };

        match trip {
            Some(trip) => {
                if !self.active {
                    info!(
                        ?trip,
                        output_power_w,
                        over_threshold_count = count,
                        "Overcurrent protection tripped"
                    );
                }
                self.floor_w = output_power_w - self.config.max_inverter_power_w;
                self.end_time = Some(now + self.config.duration());
                self.active = true;
                self.last_trip = Some(trip);
                debug!(?trip, floor_w = self.floor_w, "Safety floor recalculated");
            }
            None if self.active && self.end_time.is_some_and(|end| now < end) => {
                self.last_trip = Some(SafetyTrip::Holding);
                debug!(
                    floor_w = self.floor_w,
                    end_time = ?self.end_time,
                    "Safety period still running"
                );
            }
            None => {
                if self.active {
                    info!("Overcurrent protection released");
                }
                self.active = false;
                self.last_trip = None;
                self.floor_w = self.baseline_floor_w;
            }
        }

        self.floor_w
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn status(&self) -> SafetyStatus {
        SafetyStatus {
            active: self.active,
            trip: self.last_trip,
            end_time: self.end_time,
            floor_w: self.floor_w,
            over_threshold_count: self.window.over_threshold_count(),
        }
    }
}

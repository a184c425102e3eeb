//! Scheduled equalization charges.
//!
//! Every `interval_days` the battery is charged at a fixed extra power for
//! `duration_minutes`, so the cell voltages can equalize. A charge starts on
//! the first configured weekday on or after the scheduled date, once the
//! configured start time has passed.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ChargeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePhase {
    Idle,
    Active { end_time: NaiveDateTime },
}

/// Equalization charge state machine
#[derive(Debug, Clone)]
pub struct ChargeScheduler {
    config: ChargeConfig,
    next_date: NaiveDate,
    phase: ChargePhase,
}

impl ChargeScheduler {
    pub fn new(config: ChargeConfig) -> Self {
        let next_date = config.date;
        Self {
            config,
            next_date,
            phase: ChargePhase::Idle,
        }
    }

    /// Advance the state machine and report whether a charge is running.
    pub fn tick(&mut self, now: NaiveDateTime) -> bool {
        if !self.config.enabled {
            return self.is_active();
        }

        match self.phase {
            ChargePhase::Idle => {
                if now.date() >= self.next_date && now.time() >= self.config.start_time {
                    if now.weekday() == self.config.day {
                        let end_time = now + self.config.duration();
                        self.phase = ChargePhase::Active { end_time };
                        self.next_date += self.config.interval();
                        info!(
                            %end_time,
                            next_date = %self.next_date,
                            power_w = self.config.power_w,
                            "Equalization charge started"
                        );
                    } else {
                        // Re-evaluate tomorrow instead of stalling on the wrong weekday
                        self.next_date += Duration::days(1);
                        debug!(
                            next_date = %self.next_date,
                            "Charge day mismatch, moving charge date"
                        );
                    }
                }
            }
            ChargePhase::Active { end_time } => {
                if now >= end_time {
                    self.phase = ChargePhase::Idle;
                    info!(next_date = %self.next_date, "Equalization charge finished");
                }
            }
        }

        self.is_active()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, ChargePhase::Active { .. })
    }

    /// Extra input power to add on top of the load while charging.
    pub fn charge_power(&self) -> Option<f64> {
        self.is_active().then_some(self.config.power_w)
    }

    pub fn phase(&self) -> ChargePhase {
        self.phase
    }

    pub fn next_date(&self) -> NaiveDate {
        self.next_date
    }
}

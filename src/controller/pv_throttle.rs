//! # PV Throttling
//!
//! Keeps the solar inverters from pushing power back into the grid. While the
//! grid draw stays healthy the power limit tracks production with a small
//! buffer; when the draw falls under `min_in_power_w - throttle_buffer_w` the
//! limit is cut below production and then released one buffer step per
//! cycle. Near full charge the strong throttle curtails output further.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ThrottleConfig;
use crate::domain::{InverterLimit, PvLine, PvTotals};

/// Persistent throttle state. `power_limit_w` is clamped to
/// `[0, max available PV power]` at the end of every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    pub active: bool,
    pub power_limit_w: f64,
    /// Extra input power requested while throttling, so the battery absorbs
    /// what the PV would otherwise have exported
    pub in_surplus_w: f64,
}

/// Readings the throttle decision depends on
#[derive(Debug, Clone, Copy)]
pub struct ThrottleInputs {
    pub grid_input_power_w: f64,
    pub output_power_w: f64,
    pub soc: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleDecision {
    pub state: ThrottleState,
    pub totals: PvTotals,
    pub strong_throttle: bool,
    pub inverter_limits: Vec<InverterLimit>,
}

pub struct PvThrottleController {
    config: ThrottleConfig,
    state: ThrottleState,
}

impl PvThrottleController {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: ThrottleState::default(),
        }
    }

    pub fn state(&self) -> ThrottleState {
        self.state
    }

    pub fn line(&self) -> &str {
        &self.config.line
    }

    /// Drop any pending in-surplus when PV is not being controlled this cycle.
    pub fn suspend(&mut self) {
        self.state.in_surplus_w = 0.0;
    }

    pub fn tick(&mut self, line: &PvLine, inputs: &ThrottleInputs) -> ThrottleDecision {
        let cfg = &self.config;
        let totals = line.totals();
        let state = &mut self.state;

        debug!(
            line = %line.name,
            total_power_w = totals.power_w,
            max_power_w = totals.max_power_w,
            "PV totals"
        );

        if inputs.grid_input_power_w < cfg.min_in_power_w - cfg.throttle_buffer_w {
            state.power_limit_w = totals.power_w
                - (cfg.min_in_power_w - inputs.grid_input_power_w + cfg.over_throttle_w);
            state.active = true;
            state.in_surplus_w =
                cfg.min_in_power_w + cfg.over_throttle_w - inputs.grid_input_power_w;
            debug!(grid_input_power_w = inputs.grid_input_power_w, "Starting to throttle");
        } else if state.active {
            state.power_limit_w += cfg.throttle_buffer_w;
            state.in_surplus_w = (state.in_surplus_w - cfg.throttle_buffer_w).max(0.0);
            debug!("Relaxing PV limit and in-surplus");
            if totals.power_w < state.power_limit_w + 2.0 * cfg.throttle_buffer_w {
                state.active = false;
                state.in_surplus_w = 0.0;
                debug!("Throttling no longer required");
            }
        }

        // Track production with some headroom so noise does not cause spikes
        if !state.active {
            state.power_limit_w = totals.power_w + cfg.throttle_buffer_w;
        }

        let strong_throttle = inputs.soc >= cfg.strong_throttle_min_soc;
        if strong_throttle {
            let strong_throttle_value = (inputs.soc - cfg.strong_throttle_min_soc)
                * cfg.strong_throttle_buffer_w
                / (cfg.strong_throttle_max_soc - cfg.strong_throttle_min_soc);
            state.power_limit_w = inputs.output_power_w - strong_throttle_value;
            debug!(strong_throttle_value, "Strong throttling active");
        }

        if state.power_limit_w > totals.max_power_w {
            state.power_limit_w = totals.max_power_w;
        } else if state.power_limit_w < 0.0 {
            state.power_limit_w = 0.0;
        }

        let inverter_limits = distribute(line, &totals, state, cfg.throttle_buffer_w);

        ThrottleDecision {
            state: *state,
            totals,
            strong_throttle,
            inverter_limits,
        }
    }
}

/// Split the line limit over its available inverters.
fn distribute(
    line: &PvLine,
    totals: &PvTotals,
    state: &ThrottleState,
    throttle_buffer_w: f64,
) -> Vec<InverterLimit> {
    let count = totals.available_count.max(1) as f64;
    line.available_inverters()
        .map(|inv| {
            let limit_w = if totals.power_w == 0.0 {
                throttle_buffer_w / count
            } else if !state.active {
                inv.power.value + throttle_buffer_w / count
            } else {
                state.power_limit_w * (inv.power.value / totals.power_w)
            };
            InverterLimit {
                inverter_id: inv.id.clone(),
                limit_w,
            }
        })
        .collect()
}

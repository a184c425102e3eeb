use serde::{Deserialize, Serialize};

use super::measurement::Measurement;

/// One solar inverter on a PV line.
///
/// An inverter is `available` only if its endpoints answered at the last
/// rescan and both power readings succeeded this cycle. Unavailable
/// inverters stay in the line so they can come back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvInverter {
    pub id: String,
    pub power: Measurement,
    pub max_power: Measurement,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvLine {
    pub name: String,
    pub inverters: Vec<PvInverter>,
}

/// Sums over the available inverters of a line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PvTotals {
    pub power_w: f64,
    pub max_power_w: f64,
    pub available_count: usize,
}

impl PvLine {
    pub fn available_inverters(&self) -> impl Iterator<Item = &PvInverter> {
        self.inverters.iter().filter(|inv| inv.available)
    }

    pub fn totals(&self) -> PvTotals {
        self.available_inverters()
            .fold(PvTotals::default(), |acc, inv| PvTotals {
                power_w: acc.power_w + inv.power.value,
                max_power_w: acc.max_power_w + inv.max_power.value,
                available_count: acc.available_count + 1,
            })
    }
}

/// Power limit computed for one inverter this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterLimit {
    pub inverter_id: String,
    pub limit_w: f64,
}

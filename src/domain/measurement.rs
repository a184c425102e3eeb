use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use super::pv::PvLine;

/// `InputSource` value reported while the system runs from its own
/// inverter/generator rather than the grid. Fixed by the device protocol.
pub const INPUT_SOURCE_INVERTING: f64 = 240.0;

/// System-level points, named by their external identifiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display, EnumString, AsRefStr, EnumIter,
)]
pub enum PointName {
    Soc,
    L1OutPower,
    L1InPower,
    InputSource,
    AcSetpoint,
}

/// Bus address of an endpoint: owning service plus object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointAddress {
    pub service: String,
    pub path: String,
}

impl PointAddress {
    pub fn new(service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for PointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.service, self.path)
    }
}

/// A value read this cycle. When the endpoint could not be read, `value`
/// already holds the configured default and `available` is false.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub available: bool,
}

impl Measurement {
    pub fn available(value: f64) -> Self {
        Self {
            value,
            available: true,
        }
    }

    pub fn unavailable(default: f64) -> Self {
        Self {
            value: default,
            available: false,
        }
    }
}

/// Everything the control decision reads, captured once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSnapshot {
    pub soc: Measurement,
    pub l1_out_power: Measurement,
    pub l1_in_power: Measurement,
    pub input_source: Measurement,
    pub pv_lines: Vec<PvLine>,
}

impl MeasurementSnapshot {
    pub fn pv_line(&self, name: &str) -> Option<&PvLine> {
        self.pv_lines.iter().find(|line| line.name == name)
    }

    /// True while the installation is not drawing from the grid.
    pub fn is_inverting(&self) -> bool {
        self.input_source.value == INPUT_SOURCE_INVERTING
    }
}

pub mod registry;
pub mod simulated;

use serde_json::Value;
use thiserror::Error;

use crate::domain::{PointAddress, PointName};

pub use registry::{AvailabilityReport, ServiceRegistry};
pub use simulated::SimulatedTransport;

/// Transport-level failures. None of these is fatal to a control cycle.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("endpoint {0} is unavailable")]
    TransportUnavailable(PointAddress),
    #[error("non-numeric value {raw} on {address}")]
    NonNumericValue { address: PointAddress, raw: String },
    #[error("write to {address} rejected: {reason}")]
    WriteFailure { address: PointAddress, reason: String },
}

/// Synchronous access to named endpoints on the device bus.
///
/// Values come back as raw JSON since the bus does not guarantee a number.
#[cfg_attr(test, mockall::automock)]
pub trait PointTransport: Send {
    /// Probe an endpoint; called at startup and on every rescan.
    fn connect(&mut self, address: &PointAddress) -> Result<(), BusError>;
    fn get_value(&mut self, address: &PointAddress) -> Result<Value, BusError>;
    fn set_value(&mut self, address: &PointAddress, value: f64) -> Result<(), BusError>;
}

/// Write side of the collaborator. Implementations log failures rather than
/// returning them so a rejected write never aborts a cycle.
pub trait Actuators {
    fn write_setpoint(&mut self, point: PointName, value: f64);
    fn write_inverter_limit(&mut self, inverter_id: &str, value: f64);
}

/// Interpret a raw bus value as a number.
pub fn numeric(address: &PointAddress, raw: &Value) -> Result<f64, BusError> {
    let value = match raw {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    value.ok_or_else(|| BusError::NonNumericValue {
        address: address.clone(),
        raw: raw.to_string(),
    })
}

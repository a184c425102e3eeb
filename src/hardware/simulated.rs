use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::{BusError, PointTransport};
use crate::config::{Config, PointConfig};
use crate::domain::{PointAddress, PointName};
use strum::IntoEnumIterator;

/// In-memory device bus for development and testing.
///
/// Every configured endpoint exists with its default value. Endpoints can be
/// taken offline, fed arbitrary (also non-numeric) values, or made to reject
/// writes. All accepted writes are logged in order.
#[derive(Debug, Default)]
pub struct SimulatedTransport {
    values: HashMap<PointAddress, Value>,
    offline: HashSet<PointAddress>,
    read_only: HashSet<PointAddress>,
    writes: Vec<(PointAddress, f64)>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create every endpoint named in `cfg`, seeded with its default value.
    pub fn from_config(cfg: &Config) -> Self {
        let mut transport = Self::new();
        for name in PointName::iter() {
            transport.seed(cfg.points.get(name));
        }
        for inverter in cfg.pv_lines.iter().flat_map(|line| &line.inverters) {
            transport.seed(&inverter.power);
            transport.seed(&inverter.max_power);
            transport.seed(&inverter.power_limit);
        }
        transport
    }

    fn seed(&mut self, point: &PointConfig) {
        self.values.insert(point.address(), Value::from(point.default));
    }

    pub fn set(&mut self, address: &PointAddress, value: impl Into<Value>) {
        self.values.insert(address.clone(), value.into());
    }

    pub fn set_offline(&mut self, address: &PointAddress, offline: bool) {
        if offline {
            self.offline.insert(address.clone());
        } else {
            self.offline.remove(address);
        }
    }

    pub fn set_read_only(&mut self, address: &PointAddress, read_only: bool) {
        if read_only {
            self.read_only.insert(address.clone());
        } else {
            self.read_only.remove(address);
        }
    }

    pub fn writes(&self) -> &[(PointAddress, f64)] {
        &self.writes
    }

    /// Most recent value written to `address`.
    pub fn last_write(&self, address: &PointAddress) -> Option<f64> {
        self.writes
            .iter()
            .rev()
            .find(|(addr, _)| addr == address)
            .map(|(_, value)| *value)
    }

    fn reachable(&self, address: &PointAddress) -> Result<(), BusError> {
        if self.offline.contains(address) || !self.values.contains_key(address) {
            return Err(BusError::TransportUnavailable(address.clone()));
        }
        Ok(())
    }
}

impl PointTransport for SimulatedTransport {
    fn connect(&mut self, address: &PointAddress) -> Result<(), BusError> {
        self.reachable(address)
    }

    fn get_value(&mut self, address: &PointAddress) -> Result<Value, BusError> {
        self.reachable(address)?;
        Ok(self.values[address].clone())
    }

    fn set_value(&mut self, address: &PointAddress, value: f64) -> Result<(), BusError> {
        self.reachable(address)?;
        if self.read_only.contains(address) {
            return Err(BusError::WriteFailure {
                address: address.clone(),
                reason: "endpoint is read-only".to_string(),
            });
        }
        debug!(%address, value, "Simulated write");
        self.values.insert(address.clone(), Value::from(value));
        self.writes.push((address.clone(), value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr() -> PointAddress {
        PointAddress::new("com.victronenergy.pvinverter.pv_0", "/Ac/PowerLimit")
    }

    #[test]
    fn test_unknown_endpoint_is_unavailable() {
        let mut transport = SimulatedTransport::new();
        assert!(matches!(
            transport.connect(&addr()),
            Err(BusError::TransportUnavailable(_))
        ));
    }

    #[test]
    fn test_offline_endpoint_rejects_reads_and_writes() {
        let mut transport = SimulatedTransport::new();
        transport.set(&addr(), 1000.0);
        transport.set_offline(&addr(), true);

        assert!(transport.get_value(&addr()).is_err());
        assert!(transport.set_value(&addr(), 10.0).is_err());
        assert!(transport.writes().is_empty());

        transport.set_offline(&addr(), false);
        assert_eq!(transport.get_value(&addr()).unwrap(), json!(1000.0));
    }

    #[test]
    fn test_writes_are_logged() {
        let mut transport = SimulatedTransport::new();
        transport.set(&addr(), 0.0);
        transport.set_value(&addr(), 1500.0).unwrap();
        transport.set_value(&addr(), 1600.0).unwrap();

        assert_eq!(transport.writes().len(), 2);
        assert_eq!(transport.last_write(&addr()), Some(1600.0));
        assert_eq!(transport.get_value(&addr()).unwrap(), json!(1600.0));
    }

    #[test]
    fn test_read_only_endpoint_rejects_write() {
        let mut transport = SimulatedTransport::new();
        transport.set(&addr(), 0.0);
        transport.set_read_only(&addr(), true);
        assert!(matches!(
            transport.set_value(&addr(), 5.0),
            Err(BusError::WriteFailure { .. })
        ));
    }
}

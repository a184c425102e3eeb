//! Endpoint bookkeeping between the control engine and the device bus.
//!
//! The registry knows every configured endpoint, remembers which ones failed
//! to answer at the last (re)scan, and turns raw bus reads into a
//! [`MeasurementSnapshot`] with defaults substituted for anything missing.

use serde::Serialize;
use std::collections::BTreeSet;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

use super::{numeric, Actuators, PointTransport};
use crate::config::{Config, PointConfig, PointsConfig, PvLineConfig};
use crate::domain::{Measurement, MeasurementSnapshot, PointName, PvInverter, PvLine};

/// Endpoints that did not answer at the last scan
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AvailabilityReport {
    pub unavailable_points: Vec<PointName>,
    pub unavailable_inverters: Vec<String>,
}

impl AvailabilityReport {
    pub fn all_available(&self) -> bool {
        self.unavailable_points.is_empty() && self.unavailable_inverters.is_empty()
    }
}

pub struct ServiceRegistry<T: PointTransport> {
    transport: T,
    points: PointsConfig,
    pv_lines: Vec<PvLineConfig>,
    unavailable_points: BTreeSet<PointName>,
    unavailable_inverters: BTreeSet<String>,
}

impl<T: PointTransport> ServiceRegistry<T> {
    pub fn new(cfg: &Config, transport: T) -> Self {
        Self {
            transport,
            points: cfg.points.clone(),
            pv_lines: cfg.pv_lines.clone(),
            unavailable_points: BTreeSet::new(),
            unavailable_inverters: BTreeSet::new(),
        }
    }

    /// Probe every endpoint. A system point that fails is unavailable on its
    /// own; an inverter is unavailable as soon as one of its endpoints fails.
    pub fn connect_all(&mut self) -> AvailabilityReport {
        for name in PointName::iter() {
            let address = self.points.get(name).address();
            if let Err(e) = self.transport.connect(&address) {
                error!(point = %name, %address, error = %e, "Failed to set up service");
                self.unavailable_points.insert(name);
            }
        }

        for inverter in self.pv_lines.iter().flat_map(|line| &line.inverters) {
            for point in [&inverter.power, &inverter.max_power, &inverter.power_limit] {
                let address = point.address();
                if let Err(e) = self.transport.connect(&address) {
                    error!(
                        inverter = %inverter.id,
                        %address,
                        error = %e,
                        "Failed to set up PV inverter"
                    );
                    self.unavailable_inverters.insert(inverter.id.clone());
                    break;
                }
            }
        }

        self.availability()
    }

    /// Forget earlier failures and probe everything again.
    pub fn rescan(&mut self) -> AvailabilityReport {
        self.unavailable_points.clear();
        self.unavailable_inverters.clear();
        let report = self.connect_all();
        info!(
            unavailable_points = ?report.unavailable_points,
            unavailable_inverters = ?report.unavailable_inverters,
            "Service rescan complete"
        );
        report
    }

    pub fn availability(&self) -> AvailabilityReport {
        AvailabilityReport {
            unavailable_points: self.unavailable_points.iter().copied().collect(),
            unavailable_inverters: self.unavailable_inverters.iter().cloned().collect(),
        }
    }

    /// Read every input point and inverter for this cycle.
    pub fn refresh_snapshot(&mut self) -> MeasurementSnapshot {
        let soc = self.read(PointName::Soc);
        let l1_out_power = self.read(PointName::L1OutPower);
        let l1_in_power = self.read(PointName::L1InPower);
        let input_source = self.read(PointName::InputSource);

        let mut pv_lines = Vec::with_capacity(self.pv_lines.len());
        for line in &self.pv_lines {
            let mut inverters = Vec::with_capacity(line.inverters.len());
            for inverter in &line.inverters {
                let reachable = !self.unavailable_inverters.contains(&inverter.id);
                let (power, max_power) = if reachable {
                    (
                        read_point(&mut self.transport, &inverter.id, &inverter.power),
                        read_point(&mut self.transport, &inverter.id, &inverter.max_power),
                    )
                } else {
                    (
                        Measurement::unavailable(inverter.power.default),
                        Measurement::unavailable(inverter.max_power.default),
                    )
                };
                inverters.push(PvInverter {
                    id: inverter.id.clone(),
                    power,
                    max_power,
                    available: reachable && power.available && max_power.available,
                });
            }
            pv_lines.push(PvLine {
                name: line.name.clone(),
                inverters,
            });
        }

        MeasurementSnapshot {
            soc,
            l1_out_power,
            l1_in_power,
            input_source,
            pv_lines,
        }
    }

    fn read(&mut self, name: PointName) -> Measurement {
        let point = self.points.get(name);
        if self.unavailable_points.contains(&name) {
            return Measurement::unavailable(point.default);
        }
        read_point(&mut self.transport, name.as_ref(), point)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

/// Read one endpoint, falling back to its default on any failure.
fn read_point<T: PointTransport>(
    transport: &mut T,
    owner: &str,
    point: &PointConfig,
) -> Measurement {
    let address = point.address();
    match transport
        .get_value(&address)
        .and_then(|raw| numeric(&address, &raw))
    {
        Ok(value) => Measurement::available(value),
        Err(e) => {
            warn!(%owner, %address, error = %e, default = point.default, "Using default value");
            Measurement::unavailable(point.default)
        }
    }
}

impl<T: PointTransport> Actuators for ServiceRegistry<T> {
    fn write_setpoint(&mut self, point: PointName, value: f64) {
        if self.unavailable_points.contains(&point) {
            debug!(%point, value, "Skipping write to unavailable service");
            return;
        }
        let address = self.points.get(point).address();
        if let Err(e) = self.transport.set_value(&address, value) {
            warn!(%point, %address, error = %e, "Exception in setting service");
        }
    }

    fn write_inverter_limit(&mut self, inverter_id: &str, value: f64) {
        if self.unavailable_inverters.contains(inverter_id) {
            debug!(inverter = %inverter_id, value, "Skipping write to unavailable inverter");
            return;
        }
        let Some(inverter) = self
            .pv_lines
            .iter()
            .flat_map(|line| &line.inverters)
            .find(|inv| inv.id == inverter_id)
        else {
            warn!(inverter = %inverter_id, "Power limit for unknown inverter");
            return;
        };
        let address = inverter.power_limit.address();
        if let Err(e) = self.transport.set_value(&address, value) {
            warn!(
                inverter = %inverter_id,
                %address,
                error = %e,
                "Exception in setting power limit"
            );
        }
    }
}

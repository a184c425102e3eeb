#![allow(dead_code)]
use chrono::{NaiveDate, NaiveDateTime};
use ess_regulator::config::Config;
use ess_regulator::controller::SystemController;
use ess_regulator::domain::PointAddress;
use ess_regulator::hardware::SimulatedTransport;

pub fn config() -> Config {
    Config::from_toml_str(include_str!("../../config/default.toml")).unwrap()
}

/// Tuesday, outside the weekend and the charge window
pub fn tuesday_noon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 3)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

pub fn soc() -> PointAddress {
    PointAddress::new("com.victronenergy.system", "/Dc/Battery/Soc")
}

pub fn out_power() -> PointAddress {
    PointAddress::new("com.victronenergy.vebus.ttyO1", "/Ac/Out/L1/P")
}

pub fn in_power() -> PointAddress {
    PointAddress::new("com.victronenergy.vebus.ttyO1", "/Ac/ActiveIn/L1/P")
}

pub fn input_source() -> PointAddress {
    PointAddress::new("com.victronenergy.system", "/Ac/ActiveIn/Source")
}

pub fn ac_setpoint() -> PointAddress {
    PointAddress::new("com.victronenergy.settings", "/Settings/CGwacs/AcPowerSetPoint")
}

/// Endpoint of PV inverter `index` (0 or 1 in the default layout)
pub fn pv(index: usize, path: &str) -> PointAddress {
    PointAddress::new(format!("com.victronenergy.pvinverter.pv_{}", index), path)
}

/// Site state written into the simulated bus before a cycle
pub struct Site {
    pub soc: f64,
    pub out_power_w: f64,
    pub in_power_w: f64,
    pub input_source: f64,
    pub pv_power_w: [f64; 2],
    pub pv_max_power_w: f64,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            soc: 60.0,
            out_power_w: 1000.0,
            in_power_w: 500.0,
            // Grid connected
            input_source: 1.0,
            pv_power_w: [0.0, 0.0],
            pv_max_power_w: 5000.0,
        }
    }
}

impl Site {
    pub fn apply(&self, transport: &mut SimulatedTransport) {
        transport.set(&soc(), self.soc);
        transport.set(&out_power(), self.out_power_w);
        transport.set(&in_power(), self.in_power_w);
        transport.set(&input_source(), self.input_source);
        for (i, power) in self.pv_power_w.iter().enumerate() {
            transport.set(&pv(i, "/Ac/Power"), *power);
            transport.set(&pv(i, "/Ac/MaxPower"), self.pv_max_power_w);
        }
    }
}

pub fn controller_for(site: &Site, now: NaiveDateTime) -> SystemController<SimulatedTransport> {
    let cfg = config();
    let mut transport = SimulatedTransport::from_config(&cfg);
    site.apply(&mut transport);
    SystemController::new(&cfg, transport, now)
}

pub fn apply(controller: &mut SystemController<SimulatedTransport>, site: &Site) {
    site.apply(controller.registry_mut().transport_mut());
}

pub fn last_write(
    controller: &SystemController<SimulatedTransport>,
    address: &PointAddress,
) -> Option<f64> {
    controller.registry().transport().last_write(address)
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

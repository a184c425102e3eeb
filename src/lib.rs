//! Energy storage regulator for hybrid battery-inverter installations.
//!
//! Every cycle the controller reads battery SOC, load, grid input and PV
//! production, then writes an AC input power setpoint for the
//! inverter/charger and a power limit for each controllable PV inverter.

pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod telemetry;

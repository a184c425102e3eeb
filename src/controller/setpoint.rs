//! AC input power setpoint calculation.
//!
//! Each cycle the engine picks the stable SOC for the time of week, derives
//! the input power from the battery charge curve, then lets the equalization
//! charge, the overcurrent monitor and the PV throttle adjust it.

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pv_throttle::{PvThrottleController, ThrottleInputs, ThrottleState};
use super::safety_monitor::{SafetyMonitor, SafetyStatus};
use super::scheduler::ChargeScheduler;
use crate::config::{BatteryConfig, Config, WeekendConfig};
use crate::domain::{InverterLimit, MeasurementSnapshot, PointName};
use crate::hardware::Actuators;

/// Input power at and above `twenty_percent_power_soc`, as a share of the load
const HIGH_SOC_POWER_FRACTION: f64 = 0.2;

/// Whether `now` falls inside the configured weekend.
///
/// Both edges are evaluated every cycle. When the weekend ends in the same
/// week it starts, the end edge is applied last; when it wraps into the next
/// week, the start edge is applied last.
pub fn is_weekend(cfg: &WeekendConfig, now: NaiveDateTime) -> bool {
    let weekday = now.weekday().num_days_from_monday();
    let time = now.time();
    let start_day = cfg.start_day.num_days_from_monday();
    let end_day = cfg.end_day.num_days_from_monday();

    let started = weekday >= start_day && time >= cfg.start_time;
    let ended = weekday >= end_day && time >= cfg.end_time;

    let mut weekend = false;
    if end_day >= start_day {
        if started {
            weekend = true;
        }
        if ended {
            weekend = false;
        }
    } else {
        if ended {
            weekend = false;
        }
        if started {
            weekend = true;
        }
    }
    weekend
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurveZone {
    /// At least 1% under the stable SOC: recharge the deficit
    Recharge,
    /// Linear slope between the stable SOC and the 20% point
    Slope,
    /// At or above the 20% point
    Saturated,
}

/// Battery charge curve around a stable SOC.
#[derive(Debug, Clone, Copy)]
pub struct ChargeCurve {
    pub stable_soc: f64,
    pub twenty_percent_power_soc: f64,
    /// Battery capacity divided by the low-battery recharge time (W)
    pub recharge_rate_w: f64,
}

impl ChargeCurve {
    pub fn new(battery: &BatteryConfig, stable_soc: f64) -> Self {
        Self {
            stable_soc,
            twenty_percent_power_soc: battery.twenty_percent_power_soc,
            recharge_rate_w: battery.capacity_wh / battery.low_battery_recharge_time_h,
        }
    }

    pub fn power_slope(&self) -> f64 {
        (1.0 - HIGH_SOC_POWER_FRACTION) / (self.twenty_percent_power_soc - self.stable_soc)
    }

    pub fn zone(&self, soc: f64) -> CurveZone {
        if soc <= self.stable_soc - 1.0 {
            CurveZone::Recharge
        } else if soc >= self.twenty_percent_power_soc {
            CurveZone::Saturated
        } else {
            CurveZone::Slope
        }
    }

    /// Input power for a given SOC and (non-negative) output power.
    pub fn input_power(&self, soc: f64, out_power_w: f64) -> f64 {
        match self.zone(soc) {
            CurveZone::Recharge => {
                2.0 * (self.stable_soc - soc) / 100.0 * self.recharge_rate_w + out_power_w
            }
            CurveZone::Saturated => HIGH_SOC_POWER_FRACTION * out_power_w,
            CurveZone::Slope => {
                out_power_w * (1.0 - (soc - self.stable_soc) * self.power_slope())
            }
        }
    }
}

/// Everything decided in one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub timestamp: NaiveDateTime,
    pub weekend: bool,
    pub stable_soc: f64,
    pub soc: f64,
    pub out_power_w: f64,
    pub curve_zone: CurveZone,
    pub curve_power_w: f64,
    pub charging: bool,
    pub min_in_power_w: f64,
    pub safety: SafetyStatus,
    pub pv_controlled: bool,
    pub throttle: ThrottleState,
    pub in_surplus_w: f64,
    pub ac_setpoint_w: f64,
    pub inverter_limits: Vec<InverterLimit>,
}

/// Owns the stateful sub-controllers and computes the AC input setpoint.
pub struct SetpointEngine {
    battery: BatteryConfig,
    weekend: WeekendConfig,
    pv_controllable: bool,
    charge: ChargeScheduler,
    safety: SafetyMonitor,
    throttle: PvThrottleController,
}

impl SetpointEngine {
    pub fn new(cfg: &Config) -> Self {
        Self {
            battery: cfg.battery.clone(),
            weekend: cfg.weekend.clone(),
            pv_controllable: cfg.controller.pv_controllable,
            charge: ChargeScheduler::new(cfg.charge.clone()),
            safety: SafetyMonitor::new(cfg.safety.clone(), cfg.throttle.min_in_power_w),
            throttle: PvThrottleController::new(cfg.throttle.clone()),
        }
    }

    pub fn stable_soc(&self, weekend: bool) -> f64 {
        if weekend {
            self.battery.weekend_stable_soc
        } else {
            self.battery.week_stable_soc
        }
    }

    /// Run one control cycle on `snapshot` and emit the setpoint and
    /// inverter limits through `actuators`.
    pub fn compute_cycle(
        &mut self,
        snapshot: &MeasurementSnapshot,
        now: NaiveDateTime,
        actuators: &mut dyn Actuators,
    ) -> CycleReport {
        let soc = snapshot.soc.value;
        let out_power_w = snapshot.l1_out_power.value.max(0.0);
        debug!(soc, out_power_w, "Cycle inputs");

        let weekend = is_weekend(&self.weekend, now);
        let stable_soc = self.stable_soc(weekend);
        let curve = ChargeCurve::new(&self.battery, stable_soc);
        let curve_zone = curve.zone(soc);
        let curve_power_w = curve.input_power(soc, out_power_w);
        debug!(weekend, stable_soc, ?curve_zone, curve_power_w, "Charge curve");

        let mut in_power_w = curve_power_w;
        let charging = self.charge.tick(now);
        if let Some(charge_power_w) = self.charge.charge_power() {
            in_power_w = out_power_w + charge_power_w;
            debug!(charge_power_w, "Equalization charge active");
        }

        let min_in_power_w = self.safety.tick(out_power_w, now);

        for line in &snapshot.pv_lines {
            let totals = line.totals();
            debug!(
                line = %line.name,
                power_w = totals.power_w,
                max_power_w = totals.max_power_w,
                available = totals.available_count,
                "PV line"
            );
        }

        let mut inverter_limits = Vec::new();
        let pv_line = snapshot.pv_line(self.throttle.line());
        let pv_controlled = self.pv_controllable && !snapshot.is_inverting() && pv_line.is_some();
        let in_surplus_w = match pv_line {
            Some(line) if pv_controlled => {
                let decision = self.throttle.tick(
                    line,
                    &ThrottleInputs {
                        grid_input_power_w: snapshot.l1_in_power.value,
                        output_power_w: snapshot.l1_out_power.value,
                        soc,
                    },
                );
                for limit in &decision.inverter_limits {
                    actuators.write_inverter_limit(&limit.inverter_id, limit.limit_w);
                    debug!(
                        inverter = %limit.inverter_id,
                        limit_w = limit.limit_w,
                        "Inverter power limit"
                    );
                }
                inverter_limits = decision.inverter_limits;
                decision.state.in_surplus_w
            }
            _ => {
                self.throttle.suspend();
                debug!(
                    pv_controllable = self.pv_controllable,
                    input_source = snapshot.input_source.value,
                    "PV is not controllable this cycle"
                );
                0.0
            }
        };

        let ac_setpoint_w = min_in_power_w.max(in_power_w) + in_surplus_w;
        actuators.write_setpoint(PointName::AcSetpoint, ac_setpoint_w);
        debug!(ac_setpoint_w, min_in_power_w, "AC setpoint");

        CycleReport {
            timestamp: now,
            weekend,
            stable_soc,
            soc,
            out_power_w,
            curve_zone,
            curve_power_w,
            charging,
            min_in_power_w,
            safety: self.safety.status(),
            pv_controlled,
            throttle: self.throttle.state(),
            in_surplus_w,
            ac_setpoint_w,
            inverter_limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Measurement, PvInverter, PvLine};
    use chrono::{NaiveDate, NaiveTime, Weekday};
    use proptest::prelude::*;
    use rstest::rstest;

    fn battery() -> BatteryConfig {
        BatteryConfig {
            week_stable_soc: 55.0,
            weekend_stable_soc: 75.0,
            twenty_percent_power_soc: 90.0,
            capacity_wh: 20000.0,
            low_battery_recharge_time_h: 10.0,
        }
    }

    fn weekend_cfg(start_day: Weekday, end_day: Weekday) -> WeekendConfig {
        WeekendConfig {
            start_day,
            start_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            end_day,
            end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        }
    }

    /// 2026-03-02 is a Monday
    fn at(day_offset: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2 + day_offset)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        setpoints: Vec<(PointName, f64)>,
        limits: Vec<(String, f64)>,
    }

    impl Actuators for Recorder {
        fn write_setpoint(&mut self, point: PointName, value: f64) {
            self.setpoints.push((point, value));
        }
        fn write_inverter_limit(&mut self, inverter_id: &str, value: f64) {
            self.limits.push((inverter_id.to_string(), value));
        }
    }

    fn config() -> Config {
        Config::from_toml_str(include_str!("../../config/default.toml")).unwrap()
    }

    fn snapshot(soc: f64, out: f64, grid_in: f64, source: f64, pv: &[f64]) -> MeasurementSnapshot {
        MeasurementSnapshot {
            soc: Measurement::available(soc),
            l1_out_power: Measurement::available(out),
            l1_in_power: Measurement::available(grid_in),
            input_source: Measurement::available(source),
            pv_lines: vec![PvLine {
                name: "L1".to_string(),
                inverters: pv
                    .iter()
                    .enumerate()
                    .map(|(i, &p)| PvInverter {
                        id: format!("fronius_{}", i + 1),
                        power: Measurement::available(p),
                        max_power: Measurement::available(5000.0),
                        available: true,
                    })
                    .collect(),
            }],
        }
    }

    #[rstest]
    #[case::monday(at(0, 12, 0), false)]
    #[case::friday_before_start(at(4, 17, 59), false)]
    #[case::friday_evening(at(4, 18, 0), true)]
    #[case::saturday_morning(at(5, 8, 0), false)]
    #[case::saturday_evening(at(5, 20, 0), true)]
    #[case::sunday_after_end(at(6, 18, 30), false)]
    fn test_weekend_within_one_week(#[case] now: NaiveDateTime, #[case] expected: bool) {
        assert_eq!(is_weekend(&weekend_cfg(Weekday::Fri, Weekday::Sun), now), expected);
    }

    #[rstest]
    #[case::monday_before_end(at(0, 12, 0), false)]
    #[case::monday_after_end(at(0, 19, 0), false)]
    #[case::saturday_evening(at(5, 19, 0), true)]
    #[case::sunday_evening(at(6, 19, 0), true)]
    #[case::thursday_morning(at(3, 9, 0), false)]
    fn test_weekend_spanning_next_week(#[case] now: NaiveDateTime, #[case] expected: bool) {
        assert_eq!(is_weekend(&weekend_cfg(Weekday::Sat, Weekday::Mon), now), expected);
    }

    #[rstest]
    #[case::deep_deficit(40.0, 1000.0, CurveZone::Recharge, 1600.0)]
    #[case::one_below_stable(54.0, 1000.0, CurveZone::Recharge, 1040.0)]
    #[case::at_stable(55.0, 1000.0, CurveZone::Slope, 1000.0)]
    #[case::mid_slope(72.5, 1000.0, CurveZone::Slope, 600.0)]
    #[case::saturated(95.0, 1000.0, CurveZone::Saturated, 200.0)]
    fn test_charge_curve_zones(
        #[case] soc: f64,
        #[case] out: f64,
        #[case] zone: CurveZone,
        #[case] expected: f64,
    ) {
        let curve = ChargeCurve::new(&battery(), 55.0);
        assert_eq!(curve.zone(soc), zone);
        assert!((curve.input_power(soc, out) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_curve_continuous_at_twenty_percent_point() {
        let curve = ChargeCurve::new(&battery(), 55.0);
        let below = curve.input_power(90.0 - 1e-9, 2000.0);
        let at = curve.input_power(90.0, 2000.0);
        assert!((below - at).abs() < 1e-4);
    }

    proptest! {
        #[test]
        fn prop_curve_non_increasing(
            stable in 20.0f64..80.0,
            gap in 5.0f64..20.0,
            out in 0.0f64..8000.0,
            a in 0.0f64..100.0,
            b in 0.0f64..100.0,
        ) {
            let mut cfg = battery();
            cfg.twenty_percent_power_soc = stable + gap;
            // Recharge term large enough to sit above the slope at its edge
            cfg.capacity_wh = out * 10.0 * 100.0;
            let curve = ChargeCurve::new(&cfg, stable);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(curve.input_power(lo, out) + 1e-6 >= curve.input_power(hi, out));
        }

        #[test]
        fn prop_curve_within_zone_is_non_increasing(
            out in 0.0f64..8000.0,
            a in 54.5f64..100.0,
            b in 54.5f64..100.0,
        ) {
            let curve = ChargeCurve::new(&battery(), 55.0);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(curve.input_power(lo, out) + 1e-6 >= curve.input_power(hi, out));
        }
    }

    #[test]
    fn test_low_battery_adds_recharge_term_without_load() {
        let mut engine = SetpointEngine::new(&config());
        let mut recorder = Recorder::default();
        // Tuesday, weekday target 55
        let report = engine.compute_cycle(
            &snapshot(50.0, 0.0, 500.0, 1.0, &[0.0]),
            at(1, 12, 0),
            &mut recorder,
        );

        assert_eq!(report.curve_zone, CurveZone::Recharge);
        assert!(report.curve_power_w > 0.0);
        // 2 * 5 / 100 * 2000
        assert!((report.curve_power_w - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_setpoint_is_floor_when_curve_is_lower() {
        let mut engine = SetpointEngine::new(&config());
        let mut recorder = Recorder::default();
        let report = engine.compute_cycle(
            &snapshot(92.0, 500.0, 500.0, 1.0, &[0.0]),
            at(1, 12, 0),
            &mut recorder,
        );

        assert_eq!(report.curve_power_w, 100.0);
        assert_eq!(report.ac_setpoint_w, 200.0);
        assert_eq!(recorder.setpoints, vec![(PointName::AcSetpoint, 200.0)]);
    }

    #[test]
    fn test_charge_overrides_curve() {
        let mut engine = SetpointEngine::new(&config());
        let mut recorder = Recorder::default();
        // 2026-01-03 is the configured first charge Saturday
        let now = NaiveDate::from_ymd_opt(2026, 1, 3)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let report =
            engine.compute_cycle(&snapshot(92.0, 800.0, 500.0, 1.0, &[0.0]), now, &mut recorder);

        assert!(report.charging);
        assert_eq!(report.ac_setpoint_w, 3800.0);
    }

    #[test]
    fn test_weekend_uses_weekend_target() {
        let mut engine = SetpointEngine::new(&config());
        let mut recorder = Recorder::default();
        // Saturday evening, SOC 70 is under the weekend target of 75
        let report = engine.compute_cycle(
            &snapshot(70.0, 1000.0, 500.0, 1.0, &[0.0]),
            at(5, 20, 0),
            &mut recorder,
        );
        assert!(report.weekend);
        assert_eq!(report.stable_soc, 75.0);
        assert_eq!(report.curve_zone, CurveZone::Recharge);
    }

    #[test]
    fn test_throttle_surplus_added_to_setpoint() {
        let mut engine = SetpointEngine::new(&config());
        let mut recorder = Recorder::default();
        let report = engine.compute_cycle(
            &snapshot(60.0, 1000.0, -300.0, 1.0, &[1500.0, 1500.0]),
            at(1, 12, 0),
            &mut recorder,
        );

        assert!(report.throttle.active);
        assert!(report.throttle.power_limit_w < 3000.0);
        // 200 + 100 + 300
        assert_eq!(report.in_surplus_w, 600.0);
        assert!((report.ac_setpoint_w - (report.curve_power_w.max(200.0) + 600.0)).abs() < 1e-9);
        assert_eq!(recorder.limits.len(), 2);
    }

    #[test]
    fn test_inverting_source_skips_pv_control() {
        let mut engine = SetpointEngine::new(&config());
        let mut recorder = Recorder::default();
        let report = engine.compute_cycle(
            &snapshot(60.0, 1000.0, -300.0, 240.0, &[1500.0]),
            at(1, 12, 0),
            &mut recorder,
        );

        assert!(!report.pv_controlled);
        assert_eq!(report.in_surplus_w, 0.0);
        assert!(recorder.limits.is_empty());
        assert_eq!(recorder.setpoints.len(), 1);
    }

    #[test]
    fn test_critical_load_raises_floor() {
        let mut engine = SetpointEngine::new(&config());
        let mut recorder = Recorder::default();
        let report = engine.compute_cycle(
            &snapshot(92.0, 7000.0, 2500.0, 1.0, &[0.0]),
            at(1, 12, 0),
            &mut recorder,
        );

        assert!(report.safety.active);
        assert_eq!(report.min_in_power_w, 2500.0);
        assert_eq!(report.ac_setpoint_w, 2500.0);
    }
}

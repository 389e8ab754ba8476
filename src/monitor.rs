//! Cell-monitor scanning and pack aggregation.
//!
//! The scan is staggered: one module per tick, a plain rotating index,
//! so every tick completes with a well-defined state and the 22-module
//! rotation finishes inside a quarter of a second at the 10 ms cadence.
//! Aggregation then runs over the whole pack array each tick, after the
//! scan step, so downstream consumers never observe a half-updated
//! module.

use crate::config::{CELLS_PER_MODULE, IMBALANCE_WARN_MV, N_MODULES, SENSORS_PER_MODULE};
use crate::hal::BmsHal;
use crate::types::{PackState, SafetyStatus};

/// Rotating-scan state, owned by the pack controller.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    scan_module: usize,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the next module in rotation: cell voltages, temperatures and
    /// the monitor's own safety-status bits. Any driver failure marks the
    /// module unhealthy and raises `comm_loss`. The pack current is read
    /// every tick through module 0's sense path.
    pub fn scan_tick<H: BmsHal>(&mut self, hal: &mut H, pack: &mut PackState) {
        let module = self.scan_module;
        self.scan_module = (self.scan_module + 1) % N_MODULES;

        match hal.read_current(0) {
            Ok(ma) => pack.pack_current_ma = ma,
            Err(_) => {
                pack.faults.comm_loss = true;
            }
        }

        let cells = match hal.read_cells(module) {
            Ok(c) => c,
            Err(_) => {
                return Self::mark_comm_loss(pack, module);
            }
        };
        let temps = match hal.read_temperatures(module) {
            Ok(t) => t,
            Err(_) => {
                return Self::mark_comm_loss(pack, module);
            }
        };
        let safety = match hal.read_safety_status(module) {
            Ok(s) => s,
            Err(_) => {
                return Self::mark_comm_loss(pack, module);
            }
        };

        let cell_base = module * CELLS_PER_MODULE;
        pack.cell_mv[cell_base..cell_base + CELLS_PER_MODULE].copy_from_slice(&cells);
        let sens_base = module * SENSORS_PER_MODULE;
        pack.temp_deci_c[sens_base..sens_base + SENSORS_PER_MODULE].copy_from_slice(&temps);
        pack.module_comm_ok[module] = true;

        apply_safety_status(pack, &safety);
    }

    fn mark_comm_loss(pack: &mut PackState, module: usize) {
        warn!("monitor: module {} not responding", module);
        pack.module_comm_ok[module] = false;
        pack.faults.comm_loss = true;
    }
}

/// Record the ASIC's own hardware protections into the fault bitset.
/// These are informational latches; the protection engine's independent
/// timers decide when the pack actually faults.
fn apply_safety_status(pack: &mut PackState, safety: &SafetyStatus) {
    if safety.cov {
        pack.faults.hw_ov = true;
    }
    if safety.cuv {
        pack.faults.hw_uv = true;
    }
    if safety.scd {
        pack.faults.sc_discharge = true;
    }
    if safety.over_temp() {
        pack.faults.hw_ot = true;
    }
}

/// Derive the per-cycle statistics. A reading of 0 mV means the cell is
/// unconnected or unread and takes no part in min/max or the mean; with
/// no valid readings everything falls back to zero. The mean is over
/// valid cells, which keeps `min <= avg <= max` whenever any cell is
/// populated.
pub fn aggregate(pack: &mut PackState) {
    let mut sum: u32 = 0;
    let mut max_mv: u16 = 0;
    let mut min_mv: u16 = u16::MAX;
    let mut valid: u32 = 0;

    for &v in pack.cell_mv.iter() {
        if v == 0 {
            continue;
        }
        sum += v as u32;
        valid += 1;
        if v > max_mv {
            max_mv = v;
        }
        if v < min_mv {
            min_mv = v;
        }
    }

    if valid == 0 {
        pack.max_cell_mv = 0;
        pack.min_cell_mv = 0;
        pack.avg_cell_mv = 0;
        pack.pack_voltage_mv = 0;
    } else {
        pack.max_cell_mv = max_mv;
        pack.min_cell_mv = min_mv;
        pack.avg_cell_mv = (sum / valid) as u16;
        pack.pack_voltage_mv = sum;
    }

    let mut max_temp: i16 = i16::MIN;
    let mut min_temp: i16 = i16::MAX;
    let mut any_temp = false;
    for module in 0..N_MODULES {
        if !pack.module_comm_ok[module] {
            continue;
        }
        for s in 0..SENSORS_PER_MODULE {
            let t = pack.temp_deci_c[module * SENSORS_PER_MODULE + s];
            any_temp = true;
            if t > max_temp {
                max_temp = t;
            }
            if t < min_temp {
                min_temp = t;
            }
        }
    }
    if any_temp {
        pack.max_temp_deci_c = max_temp;
        pack.min_temp_deci_c = min_temp;
    } else {
        pack.max_temp_deci_c = 0;
        pack.min_temp_deci_c = 0;
    }

    // Imbalance is warning-grade and tracks the live spread.
    pack.faults.imbalance = valid > 0 && pack.imbalance_mv() > IMBALANCE_WARN_MV;
}

/// True once every module has reported in healthy, the NOT_READY
/// self-test condition.
pub fn all_modules_ok(pack: &PackState) -> bool {
    pack.module_comm_ok.iter().all(|&ok| ok)
}

/// Number of populated (non-zero) cell readings, for diagnostics.
pub fn populated_cells(pack: &PackState) -> usize {
    pack.cell_mv.iter().filter(|&&v| v > 0).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::N_CELLS;
    use crate::hal::mock::MockHal;

    fn scanned_pack(hal: &mut MockHal) -> (MonitorState, PackState) {
        let mut mon = MonitorState::new();
        let mut pack = PackState::new(0);
        for _ in 0..N_MODULES {
            mon.scan_tick(hal, &mut pack);
        }
        aggregate(&mut pack);
        (mon, pack)
    }

    #[test]
    fn full_rotation_populates_every_module() {
        let mut hal = MockHal::new();
        let (_, pack) = scanned_pack(&mut hal);
        assert!(all_modules_ok(&pack));
        assert_eq!(populated_cells(&pack), N_CELLS);
        assert_eq!(pack.pack_voltage_mv, 3675 * N_CELLS as u32);
        assert_eq!(pack.avg_cell_mv, 3675);
        assert_eq!(pack.min_cell_mv, 3675);
        assert_eq!(pack.max_cell_mv, 3675);
    }

    #[test]
    fn zero_cells_are_excluded_from_min_and_mean() {
        let mut hal = MockHal::new();
        hal.set_cell(5, 0);
        hal.set_cell(100, 3600);
        let (_, pack) = scanned_pack(&mut hal);
        assert_eq!(pack.min_cell_mv, 3600);
        assert_eq!(pack.max_cell_mv, 3675);
        assert!(pack.min_cell_mv <= pack.avg_cell_mv && pack.avg_cell_mv <= pack.max_cell_mv);
    }

    #[test]
    fn all_zero_readings_fall_back_to_zero() {
        let mut hal = MockHal::new();
        hal.set_all_cells(0);
        let (_, pack) = scanned_pack(&mut hal);
        assert_eq!(pack.min_cell_mv, 0);
        assert_eq!(pack.max_cell_mv, 0);
        assert_eq!(pack.avg_cell_mv, 0);
        assert_eq!(pack.pack_voltage_mv, 0);
    }

    #[test]
    fn imbalance_flag_tracks_spread() {
        let mut hal = MockHal::new();
        hal.set_cell(10, 3740); // 65 mV above nominal
        let (_, mut pack) = scanned_pack(&mut hal);
        assert!(pack.faults.imbalance);

        hal.set_cell(10, 3700); // 25 mV: inside the 50 mV window
        pack.cell_mv[10] = 3700;
        aggregate(&mut pack);
        assert!(!pack.faults.imbalance);
    }

    #[test]
    fn comm_failure_marks_module_and_fault() {
        let mut hal = MockHal::new();
        hal.comm_fail[3] = true;
        let (_, pack) = scanned_pack(&mut hal);
        assert!(!pack.module_comm_ok[3]);
        assert!(pack.module_comm_ok[4]);
        assert!(pack.faults.comm_loss);
        assert!(!all_modules_ok(&pack));
    }

    #[test]
    fn asic_safety_bits_are_recorded() {
        let mut hal = MockHal::new();
        hal.safety[2].scd = true;
        hal.safety[9].otc = true;
        let (_, pack) = scanned_pack(&mut hal);
        assert!(pack.faults.sc_discharge);
        assert!(pack.faults.hw_ot);
        assert!(!pack.faults.hw_ov);
        assert!(!pack.fault_latched);
    }

    #[test]
    fn temperature_aggregation_spans_all_sensors() {
        let mut hal = MockHal::new();
        hal.set_temp(0, -75);
        hal.set_temp(65, 412);
        let (_, pack) = scanned_pack(&mut hal);
        assert_eq!(pack.min_temp_deci_c, -75);
        assert_eq!(pack.max_temp_deci_c, 412);
    }
}

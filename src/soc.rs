//! State-of-charge estimation.
//!
//! Integer coulomb counting with a carried remainder so that 10 ms ticks
//! integrate without truncation loss, plus an open-circuit-voltage
//! correction applied after a sustained rest, only in READY, never with
//! the bus live. The estimator also keeps the cumulative charge and
//! runtime counters that go into the persistent snapshot.

use crate::config::{
    COULOMBIC_EFFICIENCY_PPT, NOMINAL_CAPACITY_MAH, REST_HOLD_MS, REST_THRESHOLD_MA,
};
use crate::types::{PackMode, PackState, PersistentSnapshot};

/// 24-point OCV curve for the NMC chemistry of the shipped modules.
/// SoC breakpoints in hundredths of a percent, voltages in mV. Both
/// tables ascend, so the lookup runs in either direction.
const OCV_SOC_BP: [u16; 24] = [
    0, 200, 500, 800, 1000, 1500, 2000, 2500, 3000, 3500, 4000, 4500, 5000, 5500, 6000, 6500,
    7000, 7500, 8000, 8500, 9000, 9500, 9800, 10000,
];

const OCV_MV_BP: [u16; 24] = [
    3000, 3280, 3420, 3480, 3510, 3555, 3590, 3610, 3625, 3638, 3650, 3662, 3675, 3690, 3710,
    3735, 3765, 3800, 3845, 3900, 3960, 4030, 4100, 4190,
];

/// Cell open-circuit voltage for a given SoC, clamped to the table ends.
pub fn ocv_mv_from_soc(soc_hundredths: u16) -> u16 {
    lookup(&OCV_SOC_BP, &OCV_MV_BP, soc_hundredths)
}

/// Reverse interpolation: SoC from a rested cell voltage.
pub fn soc_from_ocv(cell_mv: u16) -> u16 {
    lookup(&OCV_MV_BP, &OCV_SOC_BP, cell_mv)
}

fn lookup(x_bp: &[u16; 24], y_bp: &[u16; 24], x: u16) -> u16 {
    if x <= x_bp[0] {
        return y_bp[0];
    }
    if x >= x_bp[23] {
        return y_bp[23];
    }
    for i in 1..24 {
        if x <= x_bp[i] {
            let dx = x_bp[i] as i32 - x_bp[i - 1] as i32;
            if dx == 0 {
                return y_bp[i];
            }
            let dy = y_bp[i] as i32 - y_bp[i - 1] as i32;
            let frac = x as i32 - x_bp[i - 1] as i32;
            return (y_bp[i - 1] as i32 + (dy * frac) / dx) as u16;
        }
    }
    y_bp[23]
}

/// Per-pack coulomb counter. Owned by the controller; no module state.
#[derive(Debug, Clone)]
pub struct SocEstimator {
    soc_hundredths: u16,
    /// Unconverted charge, mA*ms, carried between updates. One SoC
    /// hundredth is `NOMINAL_CAPACITY_MAH * 360` mA*ms.
    charge_remainder: i64,
    /// Time spent below the rest-current threshold.
    rest_ms: u32,

    // Lifetime counters for the persistent snapshot.
    charge_acc_ma_ms: u64,
    discharge_acc_ma_ms: u64,
    total_charge_mah: u32,
    total_discharge_mah: u32,
    runtime_ms: u32,
    runtime_hours: u32,
}

/// mA*ms per SoC hundredth.
const MA_MS_PER_HUNDREDTH: i64 = NOMINAL_CAPACITY_MAH * 360;
/// mA*ms per mAh.
const MA_MS_PER_MAH: u64 = 3_600_000;
const MS_PER_HOUR: u32 = 3_600_000;

impl SocEstimator {
    pub fn new(initial_soc_hundredths: u16) -> Self {
        Self {
            soc_hundredths: initial_soc_hundredths.min(10_000),
            charge_remainder: 0,
            rest_ms: 0,
            charge_acc_ma_ms: 0,
            discharge_acc_ma_ms: 0,
            total_charge_mah: 0,
            total_discharge_mah: 0,
            runtime_ms: 0,
            runtime_hours: 0,
        }
    }

    /// Rebuild estimator state from a stored snapshot at power-on.
    pub fn restore(snapshot: &PersistentSnapshot) -> Self {
        let mut est = Self::new(snapshot.soc_hundredths);
        est.total_charge_mah = snapshot.total_charge_mah;
        est.total_discharge_mah = snapshot.total_discharge_mah;
        est.runtime_hours = snapshot.runtime_hours;
        est
    }

    pub fn soc_hundredths(&self) -> u16 {
        self.soc_hundredths
    }

    pub fn snapshot(&self) -> PersistentSnapshot {
        PersistentSnapshot {
            soc_hundredths: self.soc_hundredths,
            runtime_hours: self.runtime_hours,
            total_charge_mah: self.total_charge_mah,
            total_discharge_mah: self.total_discharge_mah,
        }
    }

    /// One integration step. Reads current, mode and the rested cell
    /// voltage from the pack record and writes `soc_hundredths` back.
    pub fn update(&mut self, pack: &mut PackState, dt_ms: u32) {
        let current_ma = pack.pack_current_ma;

        // Coulombic efficiency applies on charge only.
        let effective_ma = if current_ma > 0 {
            ((current_ma as i64) * COULOMBIC_EFFICIENCY_PPT) / 1000
        } else {
            current_ma as i64
        };

        self.charge_remainder += effective_ma * dt_ms as i64;
        let delta = self.charge_remainder / MA_MS_PER_HUNDREDTH;
        if delta != 0 {
            self.charge_remainder -= delta * MA_MS_PER_HUNDREDTH;
            let soc = (self.soc_hundredths as i64 + delta).clamp(0, 10_000);
            self.soc_hundredths = soc as u16;
        }

        self.update_counters(current_ma, dt_ms);

        // Rest detection for the OCV correction.
        if current_ma.unsigned_abs() < REST_THRESHOLD_MA as u32 {
            self.rest_ms = self.rest_ms.saturating_add(dt_ms);
        } else {
            self.rest_ms = 0;
        }

        if self.rest_ms >= REST_HOLD_MS && pack.mode == PackMode::Ready {
            let corrected = soc_from_ocv(pack.avg_cell_mv);
            debug!(
                "soc: OCV correction {} -> {} ({} mV at rest)",
                self.soc_hundredths, corrected, pack.avg_cell_mv
            );
            self.soc_hundredths = corrected;
            self.charge_remainder = 0;
            self.rest_ms = 0;
        }

        pack.soc_hundredths = self.soc_hundredths;
    }

    fn update_counters(&mut self, current_ma: i32, dt_ms: u32) {
        let amount = current_ma.unsigned_abs() as u64 * dt_ms as u64;
        if current_ma > 0 {
            self.charge_acc_ma_ms += amount;
            let mah = self.charge_acc_ma_ms / MA_MS_PER_MAH;
            if mah > 0 {
                self.charge_acc_ma_ms -= mah * MA_MS_PER_MAH;
                self.total_charge_mah = self.total_charge_mah.saturating_add(mah as u32);
            }
        } else if current_ma < 0 {
            self.discharge_acc_ma_ms += amount;
            let mah = self.discharge_acc_ma_ms / MA_MS_PER_MAH;
            if mah > 0 {
                self.discharge_acc_ma_ms -= mah * MA_MS_PER_MAH;
                self.total_discharge_mah = self.total_discharge_mah.saturating_add(mah as u32);
            }
        }

        self.runtime_ms += dt_ms;
        if self.runtime_ms >= MS_PER_HOUR {
            self.runtime_ms -= MS_PER_HOUR;
            self.runtime_hours = self.runtime_hours.saturating_add(1);
        }
    }
}

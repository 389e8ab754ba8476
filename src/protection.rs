//! Protection engine: per-cell and per-sensor fault timers, the
//! independent hardware-safety layer, overcurrent supervision, the
//! warning channel and the safe-state reset guard.
//!
//! Every timer is a leaky integrator: it climbs by `dt` while its
//! condition holds and drains at half rate while it does not, so a
//! sustained condition trips after the configured delay while transient
//! spikes never accumulate enough to nuisance-trip.
//!
//! All faults latch. Clearing requires an operator reset command with
//! the safe-state hold satisfied; nothing here ever self-clears.

use crate::config::{
    FAULT_RESET_HOLD_MS, HW_OT_DELAY_MS, HW_OT_DECI_C, HW_OV_DELAY_MS, HW_OV_MV, HW_UV_DELAY_MS,
    HW_UV_MV, LEAK_DECAY_SHIFT, MAX_DISCHARGE_MA, N_CELLS, N_SENSORS, OC_WARN_DELAY_MS,
    OC_WARN_MARGIN_PPT, OC_WARN_OFFSET_MA, SE_FAULT_DELAY_MS, SE_OT_FAULT_DECI_C,
    SE_OT_WARN_CLEAR_DECI_C, SE_OT_WARN_DECI_C, SE_OV_FAULT_MV, SE_OV_WARN_CLEAR_MV,
    SE_OV_WARN_MV, SE_UV_FAULT_MV, SE_UV_WARN_CLEAR_MV, SE_UV_WARN_MV, WARN_DELAY_MS,
    WARN_HOLD_MS,
};
use crate::hal::BmsHal;
use crate::limits;
use crate::types::{short_msg, FaultEvent, FaultKind, PackState};

fn leak_up(timer: &mut u32, dt_ms: u32) {
    *timer = timer.saturating_add(dt_ms);
}

fn leak_down(timer: &mut u32, dt_ms: u32) {
    *timer = timer.saturating_sub(dt_ms >> LEAK_DECAY_SHIFT);
}

/// Protection timers and warning latches. Owned exclusively by the pack
/// controller's protection stage; nothing else reads or writes it.
#[derive(Debug, Clone)]
pub struct ProtectionState {
    ov_timer_ms: [u32; N_CELLS],
    uv_timer_ms: [u32; N_CELLS],
    ot_timer_ms: [u32; N_SENSORS],

    hw_ov_timer_ms: u32,
    hw_uv_timer_ms: u32,
    hw_ot_timer_ms: u32,

    oc_charge_timer_ms: u32,
    oc_discharge_timer_ms: u32,
    oc_warn_timer_ms: u32,

    safe_state_ms: u32,

    warn_ov_timer_ms: u32,
    warn_uv_timer_ms: u32,
    warn_ot_timer_ms: u32,
    warning_hold_ms: u32,
    warn_ov_active: bool,
    warn_uv_active: bool,
    warn_ot_active: bool,
    warn_oc_active: bool,
}

impl ProtectionState {
    pub fn new() -> Self {
        Self {
            ov_timer_ms: [0; N_CELLS],
            uv_timer_ms: [0; N_CELLS],
            ot_timer_ms: [0; N_SENSORS],
            hw_ov_timer_ms: 0,
            hw_uv_timer_ms: 0,
            hw_ot_timer_ms: 0,
            oc_charge_timer_ms: 0,
            oc_discharge_timer_ms: 0,
            oc_warn_timer_ms: 0,
            safe_state_ms: 0,
            warn_ov_timer_ms: 0,
            warn_uv_timer_ms: 0,
            warn_ot_timer_ms: 0,
            warning_hold_ms: 0,
            warn_ov_active: false,
            warn_uv_active: false,
            warn_ot_active: false,
            warn_oc_active: false,
        }
    }

    /// One protection pass. Runs the hardware-safety layer
    /// unconditionally, then, unless a fault is already latched, the
    /// software per-cell, per-sensor and overcurrent checks and the
    /// warning channel. On the first confirmed fault the pass latches,
    /// logs the event and returns without evaluating further axes.
    pub fn run<H: BmsHal>(&mut self, hal: &mut H, pack: &mut PackState, dt_ms: u32) {
        self.hw_safety(pack, dt_ms);

        if pack.fault_latched {
            self.accumulate_safe_state(pack, dt_ms);
            return;
        }

        if self.check_cell_voltage(hal, pack, dt_ms) {
            return;
        }
        if self.check_sensor_temps(hal, pack, dt_ms) {
            return;
        }
        if self.check_overcurrent(hal, pack, dt_ms) {
            return;
        }
        self.check_warnings(pack, dt_ms);
    }

    /// Hardware-safety layer. Runs even when a software fault is already
    /// latched: it exists to defend against bugs in the rest of this
    /// engine. Messages accumulate into the fault buffer, never replace
    /// it, and `hw_fault_latched` stays set through a software reset.
    pub fn hw_safety(&mut self, pack: &mut PackState, dt_ms: u32) {
        let any_ov = pack.cell_mv.iter().any(|&v| v >= HW_OV_MV);
        if any_ov {
            leak_up(&mut self.hw_ov_timer_ms, dt_ms);
            if self.hw_ov_timer_ms >= HW_OV_DELAY_MS {
                pack.faults.hw_ov = true;
                pack.fault_latched = true;
                pack.hw_fault_latched = true;
                pack.append_fault_msg("HW SAFETY: cell overvoltage");
            }
        } else {
            leak_down(&mut self.hw_ov_timer_ms, dt_ms);
        }

        let any_uv = pack.cell_mv.iter().any(|&v| v > 0 && v <= HW_UV_MV);
        if any_uv {
            leak_up(&mut self.hw_uv_timer_ms, dt_ms);
            if self.hw_uv_timer_ms >= HW_UV_DELAY_MS {
                pack.faults.hw_uv = true;
                pack.fault_latched = true;
                pack.hw_fault_latched = true;
                pack.append_fault_msg("HW SAFETY: cell undervoltage");
            }
        } else {
            leak_down(&mut self.hw_uv_timer_ms, dt_ms);
        }

        let any_ot = pack.temp_deci_c.iter().any(|&t| t >= HW_OT_DECI_C);
        if any_ot {
            leak_up(&mut self.hw_ot_timer_ms, dt_ms);
            if self.hw_ot_timer_ms >= HW_OT_DELAY_MS {
                pack.faults.hw_ot = true;
                pack.fault_latched = true;
                pack.hw_fault_latched = true;
                pack.append_fault_msg("HW SAFETY: overtemperature");
            }
        } else {
            leak_down(&mut self.hw_ot_timer_ms, dt_ms);
        }
    }

    fn check_cell_voltage<H: BmsHal>(
        &mut self,
        hal: &mut H,
        pack: &mut PackState,
        dt_ms: u32,
    ) -> bool {
        for i in 0..N_CELLS {
            let v = pack.cell_mv[i];
            if v >= SE_OV_FAULT_MV {
                leak_up(&mut self.ov_timer_ms[i], dt_ms);
                if self.ov_timer_ms[i] >= SE_FAULT_DELAY_MS {
                    pack.faults.cell_ov = true;
                    pack.fault_latched = true;
                    let msg = short_msg(format_args!("SE OV fault: cell {} = {} mV", i, v));
                    pack.append_fault_msg(&msg);
                    warn!("protection: OV fault, cell {} at {} mV", i, v);
                    hal.log_fault_event(FaultEvent {
                        timestamp_ms: pack.uptime_ms,
                        kind: FaultKind::CellOv,
                        index: i as u16,
                        value: v as i32,
                    });
                    return true;
                }
            } else {
                leak_down(&mut self.ov_timer_ms[i], dt_ms);
            }
        }

        for i in 0..N_CELLS {
            let v = pack.cell_mv[i];
            // Cells reading 0 are unconnected, not undervolted.
            if v == 0 {
                continue;
            }
            if v <= SE_UV_FAULT_MV {
                leak_up(&mut self.uv_timer_ms[i], dt_ms);
                if self.uv_timer_ms[i] >= SE_FAULT_DELAY_MS {
                    pack.faults.cell_uv = true;
                    pack.fault_latched = true;
                    let msg = short_msg(format_args!("SE UV fault: cell {} = {} mV", i, v));
                    pack.append_fault_msg(&msg);
                    warn!("protection: UV fault, cell {} at {} mV", i, v);
                    hal.log_fault_event(FaultEvent {
                        timestamp_ms: pack.uptime_ms,
                        kind: FaultKind::CellUv,
                        index: i as u16,
                        value: v as i32,
                    });
                    return true;
                }
            } else {
                leak_down(&mut self.uv_timer_ms[i], dt_ms);
            }
        }

        false
    }

    fn check_sensor_temps<H: BmsHal>(
        &mut self,
        hal: &mut H,
        pack: &mut PackState,
        dt_ms: u32,
    ) -> bool {
        for i in 0..N_SENSORS {
            let t = pack.temp_deci_c[i];
            if t >= SE_OT_FAULT_DECI_C {
                leak_up(&mut self.ot_timer_ms[i], dt_ms);
                if self.ot_timer_ms[i] >= SE_FAULT_DELAY_MS {
                    pack.faults.cell_ot = true;
                    pack.fault_latched = true;
                    let msg = short_msg(format_args!("SE OT fault: sensor {} = {} dC", i, t));
                    pack.append_fault_msg(&msg);
                    warn!("protection: OT fault, sensor {} at {} deci-C", i, t);
                    hal.log_fault_event(FaultEvent {
                        timestamp_ms: pack.uptime_ms,
                        kind: FaultKind::CellOt,
                        index: i as u16,
                        value: t as i32,
                    });
                    return true;
                }
            } else {
                leak_down(&mut self.ot_timer_ms[i], dt_ms);
            }
        }
        false
    }

    fn check_overcurrent<H: BmsHal>(
        &mut self,
        hal: &mut H,
        pack: &mut PackState,
        dt_ms: u32,
    ) -> bool {
        let temp_lim = limits::temp_limit(pack.max_temp_deci_c);
        let current = pack.pack_current_ma;

        // Charge overcurrent faults only below freezing, against the
        // temperature-derated limit; above 0 degC the warning channel is
        // the only response.
        let oc_charge = current > 0 && pack.min_temp_deci_c < 0 && current > temp_lim.charge_ma;
        if oc_charge {
            leak_up(&mut self.oc_charge_timer_ms, dt_ms);
            if self.oc_charge_timer_ms >= SE_FAULT_DELAY_MS {
                pack.faults.oc_charge = true;
                pack.fault_latched = true;
                let msg = short_msg(format_args!("OC charge fault below 0C: {} mA", current));
                pack.append_fault_msg(&msg);
                hal.log_fault_event(FaultEvent {
                    timestamp_ms: pack.uptime_ms,
                    kind: FaultKind::OcCharge,
                    index: FaultEvent::NO_INDEX,
                    value: current,
                });
                return true;
            }
        } else {
            leak_down(&mut self.oc_charge_timer_ms, dt_ms);
        }

        // Discharge overcurrent is checked against the static pack
        // maximum regardless of temperature.
        if current < -MAX_DISCHARGE_MA {
            leak_up(&mut self.oc_discharge_timer_ms, dt_ms);
            if self.oc_discharge_timer_ms >= SE_FAULT_DELAY_MS {
                pack.faults.oc_discharge = true;
                pack.fault_latched = true;
                let msg = short_msg(format_args!("OC discharge fault: {} mA", current));
                pack.append_fault_msg(&msg);
                hal.log_fault_event(FaultEvent {
                    timestamp_ms: pack.uptime_ms,
                    kind: FaultKind::OcDischarge,
                    index: FaultEvent::NO_INDEX,
                    value: current,
                });
                return true;
            }
        } else {
            leak_down(&mut self.oc_discharge_timer_ms, dt_ms);
        }

        // Overcurrent warning: 1.05 x temperature charge limit + 5 A,
        // 10 s confirm. Feeds the warning channel, never a fault.
        let warn_thresh =
            ((temp_lim.charge_ma as i64 * OC_WARN_MARGIN_PPT) / 1000) as i32 + OC_WARN_OFFSET_MA;
        if current > warn_thresh {
            leak_up(&mut self.oc_warn_timer_ms, dt_ms);
            if self.oc_warn_timer_ms >= OC_WARN_DELAY_MS {
                self.warn_oc_active = true;
            }
        } else {
            leak_down(&mut self.oc_warn_timer_ms, dt_ms);
            if self.oc_warn_timer_ms == 0 {
                self.warn_oc_active = false;
            }
        }

        false
    }

    /// Warning channel. Each axis uses a trigger/clear hysteresis pair:
    /// once latched it is tested against the (strictly safer) clear
    /// level. A 5 s integrator confirms, and after every axis drops the
    /// aggregate holds for a further 10 s.
    fn check_warnings(&mut self, pack: &mut PackState, dt_ms: u32) {
        let ov_thresh = if self.warn_ov_active {
            SE_OV_WARN_CLEAR_MV
        } else {
            SE_OV_WARN_MV
        };
        let cond_ov = pack.cell_mv.iter().any(|&v| v >= ov_thresh);

        let uv_thresh = if self.warn_uv_active {
            SE_UV_WARN_CLEAR_MV
        } else {
            SE_UV_WARN_MV
        };
        let cond_uv = pack.cell_mv.iter().any(|&v| v > 0 && v <= uv_thresh);

        let ot_thresh = if self.warn_ot_active {
            SE_OT_WARN_CLEAR_DECI_C
        } else {
            SE_OT_WARN_DECI_C
        };
        let cond_ot = pack.max_temp_deci_c >= ot_thresh;

        if cond_ov {
            leak_up(&mut self.warn_ov_timer_ms, dt_ms);
            if self.warn_ov_timer_ms >= WARN_DELAY_MS {
                self.warn_ov_active = true;
            }
        } else {
            leak_down(&mut self.warn_ov_timer_ms, dt_ms);
            if self.warn_ov_timer_ms == 0 {
                self.warn_ov_active = false;
            }
        }

        if cond_uv {
            leak_up(&mut self.warn_uv_timer_ms, dt_ms);
            if self.warn_uv_timer_ms >= WARN_DELAY_MS {
                self.warn_uv_active = true;
            }
        } else {
            leak_down(&mut self.warn_uv_timer_ms, dt_ms);
            if self.warn_uv_timer_ms == 0 {
                self.warn_uv_active = false;
            }
        }

        if cond_ot {
            leak_up(&mut self.warn_ot_timer_ms, dt_ms);
            if self.warn_ot_timer_ms >= WARN_DELAY_MS {
                self.warn_ot_active = true;
            }
        } else {
            leak_down(&mut self.warn_ot_timer_ms, dt_ms);
            if self.warn_ot_timer_ms == 0 {
                self.warn_ot_active = false;
            }
        }

        let any_active =
            self.warn_ov_active || self.warn_uv_active || self.warn_ot_active || self.warn_oc_active;

        if any_active {
            self.warning_hold_ms = WARN_HOLD_MS;
            // Rebuild the joined message from every active axis.
            pack.warning_message.clear();
            if self.warn_ov_active {
                let msg = short_msg(format_args!("SE OV warning: {} mV", pack.max_cell_mv));
                pack.append_warning_msg(&msg);
            }
            if self.warn_uv_active {
                let msg = short_msg(format_args!("SE UV warning: {} mV", pack.min_cell_mv));
                pack.append_warning_msg(&msg);
            }
            if self.warn_ot_active {
                let msg = short_msg(format_args!("SE OT warning: {} dC", pack.max_temp_deci_c));
                pack.append_warning_msg(&msg);
            }
            if self.warn_oc_active {
                let msg = short_msg(format_args!("OC warning: {} mA", pack.pack_current_ma));
                pack.append_warning_msg(&msg);
            }
        } else if self.warning_hold_ms > 0 {
            self.warning_hold_ms = self.warning_hold_ms.saturating_sub(dt_ms);
        }

        if pack.faults.imbalance {
            pack.append_warning_msg("cell imbalance");
        }

        pack.has_warning = any_active || self.warning_hold_ms > 0 || pack.faults.imbalance;
        if !pack.has_warning && !pack.warning_message.is_empty() {
            pack.warning_message.clear();
        }
    }

    /// While latched, count time with every cell strictly inside the
    /// fault band and the hottest sensor strictly below the fault
    /// threshold; any excursion starts the hold over.
    fn accumulate_safe_state(&mut self, pack: &PackState, dt_ms: u32) {
        let cells_safe = pack
            .cell_mv
            .iter()
            .all(|&v| v < SE_OV_FAULT_MV && !(v > 0 && v <= SE_UV_FAULT_MV));

        if cells_safe && pack.max_temp_deci_c < SE_OT_FAULT_DECI_C {
            self.safe_state_ms = self.safe_state_ms.saturating_add(dt_ms);
        } else {
            self.safe_state_ms = 0;
        }
    }

    /// Reset guard: true when no fault is latched, or when the pack has
    /// held the safe state long enough. Side-effect free, so repeated
    /// denied attempts are harmless.
    pub fn can_reset(&self, pack: &PackState) -> bool {
        if !pack.fault_latched {
            return true;
        }
        self.safe_state_ms >= FAULT_RESET_HOLD_MS
    }

    /// Operator fault reset: zero every timer and clear the latched
    /// software state. `hw_fault_latched` deliberately survives; it
    /// clears only on explicit acknowledgement.
    pub fn reset(&mut self, pack: &mut PackState) {
        *self = Self::new();
        pack.faults.clear_all();
        pack.fault_latched = false;
        pack.has_warning = false;
        pack.fault_message.clear();
        pack.warning_message.clear();
        pack.ems_charge_cap_ma = i32::MAX;
        pack.ems_discharge_cap_ma = i32::MAX;
    }
}

impl Default for ProtectionState {
    fn default() -> Self {
        Self::new()
    }
}

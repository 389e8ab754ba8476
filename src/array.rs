//! Pack controller bundle and the multi-pack DC-bus coordinator.
//!
//! [`Controller`] owns one pack's state records and hardware handle and
//! exposes the periodic entry points; [`PackArray`] owns an ordered set
//! of controllers sharing one bus, sequences voltage-matched connection
//! (lowest SoC first for charge, highest first for discharge, then the
//! rest together) and distributes the requested bus current with a
//! Kirchhoff-law solver over each pack's open-circuit voltage and
//! internal resistance.
//!
//! Solver arithmetic is integer throughout: conductances in µS, voltages
//! in mV, currents in mA, 64-bit intermediates. `mV x µS = nA`, so one
//! division by 10^6 recovers mA.

use heapless::Vec;

use crate::balance::BalanceState;
use crate::config::{MAX_PACKS, N_CELLS, N_MODULES};
use crate::contactor::ContactorCtx;
use crate::hal::BmsHal;
use crate::limits;
use crate::monitor::{self, MonitorState};
use crate::protection::ProtectionState;
use crate::soc::{self, SocEstimator};
use crate::state;
use crate::types::{EmsCommand, EmsMessage, PackMode, PackState, StatusSnapshot};

/// One pack's controller: state records, timers and the hardware handle,
/// bundled so the array can own a flat ordered sequence. The records are
/// strictly acyclic: cross-references are resolved by passing borrows
/// per call, never stored.
pub struct Controller<H: BmsHal> {
    hal: H,
    pack: PackState,
    prot: ProtectionState,
    contactor: ContactorCtx,
    monitor: MonitorState,
    soc: SocEstimator,
    balance: BalanceState,
}

impl<H: BmsHal> Controller<H> {
    /// Power-on initialization: self-test every module, restore the
    /// persistent snapshot, start in NOT_READY with contactors open.
    pub fn new(pack_id: u8, mut hal: H) -> Self {
        let mut pack = PackState::new(pack_id);
        for module in 0..N_MODULES {
            if hal.init_module(module).is_err() {
                warn!("controller {}: module {} failed self-test", pack_id, module);
                pack.faults.comm_loss = true;
            }
        }

        let soc = match hal.load_persistent() {
            Some(snapshot) => SocEstimator::restore(&snapshot),
            None => SocEstimator::new(5000),
        };
        pack.soc_hundredths = soc.soc_hundredths();

        let mut contactor = ContactorCtx::new();
        contactor.init(&mut hal);

        Self {
            hal,
            pack,
            prot: ProtectionState::new(),
            contactor,
            monitor: MonitorState::new(),
            soc,
            balance: BalanceState::new(),
        }
    }

    pub fn pack(&self) -> &PackState {
        &self.pack
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Mutable hardware access, for the desktop harness to inject
    /// measurements between ticks.
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::capture(&self.pack)
    }

    /// Write the current persistent snapshot through the HAL. Call
    /// periodically and at shutdown.
    pub fn save_persistent(&mut self) {
        let snapshot = self.soc.snapshot();
        self.hal.save_persistent(&snapshot);
    }

    /// Operator acknowledgement of a hardware-safety trip. Distinct from
    /// the software fault reset, which leaves this latch alone.
    pub fn acknowledge_hw_fault(&mut self) {
        self.pack.hw_fault_latched = false;
    }

    /// Monitor stage: scan the next module, aggregate, update SoC and
    /// recompute the published current limits. Advances uptime.
    pub fn monitor_tick(&mut self, dt_ms: u32) {
        self.monitor.scan_tick(&mut self.hal, &mut self.pack);
        monitor::aggregate(&mut self.pack);
        self.pack.uptime_ms = self.pack.uptime_ms.wrapping_add(dt_ms);
        self.soc.update(&mut self.pack, dt_ms);
        self.update_limits();
        self.balance.run(&mut self.hal, &self.pack);
    }

    fn update_limits(&mut self) {
        if self.pack.fault_latched {
            self.pack.charge_limit_ma = 0;
            self.pack.discharge_limit_ma = 0;
        } else {
            let lim = limits::compute(&self.pack);
            self.pack.charge_limit_ma = lim.charge_ma.min(self.pack.ems_charge_cap_ma);
            self.pack.discharge_limit_ma = lim.discharge_ma.min(self.pack.ems_discharge_cap_ma);
        }
    }

    /// Protection stage. A fresh latch forces the FAULT transition
    /// immediately rather than a cycle later.
    pub fn protection_tick(&mut self, dt_ms: u32) {
        self.prot.run(&mut self.hal, &mut self.pack, dt_ms);
        if self.pack.fault_latched && self.pack.mode != PackMode::Fault {
            state::enter_fault(&mut self.pack, &mut self.contactor);
        }
    }

    /// State-machine stage.
    pub fn state_tick(&mut self, cmd: Option<&EmsMessage>, bus_voltage_mv: u32) {
        state::step(
            &mut self.hal,
            &mut self.pack,
            &mut self.contactor,
            &mut self.prot,
            cmd,
            bus_voltage_mv,
        );
    }

    /// Contactor stage.
    pub fn contactor_tick(&mut self, dt_ms: u32) {
        self.contactor.run(&mut self.hal, &mut self.pack, dt_ms);
    }

    /// Cooperative composite tick, in the fixed order the tasks observe:
    /// driver scan and aggregation, SoC, limits, protection, state
    /// machine, contactor. The contactor runs last so a close requested
    /// by a state transition is processed the same tick.
    pub fn tick(&mut self, cmd: Option<&EmsMessage>, bus_voltage_mv: u32, dt_ms: u32) {
        self.monitor_tick(dt_ms);
        self.protection_tick(dt_ms);
        self.state_tick(cmd, bus_voltage_mv);
        self.contactor_tick(dt_ms);
    }

    pub(crate) fn set_pack_current(&mut self, ma: i32) {
        self.pack.pack_current_ma = ma;
    }
}

/// Connection direction for the staged array connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectDirection {
    Charge,
    Discharge,
}

impl ConnectDirection {
    fn command(self) -> EmsCommand {
        match self {
            ConnectDirection::Charge => EmsCommand::ConnectForCharge,
            ConnectDirection::Discharge => EmsCommand::ConnectForDischarge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayError {
    DuplicatePackId,
    CapacityExceeded,
}

/// Coordinator for every pack on one DC bus.
pub struct PackArray<H: BmsHal> {
    controllers: Vec<Controller<H>, MAX_PACKS>,
    bus_voltage_mv: u32,
    array_charge_limit_ma: i32,
    array_discharge_limit_ma: i32,
    pending_connect: Option<ConnectDirection>,
}

impl<H: BmsHal> PackArray<H> {
    pub fn new() -> Self {
        Self {
            controllers: Vec::new(),
            bus_voltage_mv: 0,
            array_charge_limit_ma: 0,
            array_discharge_limit_ma: 0,
            pending_connect: None,
        }
    }

    /// Add a pack. IDs must be unique within the array.
    pub fn add_pack(&mut self, controller: Controller<H>) -> Result<(), ArrayError> {
        if self
            .controllers
            .iter()
            .any(|c| c.pack().pack_id == controller.pack().pack_id)
        {
            return Err(ArrayError::DuplicatePackId);
        }
        self.controllers
            .push(controller)
            .map_err(|_| ArrayError::CapacityExceeded)
    }

    pub fn controllers(&self) -> &[Controller<H>] {
        &self.controllers
    }

    pub fn controller_mut(&mut self, index: usize) -> &mut Controller<H> {
        &mut self.controllers[index]
    }

    pub fn bus_voltage_mv(&self) -> u32 {
        self.bus_voltage_mv
    }

    pub fn charge_limit_ma(&self) -> i32 {
        self.array_charge_limit_ma
    }

    pub fn discharge_limit_ma(&self) -> i32 {
        self.array_discharge_limit_ma
    }

    /// One coordinator tick: route the EMS command, step every
    /// controller, recompute the array limits, then solve the bus.
    /// `requested_current_ma` is the externally requested total, signed,
    /// positive = charging; zero selects equalization.
    pub fn step(&mut self, cmd: Option<EmsMessage>, requested_current_ma: i32, dt_ms: u32) {
        let mut per_pack: [Option<EmsMessage>; MAX_PACKS] = [None; MAX_PACKS];
        self.route_command(cmd, &mut per_pack);
        self.stage_connections(&mut per_pack);

        let bus = self.bus_voltage_mv;
        for (i, ctrl) in self.controllers.iter_mut().enumerate() {
            ctrl.tick(per_pack[i].as_ref(), bus, dt_ms);
        }

        let connected: Vec<usize, MAX_PACKS> = self
            .controllers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.pack().mode == PackMode::Connected)
            .map(|(i, _)| i)
            .collect();

        self.compute_array_limits(&connected);

        if connected.is_empty() {
            self.update_bus_voltage();
            return;
        }

        let target_ma = if requested_current_ma > 0 {
            requested_current_ma.min(self.array_charge_limit_ma) as i64
        } else if requested_current_ma < 0 {
            requested_current_ma.max(-self.array_discharge_limit_ma) as i64
        } else {
            0
        };
        let equalization = requested_current_ma == 0;

        let (bus_mv, currents) =
            solve_currents(&self.controllers, &connected, target_ma, equalization);
        self.bus_voltage_mv = bus_mv.max(0) as u32;
        for (j, &idx) in connected.iter().enumerate() {
            self.controllers[idx].set_pack_current(currents[j] as i32);
        }
    }

    fn route_command(
        &mut self,
        cmd: Option<EmsMessage>,
        per_pack: &mut [Option<EmsMessage>; MAX_PACKS],
    ) {
        let Some(msg) = cmd else { return };

        match msg.command {
            EmsCommand::ConnectForCharge => {
                self.pending_connect = Some(ConnectDirection::Charge);
                self.broadcast_keepalive(msg.timestamp_ms, per_pack);
            }
            EmsCommand::ConnectForDischarge => {
                self.pending_connect = Some(ConnectDirection::Discharge);
                self.broadcast_keepalive(msg.timestamp_ms, per_pack);
            }
            EmsCommand::Disconnect => {
                self.pending_connect = None;
                for i in 0..self.controllers.len() {
                    per_pack[i] = Some(msg);
                }
            }
            _ => {
                // None, ResetFaults, PowerSave, SetLimits: every pack
                // sees it; illegal mode/command pairs do nothing there.
                for i in 0..self.controllers.len() {
                    per_pack[i] = Some(msg);
                }
            }
        }
    }

    fn broadcast_keepalive(
        &self,
        timestamp_ms: u32,
        per_pack: &mut [Option<EmsMessage>; MAX_PACKS],
    ) {
        for i in 0..self.controllers.len() {
            per_pack[i] = Some(EmsMessage {
                command: EmsCommand::None,
                timestamp_ms,
            });
        }
    }

    /// Staged connection: the pre-charge pack goes first, alone; lowest
    /// SoC for charge, highest for discharge. Once it is CONNECTED,
    /// every remaining READY pack is requested together; packs failing
    /// the voltage-match gate stay READY and are retried each cycle.
    fn stage_connections(&mut self, per_pack: &mut [Option<EmsMessage>; MAX_PACKS]) {
        let Some(direction) = self.pending_connect else {
            return;
        };

        let any_connected = self
            .controllers
            .iter()
            .any(|c| c.pack().mode == PackMode::Connected);
        let any_connecting = self
            .controllers
            .iter()
            .any(|c| c.pack().mode == PackMode::Connecting);

        let ready: Vec<usize, MAX_PACKS> = self
            .controllers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.pack().mode == PackMode::Ready)
            .map(|(i, _)| i)
            .collect();

        if ready.is_empty() {
            if any_connected && !any_connecting {
                // Everyone that can connect has; the request is served.
                self.pending_connect = None;
            }
            return;
        }

        if any_connected {
            // Second stage: bring in everything still READY, together.
            for &i in ready.iter() {
                per_pack[i] = Some(EmsMessage {
                    command: direction.command(),
                    timestamp_ms: self.controllers[i].pack().uptime_ms,
                });
            }
        } else if !any_connecting {
            // First stage: the single best pack by SoC pre-charges the bus.
            let best = match direction {
                ConnectDirection::Charge => ready
                    .iter()
                    .copied()
                    .min_by_key(|&i| self.controllers[i].pack().soc_hundredths),
                ConnectDirection::Discharge => ready
                    .iter()
                    .copied()
                    .max_by_key(|&i| self.controllers[i].pack().soc_hundredths),
            };
            if let Some(i) = best {
                per_pack[i] = Some(EmsMessage {
                    command: direction.command(),
                    timestamp_ms: self.controllers[i].pack().uptime_ms,
                });
            }
        }
        // Otherwise the pre-charge pack is still CONNECTING: hold.
    }

    /// Array limits are the conservative form: the weakest connected
    /// pack's limit times the connected count.
    fn compute_array_limits(&mut self, connected: &Vec<usize, MAX_PACKS>) {
        if connected.is_empty() {
            self.array_charge_limit_ma = 0;
            self.array_discharge_limit_ma = 0;
            return;
        }
        let mut min_charge = i32::MAX;
        let mut min_discharge = i32::MAX;
        for &i in connected.iter() {
            min_charge = min_charge.min(self.controllers[i].pack().charge_limit_ma);
            min_discharge = min_discharge.min(self.controllers[i].pack().discharge_limit_ma);
        }
        let n = connected.len() as i32;
        self.array_charge_limit_ma = min_charge.saturating_mul(n);
        self.array_discharge_limit_ma = min_discharge.saturating_mul(n);
    }

    /// With no pack on the bus, estimate its voltage from the packs that
    /// would connect next so the voltage-match gate has a reference.
    fn update_bus_voltage(&mut self) {
        let mut sum: u64 = 0;
        let mut count: u64 = 0;
        for ctrl in self.controllers.iter() {
            if ctrl.pack().mode == PackMode::Ready {
                sum += ctrl.pack().pack_voltage_mv as u64;
                count += 1;
            }
        }
        if count > 0 {
            self.bus_voltage_mv = (sum / count) as u32;
        }
    }
}

impl<H: BmsHal> Default for PackArray<H> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Pack equivalent-circuit parameters for the solver
// ---------------------------------------------------------------------

// Module resistance against temperature and SoC, µΩ. U-shaped over SoC
// (minimum at 50 %), falling with temperature.
const R_TEMPS_DECI_C: [i32; 6] = [-100, 0, 100, 250, 350, 450];
const R_SOCS_HUNDREDTHS: [i32; 7] = [500, 2000, 3500, 5000, 6500, 8000, 9500];

const R_TABLE_UOHM: [[i32; 6]; 7] = [
    [15_300, 9_700, 6_200, 5_000, 4_400, 4_100],
    [10_900, 7_200, 4_700, 3_600, 3_300, 3_100],
    [9_900, 6_600, 4_300, 3_300, 3_000, 2_800],
    [9_300, 6_200, 4_000, 3_100, 2_800, 2_600],
    [9_600, 6_400, 4_200, 3_200, 2_900, 2_700],
    [10_200, 6_800, 4_400, 3_400, 3_100, 2_900],
    [13_500, 8_900, 5_600, 4_200, 3_900, 3_600],
];

/// Bilinear interpolation of module resistance, µΩ.
fn module_resistance_uohm(temp_deci_c: i32, soc_hundredths: i32) -> i64 {
    let t = temp_deci_c.clamp(R_TEMPS_DECI_C[0], R_TEMPS_DECI_C[5]);
    let s = soc_hundredths.clamp(R_SOCS_HUNDREDTHS[0], R_SOCS_HUNDREDTHS[6]);

    let mut ti = 0;
    for i in (0..5).rev() {
        if R_TEMPS_DECI_C[i] <= t {
            ti = i;
            break;
        }
    }
    let mut si = 0;
    for i in (0..6).rev() {
        if R_SOCS_HUNDREDTHS[i] <= s {
            si = i;
            break;
        }
    }

    let t0 = R_TEMPS_DECI_C[ti] as i64;
    let t1 = R_TEMPS_DECI_C[ti + 1] as i64;
    let s0 = R_SOCS_HUNDREDTHS[si] as i64;
    let s1 = R_SOCS_HUNDREDTHS[si + 1] as i64;

    let r00 = R_TABLE_UOHM[si][ti] as i64;
    let r01 = R_TABLE_UOHM[si][ti + 1] as i64;
    let r10 = R_TABLE_UOHM[si + 1][ti] as i64;
    let r11 = R_TABLE_UOHM[si + 1][ti + 1] as i64;

    let r0 = r00 + (r01 - r00) * (t as i64 - t0) / (t1 - t0);
    let r1 = r10 + (r11 - r10) * (t as i64 - t0) / (t1 - t0);
    r0 + (r1 - r0) * (s as i64 - s0) / (s1 - s0)
}

/// Pack conductance in µS from the equivalent-circuit table, evaluated
/// at the midpoint of the measured temperature spread.
fn pack_conductance_us(pack: &PackState) -> i64 {
    let temp = (pack.min_temp_deci_c as i32 + pack.max_temp_deci_c as i32) / 2;
    let r_pack_uohm = module_resistance_uohm(temp, pack.soc_hundredths as i32) * N_MODULES as i64;
    1_000_000_000_000 / r_pack_uohm
}

/// Pack open-circuit voltage in mV, from the rested OCV curve.
fn pack_ocv_mv(pack: &PackState) -> i64 {
    soc::ocv_mv_from_soc(pack.soc_hundredths) as i64 * N_CELLS as i64
}

/// Post-solve tolerance on per-pack limits, 1 %.
const LIMIT_TOLERANCE_PCT: i64 = 1;

/// Unified Kirchhoff / equalization solve with iterative per-pack limit
/// clamping.
///
/// Driven mode: `V_bus = (Σ OCV_k·G_k + I_target) / Σ G_k`, then
/// `I_k = (V_bus − OCV_k)·G_k`. Equalization is the same system with a
/// zero right-hand side, so `Σ I_k = 0` and higher-SoC packs discharge
/// into lower-SoC packs.
///
/// Any pack whose solution exceeds its own limit is clamped to that
/// limit, removed from the active set and held fixed; the remaining
/// packs are re-solved with the clamped current subtracted from the
/// target, preserving KCL. The iteration is bounded by the number of
/// connected packs.
fn solve_currents<H: BmsHal>(
    controllers: &[Controller<H>],
    connected: &Vec<usize, MAX_PACKS>,
    target_ma: i64,
    equalization: bool,
) -> (i64, [i64; MAX_PACKS]) {
    let n = connected.len();
    let mut active = [true; MAX_PACKS];
    let mut is_clamped = [false; MAX_PACKS];
    let mut currents_ma = [0i64; MAX_PACKS];
    let mut residual_ma = if equalization { 0 } else { target_ma };
    let mut bus_mv: i64 = 0;

    for _iteration in 0..n {
        let mut sum_g_us: i64 = 0;
        let mut sum_ocv_g_na: i64 = 0;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            let pack = controllers[connected[i]].pack();
            let g = pack_conductance_us(pack);
            sum_g_us += g;
            sum_ocv_g_na += pack_ocv_mv(pack) * g;
        }
        if sum_g_us == 0 {
            break;
        }

        bus_mv = if equalization {
            let clamped_sum_na: i64 = (0..n)
                .filter(|&i| is_clamped[i])
                .map(|i| currents_ma[i] * 1_000_000)
                .sum();
            (sum_ocv_g_na - clamped_sum_na) / sum_g_us
        } else {
            (sum_ocv_g_na + residual_ma * 1_000_000) / sum_g_us
        };

        let mut any_new_clamp = false;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            let pack = controllers[connected[i]].pack();
            let g = pack_conductance_us(pack);
            let i_k = (bus_mv - pack_ocv_mv(pack)) * g / 1_000_000;
            let charge_limit = pack.charge_limit_ma as i64;
            let discharge_limit = pack.discharge_limit_ma as i64;

            if i_k > 0 && i_k > charge_limit {
                currents_ma[i] = charge_limit;
                is_clamped[i] = true;
                active[i] = false;
                if !equalization {
                    residual_ma -= charge_limit;
                }
                any_new_clamp = true;
            } else if i_k < 0 && -i_k > discharge_limit {
                currents_ma[i] = -discharge_limit;
                is_clamped[i] = true;
                active[i] = false;
                if !equalization {
                    residual_ma += discharge_limit;
                }
                any_new_clamp = true;
            } else {
                currents_ma[i] = i_k;
            }
        }

        if !any_new_clamp {
            enforce_tolerance(controllers, connected, &mut currents_ma, n);
            return (bus_mv, currents_ma);
        }
    }

    // Iterations exhausted or every pack clamped: one final solve over
    // whatever is still active.
    let mut sum_g_us: i64 = 0;
    let mut sum_ocv_g_na: i64 = 0;
    let mut clamped_sum_na: i64 = 0;
    let mut has_active = false;
    for i in 0..n {
        if is_clamped[i] {
            clamped_sum_na += currents_ma[i] * 1_000_000;
            continue;
        }
        has_active = true;
        let pack = controllers[connected[i]].pack();
        let g = pack_conductance_us(pack);
        sum_g_us += g;
        sum_ocv_g_na += pack_ocv_mv(pack) * g;
    }

    if has_active && sum_g_us > 0 {
        bus_mv = if equalization {
            (sum_ocv_g_na - clamped_sum_na) / sum_g_us
        } else {
            (sum_ocv_g_na + residual_ma * 1_000_000) / sum_g_us
        };
        for i in 0..n {
            if is_clamped[i] {
                continue;
            }
            let pack = controllers[connected[i]].pack();
            let g = pack_conductance_us(pack);
            currents_ma[i] = (bus_mv - pack_ocv_mv(pack)) * g / 1_000_000;
        }
    } else if n > 0 {
        // Everything clamped: the bus floats to the loaded terminal
        // voltages.
        let mut v_sum_mv: i64 = 0;
        for i in 0..n {
            let pack = controllers[connected[i]].pack();
            let temp = (pack.min_temp_deci_c as i32 + pack.max_temp_deci_c as i32) / 2;
            let r_uohm =
                module_resistance_uohm(temp, pack.soc_hundredths as i32) * N_MODULES as i64;
            v_sum_mv += pack_ocv_mv(pack) + currents_ma[i] * r_uohm / 1_000_000;
        }
        bus_mv = v_sum_mv / n as i64;
    }

    enforce_tolerance(controllers, connected, &mut currents_ma, n);
    (bus_mv, currents_ma)
}

/// Per-pack limits must be honored within 1 % after the final
/// iteration; anything past the tolerance is hard-clamped.
fn enforce_tolerance<H: BmsHal>(
    controllers: &[Controller<H>],
    connected: &Vec<usize, MAX_PACKS>,
    currents_ma: &mut [i64; MAX_PACKS],
    n: usize,
) {
    for i in 0..n {
        let pack = controllers[connected[i]].pack();
        let charge_limit = pack.charge_limit_ma as i64;
        let discharge_limit = pack.discharge_limit_ma as i64;
        let i_k = currents_ma[i];
        debug_assert!(
            i_k <= charge_limit + charge_limit * LIMIT_TOLERANCE_PCT / 100 + 1
                && -i_k <= discharge_limit + discharge_limit * LIMIT_TOLERANCE_PCT / 100 + 1,
            "solver exceeded a pack limit beyond tolerance"
        );
        if i_k > 0 && i_k > charge_limit + charge_limit * LIMIT_TOLERANCE_PCT / 100 {
            currents_ma[i] = charge_limit;
        } else if i_k < 0 && -i_k > discharge_limit + discharge_limit * LIMIT_TOLERANCE_PCT / 100 {
            currents_ma[i] = -discharge_limit;
        }
    }
}

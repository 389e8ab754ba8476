//! Compile-time configuration for the pack controller.
//!
//! Thresholds and delays follow the shipped alarm table for the 22-module
//! marine pack; edit and rebuild to retarget a different pack build.

/// Modules in series per pack.
pub const N_MODULES: usize = 22;
/// Series elements (cells) per module.
pub const CELLS_PER_MODULE: usize = 14;
/// Thermistors per module.
pub const SENSORS_PER_MODULE: usize = 3;
/// Series elements per pack (308).
pub const N_CELLS: usize = N_MODULES * CELLS_PER_MODULE;
/// Temperature sensors per pack (66).
pub const N_SENSORS: usize = N_MODULES * SENSORS_PER_MODULE;
/// Maximum packs sharing one DC bus.
pub const MAX_PACKS: usize = 16;

/// Nominal pack capacity in mAh (128 Ah).
pub const NOMINAL_CAPACITY_MAH: i64 = 128_000;

// Series-element fault thresholds, 5 s confirm each.
pub const SE_OV_FAULT_MV: u16 = 4225;
pub const SE_UV_FAULT_MV: u16 = 3000;
pub const SE_OT_FAULT_DECI_C: i16 = 650;

// Warning trigger / clear pairs (hysteresis deadband).
pub const SE_OV_WARN_MV: u16 = 4210;
pub const SE_OV_WARN_CLEAR_MV: u16 = 4190;
pub const SE_UV_WARN_MV: u16 = 3200;
pub const SE_UV_WARN_CLEAR_MV: u16 = 3220;
pub const SE_OT_WARN_DECI_C: i16 = 600;
pub const SE_OT_WARN_CLEAR_DECI_C: i16 = 570;

// Hardware-safety thresholds. These back up the software engine and are
// evaluated unconditionally.
pub const HW_OV_MV: u16 = 4300;
pub const HW_UV_MV: u16 = 2700;
pub const HW_OT_DECI_C: i16 = 700;

// Fault timer delays.
pub const SE_FAULT_DELAY_MS: u32 = 5_000;
pub const HW_OV_DELAY_MS: u32 = 1_000;
pub const HW_UV_DELAY_MS: u32 = 1_000;
pub const HW_OT_DELAY_MS: u32 = 5_000;

// Warning confirm delay and post-clear hold.
pub const WARN_DELAY_MS: u32 = 5_000;
pub const WARN_HOLD_MS: u32 = 10_000;
pub const OC_WARN_DELAY_MS: u32 = 10_000;

/// Leaky-integrator decay shift: timers decay by `dt >> 1` when the
/// condition is clear.
pub const LEAK_DECAY_SHIFT: u32 = 1;

/// Cell imbalance warning threshold (max - min).
pub const IMBALANCE_WARN_MV: u16 = 50;

// Contactor timing.
pub const PRECHARGE_TIMEOUT_MS: u32 = 5_000;
pub const CONTACTOR_CLOSE_MS: u32 = 100;
pub const WELD_DETECT_MS: u32 = 200;
/// Pre-charge is complete once the pack has risen to this percentage of
/// the bus voltage.
pub const PRECHARGE_VOLT_PCT: u32 = 95;
/// Below this magnitude the pack is considered disconnected after an
/// open command.
pub const OPEN_CONFIRM_MA: i32 = 1_000;

/// Voltage-match connect gate: 1.2 V per module.
pub const VOLTAGE_MATCH_MV: u32 = 1_200 * N_MODULES as u32;

/// EMS watchdog while connecting or connected.
pub const EMS_WATCHDOG_MS: u32 = 5_000;

/// Safe-state hold required before a fault reset is accepted.
pub const FAULT_RESET_HOLD_MS: u32 = 60_000;

// Static pack maxima: 3 C charge, 5 C discharge.
pub const MAX_CHARGE_MA: i32 = 384_000;
pub const MAX_DISCHARGE_MA: i32 = 640_000;

/// Coulombic efficiency on charge, parts per thousand. Discharge is
/// integrated at unity.
pub const COULOMBIC_EFFICIENCY_PPT: i64 = 998;

// SoC rest detection for the OCV correction.
pub const REST_THRESHOLD_MA: i32 = 2_000;
pub const REST_HOLD_MS: u32 = 30_000;

// Overcurrent warning margin: 1.05 x temperature charge limit + 5 A.
pub const OC_WARN_MARGIN_PPT: i64 = 1_050;
pub const OC_WARN_OFFSET_MA: i32 = 5_000;

// Passive balancing.
pub const BALANCE_THRESHOLD_MV: u16 = 20;
/// Balancing is suspended above this pack current (0.2 C).
pub const BALANCE_MAX_CURRENT_MA: i32 = 25_600;

// Nominal task periods. The cooperative tick uses the caller's dt; these
// are the cadences of the preemptive deployment.
pub const MONITOR_PERIOD_MS: u32 = 10;
pub const PROTECTION_PERIOD_MS: u32 = 10;
pub const CONTACTOR_PERIOD_MS: u32 = 50;
pub const STATE_PERIOD_MS: u32 = 100;

/// Accumulated fault / warning message capacity.
pub const MSG_LEN: usize = 160;

/// Fault-log ring depth expected of persistent-store implementations.
pub const FAULT_LOG_DEPTH: usize = 64;

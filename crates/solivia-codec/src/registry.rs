//! Static payload tables for the two known inverter families.
//!
//! Offsets are relative to the first payload byte, i.e. after the six byte
//! response header (STX, ACK, address, length, command, subcommand). All
//! multi-byte integers are big-endian.

use serde::Serialize;

/// Variants sharing the variant 15 payload layout (protocol v1.2, page 25).
const VARIANT_15_MEMBERS: &[u8] = &[15, 18, 19, 20, 31, 34, 35, 36, 38, 39, 55, 58, 59, 60];
/// Variants sharing the three-phase variant 212 payload layout.
const VARIANT_212_MEMBERS: &[u8] = &[212, 213, 214, 215, 216, 217, 218, 219, 220, 221, 222];

pub const MIN_VARIANT: u8 = 1;
pub const MAX_VARIANT: u8 = 222;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Family {
    #[serde(rename = "variant_15")]
    Variant15,
    #[serde(rename = "variant_212")]
    Variant212,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    U8,
    U16,
    I16,
    U32,
    /// Fixed-width ASCII, padded with spaces or NULs.
    Ascii(usize),
}

impl Encoding {
    pub const fn width(self) -> usize {
        match self {
            Encoding::U8 => 1,
            Encoding::U16 | Encoding::I16 => 2,
            Encoding::U32 => 4,
            Encoding::Ascii(len) => len,
        }
    }
}

/// Fixed-point scale between the raw integer and the published unit.
///
/// Division is kept as a division so `raw / 10` matches the vendor table exactly
/// instead of accumulating the rounding error of `raw * 0.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    Unit,
    Div(u32),
    Mul(u32),
}

impl Scale {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            Scale::Unit => raw,
            Scale::Div(n) => raw / f64::from(n),
            Scale::Mul(n) => raw * f64::from(n),
        }
    }

    /// Inverse of [`Scale::apply`], rounded to the nearest raw integer.
    pub fn unapply(self, value: f64) -> f64 {
        match self {
            Scale::Unit => value.round(),
            Scale::Div(n) => (value * f64::from(n)).round(),
            Scale::Mul(n) => (value / f64::from(n)).round(),
        }
    }
}

/// How a field is published downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Instantaneous reading, averaged over the throttle window.
    Measurement,
    /// Daily or lifetime total/extreme; the last value wins.
    Counter,
    /// Raw status, revision or error code; the last value wins.
    Status,
    /// Part or serial number, published as-is.
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub unit: &'static str,
    /// Decimal places worth displaying.
    pub precision: u8,
    pub offset: usize,
    pub encoding: Encoding,
    pub scale: Scale,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub const fn end(&self) -> usize {
        self.offset + self.encoding.width()
    }
}

impl Family {
    pub fn fields(self) -> &'static [FieldDescriptor] {
        match self {
            Family::Variant15 => VARIANT_15_FIELDS,
            Family::Variant212 => VARIANT_212_FIELDS,
        }
    }

    pub fn variants(self) -> &'static [u8] {
        match self {
            Family::Variant15 => VARIANT_15_MEMBERS,
            Family::Variant212 => VARIANT_212_MEMBERS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Variant15 => "variant_15",
            Family::Variant212 => "variant_212",
        }
    }

    pub fn descriptor(self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields().iter().find(|field| field.name == name)
    }

    /// Minimum payload length covering every field of the table.
    pub fn payload_len(self) -> usize {
        self.fields()
            .iter()
            .map(FieldDescriptor::end)
            .max()
            .unwrap_or(0)
    }
}

pub fn family_for(variant: u8) -> Option<Family> {
    [Family::Variant15, Family::Variant212]
        .into_iter()
        .find(|family| family.variants().contains(&variant))
}

pub fn fields_for(variant: u8) -> Option<&'static [FieldDescriptor]> {
    family_for(variant).map(Family::fields)
}

const fn identity(name: &'static str, offset: usize, len: usize) -> FieldDescriptor {
    FieldDescriptor {
        name,
        unit: "",
        precision: 0,
        offset,
        encoding: Encoding::Ascii(len),
        scale: Scale::Unit,
        kind: FieldKind::Identity,
    }
}

const fn status(name: &'static str, offset: usize, encoding: Encoding) -> FieldDescriptor {
    FieldDescriptor {
        name,
        unit: "",
        precision: 0,
        offset,
        encoding,
        scale: Scale::Unit,
        kind: FieldKind::Status,
    }
}

const fn measurement(
    name: &'static str,
    unit: &'static str,
    precision: u8,
    offset: usize,
    encoding: Encoding,
    scale: Scale,
) -> FieldDescriptor {
    FieldDescriptor {
        name,
        unit,
        precision,
        offset,
        encoding,
        scale,
        kind: FieldKind::Measurement,
    }
}

const fn counter(
    name: &'static str,
    unit: &'static str,
    precision: u8,
    offset: usize,
    encoding: Encoding,
    scale: Scale,
) -> FieldDescriptor {
    FieldDescriptor {
        name,
        unit,
        precision,
        offset,
        encoding,
        scale,
        kind: FieldKind::Counter,
    }
}

use Encoding::{I16, U16, U32, U8};
use Scale::{Div, Mul, Unit};

static VARIANT_15_FIELDS: &[FieldDescriptor] = &[
    identity("part_number", 0, 11),
    identity("serial_number", 11, 18),
    status("sap_date_code", 29, U32),
    status("sap_revision", 33, U16),
    status("software_rev_ac_major", 35, U8),
    status("software_rev_ac_minor", 36, U8),
    status("software_rev_ac_bugfix", 37, U8),
    status("software_rev_dc_major", 38, U8),
    status("software_rev_dc_minor", 39, U8),
    status("software_rev_dc_bugfix", 40, U8),
    status("software_rev_display_major", 41, U8),
    status("software_rev_display_minor", 42, U8),
    status("software_rev_display_bugfix", 43, U8),
    status("software_rev_sc_major", 44, U8),
    status("software_rev_sc_minor", 45, U8),
    status("software_rev_sc_bugfix", 46, U8),
    // solar input
    measurement("solar_voltage_input_1", "V", 0, 47, U16, Unit),
    measurement("solar_current_input_1", "A", 1, 49, U16, Div(10)),
    measurement("solar_isolation_resistance_input_1", "Ω", 0, 51, U16, Mul(1000)),
    measurement("temperature_ntc_dc", "°C", 0, 53, I16, Unit),
    measurement("solar_input_mov_resistance", "Ω", 0, 55, U16, Mul(1000)),
    // AC output
    measurement("ac_current", "A", 1, 57, U16, Div(10)),
    measurement("ac_voltage", "V", 0, 59, U16, Unit),
    measurement("ac_power", "W", 0, 61, U16, Unit),
    measurement("ac_frequency", "Hz", 2, 63, U16, Div(100)),
    measurement("temperature_ntc_ac", "°C", 0, 65, I16, Unit),
    // SC grid
    measurement("sc_grid_voltage", "V", 2, 67, U16, Div(100)),
    measurement("sc_grid_frequency", "Hz", 2, 69, U16, Div(100)),
    measurement("sc_grid_dc_injection_current", "A", 2, 71, I16, Div(100)),
    // AC grid
    measurement("ac_grid_voltage", "V", 2, 73, U16, Div(100)),
    measurement("ac_grid_frequency", "Hz", 2, 75, U16, Div(100)),
    measurement("ac_grid_dc_injection_current", "A", 2, 77, I16, Div(100)),
    // energy and daily extremes
    counter("supplied_ac_energy_today", "Wh", 0, 79, U16, Mul(10)),
    counter("runtime_today", "s", 0, 81, U16, Mul(60)),
    counter("max_ac_current_today", "A", 1, 83, U16, Div(10)),
    counter("min_ac_voltage_today", "V", 0, 85, U16, Unit),
    counter("max_ac_voltage_today", "V", 0, 87, U16, Unit),
    counter("max_ac_power_today", "W", 0, 89, U16, Unit),
    counter("min_ac_frequency_today", "Hz", 2, 91, U16, Div(100)),
    counter("max_ac_frequency_today", "Hz", 2, 93, U16, Div(100)),
    counter("supplied_ac_energy_total", "kWh", 1, 95, U32, Div(10)),
    counter("runtime_total", "s", 0, 99, U32, Mul(3600)),
    counter("max_solar_current_input_1", "A", 1, 103, U16, Div(10)),
    counter("max_solar_voltage_input_1", "V", 0, 105, U16, Unit),
    counter("max_solar_power_input_1", "W", 0, 107, U16, Unit),
    counter("min_solar_isolation_resistance_input_1", "Ω", 0, 109, U16, Mul(1000)),
    counter("max_solar_isolation_resistance_input_1", "Ω", 0, 111, U16, Mul(1000)),
    // limits and status
    status("alarms_status", 113, U8),
    status("status_dc_input", 114, U8),
    status("limits_dc_input", 115, U8),
    status("status_ac_output", 116, U8),
    status("limits_ac_output", 117, U8),
    status("warnings_status", 118, U8),
    status("dc_hardware_failure", 119, U8),
    status("ac_hardware_failure", 120, U8),
];

static VARIANT_212_FIELDS: &[FieldDescriptor] = &[
    identity("part_number", 0, 11),
    identity("serial_number", 11, 13),
    status("sap_date_code", 24, U32),
    status("sap_revision", 28, U16),
    // firmware revisions (MA.MI) and dates (MA.MMDD)
    status("dsp_fw_rev", 30, U16),
    status("dsp_fw_date", 32, U16),
    status("redundant_mcu_fw_rev", 34, U16),
    status("redundant_mcu_fw_date", 36, U16),
    status("display_mcu_fw_rev", 38, U16),
    status("display_mcu_fw_date", 40, U16),
    status("display_webpage_ctrl_fw_rev", 42, U16),
    status("display_webpage_ctrl_fw_date", 44, U16),
    status("display_wifi_ctrl_fw_rev", 46, U16),
    status("display_wifi_ctrl_fw_date", 48, U16),
    // AC phases, 12 bytes each
    measurement("ac_voltage_phase_1", "V", 1, 50, U16, Div(10)),
    measurement("ac_current_phase_1", "A", 2, 52, U16, Div(100)),
    measurement("ac_power_phase_1", "W", 0, 54, U16, Unit),
    measurement("ac_frequency_phase_1", "Hz", 2, 56, U16, Div(100)),
    measurement("ac_voltage_redundant_phase_1", "V", 1, 58, U16, Div(10)),
    measurement("ac_frequency_redundant_phase_1", "Hz", 2, 60, U16, Div(100)),
    measurement("ac_voltage_phase_2", "V", 1, 62, U16, Div(10)),
    measurement("ac_current_phase_2", "A", 2, 64, U16, Div(100)),
    measurement("ac_power_phase_2", "W", 0, 66, U16, Unit),
    measurement("ac_frequency_phase_2", "Hz", 2, 68, U16, Div(100)),
    measurement("ac_voltage_redundant_phase_2", "V", 1, 70, U16, Div(10)),
    measurement("ac_frequency_redundant_phase_2", "Hz", 2, 72, U16, Div(100)),
    measurement("ac_voltage_phase_3", "V", 1, 74, U16, Div(10)),
    measurement("ac_current_phase_3", "A", 2, 76, U16, Div(100)),
    measurement("ac_power_phase_3", "W", 0, 78, U16, Unit),
    measurement("ac_frequency_phase_3", "Hz", 2, 80, U16, Div(100)),
    measurement("ac_voltage_redundant_phase_3", "V", 1, 82, U16, Div(10)),
    measurement("ac_frequency_redundant_phase_3", "Hz", 2, 84, U16, Div(100)),
    // solar inputs, 6 bytes each
    measurement("solar_voltage_input_1", "V", 1, 86, U16, Div(10)),
    measurement("solar_current_input_1", "A", 2, 88, U16, Div(100)),
    measurement("solar_power_input_1", "W", 0, 90, U16, Unit),
    measurement("solar_voltage_input_2", "V", 1, 92, U16, Div(10)),
    measurement("solar_current_input_2", "A", 2, 94, U16, Div(100)),
    measurement("solar_power_input_2", "W", 0, 96, U16, Unit),
    measurement("ac_power", "W", 0, 98, U16, Unit),
    measurement("bus_voltage_pos", "V", 1, 100, U16, Div(10)),
    measurement("bus_voltage_neg", "V", 1, 102, U16, Div(10)),
    counter("supplied_ac_energy_today", "Wh", 0, 104, U32, Unit),
    counter("runtime_today", "s", 0, 108, U32, Unit),
    counter("supplied_ac_energy_total", "kWh", 0, 112, U32, Unit),
    counter("runtime_total", "s", 0, 116, U32, Unit),
    measurement("inverter_module_rack_temp", "°C", 0, 120, I16, Unit),
    status("status_ac_output_1", 122, U8),
    status("status_ac_output_2", 123, U8),
    status("status_ac_output_3", 124, U8),
    status("status_ac_output_4", 125, U8),
    status("status_dc_input_1", 126, U8),
    status("status_dc_input_2", 127, U8),
    status("error_status", 128, U8),
    status("error_status_ac_1", 129, U8),
    status("global_error_1", 130, U8),
    status("cpu_error", 131, U8),
    status("global_error_2", 132, U8),
    status("limits_ac_output_1", 133, U8),
    status("limits_ac_output_2", 134, U8),
    status("global_error_3", 135, U8),
    status("limits_dc_1", 136, U8),
    status("limits_dc_2", 137, U8),
    // 20 bytes of history status follow; not decoded
];

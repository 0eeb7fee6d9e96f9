//! Raw code to physical unit conversions.

use neuro_types::ControllerVariant;

/// Amplifier resolution, offset-binary around 32768.
pub const AMPLIFIER_UV_PER_LSB: f32 = 0.195;
pub const AUX_INPUT_UV_PER_LSB: f32 = 37.4;
pub const SUPPLY_UV_PER_LSB: f32 = 74.8;
/// USB3 and stimulation controllers, offset-binary around 32768.
pub const ADC_UV_PER_LSB: f32 = 312.5;
/// USB2 controllers, unipolar.
pub const USB2_ADC_UV_PER_LSB: f32 = 50.354;
/// Stimulation DC amplifiers, 10-bit offset-binary around 512.
pub const DC_AMPLIFIER_MV_PER_LSB: f32 = -19.23;

pub fn amplifier_microvolts(code: u16) -> f32 {
    AMPLIFIER_UV_PER_LSB * (f32::from(code) - 32768.0)
}

/// Requantizes a filtered amplifier value, clamping to the code range.
pub fn microvolts_to_amplifier_code(microvolts: f32) -> u16 {
    let code = (microvolts / AMPLIFIER_UV_PER_LSB).round() + 32768.0;
    code.clamp(0.0, 65535.0) as u16
}

pub fn aux_input_volts(code: u16) -> f32 {
    AUX_INPUT_UV_PER_LSB * f32::from(code) * 1e-6
}

pub fn supply_volts(code: u16) -> f32 {
    SUPPLY_UV_PER_LSB * f32::from(code) * 1e-6
}

pub fn adc_volts(variant: ControllerVariant, code: u16) -> f32 {
    match variant {
        ControllerVariant::Usb2Record => USB2_ADC_UV_PER_LSB * f32::from(code) * 1e-6,
        _ => ADC_UV_PER_LSB * (f32::from(code) - 32768.0) * 1e-6,
    }
}

/// DAC codes share the ADC scaling on the controllers that have DACs.
pub fn dac_volts(code: u16) -> f32 {
    ADC_UV_PER_LSB * (f32::from(code) - 32768.0) * 1e-6
}

pub fn dc_amplifier_millivolts(code: u16) -> f32 {
    DC_AMPLIFIER_MV_PER_LSB * (f32::from(code & 0x03ff) - 512.0)
}

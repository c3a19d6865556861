use crate::acquisition::{AcquisitionSettings, ConfigError};
use crate::specification::DeviceSpecification;
use std::fmt;

/// `bmRequestType` of a host-to-device vendor request.
pub const VENDOR_REQUEST_OUT: u8 = 0x40;

/// A serialized vendor control request, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPayload {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

impl ControlPayload {
    fn vendor_out(request: u8, data: u8) -> Self {
        Self {
            request_type: VENDOR_REQUEST_OUT,
            request,
            value: 0,
            index: 0,
            data: vec![data],
        }
    }
}

impl fmt::Display for ControlPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x} 0x{:02x} [", self.request_type, self.request)?;
        for (i, byte) in self.data.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "0x{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

/// Control requests understood by the DSO-6022 firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    AcquireHardData,
    SetTimeDiv,
    SetVoltDivCh2,
    SetVoltDivCh1,
    SetNumChannels,
    SetCalFreq,
}

impl ControlCommand {
    pub fn request_code(self) -> u8 {
        match self {
            ControlCommand::SetVoltDivCh1 => 0xe0,
            ControlCommand::SetVoltDivCh2 => 0xe1,
            ControlCommand::SetTimeDiv => 0xe2,
            ControlCommand::AcquireHardData => 0xe3,
            ControlCommand::SetNumChannels => 0xe4,
            ControlCommand::SetCalFreq => 0xe6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ControlCommand::AcquireHardData => "acquire hard data",
            ControlCommand::SetTimeDiv => "set time/div",
            ControlCommand::SetVoltDivCh2 => "set volt/div CH2",
            ControlCommand::SetVoltDivCh1 => "set volt/div CH1",
            ControlCommand::SetNumChannels => "set channel count",
            ControlCommand::SetCalFreq => "set calibration frequency",
        }
    }

    /// Serialize the command for the given settings.
    pub fn encode(
        self,
        settings: &AcquisitionSettings,
        spec: &DeviceSpecification,
    ) -> Result<ControlPayload, ConfigError> {
        let data = match self {
            ControlCommand::AcquireHardData => 0x01,
            ControlCommand::SetTimeDiv => settings.samplerate.rate_id,
            ControlCommand::SetVoltDivCh1 => spec.gain_step(settings.voltage_range[0]).gain_id,
            ControlCommand::SetVoltDivCh2 => spec.gain_step(settings.voltage_range[1]).gain_id,
            ControlCommand::SetNumChannels => u8::try_from(settings.channel_count)
                .map_err(|_| ConfigError::UnsupportedChannelCount(settings.channel_count))?,
            ControlCommand::SetCalFreq => calibration_frequency_code(settings.calibration_frequency)?,
        };
        Ok(ControlPayload::vendor_out(self.request_code(), data))
    }

    /// Whether the device would need this command to reach `wanted`.
    pub fn is_stale(self, wanted: &AcquisitionSettings, dispatched: &AcquisitionSettings) -> bool {
        match self {
            ControlCommand::AcquireHardData => true,
            ControlCommand::SetTimeDiv => wanted.samplerate != dispatched.samplerate,
            ControlCommand::SetVoltDivCh1 => wanted.voltage_range[0] != dispatched.voltage_range[0],
            ControlCommand::SetVoltDivCh2 => wanted.voltage_range[1] != dispatched.voltage_range[1],
            ControlCommand::SetNumChannels => wanted.channel_count != dispatched.channel_count,
            ControlCommand::SetCalFreq => {
                wanted.calibration_frequency != dispatched.calibration_frequency
            }
        }
    }

    /// Copy the parameter this command carries from `sent` into `dispatched`.
    pub fn record(self, sent: &AcquisitionSettings, dispatched: &mut AcquisitionSettings) {
        match self {
            ControlCommand::AcquireHardData => {}
            ControlCommand::SetTimeDiv => {
                dispatched.samplerate = sent.samplerate;
                dispatched.time_per_div = sent.time_per_div;
            }
            ControlCommand::SetVoltDivCh1 => dispatched.voltage_range[0] = sent.voltage_range[0],
            ControlCommand::SetVoltDivCh2 => dispatched.voltage_range[1] = sent.voltage_range[1],
            ControlCommand::SetNumChannels => dispatched.channel_count = sent.channel_count,
            ControlCommand::SetCalFreq => {
                dispatched.calibration_frequency = sent.calibration_frequency;
            }
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Firmware code for the calibration square wave output.
///
/// 100 Hz is code 0, whole kHz from 1 to 100 are sent as kHz, and other
/// multiples of 10 Hz below 1 kHz are sent as `100 + Hz / 10`.
pub fn calibration_frequency_code(hz: f64) -> Result<u8, ConfigError> {
    let unsupported = || ConfigError::UnsupportedCalibrationFrequency(hz);
    if !hz.is_finite() || hz.fract() != 0.0 {
        return Err(unsupported());
    }

    let code = match hz as u32 {
        100 => 0,
        hz @ 1_000..=100_000 if hz % 1_000 == 0 => hz / 1_000,
        hz @ 10..=990 if hz % 10 == 0 => 100 + hz / 10,
        _ => return Err(unsupported()),
    };
    u8::try_from(code).map_err(|_| unsupported())
}

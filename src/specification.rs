use crate::calibration::CalibrationSection;

/// Number of analog input channels of the DSO-6022 family.
pub const CHANNEL_COUNT: usize = 2;

/// Number of selectable voltage ranges per channel.
pub const RANGE_COUNT: usize = 8;

/// Vertical screen divisions the gain table is expressed against.
pub const DIVS_VOLTAGE: f64 = 8.0;

/// Horizontal screen divisions, used to size the capture window.
pub const DIVS_TIME: f64 = 10.0;

/// Raw ADC code of a 0 V input before offset correction.
pub const RAW_ZERO_CODE: u8 = 0x80;

/// Gain calibration value meaning "no override".
pub const GAIN_NOT_CALIBRATED: f64 = 0.0;

/// Offset calibration value meaning "no override".
pub const OFFSET_NOT_CALIBRATED: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum VoltageRange {
    MilliVolts20,
    MilliVolts50,
    MilliVolts100,
    MilliVolts200,
    MilliVolts500,
    #[default]
    MilliVolts1000,
    MilliVolts2000,
    MilliVolts5000,
}

impl VoltageRange {
    pub const ALL: [Self; RANGE_COUNT] = [
        Self::MilliVolts20,
        Self::MilliVolts50,
        Self::MilliVolts100,
        Self::MilliVolts200,
        Self::MilliVolts500,
        Self::MilliVolts1000,
        Self::MilliVolts2000,
        Self::MilliVolts5000,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Key used by the calibration store, e.g. `"200mV"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MilliVolts20 => "20mV",
            Self::MilliVolts50 => "50mV",
            Self::MilliVolts100 => "100mV",
            Self::MilliVolts200 => "200mV",
            Self::MilliVolts500 => "500mV",
            Self::MilliVolts1000 => "1000mV",
            Self::MilliVolts2000 => "2000mV",
            Self::MilliVolts5000 => "5000mV",
        }
    }

    pub fn volts_per_div(self) -> f64 {
        match self {
            Self::MilliVolts20 => 0.02,
            Self::MilliVolts50 => 0.05,
            Self::MilliVolts100 => 0.1,
            Self::MilliVolts200 => 0.2,
            Self::MilliVolts500 => 0.5,
            Self::MilliVolts1000 => 1.0,
            Self::MilliVolts2000 => 2.0,
            Self::MilliVolts5000 => 5.0,
        }
    }
}

impl std::fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input coupling. The DSO-6022 front end is DC coupled only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coupling {
    DC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerMode {
    Auto,
    Normal,
    Single,
}

/// Sample rate envelope for one channel mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRateLimits {
    pub base: f64,
    pub max: f64,
    /// Largest software decimation factor that keeps calibration valid.
    pub max_downsampler: u32,
    pub record_lengths: Vec<u32>,
}

/// One entry of the gain table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainStep {
    /// Hardware gain id sent to the firmware.
    pub gain_id: u8,
    /// Volts spanned by the full screen height.
    pub volts_per_screen: f64,
}

/// One entry of the fixed sample rate menu.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedSampleRate {
    /// Sample rate id sent to the firmware.
    pub rate_id: u8,
    pub samplerate: f64,
}

impl FixedSampleRate {
    /// Rate the ADC actually runs at for this id.
    ///
    /// Ids 110, 120 and 150 are the firmware codes for 100k, 200k and 500k;
    /// every other id is the rate in MS/s.
    pub fn hardware_samplerate(&self) -> f64 {
        match self.rate_id {
            rate_id @ 100..=199 => f64::from(rate_id - 100) * 10e3,
            rate_id => f64::from(rate_id) * 1e6,
        }
    }

    /// Software decimation needed on top of the hardware rate.
    pub fn decimation(&self) -> u32 {
        (self.hardware_samplerate() / self.samplerate).round().max(1.0) as u32
    }
}

/// Leading samples dropped from every capture and the retained window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFraming {
    /// Samples dropped because the stream starts unreliably.
    pub discard_head: usize,
    /// Extra samples dropped on top of `discard_head`.
    pub discard_margin: usize,
    /// Samples per channel kept after discarding.
    pub window: usize,
}

impl CaptureFraming {
    pub fn discard(&self) -> usize {
        self.discard_head + self.discard_margin
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpecification {
    pub channels: usize,
    pub samplerate_single: SampleRateLimits,
    pub samplerate_multi: SampleRateLimits,
    pub buffer_dividers: Vec<u32>,
    /// Raw code at the top of the screen, per channel and range.
    pub voltage_limit: [[f64; RANGE_COUNT]; CHANNEL_COUNT],
    pub voltage_offset: [[i32; RANGE_COUNT]; CHANNEL_COUNT],
    pub gain: [GainStep; RANGE_COUNT],
    pub fixed_sample_rates: Vec<FixedSampleRate>,
    pub sample_size: u8,
    pub couplings: Vec<Coupling>,
    pub trigger_modes: Vec<TriggerMode>,
    pub fixed_usb_in_length: usize,
    pub framing: CaptureFraming,
}

// Measured gain error of the input divider and amplifier stages:
// x1 and x2 read 1% low, x5 reads 2% high, x10 is exact.
const DSO6022_VOLTAGE_LIMIT: [f64; RANGE_COUNT] =
    [40.0, 100.0, 200.0, 202.0, 198.0, 198.0, 396.0, 990.0];

const DSO6022_GAIN: [GainStep; RANGE_COUNT] = [
    GainStep { gain_id: 10, volts_per_screen: 0.16 },
    GainStep { gain_id: 10, volts_per_screen: 0.40 },
    GainStep { gain_id: 10, volts_per_screen: 0.80 },
    GainStep { gain_id: 5, volts_per_screen: 1.60 },
    GainStep { gain_id: 2, volts_per_screen: 4.00 },
    GainStep { gain_id: 1, volts_per_screen: 8.00 },
    GainStep { gain_id: 1, volts_per_screen: 16.00 },
    GainStep { gain_id: 1, volts_per_screen: 40.00 },
];

// Rates below 100 kS/s are decimated in software from the 100 kS/s stream.
// 48 MS/s is left out, it drops samples with one channel enabled.
const DSO6022_FIXED_SAMPLE_RATES: [(u8, f64); 17] = [
    (110, 1e3),
    (110, 2e3),
    (110, 5e3),
    (110, 10e3),
    (110, 20e3),
    (110, 50e3),
    (110, 100e3),
    (120, 200e3),
    (150, 500e3),
    (1, 1e6),
    (2, 2e6),
    (5, 5e6),
    (10, 10e6),
    (12, 12e6),
    (15, 15e6),
    (24, 24e6),
    (30, 30e6),
];

impl DeviceSpecification {
    /// Build the DSO-6022 specification and apply any stored calibration.
    pub fn dso6022(calibration: Option<&CalibrationSection>) -> Self {
        let mut spec = Self::dso6022_factory();
        match calibration {
            Some(section) => spec.apply_calibration(section),
            None => log::debug!("No calibration on file, using factory voltage limits"),
        }
        spec
    }

    /// The DSO-6022 specification as characterized, before calibration.
    pub fn dso6022_factory() -> Self {
        Self {
            channels: CHANNEL_COUNT,
            samplerate_single: SampleRateLimits {
                base: 1e6,
                max: 30e6,
                max_downsampler: 10,
                record_lengths: vec![u32::MAX],
            },
            samplerate_multi: SampleRateLimits {
                base: 1e6,
                max: 15e6,
                max_downsampler: 10,
                record_lengths: vec![u32::MAX],
            },
            buffer_dividers: vec![1000, 1, 1],
            voltage_limit: [DSO6022_VOLTAGE_LIMIT; CHANNEL_COUNT],
            voltage_offset: [[0; RANGE_COUNT]; CHANNEL_COUNT],
            gain: DSO6022_GAIN,
            fixed_sample_rates: DSO6022_FIXED_SAMPLE_RATES
                .iter()
                .map(|&(rate_id, samplerate)| FixedSampleRate { rate_id, samplerate })
                .collect(),
            sample_size: 17,
            couplings: vec![Coupling::DC],
            trigger_modes: vec![TriggerMode::Auto, TriggerMode::Normal, TriggerMode::Single],
            fixed_usb_in_length: 0,
            // 20000 samples at 100 kS/s fill the screen twice at 10 ms/div
            framing: CaptureFraming {
                discard_head: 2048,
                discard_margin: 480,
                window: 20_000,
            },
        }
    }

    /// Overlay per-unit gain and offset corrections onto the factory tables.
    pub fn apply_calibration(&mut self, section: &CalibrationSection) {
        for channel in 0..CHANNEL_COUNT {
            for range in VoltageRange::ALL {
                let factor = section.gain_factor(channel, range);
                if factor != GAIN_NOT_CALIBRATED && factor.is_finite() {
                    self.voltage_limit[channel][range.index()] /= factor;
                }

                let offset = section.offset(channel, range);
                if offset != OFFSET_NOT_CALIBRATED {
                    self.voltage_offset[channel][range.index()] =
                        i32::from(RAW_ZERO_CODE) - offset;
                }
            }
        }
        log::debug!(
            "Calibrated voltage limits: {:?}, offsets: {:?}",
            self.voltage_limit,
            self.voltage_offset
        );
    }

    pub fn samplerate_limits(&self, channel_count: usize) -> &SampleRateLimits {
        if channel_count > 1 {
            &self.samplerate_multi
        } else {
            &self.samplerate_single
        }
    }

    pub fn gain_step(&self, range: VoltageRange) -> GainStep {
        self.gain[range.index()]
    }

    pub fn supports_channel_count(&self, channel_count: usize) -> bool {
        (1..=self.channels).contains(&channel_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationCategory, CalibrationSection};

    fn section(entries: &[(CalibrationCategory, usize, VoltageRange, &str)]) -> CalibrationSection {
        let mut section = CalibrationSection::default();
        for &(category, channel, range, value) in entries {
            section.insert(category, channel, range, value);
        }
        section
    }

    #[test]
    fn test_factory_tables_are_two_by_eight_and_positive() {
        let spec = DeviceSpecification::dso6022_factory();
        assert_eq!(spec.voltage_limit.len(), 2);
        assert_eq!(spec.voltage_offset.len(), 2);
        for channel in 0..CHANNEL_COUNT {
            assert_eq!(spec.voltage_limit[channel].len(), 8);
            assert_eq!(spec.voltage_offset[channel].len(), 8);
            assert!(spec.voltage_limit[channel].iter().all(|&limit| limit > 0.0));
            assert!(spec.voltage_offset[channel].iter().all(|&offset| offset == 0));
        }
        assert_eq!(spec.couplings, vec![Coupling::DC]);
    }

    #[test]
    fn test_missing_section_keeps_factory_defaults() {
        assert_eq!(
            DeviceSpecification::dso6022(None),
            DeviceSpecification::dso6022_factory()
        );
    }

    #[test]
    fn test_zero_gain_factor_is_ignored() {
        let calibration = section(&[(
            CalibrationCategory::Gain,
            0,
            VoltageRange::MilliVolts200,
            "0.0",
        )]);
        let spec = DeviceSpecification::dso6022(Some(&calibration));
        assert_eq!(spec.voltage_limit[0][3], 202.0);
    }

    #[test]
    fn test_gain_factor_divides_limit() {
        let calibration = section(&[
            (CalibrationCategory::Gain, 1, VoltageRange::MilliVolts20, "1.25"),
            (CalibrationCategory::Gain, 0, VoltageRange::MilliVolts5000, "0.5"),
        ]);
        let spec = DeviceSpecification::dso6022(Some(&calibration));
        assert_eq!(spec.voltage_limit[1][0], 32.0);
        assert_eq!(spec.voltage_limit[0][7], 1980.0);
        // untouched cells keep their defaults
        assert_eq!(spec.voltage_limit[0][0], 40.0);
        assert_eq!(spec.voltage_limit[1][7], 990.0);
    }

    #[test]
    fn test_offset_sentinel_is_ignored() {
        let calibration = section(&[(
            CalibrationCategory::Offset,
            0,
            VoltageRange::MilliVolts50,
            "255",
        )]);
        let spec = DeviceSpecification::dso6022(Some(&calibration));
        assert_eq!(spec.voltage_offset[0][1], 0);
    }

    #[test]
    fn test_stored_offset_is_relative_to_zero_code() {
        let calibration = section(&[
            (CalibrationCategory::Offset, 0, VoltageRange::MilliVolts50, "130"),
            (CalibrationCategory::Offset, 1, VoltageRange::MilliVolts2000, "0"),
        ]);
        let spec = DeviceSpecification::dso6022(Some(&calibration));
        assert_eq!(spec.voltage_offset[0][1], -2);
        assert_eq!(spec.voltage_offset[1][6], 0x80);
    }

    #[test]
    fn test_malformed_entries_fall_back_to_defaults() {
        let calibration = section(&[
            (CalibrationCategory::Gain, 0, VoltageRange::MilliVolts100, "fast"),
            (CalibrationCategory::Gain, 0, VoltageRange::MilliVolts500, "inf"),
            (CalibrationCategory::Offset, 1, VoltageRange::MilliVolts100, "0x7f"),
        ]);
        let spec = DeviceSpecification::dso6022(Some(&calibration));
        assert_eq!(spec.voltage_limit, DeviceSpecification::dso6022_factory().voltage_limit);
        assert_eq!(spec.voltage_offset[1][2], 0);
    }

    #[test]
    fn test_gain_table_is_not_calibrated() {
        let calibration = section(&[(
            CalibrationCategory::Gain,
            0,
            VoltageRange::MilliVolts200,
            "2.0",
        )]);
        let spec = DeviceSpecification::dso6022(Some(&calibration));
        assert_eq!(spec.gain, DSO6022_GAIN);
    }

    #[test]
    fn test_fixed_rate_hardware_mapping() {
        let spec = DeviceSpecification::dso6022_factory();
        let rate = |hz: f64| {
            *spec
                .fixed_sample_rates
                .iter()
                .find(|rate| rate.samplerate == hz)
                .unwrap()
        };
        assert_eq!(rate(10e3).hardware_samplerate(), 100e3);
        assert_eq!(rate(10e3).decimation(), 10);
        assert_eq!(rate(1e3).decimation(), 100);
        assert_eq!(rate(200e3).hardware_samplerate(), 200e3);
        assert_eq!(rate(500e3).decimation(), 1);
        assert_eq!(rate(24e6).hardware_samplerate(), 24e6);
    }

    #[test]
    fn test_range_labels_round_trip_index() {
        for (index, range) in VoltageRange::ALL.iter().enumerate() {
            assert_eq!(range.index(), index);
            assert_eq!(VoltageRange::from_index(index), Some(*range));
        }
        assert_eq!(VoltageRange::from_index(8), None);
        assert_eq!(VoltageRange::MilliVolts2000.as_str(), "2000mV");
    }
}

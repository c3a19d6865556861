use crate::control_command::ControlCommand;
use crate::device_model::DeviceModel;
use crate::specification::{
    DeviceSpecification, FixedSampleRate, VoltageRange, CHANNEL_COUNT, DIVS_TIME, DIVS_VOLTAGE,
    RAW_ZERO_CODE,
};
use crate::transport::{TransferError, UsbTransport, BULK_ENDPOINT_IN};
use polars::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
/// How long one bulk read may block before the stop flag is checked again.
const BULK_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_TIME_PER_DIV: f64 = 1e-3;
const DEFAULT_CALIBRATION_FREQUENCY: f64 = 1e3;

const TIME_COLUMN_NAME: &str = "time";
const CHANNEL_COLUMN_NAMES: [&str; CHANNEL_COUNT] = ["ch1", "ch2"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Channel {0} does not exist")]
    UnsupportedChannel(usize),

    #[error("{0} active channels are not supported")]
    UnsupportedChannelCount(usize),

    #[error("No fixed sample rate can show {time_per_div} s/div")]
    TimebaseOutOfRange { time_per_div: f64 },

    #[error("Sample rate {0} S/s is not available")]
    UnsupportedSampleRate(f64),

    #[error("Sample rate {samplerate} S/s exceeds {max} S/s with {channel_count} channel(s)")]
    SampleRateTooHigh {
        samplerate: f64,
        max: f64,
        channel_count: usize,
    },

    #[error("Software downsampling by {required} exceeds the maximum of {max}")]
    DownsamplingExceeded { required: u32, max: u32 },

    #[error("Calibration output frequency {0} Hz is not supported")]
    UnsupportedCalibrationFrequency(f64),

    #[error("Model does not register the '{0}' command")]
    CommandNotRegistered(ControlCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedCapture {
    #[error("Capture holds {samples} samples per channel, at least {required} are needed")]
    TooShort { samples: usize, required: usize },

    #[error("Capture of {bytes} bytes does not split into {channels} channels")]
    Misaligned { bytes: usize, channels: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transfer for '{command}' failed: {source}")]
    Transfer {
        command: ControlCommand,
        #[source]
        source: TransferError,
    },

    #[error("Malformed capture: {0}")]
    Malformed(#[from] MalformedCapture),

    #[error("No device attached")]
    NotConnected,

    #[error("Acquisition cancelled")]
    Cancelled,
}

impl AcquisitionError {
    /// Whether the device needs attention (reconnect or retry) before the
    /// next cycle can succeed.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, Self::Transfer { .. } | Self::NotConnected)
    }
}

/// Front-end configuration of one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub voltage_range: [VoltageRange; CHANNEL_COUNT],
    pub channel_count: usize,
    /// Requested time base in seconds per division.
    pub time_per_div: f64,
    pub samplerate: FixedSampleRate,
    pub calibration_frequency: f64,
}

impl AcquisitionSettings {
    pub fn defaults(spec: &DeviceSpecification) -> Self {
        let channel_count = spec.channels;
        let samplerate = select_samplerate(spec, DEFAULT_TIME_PER_DIV, channel_count)
            .ok()
            .or_else(|| spec.fixed_sample_rates.first().copied())
            .unwrap_or(FixedSampleRate {
                rate_id: 1,
                samplerate: 1e6,
            });
        Self {
            voltage_range: [VoltageRange::default(); CHANNEL_COUNT],
            channel_count,
            time_per_div: DEFAULT_TIME_PER_DIV,
            samplerate,
            calibration_frequency: DEFAULT_CALIBRATION_FREQUENCY,
        }
    }

    /// Seconds between two output samples.
    pub fn sample_interval(&self) -> f64 {
        1.0 / self.samplerate.samplerate
    }
}

pub fn validate_channel(spec: &DeviceSpecification, channel: usize) -> Result<(), ConfigError> {
    if channel < spec.channels {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedChannel(channel))
    }
}

pub fn validate_channel_count(
    spec: &DeviceSpecification,
    channel_count: usize,
) -> Result<(), ConfigError> {
    if spec.supports_channel_count(channel_count) {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedChannelCount(channel_count))
    }
}

/// Check that `rate` is usable with `channel_count` channels.
pub fn validate_samplerate(
    spec: &DeviceSpecification,
    rate: FixedSampleRate,
    channel_count: usize,
) -> Result<(), ConfigError> {
    let limits = spec.samplerate_limits(channel_count);
    if rate.samplerate > limits.max {
        return Err(ConfigError::SampleRateTooHigh {
            samplerate: rate.samplerate,
            max: limits.max,
            channel_count,
        });
    }
    let required = rate.decimation();
    if required > limits.max_downsampler {
        return Err(ConfigError::DownsamplingExceeded {
            required,
            max: limits.max_downsampler,
        });
    }
    Ok(())
}

/// Pick the fastest fixed rate whose capture window still spans two screens.
pub fn select_samplerate(
    spec: &DeviceSpecification,
    time_per_div: f64,
    channel_count: usize,
) -> Result<FixedSampleRate, ConfigError> {
    let out_of_range = ConfigError::TimebaseOutOfRange { time_per_div };
    if !time_per_div.is_finite() || time_per_div <= 0.0 {
        return Err(out_of_range);
    }

    let screens = 2.0 * DIVS_TIME * time_per_div;
    let fastest = spec.framing.window as f64 / screens * (1.0 + 1e-9);
    spec.fixed_sample_rates
        .iter()
        .filter(|rate| rate.samplerate <= fastest)
        .filter(|rate| validate_samplerate(spec, **rate, channel_count).is_ok())
        .max_by(|a, b| a.samplerate.total_cmp(&b.samplerate))
        .copied()
        .ok_or(out_of_range)
}

/// Look up a rate of the fixed menu by its value in S/s.
pub fn find_samplerate(
    spec: &DeviceSpecification,
    samplerate: f64,
) -> Result<FixedSampleRate, ConfigError> {
    spec.fixed_sample_rates
        .iter()
        .find(|rate| rate.samplerate == samplerate)
        .copied()
        .ok_or(ConfigError::UnsupportedSampleRate(samplerate))
}

/// Number of raw bytes one capture with `settings` occupies.
pub fn raw_capture_length(spec: &DeviceSpecification, settings: &AcquisitionSettings) -> usize {
    let decimation = settings.samplerate.decimation() as usize;
    let samples = spec.framing.discard() + spec.framing.window * decimation;
    samples * settings.channel_count
}

/// Map one raw code of `channel` to volts.
pub fn raw_to_voltage(
    spec: &DeviceSpecification,
    channel: usize,
    range: VoltageRange,
    code: u8,
) -> f64 {
    let limit = spec.voltage_limit[channel][range.index()];
    let offset = spec.voltage_offset[channel][range.index()];
    let volts_per_div = spec.gain_step(range).volts_per_screen / DIVS_VOLTAGE;

    (f64::from(code) - f64::from(RAW_ZERO_CODE) - f64::from(offset)) / limit
        * (DIVS_VOLTAGE / 2.0)
        * volts_per_div
}

/// Convert an interleaved raw capture into calibrated per-channel voltages.
///
/// The leading discard region is dropped and rates below the hardware rate
/// are averaged down by the rate's decimation factor.
pub fn convert_raw_samples(
    spec: &DeviceSpecification,
    settings: &AcquisitionSettings,
    raw: &[u8],
) -> Result<Vec<Vec<f64>>, MalformedCapture> {
    #[cfg(feature = "cpu-profiling")]
    let _span = tracy_client::Client::running()
        .map(|client| client.span(tracy_client::span_location!("convert_raw_samples"), 0));

    let channels = settings.channel_count;
    if channels == 0 || raw.len() % channels != 0 {
        return Err(MalformedCapture::Misaligned {
            bytes: raw.len(),
            channels,
        });
    }

    let samples = raw.len() / channels;
    let decimation = settings.samplerate.decimation() as usize;
    let discard = spec.framing.discard();
    let required = discard + spec.framing.window * decimation;
    if samples < required {
        return Err(MalformedCapture::TooShort { samples, required });
    }

    let converted = (0..channels)
        .map(|channel| {
            let range = settings.voltage_range[channel];
            raw[discard * channels..required * channels]
                .chunks_exact(channels * decimation)
                .map(|block| {
                    let sum: f64 = block
                        .iter()
                        .skip(channel)
                        .step_by(channels)
                        .map(|&code| raw_to_voltage(spec, channel, range, code))
                        .sum();
                    sum / decimation as f64
                })
                .collect()
        })
        .collect();
    Ok(converted)
}

/// One calibrated capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Position of this capture in the output sequence, starting at 1.
    pub sequence: u64,
    pub settings: AcquisitionSettings,
    /// Seconds between two samples.
    pub sample_interval: f64,
    /// Volts per active channel, in capture order.
    pub channels: Vec<Vec<f64>>,
}

impl Capture {
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, channel: usize) -> Option<&[f64]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    /// `time` column plus one column of volts per active channel.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let time: Vec<f64> = (0..self.len())
            .map(|i| i as f64 * self.sample_interval)
            .collect();
        let mut columns: Vec<Column> = vec![Series::new(TIME_COLUMN_NAME.into(), time).into()];
        for (name, values) in CHANNEL_COLUMN_NAMES.iter().zip(&self.channels) {
            columns.push(Series::new((*name).into(), values.as_slice()).into());
        }
        DataFrame::new(columns)
    }
}

/// Drives one device through configuration and acquisition.
///
/// Configuration requests are validated immediately and staged; they reach
/// the device at the start of the next [`run_cycle`](Self::run_cycle).
pub struct AcquisitionEngine {
    model: Arc<DeviceModel>,
    commands: Vec<ControlCommand>,
    transport: Option<Box<dyn UsbTransport>>,
    /// Settings of the last successful capture.
    active: AcquisitionSettings,
    /// Settings the next cycle will use.
    pending: AcquisitionSettings,
    /// What the device was last told, `None` when unknown.
    dispatched: Option<AcquisitionSettings>,
    sequence: u64,
    stop: Arc<AtomicBool>,
    capture_timeout: Duration,
}

impl AcquisitionEngine {
    pub fn new(model: Arc<DeviceModel>) -> Self {
        let active = AcquisitionSettings::defaults(model.specification());
        let mut engine = Self {
            model: Arc::clone(&model),
            commands: Vec::new(),
            transport: None,
            pending: active.clone(),
            active,
            dispatched: None,
            sequence: 0,
            stop: Arc::new(AtomicBool::new(false)),
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
        };
        model.apply_requirements(&mut engine);
        engine
    }

    pub fn add_command(&mut self, command: ControlCommand) {
        if !self.commands.contains(&command) {
            self.commands.push(command);
        }
    }

    pub fn remove_command(&mut self, command: ControlCommand) {
        self.commands.retain(|registered| *registered != command);
    }

    pub fn commands(&self) -> &[ControlCommand] {
        &self.commands
    }

    pub fn model(&self) -> &Arc<DeviceModel> {
        &self.model
    }

    pub fn specification(&self) -> &DeviceSpecification {
        self.model.specification()
    }

    pub fn attach(&mut self, transport: Box<dyn UsbTransport>) {
        log::debug!("Attached transport for {}", self.model.name());
        self.transport = Some(transport);
        self.dispatched = None;
    }

    pub fn detach(&mut self) -> Option<Box<dyn UsbTransport>> {
        log::debug!("Detached transport for {}", self.model.name());
        self.dispatched = None;
        self.transport.take()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Flag that aborts a running cycle when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn set_capture_timeout(&mut self, timeout: Duration) {
        self.capture_timeout = timeout;
    }

    /// Settings of the last successful capture.
    pub fn active_settings(&self) -> &AcquisitionSettings {
        &self.active
    }

    /// Settings the next cycle will apply.
    pub fn pending_settings(&self) -> &AcquisitionSettings {
        &self.pending
    }

    /// Configuration rebuilt from the commands last sent to the device.
    pub fn dispatched_settings(&self) -> Option<&AcquisitionSettings> {
        self.dispatched.as_ref()
    }

    /// Number of captures produced so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn request_voltage_range(
        &mut self,
        channel: usize,
        range: VoltageRange,
    ) -> Result<(), ConfigError> {
        validate_channel(self.specification(), channel)?;
        self.pending.voltage_range[channel] = range;
        Ok(())
    }

    /// Change the number of active channels, keeping the time base.
    pub fn request_channel_count(&mut self, channel_count: usize) -> Result<(), ConfigError> {
        let spec = self.model.specification();
        validate_channel_count(spec, channel_count)?;
        let samplerate = select_samplerate(spec, self.pending.time_per_div, channel_count)?;
        self.pending.channel_count = channel_count;
        self.pending.samplerate = samplerate;
        Ok(())
    }

    pub fn request_time_per_div(&mut self, time_per_div: f64) -> Result<(), ConfigError> {
        let samplerate = select_samplerate(
            self.model.specification(),
            time_per_div,
            self.pending.channel_count,
        )?;
        self.pending.time_per_div = time_per_div;
        self.pending.samplerate = samplerate;
        Ok(())
    }

    /// Select a rate from the fixed menu directly.
    pub fn request_samplerate(&mut self, samplerate: f64) -> Result<(), ConfigError> {
        let spec = self.model.specification();
        let rate = find_samplerate(spec, samplerate)?;
        validate_samplerate(spec, rate, self.pending.channel_count)?;
        self.pending.samplerate = rate;
        self.pending.time_per_div = spec.framing.window as f64 / rate.samplerate / (2.0 * DIVS_TIME);
        Ok(())
    }

    pub fn request_calibration_frequency(&mut self, hz: f64) -> Result<(), ConfigError> {
        crate::control_command::calibration_frequency_code(hz)?;
        self.pending.calibration_frequency = hz;
        Ok(())
    }

    /// Apply pending configuration, acquire one capture and convert it.
    ///
    /// On any error the active settings and the sequence are unchanged and
    /// the next cycle resends the full configuration.
    pub fn run_cycle(&mut self) -> Result<Capture, AcquisitionError> {
        let span = tracing::debug_span!(
            "acquisition_cycle",
            model = self.model.name(),
            sequence = self.sequence + 1
        );
        let _enter = span.enter();

        if self.stop.load(Ordering::Relaxed) {
            return Err(AcquisitionError::Cancelled);
        }
        if self.transport.is_none() {
            return Err(AcquisitionError::NotConnected);
        }
        if !self.commands.contains(&ControlCommand::AcquireHardData) {
            return Err(ConfigError::CommandNotRegistered(ControlCommand::AcquireHardData).into());
        }

        let wanted = self.pending.clone();
        let channels = match self.reconfigure(&wanted).and_then(|()| {
            let raw = self.acquire(&wanted)?;
            Ok(convert_raw_samples(self.model.specification(), &wanted, &raw)?)
        }) {
            Ok(channels) => channels,
            Err(e) => {
                self.dispatched = None;
                return Err(e);
            }
        };

        self.sequence += 1;
        self.active = wanted.clone();
        Ok(Capture {
            sequence: self.sequence,
            sample_interval: wanted.sample_interval(),
            settings: wanted,
            channels,
        })
    }

    /// Send every configuration command the device is not yet up to date on,
    /// in registration order.
    fn reconfigure(&mut self, wanted: &AcquisitionSettings) -> Result<(), AcquisitionError> {
        let previous = self.dispatched.take();
        let mut dispatched = previous.clone().unwrap_or_else(|| wanted.clone());

        for command in self.commands.clone() {
            if command == ControlCommand::AcquireHardData {
                continue;
            }
            if previous.is_some() && !command.is_stale(wanted, &dispatched) {
                continue;
            }
            self.send(command, wanted)?;
            command.record(wanted, &mut dispatched);
        }
        // host side only, no command carries it
        dispatched.time_per_div = wanted.time_per_div;

        self.dispatched = Some(dispatched);
        Ok(())
    }

    fn acquire(&mut self, wanted: &AcquisitionSettings) -> Result<Vec<u8>, AcquisitionError> {
        self.send(ControlCommand::AcquireHardData, wanted)?;

        let length = raw_capture_length(self.model.specification(), wanted);
        let deadline = Instant::now() + self.capture_timeout;
        let transport = self
            .transport
            .as_mut()
            .ok_or(AcquisitionError::NotConnected)?;

        let mut raw = Vec::with_capacity(length);
        while raw.len() < length {
            if self.stop.load(Ordering::Relaxed) {
                return Err(AcquisitionError::Cancelled);
            }
            match transport.bulk_in(BULK_ENDPOINT_IN, length - raw.len(), BULK_POLL_TIMEOUT) {
                Ok(chunk) => {
                    raw.extend_from_slice(&chunk);
                    log::trace!("Read {} of {} bytes", raw.len(), length);
                    // an empty transfer or the deadline ends the capture early
                    if chunk.is_empty() || Instant::now() >= deadline {
                        break;
                    }
                }
                Err(TransferError::Timeout) if Instant::now() < deadline => {}
                Err(source) => {
                    return Err(AcquisitionError::Transfer {
                        command: ControlCommand::AcquireHardData,
                        source,
                    });
                }
            }
        }
        raw.truncate(length);
        Ok(raw)
    }

    fn send(
        &mut self,
        command: ControlCommand,
        settings: &AcquisitionSettings,
    ) -> Result<(), AcquisitionError> {
        let payload = command.encode(settings, self.model.specification())?;
        let transport = self
            .transport
            .as_mut()
            .ok_or(AcquisitionError::NotConnected)?;
        log::debug!("Sending {}: {}", command, payload);
        transport
            .control_out(&payload, CONTROL_TIMEOUT)
            .map_err(|source| {
                log::warn!("{} failed: {}", command, source);
                AcquisitionError::Transfer { command, source }
            })
    }
}

impl std::fmt::Debug for AcquisitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionEngine")
            .field("model", &self.model.name())
            .field("commands", &self.commands)
            .field("connected", &self.is_connected())
            .field("active", &self.active)
            .field("pending", &self.pending)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

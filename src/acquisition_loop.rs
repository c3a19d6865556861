//! Background acquisition on a dedicated thread.
//!
//! The loop owns the engine and with it the device handle; callers talk to it
//! through a [`ScopeController`] and receive [`AcquisitionEvent`]s. Requests
//! are applied at the start of the next cycle, never in the middle of one.

use crate::acquisition::{
    validate_channel, validate_channel_count, AcquisitionEngine, AcquisitionError, Capture,
    ConfigError,
};
use crate::control_command::calibration_frequency_code;
use crate::device_model::DeviceModel;
use crate::specification::VoltageRange;
use crate::transport::UsbTransport;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often an idle loop wakes up to check the stop flag.
const IDLE_POLL: Duration = Duration::from_millis(50);

pub enum ScopeRequest {
    VoltageRange { channel: usize, range: VoltageRange },
    ChannelCount(usize),
    TimePerDiv(f64),
    SampleRate(f64),
    CalibrationFrequency(f64),
    Attach(Box<dyn UsbTransport>),
    Detach,
    /// Resume after a device fault without reattaching.
    Retry,
}

impl std::fmt::Debug for ScopeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VoltageRange { channel, range } => f
                .debug_struct("VoltageRange")
                .field("channel", channel)
                .field("range", range)
                .finish(),
            Self::ChannelCount(count) => f.debug_tuple("ChannelCount").field(count).finish(),
            Self::TimePerDiv(time) => f.debug_tuple("TimePerDiv").field(time).finish(),
            Self::SampleRate(rate) => f.debug_tuple("SampleRate").field(rate).finish(),
            Self::CalibrationFrequency(hz) => {
                f.debug_tuple("CalibrationFrequency").field(hz).finish()
            }
            Self::Attach(_) => f.write_str("Attach"),
            Self::Detach => f.write_str("Detach"),
            Self::Retry => f.write_str("Retry"),
        }
    }
}

#[derive(Debug)]
pub enum AcquisitionEvent {
    Capture(Capture),
    /// A cycle or a request failed; the loop keeps running.
    Fault(AcquisitionError),
    Detached,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Acquisition loop is no longer running")]
    LoopStopped,
}

/// Handle to a running acquisition loop.
#[derive(Debug)]
pub struct ScopeController {
    model: Arc<DeviceModel>,
    requests: Sender<ScopeRequest>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<AcquisitionEngine>>,
}

impl ScopeController {
    pub fn model(&self) -> &Arc<DeviceModel> {
        &self.model
    }

    fn send(&self, request: ScopeRequest) -> Result<(), ControllerError> {
        self.requests
            .send(request)
            .map_err(|_| ControllerError::LoopStopped)
    }

    pub fn set_voltage_range(
        &self,
        channel: usize,
        range: VoltageRange,
    ) -> Result<(), ControllerError> {
        validate_channel(self.model.specification(), channel)?;
        self.send(ScopeRequest::VoltageRange { channel, range })
    }

    pub fn set_channel_count(&self, channel_count: usize) -> Result<(), ControllerError> {
        validate_channel_count(self.model.specification(), channel_count)?;
        self.send(ScopeRequest::ChannelCount(channel_count))
    }

    /// Rates that depend on the channel count are checked by the loop and
    /// reported as a [`AcquisitionEvent::Fault`] if unusable.
    pub fn set_time_per_div(&self, time_per_div: f64) -> Result<(), ControllerError> {
        if !time_per_div.is_finite() || time_per_div <= 0.0 {
            return Err(ConfigError::TimebaseOutOfRange { time_per_div }.into());
        }
        self.send(ScopeRequest::TimePerDiv(time_per_div))
    }

    pub fn set_samplerate(&self, samplerate: f64) -> Result<(), ControllerError> {
        crate::acquisition::find_samplerate(self.model.specification(), samplerate)?;
        self.send(ScopeRequest::SampleRate(samplerate))
    }

    pub fn set_calibration_frequency(&self, hz: f64) -> Result<(), ControllerError> {
        calibration_frequency_code(hz)?;
        self.send(ScopeRequest::CalibrationFrequency(hz))
    }

    /// Hand a freshly connected device to the loop.
    pub fn attach(&self, transport: Box<dyn UsbTransport>) -> Result<(), ControllerError> {
        self.send(ScopeRequest::Attach(transport))
    }

    /// Tell the loop the device went away.
    pub fn detach(&self) -> Result<(), ControllerError> {
        self.send(ScopeRequest::Detach)
    }

    pub fn retry(&self) -> Result<(), ControllerError> {
        self.send(ScopeRequest::Retry)
    }

    /// Stop the loop, aborting any transfer wait, and get the engine back.
    ///
    /// The returned engine is ready to run cycles or be spawned again.
    pub fn stop(mut self) -> Option<AcquisitionEngine> {
        self.stop.store(true, Ordering::Relaxed);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(engine) => {
                self.stop.store(false, Ordering::Relaxed);
                Some(engine)
            }
            Err(_) => {
                log::error!("Acquisition thread panicked");
                None
            }
        }
    }
}

impl Drop for ScopeController {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop.store(true, Ordering::Relaxed);
        }
    }
}

/// Why the loop stopped cycling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    /// Waiting for a new transport or a retry request.
    DeviceFault,
    /// Waiting for a configuration change.
    Configuration,
}

pub struct AcquisitionLoop {
    engine: AcquisitionEngine,
    requests: Receiver<ScopeRequest>,
    events: Sender<AcquisitionEvent>,
    stop: Arc<AtomicBool>,
    halted: Option<Halt>,
}

impl AcquisitionLoop {
    /// Move `engine` onto its own thread and start acquiring.
    pub fn spawn(
        engine: AcquisitionEngine,
    ) -> std::io::Result<(ScopeController, Receiver<AcquisitionEvent>)> {
        let (request_tx, request_rx) = channel::unbounded();
        let (event_tx, event_rx) = channel::unbounded();
        let model = Arc::clone(engine.model());
        let stop = engine.stop_handle();
        stop.store(false, Ordering::Relaxed);

        let acquisition = Self {
            engine,
            requests: request_rx,
            events: event_tx,
            stop: Arc::clone(&stop),
            halted: None,
        };
        let thread = thread::Builder::new()
            .name(format!("{}-acquisition", model.identity().firmware_token))
            .spawn(move || acquisition.run())?;

        Ok((
            ScopeController {
                model,
                requests: request_tx,
                stop,
                thread: Some(thread),
            },
            event_rx,
        ))
    }

    fn run(mut self) -> AcquisitionEngine {
        log::debug!("Acquisition loop for {} started", self.engine.model().name());
        while !self.stop.load(Ordering::Relaxed) {
            if !self.drain_requests() {
                break;
            }
            if !self.is_cycling() {
                continue;
            }

            match self.engine.run_cycle() {
                Ok(capture) => self.emit(AcquisitionEvent::Capture(capture)),
                Err(AcquisitionError::Cancelled) => break,
                Err(e) => {
                    if e.is_device_fault() {
                        log::warn!("Acquisition halted: {}", e);
                        self.halted = Some(Halt::DeviceFault);
                    } else if let AcquisitionError::Config(_) = e {
                        log::warn!("Acquisition halted: {}", e);
                        self.halted = Some(Halt::Configuration);
                    } else {
                        log::warn!("Discarding acquisition cycle: {}", e);
                    }
                    self.emit(AcquisitionEvent::Fault(e));
                }
            }
        }
        log::debug!("Acquisition loop for {} stopped", self.engine.model().name());
        self.emit(AcquisitionEvent::Stopped);
        self.engine
    }

    fn is_cycling(&self) -> bool {
        self.halted.is_none() && self.engine.is_connected()
    }

    /// Apply every queued request. Blocks briefly while there is nothing to
    /// acquire. Returns `false` once the controller is gone.
    fn drain_requests(&mut self) -> bool {
        if !self.is_cycling() {
            match self.requests.recv_timeout(IDLE_POLL) {
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.handle(request),
                Err(channel::TryRecvError::Empty) => return true,
                Err(channel::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle(&mut self, request: ScopeRequest) {
        log::trace!("Handling {:?}", request);
        let result = match request {
            ScopeRequest::VoltageRange { channel, range } => {
                self.engine.request_voltage_range(channel, range)
            }
            ScopeRequest::ChannelCount(count) => self.engine.request_channel_count(count),
            ScopeRequest::TimePerDiv(time_per_div) => self.engine.request_time_per_div(time_per_div),
            ScopeRequest::SampleRate(samplerate) => self.engine.request_samplerate(samplerate),
            ScopeRequest::CalibrationFrequency(hz) => {
                self.engine.request_calibration_frequency(hz)
            }
            ScopeRequest::Attach(transport) => {
                self.engine.attach(transport);
                self.halted = None;
                Ok(())
            }
            ScopeRequest::Detach => {
                self.engine.detach();
                self.emit(AcquisitionEvent::Detached);
                Ok(())
            }
            ScopeRequest::Retry => {
                self.halted = None;
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                if self.halted == Some(Halt::Configuration) {
                    self.halted = None;
                }
            }
            Err(e) => {
                log::warn!("Rejected configuration request: {}", e);
                self.emit(AcquisitionEvent::Fault(e.into()));
            }
        }
    }

    fn emit(&self, event: AcquisitionEvent) {
        if self.events.send(event).is_err() {
            log::trace!("No listener for acquisition events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::MemoryCalibration;
    use crate::control_command::ControlCommand;
    use crate::device_model::{ModelRegistry, ModelVariant};
    use crate::transport::mock::MockTransport;
    use crate::transport::TransferError;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    fn spawn() -> (ScopeController, Receiver<AcquisitionEvent>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let model = ModelRegistry::new(&MemoryCalibration::new())
            .by_variant(ModelVariant::Dso6022Be)
            .unwrap();
        AcquisitionLoop::spawn(AcquisitionEngine::new(model)).unwrap()
    }

    fn next_capture(events: &Receiver<AcquisitionEvent>) -> Capture {
        loop {
            match events.recv_timeout(EVENT_TIMEOUT).unwrap() {
                AcquisitionEvent::Capture(capture) => return capture,
                other => log::debug!("Skipping {:?}", other),
            }
        }
    }

    #[test]
    fn test_loop_idles_until_attached() {
        let (controller, events) = spawn();
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());

        controller.attach(Box::new(MockTransport::new())).unwrap();
        let capture = next_capture(&events);
        assert_eq!(capture.sequence, 1);

        let engine = controller.stop().unwrap();
        assert!(engine.sequence() >= 1);
    }

    #[test]
    fn test_configuration_is_applied_between_cycles() {
        let (controller, events) = spawn();
        controller.attach(Box::new(MockTransport::new())).unwrap();
        next_capture(&events);

        controller
            .set_voltage_range(1, VoltageRange::MilliVolts50)
            .unwrap();
        controller.set_channel_count(1).unwrap();

        let capture = loop {
            let capture = next_capture(&events);
            if capture.settings.channel_count == 1 {
                break capture;
            }
        };
        assert_eq!(capture.channels.len(), 1);
        assert_eq!(capture.settings.voltage_range[1], VoltageRange::MilliVolts50);
        controller.stop();
    }

    #[test]
    fn test_invalid_requests_never_reach_the_loop() {
        let (controller, _events) = spawn();
        assert!(matches!(
            controller.set_voltage_range(5, VoltageRange::MilliVolts20),
            Err(ControllerError::Config(ConfigError::UnsupportedChannel(5)))
        ));
        assert!(matches!(
            controller.set_channel_count(4),
            Err(ControllerError::Config(ConfigError::UnsupportedChannelCount(4)))
        ));
        assert!(controller.set_calibration_frequency(7.0).is_err());
        assert!(controller.set_samplerate(3e6).is_err());
        assert!(controller.set_time_per_div(0.0).is_err());
        controller.stop();
    }

    #[test]
    fn test_device_fault_halts_until_retry() {
        let (controller, events) = spawn();
        let transport = MockTransport::new();
        transport.state.lock().fail_request = Some((0xe3, TransferError::Disconnected));
        controller.attach(Box::new(transport.clone())).unwrap();

        let fault = events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert!(matches!(
            fault,
            AcquisitionEvent::Fault(AcquisitionError::Transfer {
                source: TransferError::Disconnected,
                ..
            })
        ));
        // halted: no further traffic while waiting for the caller
        let reads = transport.state.lock().bulk_reads;
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(transport.state.lock().bulk_reads, reads);

        controller.retry().unwrap();
        assert_eq!(next_capture(&events).sequence, 1);
        controller.stop();
    }

    #[test]
    fn test_stop_aborts_pending_bulk_wait() {
        let (controller, events) = spawn();
        let transport = MockTransport::new();
        {
            let mut state = transport.state.lock();
            for _ in 0..100 {
                state.bulk_responses.push_back(Err(TransferError::Timeout));
            }
        }
        controller.attach(Box::new(transport)).unwrap();
        thread::sleep(Duration::from_millis(150));

        let started = std::time::Instant::now();
        let engine = controller.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.sequence(), 0);

        let stopped = events
            .iter()
            .any(|event| matches!(event, AcquisitionEvent::Stopped));
        assert!(stopped);
    }

    #[test]
    fn test_stopped_engine_can_be_spawned_again() {
        let (controller, events) = spawn();
        controller.attach(Box::new(MockTransport::new())).unwrap();
        next_capture(&events);
        let engine = controller.stop().unwrap();
        let sequence = engine.sequence();

        let (controller, events) = AcquisitionLoop::spawn(engine).unwrap();
        let capture = next_capture(&events);
        assert_eq!(capture.sequence, sequence + 1);

        let mut engine = controller.stop().unwrap();
        assert!(engine.run_cycle().is_ok());
    }

    #[test]
    fn test_configuration_fault_halts_until_next_request() {
        let _ = env_logger::builder().is_test(true).try_init();
        let model = ModelRegistry::new(&MemoryCalibration::new())
            .by_variant(ModelVariant::Dso6022Be)
            .unwrap();
        let mut engine = AcquisitionEngine::new(model);
        engine.remove_command(ControlCommand::AcquireHardData);
        let (controller, events) = AcquisitionLoop::spawn(engine).unwrap();
        let transport = MockTransport::new();
        controller.attach(Box::new(transport.clone())).unwrap();

        let is_unregistered = |event: AcquisitionEvent| {
            matches!(
                event,
                AcquisitionEvent::Fault(AcquisitionError::Config(
                    ConfigError::CommandNotRegistered(ControlCommand::AcquireHardData)
                ))
            )
        };
        assert!(is_unregistered(events.recv_timeout(EVENT_TIMEOUT).unwrap()));
        // halted: no further cycles until the configuration changes
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(transport.requests().is_empty());

        controller
            .set_voltage_range(0, VoltageRange::MilliVolts500)
            .unwrap();
        assert!(is_unregistered(events.recv_timeout(EVENT_TIMEOUT).unwrap()));
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
        controller.stop();
    }

    #[test]
    fn test_detach_reports_and_idles() {
        let (controller, events) = spawn();
        controller.attach(Box::new(MockTransport::new())).unwrap();
        next_capture(&events);
        controller.detach().unwrap();

        let detached = events
            .iter()
            .any(|event| matches!(event, AcquisitionEvent::Detached));
        assert!(detached);
        let engine = controller.stop().unwrap();
        assert!(!engine.is_connected());
    }
}

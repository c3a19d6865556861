//! # Hantek DSO RS
//!
//! A Rust library for controlling Hantek DSO-6022 USB oscilloscopes and turning
//! their raw sample stream into calibrated voltages.
//!
//! The library does not talk to USB itself. Applications open the device with the
//! USB stack of their choice and hand it to the engine as a [`UsbTransport`];
//! everything above that (command encoding, calibration, time base selection,
//! sample conversion) lives here.
//!
//! ## Features
//!
//! - **Model registry**: DSO-6022BE and DSO-6022BL identities, matched by stock or running USB IDs
//! - **Calibration**: Per-channel, per-range gain and offset corrections loaded via `config`
//! - **Minimal reconfiguration**: Only control commands whose settings changed are resent
//! - **Background acquisition**: A dedicated thread fed over `crossbeam` channels
//! - **DataFrame output**: Captures convert to `polars` DataFrames with a time column
//!
//! ## Examples
//!
//! ### Building a Model
//!
//! ```rust
//! use hantek_dso_rs::{ModelRegistry, MemoryCalibration, ModelVariant, VoltageRange};
//!
//! let registry = ModelRegistry::new(&MemoryCalibration::new());
//! let model = registry.by_variant(ModelVariant::Dso6022Be).unwrap();
//!
//! let spec = model.specification();
//! println!("{} has {} channels", model.name(), spec.channels);
//! println!("1V range limit: {}", spec.voltage_limit[0][VoltageRange::MilliVolts1000.index()]);
//! ```
//!
//! ### Single Captures
//!
//! ```rust,ignore
//! use hantek_dso_rs::{AcquisitionEngine, FileCalibration, ModelRegistry, UsbId, VoltageRange};
//!
//! let calibration = FileCalibration::user_default()?;
//! let registry = ModelRegistry::new(&calibration);
//! let (model, _) = registry.find(UsbId::new(0x04b5, 0x6022)).ok_or("no scope")?;
//!
//! let mut engine = AcquisitionEngine::new(model);
//! engine.attach(Box::new(my_usb_handle));
//! engine.request_voltage_range(0, VoltageRange::MilliVolts500)?;
//! engine.request_time_per_div(1e-3)?;
//!
//! let capture = engine.run_cycle()?;
//! println!("{}", capture.to_dataframe()?);
//! ```
//!
//! ### Continuous Acquisition
//!
//! ```rust,ignore
//! use hantek_dso_rs::{AcquisitionEngine, AcquisitionEvent, AcquisitionLoop};
//!
//! let (controller, events) = AcquisitionLoop::spawn(AcquisitionEngine::new(model))?;
//! controller.attach(Box::new(my_usb_handle))?;
//! controller.set_channel_count(1)?;
//!
//! for event in events.iter().take(10) {
//!     if let AcquisitionEvent::Capture(capture) = event {
//!         println!("#{}: {} samples", capture.sequence, capture.len());
//!     }
//! }
//! let engine = controller.stop();
//! ```

pub mod acquisition;
pub mod acquisition_loop;
pub mod calibration;
pub mod control_command;
pub mod device_model;
pub mod specification;
pub mod transport;

// Re-export the main types for convenience
pub use specification::{
    Coupling, DeviceSpecification, FixedSampleRate, GainStep, SampleRateLimits, TriggerMode,
    VoltageRange,
};

pub use calibration::{
    CalibrationCategory, CalibrationError, CalibrationSection, CalibrationSource,
    FileCalibration, MemoryCalibration,
};

pub use device_model::{DeviceModel, IdentityMatch, ModelIdentity, ModelRegistry, ModelVariant, UsbId};

pub use control_command::{ControlCommand, ControlPayload};

pub use transport::{TransferError, UsbTransport, BULK_ENDPOINT_IN};

pub use acquisition::{
    AcquisitionEngine, AcquisitionError, AcquisitionSettings, Capture, ConfigError,
    MalformedCapture,
};

pub use acquisition_loop::{AcquisitionEvent, AcquisitionLoop, ControllerError, ScopeController};

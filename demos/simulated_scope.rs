// Simulated acquisition example
//
// Runs the background acquisition loop against a simulated DSO-6022BE that
// answers control requests and streams a sine wave, so the whole pipeline can
// be exercised without hardware.

use clap::Parser;
use hantek_dso_rs::{
    AcquisitionEngine, AcquisitionEvent, AcquisitionLoop, ControlPayload, FixedSampleRate,
    MemoryCalibration, ModelRegistry, ModelVariant, TransferError, UsbTransport, VoltageRange,
};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "simulated_scope")]
#[command(version = "1.0")]
#[command(about = "Acquire from a simulated DSO-6022BE")]
struct Args {
    /// Number of captures to take before stopping
    #[arg(short = 'n', long, default_value_t = 5)]
    captures: usize,

    /// Active channels (1 or 2)
    #[arg(short, long, default_value_t = 2)]
    channels: usize,

    /// Time base in seconds per division
    #[arg(short, long, default_value_t = 1e-3)]
    time_per_div: f64,

    /// Voltage range for both channels, e.g. 500mV
    #[arg(short, long, default_value = "1000mV")]
    range: String,

    /// Frequency of the simulated signal in Hz
    #[arg(short, long, default_value_t = 1000.0)]
    frequency: f64,

    /// Print the last capture as a table
    #[arg(long)]
    table: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Pretends to be a DSO-6022BE running its firmware.
struct SineScope {
    rates: Vec<FixedSampleRate>,
    frequency: f64,
    samplerate: f64,
    channels: usize,
    phase: f64,
}

impl SineScope {
    fn new(rates: &[FixedSampleRate], frequency: f64) -> Self {
        Self {
            rates: rates.to_vec(),
            frequency,
            samplerate: 1e6,
            channels: 2,
            phase: 0.0,
        }
    }
}

impl UsbTransport for SineScope {
    fn control_out(
        &mut self,
        payload: &ControlPayload,
        _timeout: Duration,
    ) -> Result<(), TransferError> {
        log::debug!("Control request {}", payload);
        let value = payload.data.first().copied().unwrap_or_default();
        match payload.request {
            0xe2 => {
                if let Some(rate) = self.rates.iter().find(|rate| rate.rate_id == value) {
                    self.samplerate = rate.hardware_samplerate();
                }
            }
            0xe4 => self.channels = usize::from(value.max(1)),
            _ => {}
        }
        Ok(())
    }

    fn bulk_in(
        &mut self,
        _endpoint: u8,
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        let step = TAU * self.frequency / self.samplerate;
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            let level = self.phase.sin();
            for channel in 0..self.channels {
                // second channel carries half the amplitude
                let amplitude = 100.0 / (channel + 1) as f64;
                data.push((128.0 + amplitude * level).round() as u8);
            }
            self.phase = (self.phase + step) % TAU;
        }
        data.truncate(length);
        Ok(data)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let Some(range) = VoltageRange::ALL
        .into_iter()
        .find(|range| range.as_str().eq_ignore_ascii_case(&args.range))
    else {
        eprintln!("Invalid voltage range: {}", args.range);
        std::process::exit(1);
    };

    let registry = ModelRegistry::new(&MemoryCalibration::new());
    let model = registry
        .by_variant(ModelVariant::Dso6022Be)
        .ok_or("DSO-6022BE is not registered")?;

    println!("Simulated {}", model.name());
    println!("=====================");
    println!("Channels: {}", args.channels);
    println!("Time base: {}s/div", args.time_per_div);
    println!("Range: {}", range);
    println!("Signal: {}Hz sine\n", args.frequency);

    let engine = AcquisitionEngine::new(Arc::clone(&model));
    let (controller, events) = AcquisitionLoop::spawn(engine)?;
    controller.set_channel_count(args.channels)?;
    controller.set_time_per_div(args.time_per_div)?;
    for channel in 0..args.channels {
        controller.set_voltage_range(channel, range)?;
    }
    let scope = SineScope::new(&model.specification().fixed_sample_rates, args.frequency);
    controller.attach(Box::new(scope))?;

    let mut received = 0;
    let mut last = None;
    for event in &events {
        match event {
            AcquisitionEvent::Capture(capture) => {
                print!(
                    "#{:<3} {} samples @ {}S/s",
                    capture.sequence,
                    capture.len(),
                    capture.settings.samplerate.samplerate
                );
                for (channel, values) in capture.channels.iter().enumerate() {
                    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    print!("  ch{}: {:+.3}V..{:+.3}V", channel + 1, min, max);
                }
                println!();
                last = Some(capture);
                received += 1;
                if received >= args.captures {
                    break;
                }
            }
            AcquisitionEvent::Fault(e) => {
                eprintln!("Acquisition fault: {}", e);
                break;
            }
            AcquisitionEvent::Detached | AcquisitionEvent::Stopped => break,
        }
    }

    let engine = controller.stop();
    if let Some(engine) = engine {
        println!("\nStopped after {} captures", engine.sequence());
    }

    if args.table {
        if let Some(capture) = last {
            println!("{}", capture.to_dataframe()?.head(Some(10)));
        }
    }

    Ok(())
}

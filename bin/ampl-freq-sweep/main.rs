use clap::Parser;
use env_logger::Env;
use log::{error, info, LevelFilter};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use visa_rs::DefaultRM;

use rusty_lockin::{
    load_config_or_default, timestamped_stem, write_settings_json, AppConfig, InstrumentConfig,
    InstrumentModel, Ladder, LockinError, LockinInterface, PointLog, ReferenceSource, Sr830,
    Sr860, SweepDriver, SweepOptions, SweepPoint, TerminalView,
};

#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStrExt;

/// Lock-in Amplitude/Frequency Sweep Tool
#[derive(Parser, Debug)]
#[command(name = "ampl-freq-sweep")]
#[command(about = "Automated response sweeps for SR830/SR860 lock-in amplifiers", long_about = None)]
struct Args {
    /// Path to configuration file (falls back to config.toml when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Select the instrument by serial number
    #[arg(short, long, value_name = "SERIAL")]
    serial: Option<String>,

    /// Report the grid and duration estimate without touching hardware
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Windows-specific: Allocate console if launched from GUI
    #[cfg(windows)]
    ensure_console_allocated();

    // Parse arguments and load configuration
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref());

    // Initialize logging
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level)?;

    apply_overrides(&mut config, &args);
    config.validate()?;
    log_startup_info(&config, args.config.as_deref());

    let options = SweepOptions::from_config(&config);
    if args.dry_run {
        return report_plan(&config, &options);
    }

    // Connect and apply the settings the sweep math relies on
    let rm = DefaultRM::new()?;
    let mut instrument = connect_instrument(&rm, &config.instrument)?;
    apply_sweep_settings(instrument.as_mut(), &config)?;

    // Run with graceful shutdown support
    let shutdown_flag = setup_shutdown_handler();
    let driver = SweepDriver::new(options).with_cancel(shutdown_flag.clone());
    run_and_report(driver, instrument.as_mut(), &config)
}

// Helper Functions

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Lock-in Sweep Tool ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults (no file given)"),
    }
    info!("Instrument: {:?}", config.instrument.model);
    if let Some(ref serial) = config.instrument.serial {
        info!("Serial: {}", serial);
    }
    if let Some(ref resource) = config.instrument.resource {
        info!("Resource: {}", resource);
    }
    info!(
        "Amplitude: {:.3e} V to {:.3e} V, {} points, {} repeats",
        config.sweep.amplitude_min,
        config.sweep.amplitude_max,
        config.sweep.amplitude_points,
        config.sweep.amplitude_repeats
    );
    info!(
        "Frequency: {:.3e} Hz to {:.3e} Hz, {} points, {} repeats",
        config.sweep.frequency_min,
        config.sweep.frequency_max,
        config.sweep.frequency_points,
        config.sweep.frequency_repeats
    );
    info!("Output directory: {}", config.output.directory);
}

/// Apply command-line overrides to the loaded configuration
fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(ref output) = args.output {
        config.output.directory = output.display().to_string();
    }
    if let Some(ref serial) = args.serial {
        config.instrument.serial = Some(serial.clone());
    }
}

/// Print the grid dimensions and settle-time estimate, no hardware needed
fn report_plan(
    config: &AppConfig,
    options: &SweepOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Grid: {} amplitudes x {} frequencies, {} points total",
        options.amplitudes.len(),
        options.frequencies.len(),
        options.grid_points()
    );
    let driver = SweepDriver::new(options.clone());
    let estimate = driver.estimate_duration(time_constant_table(config.instrument.model))?;
    info!(
        "Estimated duration: {:.0} s (settle waits only)",
        estimate.as_secs_f64()
    );
    Ok(())
}

fn time_constant_table(model: InstrumentModel) -> Ladder {
    match model {
        InstrumentModel::Sr830 => Ladder::new(rusty_lockin::instrument::sr830::TIME_CONSTANT),
        InstrumentModel::Sr860 => Ladder::new(rusty_lockin::instrument::sr860::TIME_CONSTANT),
    }
}

/// Open the configured instrument, by resource string or bus discovery
fn connect_instrument(
    rm: &DefaultRM,
    config: &InstrumentConfig,
) -> Result<Box<dyn LockinInterface>, Box<dyn std::error::Error>> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let instrument: Box<dyn LockinInterface> = match config.model {
        InstrumentModel::Sr830 => {
            let lockin = match &config.resource {
                Some(resource) => Sr830::open(rm, resource, timeout)?,
                None => Sr830::find(rm, config.serial.as_deref(), timeout)?,
            };
            Box::new(lockin)
        }
        InstrumentModel::Sr860 => {
            let mut lockin = match &config.resource {
                Some(resource) => Sr860::open(rm, resource, timeout)?,
                None => Sr860::find(rm, config.serial.as_deref(), timeout)?,
            };
            lockin.set_advanced_filter(config.advanced_filter)?;
            if let Some(impedance) = config.reference_impedance {
                lockin.set_reference_impedance(impedance)?;
            }
            Box::new(lockin)
        }
    };
    info!("Connected to {}", instrument.name());
    Ok(instrument)
}

/// Program the settings the settle-time math assumes: internal reference,
/// detection at the fundamental, the configured filter slope
fn apply_sweep_settings(
    instrument: &mut dyn LockinInterface,
    config: &AppConfig,
) -> Result<(), LockinError> {
    instrument.set_reference_source(ReferenceSource::Internal)?;
    instrument.set_detection_harmonic(1)?;
    instrument.set_filter_slope(config.settle.slope)?;
    Ok(())
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current wait...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    shutdown_flag
}

/// Run the sweep and report results
fn run_and_report(
    driver: SweepDriver,
    instrument: &mut dyn LockinInterface,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = PathBuf::from(&config.output.directory);
    fs::create_dir_all(&output_dir)?;
    let stem = match &config.output.stem {
        Some(stem) => stem.clone(),
        None => timestamped_stem("sweep"),
    };
    let base = output_dir.join(&stem);

    let mut view = TerminalView::new();
    let mut point_log = if config.output.point_log {
        Some(PointLog::<SweepPoint>::new(
            &base,
            config.output.log_buffer_size,
            config.output.finalize_log_as_json,
        ))
    } else {
        None
    };

    info!("Starting sweep...");
    match driver.run(instrument, &mut view, point_log.as_mut()) {
        Ok(table) => {
            table.export(&base)?;
            info!(
                "Results written to {}.txt and {}.dat",
                base.display(),
                base.display()
            );
            if config.output.write_settings {
                let settings_path = output_dir.join(format!("{stem}_settings.json"));
                write_settings_json(&settings_path, config)?;
                info!("Settings snapshot written to {}", settings_path.display());
            }
            info!("✓ Sweep completed: {} points", table.len());
            Ok(())
        }
        Err(LockinError::Cancelled) => {
            if let Some(ref log) = point_log {
                info!("Collected points remain in {}", log.path().display());
            }
            info!("✓ Sweep stopped by user");
            Ok(())
        }
        Err(e) => {
            error!("✗ Sweep failed: {}", e);
            Err(e.into())
        }
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

/// Windows-specific: Allocate console if running from GUI
#[cfg(windows)]
fn ensure_console_allocated() {
    unsafe {
        // Try to allocate a new console
        if winapi::um::consoleapi::AllocConsole() != 0 {
            // Successfully allocated new console
            println!("Console allocated for sweep tool");
        }

        // Set console title
        let title = "Lock-in Sweep Tool";
        let wide_title: Vec<u16> = OsString::from(title)
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        winapi::um::wincon::SetConsoleTitleW(wide_title.as_ptr());

        // Enable ANSI escape sequences for colored output (Windows 10+)
        let stdout_handle =
            winapi::um::processenv::GetStdHandle(winapi::um::winbase::STD_OUTPUT_HANDLE);
        if stdout_handle != winapi::um::handleapi::INVALID_HANDLE_VALUE {
            let mut mode: u32 = 0;
            if winapi::um::consoleapi::GetConsoleMode(stdout_handle, &mut mode) != 0 {
                mode |= winapi::um::wincon::ENABLE_VIRTUAL_TERMINAL_PROCESSING;
                winapi::um::consoleapi::SetConsoleMode(stdout_handle, mode);
            }
        }
    }
}

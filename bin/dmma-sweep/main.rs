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
    load_config_or_default, timestamped_stem, write_settings_json, AppConfig, DualGridData,
    DualGridOptions, InputConfig, InputCoupling, InstrumentConfig, InstrumentModel, LockinError,
    LockinInterface, PointLog, ReferenceSource, ReferenceTrigger, Sr830, Sr860, SweepDriver,
    SweepOptions, SweepPoint, TerminalView,
};

#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStrExt;

/// Dynamic Mechanical Measurement Tool
///
/// Drives two lock-ins over a shared TTL reference: the source excites the
/// sample and reads the displacement channel, the follower reads the force
/// channel. The grid is covered twice, amplitude-major and frequency-major.
#[derive(Parser, Debug)]
#[command(name = "dmma-sweep")]
#[command(about = "Dual lock-in displacement/force grids", long_about = None)]
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

    if let Some(ref output) = args.output {
        config.output.directory = output.display().to_string();
    }
    config.validate()?;
    let follower_config = config.follower.clone().ok_or_else(|| {
        LockinError::Config("dual sweep needs a [follower] instrument section".to_string())
    })?;
    log_startup_info(&config, args.config.as_deref());

    // Connect both instruments and wire up the shared reference
    let rm = DefaultRM::new()?;
    let mut source = connect_instrument(&rm, &config.instrument)?;
    let mut follower = connect_instrument(&rm, &follower_config)?;
    apply_dmma_settings(source.as_mut(), follower.as_mut(), &config)?;

    // Run with graceful shutdown support
    let shutdown_flag = setup_shutdown_handler();
    let driver =
        SweepDriver::new(SweepOptions::from_config(&config)).with_cancel(shutdown_flag.clone());
    let dual = DualGridOptions::from_config(&config);
    run_and_report(driver, source.as_mut(), follower.as_mut(), &dual, &config)
}

// Helper Functions

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Dynamic Mechanical Measurement Tool ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults (no file given)"),
    }
    info!("Source: {:?}", config.instrument.model);
    if let Some(ref follower) = config.follower {
        info!("Follower: {:?}", follower.model);
    }
    info!(
        "Amplitude: {:.3e} V to {:.3e} V",
        config.sweep.amplitude_min, config.sweep.amplitude_max
    );
    info!(
        "Frequency: {:.3e} Hz to {:.3e} Hz",
        config.sweep.frequency_min, config.sweep.frequency_max
    );
    info!(
        "Passes: {}x{} amplitude-major, {}x{} frequency-major",
        config.sweep.dual.first_pass_amplitudes,
        config.sweep.dual.first_pass_frequencies,
        config.sweep.dual.second_pass_amplitudes,
        config.sweep.dual.second_pass_frequencies
    );
    info!("Output directory: {}", config.output.directory);
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

/// Program both instruments for a shared-reference measurement: the source
/// runs its internal oscillator, the follower locks to the source's TTL
/// sync output
fn apply_dmma_settings<'a>(
    source: &'a mut dyn LockinInterface,
    follower: &'a mut dyn LockinInterface,
    config: &AppConfig,
) -> Result<(), LockinError> {
    for lockin in [&mut *source, &mut *follower] {
        lockin.set_detection_harmonic(1)?;
        lockin.set_filter_slope(config.settle.slope)?;
        lockin.set_input_config(InputConfig::VoltageA)?;
        lockin.set_input_coupling(InputCoupling::Ac)?;
        lockin.set_sync_filter(true)?;
        lockin.set_reference_phase(0.0)?;
    }
    source.set_reference_source(ReferenceSource::Internal)?;
    follower.set_reference_source(ReferenceSource::External)?;
    follower.set_reference_trigger(ReferenceTrigger::PosTtl)?;
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

/// Run both passes and write one table per instrument per pass
fn run_and_report(
    driver: SweepDriver,
    source: &mut dyn LockinInterface,
    follower: &mut dyn LockinInterface,
    dual: &DualGridOptions,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = PathBuf::from(&config.output.directory);
    fs::create_dir_all(&output_dir)?;
    let stem = match &config.output.stem {
        Some(stem) => stem.clone(),
        None => timestamped_stem("dmma"),
    };

    let mut view = TerminalView::new();
    let mut point_log = if config.output.point_log {
        Some(PointLog::<SweepPoint>::new(
            output_dir.join(&stem),
            config.output.log_buffer_size,
            config.output.finalize_log_as_json,
        ))
    } else {
        None
    };

    info!("Starting dual grid...");
    match driver.run_dual_grid(source, follower, dual, &mut view, point_log.as_mut()) {
        Ok(data) => {
            export_tables(&data, &output_dir, &stem)?;
            if config.output.write_settings {
                let settings_path = output_dir.join(format!("{stem}_settings.json"));
                write_settings_json(&settings_path, config)?;
                info!("Settings snapshot written to {}", settings_path.display());
            }
            info!(
                "✓ Dual grid completed: {} + {} points",
                data.first_source.len(),
                data.second_source.len()
            );
            Ok(())
        }
        Err(LockinError::Cancelled) => {
            if let Some(ref log) = point_log {
                info!("Collected source points remain in {}", log.path().display());
            }
            info!("✓ Dual grid stopped by user");
            Ok(())
        }
        Err(e) => {
            error!("✗ Dual grid failed: {}", e);
            Err(e.into())
        }
    }
}

/// Write the four result tables: pass a/b, displacement (source) and force
/// (follower) channels
fn export_tables(
    data: &DualGridData,
    output_dir: &Path,
    stem: &str,
) -> Result<(), LockinError> {
    data.first_source
        .export(output_dir.join(format!("{stem}_a_displ")))?;
    data.first_follower
        .export(output_dir.join(format!("{stem}_a_force")))?;
    data.second_source
        .export(output_dir.join(format!("{stem}_b_displ")))?;
    data.second_follower
        .export(output_dir.join(format!("{stem}_b_force")))?;
    info!("Results written to {}", output_dir.join(stem).display());
    Ok(())
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
            println!("Console allocated for measurement tool");
        }

        // Set console title
        let title = "Dynamic Mechanical Measurement Tool";
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

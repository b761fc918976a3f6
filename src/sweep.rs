//! Amplitude/frequency sweep drivers.
//!
//! A sweep walks a row-major grid of drive amplitudes and reference
//! frequencies, settling and auto-ranging at each cell before the reading
//! is recorded. The dual-instrument variant drives a source lock-in and a
//! follower synchronized over a TTL reference, covering the grid twice:
//! once amplitude-major, once frequency-major.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use crate::autorange::{read_validated, RangeOptions, WINDOW_CEILING_FRACTION, WINDOW_FLOOR_FRACTION};
use crate::config::AppConfig;
use crate::error::LockinError;
use crate::export::ResultTable;
use crate::instrument::LockinInterface;
use crate::ladder::Ladder;
use crate::logger::PointLog;
use crate::plotting::SweepView;
use crate::settle::{required_settle_time, select_time_constants, SettleRequest};
use crate::types::{FilterSlope, SweepPoint};
use crate::utils::{linspace, logspace, poll_consecutive, sleep_cancellable, PollError};

/// Extra wait after a time-constant change and after the first excitation
/// step of a pass, covering the large output transient both cause.
pub const STEP_CHANGE_EXTRA: Duration = Duration::from_millis(2000);

/// Consecutive locked polls required before a recovered phase lock is
/// trusted.
pub const LOCK_POLLS_REQUIRED: usize = 5;

/// Interval between phase-lock polls.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Everything a sweep needs besides the instruments themselves.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Drive amplitudes in volts, in sweep order.
    pub amplitudes: Vec<f64>,
    /// Reference frequencies in hertz, in sweep order.
    pub frequencies: Vec<f64>,
    pub amplitude_repeats: usize,
    pub frequency_repeats: usize,
    /// Pick time constants from the excitation instead of a fixed wait.
    pub auto_time_constant: bool,
    /// Wait per point when `auto_time_constant` is off.
    pub fixed_wait: Duration,
    /// Extra transient wait; see [`STEP_CHANGE_EXTRA`].
    pub extra_settle: Duration,
    /// Harmonic rejection demanded at the smallest amplitude, positive dB.
    pub attenuation_min_db: f64,
    /// Rejection cap reached at large amplitudes, positive dB.
    pub attenuation_max_db: f64,
    pub slope: FilterSlope,
    /// Settle multiplier override; `None` uses the slope's own factor.
    pub wait_factor: Option<f64>,
    /// Signal-to-dc separation for dc-coupled inputs; `None` means ac.
    pub signal_to_dc_db: Option<f64>,
    pub auto_sensitivity: bool,
    pub max_range_adjustments: usize,
    pub window_floor: f64,
    pub window_ceiling: f64,
    /// Readings averaged per grid point; 1 records single shots.
    pub samples_per_point: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        SweepOptions {
            amplitudes: Vec::new(),
            frequencies: Vec::new(),
            amplitude_repeats: 1,
            frequency_repeats: 1,
            auto_time_constant: true,
            fixed_wait: Duration::from_secs(1),
            extra_settle: STEP_CHANGE_EXTRA,
            attenuation_min_db: 80.0,
            attenuation_max_db: 160.0,
            slope: FilterSlope::Db24,
            wait_factor: None,
            signal_to_dc_db: None,
            auto_sensitivity: true,
            max_range_adjustments: 32,
            window_floor: WINDOW_FLOOR_FRACTION,
            window_ceiling: WINDOW_CEILING_FRACTION,
            samples_per_point: 1,
        }
    }
}

impl SweepOptions {
    /// Options derived from a loaded configuration, grids included.
    pub fn from_config(config: &AppConfig) -> Self {
        let sweep = &config.sweep;
        let space: fn(f64, f64, usize) -> Vec<f64> =
            if sweep.log_spacing { logspace } else { linspace };
        SweepOptions {
            amplitudes: space(
                sweep.amplitude_min,
                sweep.amplitude_max,
                sweep.amplitude_points,
            ),
            frequencies: space(
                sweep.frequency_min,
                sweep.frequency_max,
                sweep.frequency_points,
            ),
            amplitude_repeats: sweep.amplitude_repeats,
            frequency_repeats: sweep.frequency_repeats,
            auto_time_constant: config.settle.auto_time_constant,
            fixed_wait: Duration::from_millis(config.settle.fixed_wait_ms),
            extra_settle: STEP_CHANGE_EXTRA,
            attenuation_min_db: config.settle.attenuation_min_db,
            attenuation_max_db: config.settle.attenuation_max_db,
            slope: config.settle.slope,
            wait_factor: config.settle.wait_factor,
            signal_to_dc_db: config.settle.signal_to_dc_db,
            auto_sensitivity: config.ranging.auto_sensitivity,
            max_range_adjustments: config.ranging.max_adjustments,
            window_floor: config.ranging.window_floor,
            window_ceiling: config.ranging.window_ceiling,
            samples_per_point: config.averaging.samples,
        }
    }

    /// Total number of recorded points, repeats included.
    pub fn grid_points(&self) -> usize {
        self.amplitudes.len()
            * self.amplitude_repeats
            * self.frequencies.len()
            * self.frequency_repeats
    }

    fn min_amplitude(&self) -> f64 {
        self.amplitudes
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    fn min_frequency(&self) -> f64 {
        self.frequencies
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    fn settle_request(&self, amplitude: f64, frequency: f64, min_amplitude: f64) -> SettleRequest {
        SettleRequest {
            amplitude,
            min_amplitude,
            frequency,
            atten_min_db: self.attenuation_min_db,
            atten_max_db: self.attenuation_max_db,
            slope: self.slope,
            signal_to_dc_db: self.signal_to_dc_db,
            wait_factor: self.wait_factor,
        }
    }

    fn range_options(&self) -> RangeOptions {
        RangeOptions {
            enabled: self.auto_sensitivity,
            max_adjustments: self.max_range_adjustments,
            floor_fraction: self.window_floor,
            ceiling_fraction: self.window_ceiling,
        }
    }

    fn validate_grids(&self) -> Result<(), LockinError> {
        if self.amplitudes.is_empty() || self.frequencies.is_empty() {
            return Err(LockinError::Config(
                "sweep grids need at least one value per axis".to_string(),
            ));
        }
        if self.amplitude_repeats == 0 || self.frequency_repeats == 0 {
            return Err(LockinError::Config(
                "repeat counts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Grid limits and point counts for the two passes of a dual-instrument
/// run. Acquisition behavior (settling, ranging, averaging) comes from the
/// driver's [`SweepOptions`].
#[derive(Debug, Clone)]
pub struct DualGridOptions {
    pub amplitude_limits: (f64, f64),
    pub frequency_limits: (f64, f64),
    /// (amplitude points, frequency points) of the amplitude-major pass.
    pub first_pass: (usize, usize),
    /// (amplitude points, frequency points) of the frequency-major pass.
    pub second_pass: (usize, usize),
    pub log_spacing: bool,
}

impl DualGridOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let sweep = &config.sweep;
        DualGridOptions {
            amplitude_limits: (sweep.amplitude_min, sweep.amplitude_max),
            frequency_limits: (sweep.frequency_min, sweep.frequency_max),
            first_pass: (
                sweep.dual.first_pass_amplitudes,
                sweep.dual.first_pass_frequencies,
            ),
            second_pass: (
                sweep.dual.second_pass_amplitudes,
                sweep.dual.second_pass_frequencies,
            ),
            log_spacing: sweep.log_spacing,
        }
    }

    fn validate(&self) -> Result<(), LockinError> {
        if !(self.amplitude_limits.0 > 0.0) || self.amplitude_limits.1 < self.amplitude_limits.0 {
            return Err(LockinError::Config(format!(
                "amplitude limits {:?} are not a positive interval",
                self.amplitude_limits
            )));
        }
        if !(self.frequency_limits.0 > 0.0) || self.frequency_limits.1 < self.frequency_limits.0 {
            return Err(LockinError::Config(format!(
                "frequency limits {:?} are not a positive interval",
                self.frequency_limits
            )));
        }
        if self.first_pass.0 == 0
            || self.first_pass.1 == 0
            || self.second_pass.0 == 0
            || self.second_pass.1 == 0
        {
            return Err(LockinError::Config(
                "dual grid passes need at least one point per axis".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tables collected by [`SweepDriver::run_dual_grid`], one per instrument
/// per pass.
#[derive(Debug, Default)]
pub struct DualGridData {
    pub first_source: ResultTable,
    pub first_follower: ResultTable,
    pub second_source: ResultTable,
    pub second_follower: ResultTable,
}

#[derive(Clone, Copy)]
enum GridOrder {
    AmplitudeMajor,
    FrequencyMajor,
}

pub struct SweepDriver {
    pub options: SweepOptions,
    cancel: Option<Arc<AtomicBool>>,
}

impl SweepDriver {
    pub fn new(options: SweepOptions) -> Self {
        SweepDriver {
            options,
            cancel: None,
        }
    }

    /// Attach a flag that aborts the sweep between points and during waits.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Sweep one instrument over the configured grid.
    ///
    /// Afterwards the excitation is parked at the smallest grid values and
    /// the sensitivity the operator had set going in is put back, also when
    /// the sweep was cancelled or failed.
    pub fn run(
        &self,
        instrument: &mut dyn LockinInterface,
        view: &mut dyn SweepView,
        mut point_log: Option<&mut PointLog<SweepPoint>>,
    ) -> Result<ResultTable, LockinError> {
        self.options.validate_grids()?;
        let saved_sensitivity = if self.options.auto_sensitivity {
            Some(instrument.sensitivity_index()?)
        } else {
            None
        };
        if self.options.auto_time_constant {
            let estimate = self.estimate_duration(instrument.time_constant_ladder())?;
            info!(
                "Sweep started on {}: {} amplitudes x {} frequencies, estimated {:.0} s",
                instrument.name(),
                self.options.amplitudes.len(),
                self.options.frequencies.len(),
                estimate.as_secs_f64()
            );
        } else {
            info!(
                "Sweep started on {}: {} amplitudes x {} frequencies, fixed {:?} per point",
                instrument.name(),
                self.options.amplitudes.len(),
                self.options.frequencies.len(),
                self.options.fixed_wait
            );
        }

        let result = self.run_grid(&mut *instrument, view, point_log.as_deref_mut());
        let parked = self.restore(&mut *instrument, saved_sensitivity);
        match (result, parked) {
            (Ok(table), Ok(())) => {
                view.finish();
                if let Some(log) = point_log.as_deref_mut() {
                    log.flush()?;
                }
                info!("Sweep finished: {} points", table.len());
                Ok(table)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(park_err)) => {
                warn!("Parking failed while aborting: {}", park_err);
                Err(e)
            }
        }
    }

    fn run_grid(
        &self,
        instrument: &mut dyn LockinInterface,
        view: &mut dyn SweepView,
        mut point_log: Option<&mut PointLog<SweepPoint>>,
    ) -> Result<ResultTable, LockinError> {
        let options = &self.options;
        let min_amplitude = options.min_amplitude();
        let mut table = ResultTable::with_capacity(options.grid_points());

        for _ in 0..options.amplitude_repeats {
            for &amplitude in &options.amplitudes {
                self.check_cancelled()?;
                let amplitude_actual = instrument.set_reference_amplitude(amplitude)?;
                // Converged sensitivity of the first pass, reused as the
                // starting point of inner repeats
                let mut initial_sens: Option<i32> = None;
                for repeat_f in 0..options.frequency_repeats {
                    if repeat_f > 0 && options.auto_sensitivity {
                        if let Some(index) = initial_sens {
                            debug!("Restoring sensitivity index {} for repeat", index);
                            instrument.set_sensitivity_index(index)?;
                        }
                    }
                    for (i_f, &frequency) in options.frequencies.iter().enumerate() {
                        self.check_cancelled()?;
                        let frequency_actual = instrument.set_reference_frequency(frequency)?;

                        let wait = self.point_wait(&mut *instrument, amplitude, frequency, min_amplitude)?;
                        let extra = if i_f == 0 {
                            options.extra_settle
                        } else {
                            Duration::ZERO
                        };
                        self.wait(wait + extra)?;

                        let reading = {
                            let mut group: [&mut dyn LockinInterface; 1] = [&mut *instrument];
                            self.measure(&mut group, wait)?.remove(0)
                        };
                        if options.auto_sensitivity && repeat_f == 0 && i_f == 0 {
                            initial_sens = Some(instrument.sensitivity_index()?);
                        }

                        let point = SweepPoint {
                            amplitude_setpoint: amplitude,
                            amplitude_actual,
                            frequency_setpoint: frequency,
                            frequency_actual,
                            magnitude: reading.0,
                            phase: reading.1,
                            stddev: reading.2,
                        };
                        debug!(
                            "({:.4e} V, {:.4e} Hz) -> {:.4e} V at {:.2} deg",
                            amplitude, frequency, point.magnitude, point.phase
                        );
                        table.append(point);
                        view.update_point(&point);
                        if let Some(log) = point_log.as_deref_mut() {
                            log.append(point)?;
                        }
                    }
                }
            }
        }
        Ok(table)
    }

    /// Drive both instruments over the grid twice: amplitude-major, then
    /// frequency-major with its own point counts.
    ///
    /// `source` runs the internal oscillator and sets the excitation;
    /// `follower` tracks it over the external reference and must hold phase
    /// lock before a reading counts.
    pub fn run_dual_grid(
        &self,
        source: &mut dyn LockinInterface,
        follower: &mut dyn LockinInterface,
        dual: &DualGridOptions,
        view: &mut dyn SweepView,
        mut point_log: Option<&mut PointLog<SweepPoint>>,
    ) -> Result<DualGridData, LockinError> {
        dual.validate()?;
        info!(
            "Dual grid started on {} + {}: passes {}x{} and {}x{}",
            source.name(),
            follower.name(),
            dual.first_pass.0,
            dual.first_pass.1,
            dual.second_pass.0,
            dual.second_pass.1
        );

        let result = self.dual_passes(
            &mut *source,
            &mut *follower,
            dual,
            view,
            point_log.as_deref_mut(),
        );
        let parked = self.park(&mut *source, dual.amplitude_limits.0, dual.frequency_limits.0);
        match (result, parked) {
            (Ok(data), Ok(())) => {
                view.finish();
                if let Some(log) = point_log.as_deref_mut() {
                    log.flush()?;
                }
                info!(
                    "Dual grid finished: {} + {} points",
                    data.first_source.len(),
                    data.second_source.len()
                );
                Ok(data)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(park_err)) => {
                warn!("Parking failed while aborting: {}", park_err);
                Err(e)
            }
        }
    }

    fn dual_passes(
        &self,
        source: &mut dyn LockinInterface,
        follower: &mut dyn LockinInterface,
        dual: &DualGridOptions,
        view: &mut dyn SweepView,
        mut point_log: Option<&mut PointLog<SweepPoint>>,
    ) -> Result<DualGridData, LockinError> {
        let space: fn(f64, f64, usize) -> Vec<f64> =
            if dual.log_spacing { logspace } else { linspace };
        let min_amplitude = dual.amplitude_limits.0;

        let amplitudes = space(
            dual.amplitude_limits.0,
            dual.amplitude_limits.1,
            dual.first_pass.0,
        );
        let frequencies = space(
            dual.frequency_limits.0,
            dual.frequency_limits.1,
            dual.first_pass.1,
        );
        let (first_source, first_follower) = self.run_dual_pass(
            &mut *source,
            &mut *follower,
            &amplitudes,
            &frequencies,
            GridOrder::AmplitudeMajor,
            min_amplitude,
            view,
            point_log.as_deref_mut(),
        )?;

        let amplitudes = space(
            dual.amplitude_limits.0,
            dual.amplitude_limits.1,
            dual.second_pass.0,
        );
        let frequencies = space(
            dual.frequency_limits.0,
            dual.frequency_limits.1,
            dual.second_pass.1,
        );
        let (second_source, second_follower) = self.run_dual_pass(
            &mut *source,
            &mut *follower,
            &amplitudes,
            &frequencies,
            GridOrder::FrequencyMajor,
            min_amplitude,
            view,
            point_log.as_deref_mut(),
        )?;

        Ok(DualGridData {
            first_source,
            first_follower,
            second_source,
            second_follower,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_dual_pass(
        &self,
        source: &mut dyn LockinInterface,
        follower: &mut dyn LockinInterface,
        amplitudes: &[f64],
        frequencies: &[f64],
        order: GridOrder,
        min_amplitude: f64,
        view: &mut dyn SweepView,
        mut point_log: Option<&mut PointLog<SweepPoint>>,
    ) -> Result<(ResultTable, ResultTable), LockinError> {
        let options = &self.options;
        let cells: Vec<(f64, f64)> = match order {
            GridOrder::AmplitudeMajor => amplitudes
                .iter()
                .flat_map(|&a| frequencies.iter().map(move |&f| (a, f)))
                .collect(),
            GridOrder::FrequencyMajor => frequencies
                .iter()
                .flat_map(|&f| amplitudes.iter().map(move |&a| (a, f)))
                .collect(),
        };

        let mut source_table = ResultTable::with_capacity(cells.len());
        let mut follower_table = ResultTable::with_capacity(cells.len());
        let mut last_amplitude = f64::NAN;
        let mut last_frequency = f64::NAN;
        let mut amplitude_actual = f64::NAN;
        let mut frequency_actual = f64::NAN;
        let mut first_point = true;

        for (amplitude, frequency) in cells {
            self.check_cancelled()?;
            if amplitude != last_amplitude {
                amplitude_actual = source.set_reference_amplitude(amplitude)?;
                last_amplitude = amplitude;
            }
            if frequency != last_frequency {
                frequency_actual = source.set_reference_frequency(frequency)?;
                last_frequency = frequency;
            }

            let wait = if options.auto_time_constant {
                let request = options.settle_request(amplitude, frequency, min_amplitude);
                let outcome = {
                    let mut group: [&mut dyn LockinInterface; 2] =
                        [&mut *source, &mut *follower];
                    select_time_constants(&mut group, &request)?
                };
                if outcome.time_constant_changed {
                    self.wait(options.extra_settle)?;
                }
                outcome.wait
            } else {
                options.fixed_wait
            };

            if follower.is_phase_lock_unlocked()? {
                debug!("{} unlocked, waiting for a stable lock", follower.name());
                self.await_lock(&mut *follower)?;
            }

            let extra = if first_point {
                options.extra_settle
            } else {
                Duration::ZERO
            };
            first_point = false;
            self.wait(wait + extra)?;

            let readings = {
                let mut group: [&mut dyn LockinInterface; 2] = [&mut *source, &mut *follower];
                self.measure(&mut group, wait)?
            };
            let source_point = SweepPoint {
                amplitude_setpoint: amplitude,
                amplitude_actual,
                frequency_setpoint: frequency,
                frequency_actual,
                magnitude: readings[0].0,
                phase: readings[0].1,
                stddev: readings[0].2,
            };
            let follower_point = SweepPoint {
                magnitude: readings[1].0,
                phase: readings[1].1,
                stddev: readings[1].2,
                ..source_point
            };
            source_table.append(source_point);
            follower_table.append(follower_point);
            view.update_point(&source_point);
            if let Some(log) = point_log.as_deref_mut() {
                log.append(source_point)?;
            }
        }
        Ok((source_table, follower_table))
    }

    /// Predicted wall-clock duration of the configured single-instrument
    /// sweep against the given time-constant table.
    ///
    /// Counts per-point settle waits, the transient wait after each
    /// time-constant change and at the start of every pass. Auto-ranging
    /// and averaging time are not included.
    pub fn estimate_duration(&self, time_constants: Ladder) -> Result<Duration, LockinError> {
        let options = &self.options;
        let min_amplitude = options.min_amplitude();
        let mut total = Duration::ZERO;
        let mut prev_index: Option<usize> = None;

        for _ in 0..options.amplitude_repeats {
            for &amplitude in &options.amplitudes {
                for _ in 0..options.frequency_repeats {
                    for (i_f, &frequency) in options.frequencies.iter().enumerate() {
                        let wait = if options.auto_time_constant {
                            let request =
                                options.settle_request(amplitude, frequency, min_amplitude);
                            let tau = required_settle_time(&request)?;
                            let index = time_constants.smallest_at_least(tau)?;
                            if prev_index != Some(index) {
                                total += options.extra_settle;
                            }
                            prev_index = Some(index);
                            let factor = options
                                .wait_factor
                                .unwrap_or_else(|| options.slope.wait_factor());
                            Duration::from_secs_f64(factor * time_constants.values()[index])
                        } else {
                            options.fixed_wait
                        };
                        total += wait;
                        if i_f == 0 {
                            total += options.extra_settle;
                        }
                    }
                }
            }
        }
        Ok(total)
    }

    fn point_wait(
        &self,
        instrument: &mut dyn LockinInterface,
        amplitude: f64,
        frequency: f64,
        min_amplitude: f64,
    ) -> Result<Duration, LockinError> {
        if !self.options.auto_time_constant {
            return Ok(self.options.fixed_wait);
        }
        let request = self
            .options
            .settle_request(amplitude, frequency, min_amplitude);
        let outcome = {
            let mut group: [&mut dyn LockinInterface; 1] = [&mut *instrument];
            select_time_constants(&mut group, &request)?
        };
        if outcome.time_constant_changed {
            self.wait(self.options.extra_settle)?;
        }
        Ok(outcome.wait)
    }

    /// One validated, optionally averaged reading per instrument.
    fn measure(
        &self,
        instruments: &mut [&mut dyn LockinInterface],
        settle_wait: Duration,
    ) -> Result<Vec<(f64, f64, Option<f64>)>, LockinError> {
        let first = read_validated(
            instruments,
            &self.options.range_options(),
            settle_wait,
            self.cancel_ref(),
        )?;
        let samples = self.options.samples_per_point.max(1);
        if samples == 1 {
            return Ok(first.into_iter().map(|(m, p)| (m, p, None)).collect());
        }

        // The validated reading doubles as the first averaging sample
        let mut history: Vec<Vec<(f64, f64)>> = first
            .iter()
            .map(|&reading| {
                let mut samples_for = Vec::with_capacity(samples);
                samples_for.push(reading);
                samples_for
            })
            .collect();
        for _ in 1..samples {
            for (i, instrument) in instruments.iter_mut().enumerate() {
                history[i].push(instrument.read_magnitude_phase()?);
            }
        }
        Ok(history
            .iter()
            .map(|collected| {
                let (magnitude, phase, stddev) = average_readings(collected);
                (magnitude, phase, Some(stddev))
            })
            .collect())
    }

    fn await_lock(&self, follower: &mut dyn LockinInterface) -> Result<(), LockinError> {
        poll_consecutive(
            || follower.is_phase_lock_unlocked().map(|unlocked| !unlocked),
            LOCK_POLLS_REQUIRED,
            LOCK_POLL_INTERVAL,
            None,
            self.cancel_ref(),
        )
        .map_err(|e| match e {
            PollError::Cancelled => LockinError::Cancelled,
            PollError::ConditionError(e) => e,
            PollError::Timeout => {
                LockinError::Config("phase-lock wait timed out".to_string())
            }
        })
    }

    /// Park the excitation at the grid minimum and put the sensitivity the
    /// operator had selected back.
    fn restore(
        &self,
        instrument: &mut dyn LockinInterface,
        saved_sensitivity: Option<i32>,
    ) -> Result<(), LockinError> {
        self.park(
            &mut *instrument,
            self.options.min_amplitude(),
            self.options.min_frequency(),
        )?;
        if let Some(index) = saved_sensitivity {
            instrument.set_sensitivity_index(index)?;
        }
        Ok(())
    }

    fn park(
        &self,
        instrument: &mut dyn LockinInterface,
        amplitude: f64,
        frequency: f64,
    ) -> Result<(), LockinError> {
        debug!(
            "Parking {} at {:.4e} V, {:.4e} Hz",
            instrument.name(),
            amplitude,
            frequency
        );
        instrument.set_reference_amplitude(amplitude)?;
        instrument.set_reference_frequency(frequency)?;
        Ok(())
    }

    fn cancel_ref(&self) -> Option<&AtomicBool> {
        self.cancel.as_deref()
    }

    fn check_cancelled(&self) -> Result<(), LockinError> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::SeqCst) {
                return Err(LockinError::Cancelled);
            }
        }
        Ok(())
    }

    fn wait(&self, duration: Duration) -> Result<(), LockinError> {
        if sleep_cancellable(duration, self.cancel_ref()) {
            Ok(())
        } else {
            Err(LockinError::Cancelled)
        }
    }
}

/// Complex-domain mean of `(magnitude, phase-in-degrees)` readings.
///
/// Returns the averaged magnitude and phase plus the standard deviation
/// around the mean in the complex plane.
pub fn average_readings(readings: &[(f64, f64)]) -> (f64, f64, f64) {
    if readings.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let n = readings.len() as f64;
    let complex: Vec<(f64, f64)> = readings
        .iter()
        .map(|&(magnitude, phase)| {
            let radians = phase.to_radians();
            (magnitude * radians.cos(), magnitude * radians.sin())
        })
        .collect();

    let mut re_mean = 0.0;
    let mut im_mean = 0.0;
    for &(re, im) in &complex {
        re_mean += re;
        im_mean += im;
    }
    re_mean /= n;
    im_mean /= n;

    let mut variance = 0.0;
    for &(re, im) in &complex {
        let dr = re - re_mean;
        let di = im - im_mean;
        variance += dr * dr + di * di;
    }
    variance /= n;

    let magnitude = (re_mean * re_mean + im_mean * im_mean).sqrt();
    let phase = im_mean.atan2(re_mean).to_degrees();
    (magnitude, phase, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockLockin;
    use crate::plotting::NullView;

    struct CountingView {
        points: usize,
        finishes: usize,
    }

    impl SweepView for CountingView {
        fn update_point(&mut self, _point: &SweepPoint) {
            self.points += 1;
        }

        fn finish(&mut self) {
            self.finishes += 1;
        }
    }

    fn fast_options(amplitudes: &[f64], frequencies: &[f64]) -> SweepOptions {
        SweepOptions {
            amplitudes: amplitudes.to_vec(),
            frequencies: frequencies.to_vec(),
            auto_time_constant: false,
            fixed_wait: Duration::ZERO,
            extra_settle: Duration::ZERO,
            auto_sensitivity: false,
            ..SweepOptions::default()
        }
    }

    fn setpoints(table: &ResultTable) -> Vec<(f64, f64)> {
        table
            .points()
            .iter()
            .map(|p| (p.amplitude_setpoint, p.frequency_setpoint))
            .collect()
    }

    #[test]
    fn grid_rows_are_amplitude_major() {
        let mut mock = MockLockin::sr830_like(5e-4);
        mock.sens_index = 17;
        let driver = SweepDriver::new(fast_options(&[1.0, 2.0], &[10.0, 20.0]));
        let table = driver.run(&mut mock, &mut NullView, None).unwrap();
        assert_eq!(
            setpoints(&table),
            vec![(1.0, 10.0), (1.0, 20.0), (2.0, 10.0), (2.0, 20.0)]
        );
        // One amplitude write per row, then parking at the grid minimum
        assert_eq!(mock.amplitude_writes, vec![1.0, 2.0, 1.0]);
        assert_eq!(mock.frequency_writes, vec![10.0, 20.0, 10.0, 20.0, 10.0]);
    }

    #[test]
    fn frequency_repeats_rerun_the_inner_pass() {
        let mut mock = MockLockin::sr830_like(5e-4);
        mock.sens_index = 17;
        let mut options = fast_options(&[1.0], &[10.0, 20.0]);
        options.frequency_repeats = 2;
        let driver = SweepDriver::new(options);
        let table = driver.run(&mut mock, &mut NullView, None).unwrap();
        assert_eq!(
            setpoints(&table),
            vec![(1.0, 10.0), (1.0, 20.0), (1.0, 10.0), (1.0, 20.0)]
        );
    }

    #[test]
    fn repeats_restore_the_converged_sensitivity() {
        // First point walks the range down from full scale until 5e-4 V sits
        // inside the 0.2 V window; the repeat re-applies that converged index
        // instead of walking again
        let mut mock = MockLockin::sr830_like(5e-4);
        mock.sens_index = 26;
        let mut options = fast_options(&[0.1], &[100.0]);
        options.auto_sensitivity = true;
        options.frequency_repeats = 2;
        let driver = SweepDriver::new(options);
        let table = driver.run(&mut mock, &mut NullView, None).unwrap();
        assert_eq!(table.len(), 2);
        // The trailing write puts the operator's pre-sweep range back
        assert_eq!(mock.sens_writes, vec![25, 24, 24, 26]);
    }

    #[test]
    fn preset_cancel_flag_aborts_before_the_first_point() {
        let mut mock = MockLockin::sr830_like(5e-4);
        mock.sens_index = 17;
        let cancel = Arc::new(AtomicBool::new(true));
        let driver =
            SweepDriver::new(fast_options(&[1.0, 2.0], &[10.0])).with_cancel(cancel);
        let result = driver.run(&mut mock, &mut NullView, None);
        assert!(matches!(result, Err(LockinError::Cancelled)));
        // Parking still happens on the way out
        assert_eq!(mock.amplitude_writes, vec![1.0]);
        assert_eq!(mock.frequency_writes, vec![10.0]);
    }

    #[test]
    fn averaging_of_identical_samples_has_zero_spread() {
        let mut mock = MockLockin::sr830_like(5e-4);
        mock.sens_index = 17;
        mock.phase = 30.0;
        let mut options = fast_options(&[1.0], &[10.0]);
        options.samples_per_point = 3;
        let driver = SweepDriver::new(options);
        let table = driver.run(&mut mock, &mut NullView, None).unwrap();
        let point = table.points()[0];
        assert!((point.magnitude - 5e-4).abs() < 1e-15);
        assert!((point.phase - 30.0).abs() < 1e-9);
        assert_eq!(point.stddev, Some(0.0));
    }

    #[test]
    fn complex_averaging_matches_hand_arithmetic() {
        // Two unit readings at 0 and 90 degrees: mean is (0.5, 0.5), so
        // magnitude 1/sqrt(2), phase 45, and each sample sits 1/sqrt(2)
        // from the mean
        let (magnitude, phase, stddev) = average_readings(&[(1.0, 0.0), (1.0, 90.0)]);
        let expected = 0.5f64.sqrt();
        assert!((magnitude - expected).abs() < 1e-12);
        assert!((phase - 45.0).abs() < 1e-12);
        assert!((stddev - expected).abs() < 1e-12);
    }

    #[test]
    fn view_sees_every_point_and_one_finish() {
        let mut mock = MockLockin::sr830_like(5e-4);
        mock.sens_index = 17;
        let mut view = CountingView {
            points: 0,
            finishes: 0,
        };
        let driver = SweepDriver::new(fast_options(&[1.0, 2.0], &[10.0, 20.0]));
        driver.run(&mut mock, &mut view, None).unwrap();
        assert_eq!(view.points, 4);
        assert_eq!(view.finishes, 1);
    }

    #[test]
    fn estimate_covers_settle_wait_for_a_single_point() {
        let mut options = fast_options(&[0.02], &[10.0]);
        options.auto_time_constant = true;
        let driver = SweepDriver::new(options);
        let ladder = Ladder::new(crate::instrument::sr830::TIME_CONSTANT);
        // 80 dB at 24 dB/oct puts the corner 10.08x below 2f: tau 0.080 s,
        // quantized up to 0.1 s, times the slope's factor of 10
        let estimate = driver.estimate_duration(ladder).unwrap();
        assert!((estimate.as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dual_grid_passes_cover_both_orders() {
        let mut source = MockLockin::sr830_like(5e-4);
        source.sens_index = 17;
        let mut follower = MockLockin::sr860_like(2e-4);
        follower.sens_index = 10;
        let dual = DualGridOptions {
            amplitude_limits: (0.5, 2.0),
            frequency_limits: (10.0, 1000.0),
            first_pass: (2, 2),
            second_pass: (2, 2),
            log_spacing: false,
        };
        let driver = SweepDriver::new(fast_options(&[], &[]));
        let data = driver
            .run_dual_grid(&mut source, &mut follower, &dual, &mut NullView, None)
            .unwrap();

        assert_eq!(
            setpoints(&data.first_source),
            vec![(0.5, 10.0), (0.5, 1000.0), (2.0, 10.0), (2.0, 1000.0)]
        );
        assert_eq!(
            setpoints(&data.second_source),
            vec![(0.5, 10.0), (2.0, 10.0), (0.5, 1000.0), (2.0, 1000.0)]
        );
        assert_eq!(setpoints(&data.first_follower), setpoints(&data.first_source));
        // Only the source drives the excitation
        assert!(follower.amplitude_writes.is_empty());
        assert!(follower.frequency_writes.is_empty());
        // Follower readings land in the follower tables
        assert!((data.first_follower.points()[0].magnitude - 2e-4).abs() < 1e-15);
    }

    #[test]
    fn transient_unlock_restarts_the_lock_gate() {
        let mut source = MockLockin::sr830_like(5e-4);
        source.sens_index = 17;
        let mut follower = MockLockin::sr860_like(2e-4);
        follower.sens_index = 10;
        // First point check sees an unlock; inside the gate one more
        // transient unlock forces the consecutive count back to zero
        follower.unlock_pattern = [true, true, false, true, false, false, false, false, false]
            .into_iter()
            .collect();
        let dual = DualGridOptions {
            amplitude_limits: (0.5, 2.0),
            frequency_limits: (10.0, 1000.0),
            first_pass: (2, 2),
            second_pass: (2, 2),
            log_spacing: false,
        };
        let driver = SweepDriver::new(fast_options(&[], &[]));
        driver
            .run_dual_grid(&mut source, &mut follower, &dual, &mut NullView, None)
            .unwrap();
        // 8 per-point checks plus 8 gate polls: unlock, one locked poll,
        // a second unlock resetting the count, then 5 locked in a row
        assert_eq!(follower.lock_polls, 16);
    }
}

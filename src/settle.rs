//! Settling-time selection.
//!
//! Translates a second-harmonic attenuation requirement into a wait time by
//! picking, on each instrument, the fastest time constant whose settling
//! value still meets the requirement. Attenuations are positive dB
//! magnitudes; the demanded rejection grows with the drive amplitude and is
//! capped at a configured maximum.

use std::f64::consts::PI;
use std::time::Duration;

use log::debug;

use crate::error::LockinError;
use crate::instrument::LockinInterface;
use crate::types::FilterSlope;

/// Inputs for one settling-time selection.
#[derive(Debug, Clone)]
pub struct SettleRequest {
    /// Current drive amplitude in volts.
    pub amplitude: f64,
    /// Smallest amplitude of the whole sweep; the attenuation ramp is
    /// referenced to it.
    pub min_amplitude: f64,
    /// Current reference frequency in hertz.
    pub frequency: f64,
    /// 2f rejection in dB demanded at the minimum amplitude.
    pub atten_min_db: f64,
    /// 2f rejection cap in dB reached at large amplitudes.
    pub atten_max_db: f64,
    pub slope: FilterSlope,
    /// Signal-to-DC ratio in dB for dc-coupled inputs; `None` for ac
    /// coupling, where only the 2f corner matters.
    pub signal_to_dc_db: Option<f64>,
    /// Settle multiplier; defaults to the slope's own factor.
    pub wait_factor: Option<f64>,
}

/// Result of a time-constant selection across one or more instruments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleOutcome {
    /// Time to sleep before the next reading: the slowest achieved time
    /// constant scaled by the wait factor.
    pub wait: Duration,
    /// Slowest achieved time constant across the instruments, in seconds.
    pub tau_achieved: f64,
    /// True when at least one instrument's register was rewritten.
    pub time_constant_changed: bool,
}

/// Required 2f attenuation in dB for the request's amplitude.
///
/// Scales up by 20 dB per decade of amplitude above the sweep minimum,
/// capped at `atten_max_db`. May come out negative or non-finite for
/// amplitudes far below the minimum; [`required_settle_time`] falls back to
/// `atten_min_db` in that case.
pub fn required_attenuation(req: &SettleRequest) -> f64 {
    let scaled = req.atten_min_db + 20.0 * (req.amplitude / req.min_amplitude).log10();
    scaled.min(req.atten_max_db)
}

fn corner_settle_time(atten_db: f64, fallback_db: f64, slope_db: f64, omega: f64) -> f64 {
    let mut octaves = atten_db / slope_db;
    if !octaves.is_finite() || octaves < 0.0 {
        octaves = fallback_db / slope_db;
    }
    2f64.powf(octaves) / omega
}

/// Minimum settling time in seconds that satisfies the request, before
/// hardware quantization.
///
/// The filter corner must sit `atten/slope` octaves below 2f; for
/// dc-coupled inputs the fundamental needs `(signal_to_dc + atten)/slope`
/// octaves below 1f as well and the slower of the two corners wins.
pub fn required_settle_time(req: &SettleRequest) -> Result<f64, LockinError> {
    if !req.frequency.is_finite() || req.frequency <= 0.0 {
        return Err(LockinError::Config(format!(
            "settle frequency must be positive, got {}",
            req.frequency
        )));
    }
    if !req.min_amplitude.is_finite() || req.min_amplitude <= 0.0 {
        return Err(LockinError::Config(format!(
            "minimum sweep amplitude must be positive, got {}",
            req.min_amplitude
        )));
    }
    if req.atten_min_db > req.atten_max_db {
        return Err(LockinError::Config(format!(
            "attenuation ramp inverted: {} dB > {} dB",
            req.atten_min_db, req.atten_max_db
        )));
    }

    let atten = required_attenuation(req);
    let slope_db = req.slope.db_per_octave();
    let tau_2f = corner_settle_time(atten, req.atten_min_db, slope_db, 4.0 * PI * req.frequency);
    match req.signal_to_dc_db {
        None => Ok(tau_2f),
        Some(signal_to_dc) => {
            let tau_1f = corner_settle_time(
                signal_to_dc + atten,
                signal_to_dc + req.atten_min_db,
                slope_db,
                2.0 * PI * req.frequency,
            );
            Ok(tau_2f.max(tau_1f))
        }
    }
}

/// Set the fastest adequate time constant on every instrument and return
/// the shared wait.
///
/// Registers that already hold the right index are left untouched; after a
/// write the index is read back, so a hardware clamp shows up in the
/// reported wait. The wait is the slowest achieved value across all
/// instruments times the wait factor.
///
/// # Errors
///
/// [`LockinError::QuantizationLimit`] when even the slowest time constant
/// of some instrument cannot meet the requirement.
pub fn select_time_constants(
    instruments: &mut [&mut dyn LockinInterface],
    req: &SettleRequest,
) -> Result<SettleOutcome, LockinError> {
    if instruments.is_empty() {
        return Err(LockinError::Config(
            "time-constant selection needs at least one instrument".to_string(),
        ));
    }
    if let Some(factor) = req.wait_factor {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(LockinError::Config(format!(
                "wait factor must be positive, got {factor}"
            )));
        }
    }

    let tau_required = required_settle_time(req)?;
    let mut tau_achieved: f64 = 0.0;
    let mut changed = false;
    for instrument in instruments.iter_mut() {
        let ladder = instrument.time_constant_ladder();
        let target = ladder.smallest_at_least(tau_required)? as i32;
        let current = instrument.time_constant_index()?;
        let achieved_index = if current == target {
            current
        } else {
            instrument.set_time_constant_index(target)?;
            changed = true;
            instrument.time_constant_index()?
        };
        let achieved = ladder.value_at(achieved_index)?;
        if achieved_index != current {
            debug!(
                "{}: time constant {} -> {} ({:.3e} s for required {:.3e} s)",
                instrument.name(),
                current,
                achieved_index,
                achieved,
                tau_required
            );
        }
        tau_achieved = tau_achieved.max(achieved);
    }

    let factor = req.wait_factor.unwrap_or_else(|| req.slope.wait_factor());
    Ok(SettleOutcome {
        wait: Duration::from_secs_f64(factor * tau_achieved),
        tau_achieved,
        time_constant_changed: changed,
    })
}

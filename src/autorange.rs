//! Sensitivity auto-ranging.
//!
//! Walks each instrument's sensitivity ladder one step at a time until the
//! measured magnitude falls inside the active range's measurement window.
//! Several instruments share one settle wait per iteration but converge
//! independently.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use log::{debug, warn};

use crate::error::LockinError;
use crate::instrument::LockinInterface;
use crate::utils::sleep_cancellable;

/// Window floor as a fraction of full scale. Hardware-specific constant
/// carried over from the instrument's 16-bit display resolution; do not
/// re-derive.
pub const WINDOW_FLOOR_FRACTION: f64 = 100.0 / 65536.0;

/// Window ceiling as a fraction of full scale, just under overload.
pub const WINDOW_CEILING_FRACTION: f64 = 0.99;

#[derive(Debug, Clone, Copy)]
pub struct RangeOptions {
    /// Disabled auto-ranging returns the raw reading untouched.
    pub enabled: bool,
    /// Adjustments per instrument before giving up. Must cover the longest
    /// sensitivity ladder for a full edge-to-edge walk.
    pub max_adjustments: usize,
    pub floor_fraction: f64,
    pub ceiling_fraction: f64,
}

impl Default for RangeOptions {
    fn default() -> Self {
        RangeOptions {
            enabled: true,
            max_adjustments: 32,
            floor_fraction: WINDOW_FLOOR_FRACTION,
            ceiling_fraction: WINDOW_CEILING_FRACTION,
        }
    }
}

/// Valid magnitude band for one sensitivity setting, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeWindow {
    pub min: f64,
    pub max: f64,
}

impl RangeWindow {
    pub fn for_full_scale(full_scale: f64, options: &RangeOptions) -> Self {
        RangeWindow {
            min: full_scale * options.floor_fraction,
            max: full_scale * options.ceiling_fraction,
        }
    }

    pub fn contains(&self, magnitude: f64) -> bool {
        magnitude >= self.min && magnitude <= self.max
    }
}

/// Read every instrument, adjusting sensitivities until all magnitudes are
/// in-window.
///
/// Each iteration steps every out-of-window instrument by one ladder
/// position (clamped at the ladder edges), sleeps once for `settle_wait`,
/// then re-reads all instruments. Returns the final `(magnitude, phase)`
/// pairs in instrument order.
///
/// # Errors
///
/// [`LockinError::RangingTimedOut`] when `max_adjustments` iterations were
/// not enough, [`LockinError::Cancelled`] when the cancel flag was raised
/// during a wait.
pub fn read_validated(
    instruments: &mut [&mut dyn LockinInterface],
    options: &RangeOptions,
    settle_wait: Duration,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<(f64, f64)>, LockinError> {
    if instruments.is_empty() {
        return Err(LockinError::Config(
            "auto-ranging needs at least one instrument".to_string(),
        ));
    }

    let mut readings = Vec::with_capacity(instruments.len());
    for instrument in instruments.iter_mut() {
        readings.push(instrument.read_magnitude_phase()?);
    }
    if !options.enabled {
        return Ok(readings);
    }

    let mut windows = Vec::with_capacity(instruments.len());
    for instrument in instruments.iter_mut() {
        let index = instrument.sensitivity_index()?;
        let full_scale = instrument.sensitivity_ladder().value_at(index)?;
        windows.push(RangeWindow::for_full_scale(full_scale, options));
    }

    let mut steps = 0usize;
    loop {
        let any_outside = windows
            .iter()
            .zip(readings.iter())
            .any(|(window, reading)| !window.contains(reading.0));
        if !any_outside {
            return Ok(readings);
        }
        if steps >= options.max_adjustments {
            warn!(
                "Auto-ranging gave up after {} adjustments; last readings {:?}",
                steps, readings
            );
            return Err(LockinError::RangingTimedOut { steps });
        }

        for (i, instrument) in instruments.iter_mut().enumerate() {
            let magnitude = readings[i].0;
            if windows[i].contains(magnitude) {
                continue;
            }
            // Below the floor the full scale must shrink, above the
            // ceiling it must grow
            let direction = if magnitude < windows[i].min {
                -instrument.sensitivity_step_direction()
            } else {
                instrument.sensitivity_step_direction()
            };
            let ladder = instrument.sensitivity_ladder();
            let current = instrument.sensitivity_index()?;
            let target = ladder.clamp_index(current + direction);
            if target != current {
                instrument.set_sensitivity_index(target)?;
            }
            let achieved = instrument.sensitivity_index()?;
            let full_scale = ladder.value_at(achieved)?;
            windows[i] = RangeWindow::for_full_scale(full_scale, options);
            debug!(
                "{}: sensitivity {} -> {} ({:.3e} outside [{:.3e}, {:.3e}])",
                instrument.name(),
                current,
                achieved,
                magnitude,
                windows[i].min,
                windows[i].max
            );
        }
        steps += 1;

        if !sleep_cancellable(settle_wait, cancel) {
            return Err(LockinError::Cancelled);
        }
        for (i, instrument) in instruments.iter_mut().enumerate() {
            readings[i] = instrument.read_magnitude_phase()?;
        }
    }
}

//! Live terminal visualization of a running sweep.
//!
//! Views are best-effort observers: they never fail the measurement, they
//! only draw what they are handed.

use textplots::{Chart, Plot, Shape};

use crate::types::SweepPoint;

/// Observer fed one point per acquired grid cell.
pub trait SweepView {
    /// Called after every acquired point. Must not fail; a view that cannot
    /// draw simply skips the update.
    fn update_point(&mut self, point: &SweepPoint);

    /// Called once after the last point of a sweep.
    fn finish(&mut self);
}

/// View that discards everything.
#[derive(Debug, Default)]
pub struct NullView;

impl SweepView for NullView {
    fn update_point(&mut self, _point: &SweepPoint) {}

    fn finish(&mut self) {}
}

/// Pick a display scale and unit prefix for a maximum magnitude in volts.
pub fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1.0 {
        (1.0, "V")
    } else if max_value >= 1e-3 {
        (1e3, "mV")
    } else if max_value >= 1e-6 {
        (1e6, "μV")
    } else if max_value >= 1e-9 {
        (1e9, "nV")
    } else {
        (1e12, "pV")
    }
}

/// Braille-art magnitude trace redrawn every few points.
#[derive(Debug)]
pub struct TerminalView {
    width: u32,
    height: u32,
    redraw_every: usize,
    magnitudes: Vec<f64>,
    since_redraw: usize,
}

impl Default for TerminalView {
    fn default() -> Self {
        TerminalView {
            width: 140,
            height: 60,
            redraw_every: 10,
            magnitudes: Vec::new(),
            since_redraw: 0,
        }
    }
}

impl TerminalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_geometry(width: u32, height: u32, redraw_every: usize) -> Self {
        TerminalView {
            width,
            height,
            redraw_every: redraw_every.max(1),
            ..Self::default()
        }
    }

    pub fn points_seen(&self) -> usize {
        self.magnitudes.len()
    }

    fn redraw(&self) {
        if self.magnitudes.is_empty() {
            return;
        }
        let max_abs = self.magnitudes.iter().fold(0.0f64, |a, &b| a.max(b.abs()));
        let (scale, unit) = determine_scale(max_abs);

        let frame: Vec<(f32, f32)> = self
            .magnitudes
            .iter()
            .enumerate()
            .map(|(i, &value)| (i as f32, (value * scale) as f32))
            .collect();
        let max_index = (self.magnitudes.len() - 1) as f32;

        println!(
            "Sweep magnitude: {} points | Y-axis: {}",
            self.magnitudes.len(),
            unit
        );
        println!("{}", "─".repeat(self.width as usize));
        Chart::new(self.width, self.height, 0.0, max_index.max(1.0))
            .lineplot(&Shape::Lines(&frame))
            .nice();
        println!("Point Index →");
    }
}

impl SweepView for TerminalView {
    fn update_point(&mut self, point: &SweepPoint) {
        self.magnitudes.push(point.magnitude);
        self.since_redraw += 1;
        if self.since_redraw >= self.redraw_every {
            self.since_redraw = 0;
            self.redraw();
        }
    }

    fn finish(&mut self) {
        self.redraw();
        if let Some(&last) = self.magnitudes.last() {
            let (scale, unit) = determine_scale(last.abs());
            println!(
                "Sweep finished: {} points, last magnitude {:.3} {}",
                self.magnitudes.len(),
                last * scale,
                unit
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(magnitude: f64) -> SweepPoint {
        SweepPoint {
            amplitude_setpoint: 0.1,
            amplitude_actual: 0.1,
            frequency_setpoint: 100.0,
            frequency_actual: 100.0,
            magnitude,
            phase: 0.0,
            stddev: None,
        }
    }

    #[test]
    fn scale_picks_the_matching_unit_prefix() {
        assert_eq!(determine_scale(5.0), (1.0, "V"));
        assert_eq!(determine_scale(0.005), (1e3, "mV"));
        assert_eq!(determine_scale(5e-6), (1e6, "μV"));
        assert_eq!(determine_scale(5e-9), (1e9, "nV"));
        assert_eq!(determine_scale(5e-12), (1e12, "pV"));
    }

    #[test]
    fn terminal_view_survives_a_single_point_sweep() {
        let mut view = TerminalView::with_geometry(40, 20, 1);
        view.update_point(&point(1e-3));
        view.finish();
        assert_eq!(view.points_seen(), 1);
    }

    #[test]
    fn null_view_accepts_everything() {
        let mut view = NullView;
        view.update_point(&point(0.0));
        view.finish();
    }
}

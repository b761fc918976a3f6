use crate::error::LockinError;
use crate::ladder::Ladder;
use crate::types::{
    FilterSlope, InputConfig, InputCoupling, ReferenceSource, ReferenceTrigger,
};

/// Capability set the sweep core needs from a lock-in amplifier.
///
/// The sweep, settling, and auto-ranging logic depend only on this trait;
/// each supported model (SR830, SR860) implements it by mapping the
/// operations onto its own register names and numeric codes. Register tables
/// (sensitivity and time-constant ladders, step direction) are data supplied
/// by the implementation, never logic in the core.
///
/// All hardware operations take `&mut self`: one logical owner drives an
/// instrument for the duration of a sweep, and query/write round-trips are
/// blocking.
pub trait LockinInterface {
    /// Short label for logs and output files ("SR830", "SR860 s/n 003521").
    fn name(&self) -> &str;

    /// Full-scale sensitivity table, indexed by the sensitivity register.
    fn sensitivity_ladder(&self) -> Ladder;

    /// Filter time-constant table, indexed by the time-constant register.
    fn time_constant_ladder(&self) -> Ladder;

    /// Register step that moves one position toward a larger full scale:
    /// +1 when the sensitivity table increases with index, -1 when it
    /// decreases.
    fn sensitivity_step_direction(&self) -> i32;

    /// Current sensitivity register value.
    fn sensitivity_index(&mut self) -> Result<i32, LockinError>;

    /// Program the sensitivity register.
    ///
    /// # Errors
    /// `Config` if `index` is outside the register range.
    fn set_sensitivity_index(&mut self, index: i32) -> Result<(), LockinError>;

    /// Current time-constant register value.
    fn time_constant_index(&mut self) -> Result<i32, LockinError>;

    /// Program the time-constant register.
    ///
    /// # Errors
    /// `Config` if `index` is outside the register range.
    fn set_time_constant_index(&mut self, index: i32) -> Result<(), LockinError>;

    /// One simultaneous magnitude/phase snapshot (R in volts, theta in
    /// degrees).
    fn read_magnitude_phase(&mut self) -> Result<(f64, f64), LockinError>;

    /// Whether the PLL has lost lock on the external reference. Meaningful
    /// on a follower instrument; a source running its internal oscillator
    /// reports `false`.
    fn is_phase_lock_unlocked(&mut self) -> Result<bool, LockinError>;

    /// Set the reference output amplitude and return the amplitude the
    /// hardware actually applied after quantization.
    fn set_reference_amplitude(&mut self, volts: f64) -> Result<f64, LockinError>;

    /// Set the reference frequency and return the frequency the hardware
    /// actually applied after quantization.
    fn set_reference_frequency(&mut self, hertz: f64) -> Result<f64, LockinError>;

    /// Detection harmonic (1 = fundamental). Valid range is model-specific.
    fn set_detection_harmonic(&mut self, harmonic: u32) -> Result<(), LockinError>;

    /// Output low-pass filter slope.
    fn set_filter_slope(&mut self, slope: FilterSlope) -> Result<(), LockinError>;

    /// Signal input routing.
    fn set_input_config(&mut self, input: InputConfig) -> Result<(), LockinError>;

    /// Signal input coupling.
    fn set_input_coupling(&mut self, coupling: InputCoupling) -> Result<(), LockinError>;

    /// Synchronous filter on/off.
    fn set_sync_filter(&mut self, enabled: bool) -> Result<(), LockinError>;

    /// Reference phase offset in degrees. Valid range is model-specific.
    fn set_reference_phase(&mut self, degrees: f64) -> Result<(), LockinError>;

    /// Reference oscillator source.
    ///
    /// # Errors
    /// `Config` if the model does not support the requested source
    /// (`Dual`/`Chop` are SR860-only).
    fn set_reference_source(&mut self, source: ReferenceSource) -> Result<(), LockinError>;

    /// External reference trigger mode.
    fn set_reference_trigger(&mut self, trigger: ReferenceTrigger) -> Result<(), LockinError>;
}

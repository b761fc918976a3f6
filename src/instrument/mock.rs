//! In-memory lock-in used by the core-logic tests. Models ideal clipping:
//! the reported magnitude is the true signal limited to the active full
//! scale, and register writes outside the valid range are rejected the same
//! way the real profiles reject them.

use std::collections::VecDeque;

use crate::error::LockinError;
use crate::instrument::{LockinInterface, ScpiTransport};
use crate::ladder::Ladder;
use crate::types::{
    FilterSlope, InputConfig, InputCoupling, ReferenceSource, ReferenceTrigger,
};

/// Records every command and answers queries from a scripted reply queue.
/// Used to check the exact wire traffic the profiles produce.
pub(crate) struct ScriptTransport {
    pub sent: Vec<String>,
    pub replies: VecDeque<String>,
}

impl ScriptTransport {
    pub fn with_replies(replies: &[&str]) -> Self {
        ScriptTransport {
            sent: Vec::new(),
            replies: replies.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl ScpiTransport for ScriptTransport {
    fn write_line(&mut self, command: &str) -> Result<(), LockinError> {
        self.sent.push(command.to_string());
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, LockinError> {
        self.sent.push(command.to_string());
        self.replies
            .pop_front()
            .ok_or_else(|| LockinError::UnexpectedResponse {
                command: command.to_string(),
                response: "<no scripted reply>".to_string(),
            })
    }
}

pub(crate) struct MockLockin {
    label: String,
    sens_ladder: Ladder,
    tc_ladder: Ladder,
    step_direction: i32,
    pub sens_index: i32,
    pub tc_index: i32,
    /// True signal magnitude at the input, before range clipping.
    pub signal: f64,
    pub phase: f64,
    /// Scripted answers for successive unlock polls; exhausted = locked.
    pub unlock_pattern: VecDeque<bool>,
    pub lock_polls: usize,
    pub sens_writes: Vec<i32>,
    pub tc_writes: Vec<i32>,
    pub amplitude_writes: Vec<f64>,
    pub frequency_writes: Vec<f64>,
    /// Rounding granularity applied to amplitude/frequency setpoints;
    /// zero means the hardware applies setpoints exactly.
    pub quantum: f64,
}

impl MockLockin {
    pub fn new(
        label: &str,
        sens_values: &'static [f64],
        tc_values: &'static [f64],
        step_direction: i32,
    ) -> Self {
        Self {
            label: label.to_string(),
            sens_ladder: Ladder::new(sens_values),
            tc_ladder: Ladder::new(tc_values),
            step_direction,
            sens_index: 0,
            tc_index: 0,
            signal: 0.0,
            phase: 0.0,
            unlock_pattern: VecDeque::new(),
            lock_polls: 0,
            sens_writes: Vec::new(),
            tc_writes: Vec::new(),
            amplitude_writes: Vec::new(),
            frequency_writes: Vec::new(),
            quantum: 0.0,
        }
    }

    /// SR830-shaped mock: increasing sensitivity table, step direction +1.
    pub fn sr830_like(signal: f64) -> Self {
        let mut mock = Self::new(
            "mock-830",
            crate::instrument::sr830::SENSITIVITY,
            crate::instrument::sr830::TIME_CONSTANT,
            1,
        );
        mock.signal = signal;
        mock
    }

    /// SR860-shaped mock: decreasing sensitivity table, step direction -1.
    pub fn sr860_like(signal: f64) -> Self {
        let mut mock = Self::new(
            "mock-860",
            crate::instrument::sr860::SENSITIVITY,
            crate::instrument::sr860::TIME_CONSTANT,
            -1,
        );
        mock.signal = signal;
        mock
    }

    fn quantize(&self, value: f64) -> f64 {
        if self.quantum > 0.0 {
            (value / self.quantum).round() * self.quantum
        } else {
            value
        }
    }

    fn reported_magnitude(&self) -> f64 {
        let full_scale = self.sens_ladder.values()[self.sens_index as usize];
        self.signal.min(full_scale)
    }
}

impl LockinInterface for MockLockin {
    fn name(&self) -> &str {
        &self.label
    }

    fn sensitivity_ladder(&self) -> Ladder {
        self.sens_ladder
    }

    fn time_constant_ladder(&self) -> Ladder {
        self.tc_ladder
    }

    fn sensitivity_step_direction(&self) -> i32 {
        self.step_direction
    }

    fn sensitivity_index(&mut self) -> Result<i32, LockinError> {
        Ok(self.sens_index)
    }

    fn set_sensitivity_index(&mut self, index: i32) -> Result<(), LockinError> {
        if index < 0 || index as usize >= self.sens_ladder.len() {
            return Err(LockinError::Config(format!(
                "sensitivity index {index} outside 0..{}",
                self.sens_ladder.len()
            )));
        }
        self.sens_writes.push(index);
        self.sens_index = index;
        Ok(())
    }

    fn time_constant_index(&mut self) -> Result<i32, LockinError> {
        Ok(self.tc_index)
    }

    fn set_time_constant_index(&mut self, index: i32) -> Result<(), LockinError> {
        if index < 0 || index as usize >= self.tc_ladder.len() {
            return Err(LockinError::Config(format!(
                "time constant index {index} outside 0..{}",
                self.tc_ladder.len()
            )));
        }
        self.tc_writes.push(index);
        self.tc_index = index;
        Ok(())
    }

    fn read_magnitude_phase(&mut self) -> Result<(f64, f64), LockinError> {
        Ok((self.reported_magnitude(), self.phase))
    }

    fn is_phase_lock_unlocked(&mut self) -> Result<bool, LockinError> {
        self.lock_polls += 1;
        Ok(self.unlock_pattern.pop_front().unwrap_or(false))
    }

    fn set_reference_amplitude(&mut self, volts: f64) -> Result<f64, LockinError> {
        self.amplitude_writes.push(volts);
        Ok(self.quantize(volts))
    }

    fn set_reference_frequency(&mut self, hertz: f64) -> Result<f64, LockinError> {
        self.frequency_writes.push(hertz);
        Ok(self.quantize(hertz))
    }

    fn set_detection_harmonic(&mut self, _harmonic: u32) -> Result<(), LockinError> {
        Ok(())
    }

    fn set_filter_slope(&mut self, _slope: FilterSlope) -> Result<(), LockinError> {
        Ok(())
    }

    fn set_input_config(&mut self, _input: InputConfig) -> Result<(), LockinError> {
        Ok(())
    }

    fn set_input_coupling(&mut self, _coupling: InputCoupling) -> Result<(), LockinError> {
        Ok(())
    }

    fn set_sync_filter(&mut self, _enabled: bool) -> Result<(), LockinError> {
        Ok(())
    }

    fn set_reference_phase(&mut self, _degrees: f64) -> Result<(), LockinError> {
        Ok(())
    }

    fn set_reference_source(&mut self, _source: ReferenceSource) -> Result<(), LockinError> {
        Ok(())
    }

    fn set_reference_trigger(&mut self, _trigger: ReferenceTrigger) -> Result<(), LockinError> {
        Ok(())
    }
}

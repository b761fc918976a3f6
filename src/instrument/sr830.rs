//! SR830 command profile.
//!
//! The SR830 indexes its sensitivity table from the smallest full scale
//! upward, so stepping toward a larger full scale means incrementing the
//! SENS register.

use std::time::Duration;

use visa_rs::DefaultRM;

use crate::error::LockinError;
use crate::instrument::visa::{find_instrument, ScpiTransport, VisaSession, SRS_VENDOR};
use crate::instrument::{parse_float, parse_int, parse_pair, LockinInterface};
use crate::ladder::Ladder;
use crate::types::{
    FilterSlope, InputConfig, InputCoupling, ReferenceSource, ReferenceTrigger,
};

const MODEL: &str = "SR830";

/// Full-scale sensitivities in volts, SENS register order (0-26).
pub const SENSITIVITY: &[f64] = &[
    2e-9, 5e-9, //
    1e-8, 2e-8, 5e-8, //
    1e-7, 2e-7, 5e-7, //
    1e-6, 2e-6, 5e-6, //
    1e-5, 2e-5, 5e-5, //
    1e-4, 2e-4, 5e-4, //
    1e-3, 2e-3, 5e-3, //
    1e-2, 2e-2, 5e-2, //
    1e-1, 2e-1, 5e-1, //
    1.0,
];

/// Time constants in seconds, OFLT register order (0-19).
pub const TIME_CONSTANT: &[f64] = &[
    1e-5, 3e-5, //
    1e-4, 3e-4, //
    1e-3, 3e-3, //
    1e-2, 3e-2, //
    1e-1, 3e-1, //
    1.0, 3.0, //
    1e1, 3e1, //
    1e2, 3e2, //
    1e3, 3e3, //
    1e4, 3e4,
];

pub struct Sr830<T> {
    transport: T,
    label: String,
}

impl Sr830<VisaSession> {
    /// Locate the only SR830 on the VISA bus, or the unit with the given
    /// serial number when several are connected.
    pub fn find(
        rm: &DefaultRM,
        serial: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LockinError> {
        let (session, identity) = find_instrument(rm, MODEL, serial, timeout)?;
        Ok(Sr830 {
            transport: session,
            label: format!("{} s/n {}", MODEL, identity.serial),
        })
    }

    /// Open a specific VISA resource and verify it answers as an SR830.
    pub fn open(
        rm: &DefaultRM,
        resource: &str,
        timeout: Duration,
    ) -> Result<Self, LockinError> {
        let mut session = VisaSession::open(rm, resource, timeout)?;
        let identity = session.identify()?;
        if identity.vendor != SRS_VENDOR || identity.model != MODEL {
            return Err(LockinError::UnexpectedResponse {
                command: "*IDN?".to_string(),
                response: format!("{},{}", identity.vendor, identity.model),
            });
        }
        Ok(Sr830 {
            transport: session,
            label: format!("{} s/n {}", MODEL, identity.serial),
        })
    }
}

impl<T: ScpiTransport> Sr830<T> {
    pub fn with_transport(transport: T) -> Self {
        Sr830 {
            transport,
            label: MODEL.to_string(),
        }
    }
}

impl<T: ScpiTransport> LockinInterface for Sr830<T> {
    fn name(&self) -> &str {
        &self.label
    }

    fn sensitivity_ladder(&self) -> Ladder {
        Ladder::new(SENSITIVITY)
    }

    fn time_constant_ladder(&self) -> Ladder {
        Ladder::new(TIME_CONSTANT)
    }

    fn sensitivity_step_direction(&self) -> i32 {
        1
    }

    fn sensitivity_index(&mut self) -> Result<i32, LockinError> {
        let response = self.transport.query("SENS?")?;
        parse_int("SENS?", &response)
    }

    fn set_sensitivity_index(&mut self, index: i32) -> Result<(), LockinError> {
        if index < 0 || index as usize >= SENSITIVITY.len() {
            return Err(LockinError::Config(format!(
                "sensitivity index {index} outside 0..{}",
                SENSITIVITY.len()
            )));
        }
        self.transport.write_line(&format!("SENS {index}"))
    }

    fn time_constant_index(&mut self) -> Result<i32, LockinError> {
        let response = self.transport.query("OFLT?")?;
        let value = parse_int("OFLT?", &response)?;
        if value < 0 || value as usize >= TIME_CONSTANT.len() {
            return Err(LockinError::UnexpectedResponse {
                command: "OFLT?".to_string(),
                response,
            });
        }
        Ok(value)
    }

    fn set_time_constant_index(&mut self, index: i32) -> Result<(), LockinError> {
        if index < 0 || index as usize >= TIME_CONSTANT.len() {
            return Err(LockinError::Config(format!(
                "time constant index {index} outside 0..{}",
                TIME_CONSTANT.len()
            )));
        }
        self.transport.write_line(&format!("OFLT {index}"))
    }

    fn read_magnitude_phase(&mut self) -> Result<(f64, f64), LockinError> {
        let response = self.transport.query("SNAP? 3,4")?;
        parse_pair("SNAP? 3,4", &response)
    }

    fn is_phase_lock_unlocked(&mut self) -> Result<bool, LockinError> {
        let response = self.transport.query("LIAS? 3")?;
        match parse_int("LIAS? 3", &response)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(LockinError::UnexpectedResponse {
                command: "LIAS? 3".to_string(),
                response,
            }),
        }
    }

    fn set_reference_amplitude(&mut self, volts: f64) -> Result<f64, LockinError> {
        self.transport.write_line(&format!("SLVL {volts:.4}"))?;
        let response = self.transport.query("SLVL?")?;
        parse_float("SLVL?", &response)
    }

    fn set_reference_frequency(&mut self, hertz: f64) -> Result<f64, LockinError> {
        self.transport.write_line(&format!("FREQ {hertz:.6}"))?;
        let response = self.transport.query("FREQ?")?;
        parse_float("FREQ?", &response)
    }

    fn set_detection_harmonic(&mut self, harmonic: u32) -> Result<(), LockinError> {
        if harmonic < 1 || harmonic > 19999 {
            return Err(LockinError::Config(format!(
                "harmonic {harmonic} outside 1..=19999"
            )));
        }
        self.transport.write_line(&format!("HARM {harmonic}"))
    }

    fn set_filter_slope(&mut self, slope: FilterSlope) -> Result<(), LockinError> {
        self.transport.write_line(&format!("OFSL {}", slope.code()))
    }

    fn set_input_config(&mut self, input: InputConfig) -> Result<(), LockinError> {
        let code = match input {
            InputConfig::VoltageA => 0,
            InputConfig::VoltageDiff => 1,
            InputConfig::Current1Meg => 2,
            InputConfig::Current100Meg => 3,
        };
        self.transport.write_line(&format!("ISRC {code}"))
    }

    fn set_input_coupling(&mut self, coupling: InputCoupling) -> Result<(), LockinError> {
        self.transport
            .write_line(&format!("ICPL {}", coupling.code()))
    }

    fn set_sync_filter(&mut self, enabled: bool) -> Result<(), LockinError> {
        self.transport
            .write_line(if enabled { "SYNC 1" } else { "SYNC 0" })
    }

    fn set_reference_phase(&mut self, degrees: f64) -> Result<(), LockinError> {
        if !(-360.0..=729.99).contains(&degrees) {
            return Err(LockinError::Config(format!(
                "reference phase {degrees} outside -360.00..=729.99 deg"
            )));
        }
        self.transport.write_line(&format!("PHAS {degrees:.2}"))
    }

    fn set_reference_source(&mut self, source: ReferenceSource) -> Result<(), LockinError> {
        let code = match source {
            ReferenceSource::Internal => 1,
            ReferenceSource::External => 0,
            ReferenceSource::Dual | ReferenceSource::Chop => {
                return Err(LockinError::Config(format!(
                    "SR830 does not support the {source:?} reference source"
                )));
            }
        };
        self.transport.write_line(&format!("FMOD {code}"))
    }

    fn set_reference_trigger(&mut self, trigger: ReferenceTrigger) -> Result<(), LockinError> {
        self.transport
            .write_line(&format!("RSLP {}", trigger.code()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::ScriptTransport;

    fn scripted(replies: &[&str]) -> Sr830<ScriptTransport> {
        Sr830::with_transport(ScriptTransport::with_replies(replies))
    }

    #[test]
    fn snap_reads_magnitude_and_phase() {
        let mut lockin = scripted(&["4.567e-5,-12.5"]);
        let (r, theta) = lockin.read_magnitude_phase().unwrap();
        assert_eq!(r, 4.567e-5);
        assert_eq!(theta, -12.5);
        assert_eq!(lockin.transport.sent, ["SNAP? 3,4"]);
    }

    #[test]
    fn sensitivity_register_round_trip() {
        let mut lockin = scripted(&["13"]);
        lockin.set_sensitivity_index(13).unwrap();
        assert_eq!(lockin.sensitivity_index().unwrap(), 13);
        assert_eq!(lockin.transport.sent, ["SENS 13", "SENS?"]);
    }

    #[test]
    fn sensitivity_register_bounds() {
        let mut lockin = scripted(&[]);
        assert!(matches!(
            lockin.set_sensitivity_index(27),
            Err(LockinError::Config(_))
        ));
        assert!(matches!(
            lockin.set_sensitivity_index(-1),
            Err(LockinError::Config(_))
        ));
        assert!(lockin.transport.sent.is_empty());
    }

    #[test]
    fn amplitude_returns_read_back_value() {
        let mut lockin = scripted(&["0.004"]);
        let achieved = lockin.set_reference_amplitude(0.004).unwrap();
        assert_eq!(achieved, 0.004);
        assert_eq!(lockin.transport.sent, ["SLVL 0.0040", "SLVL?"]);
    }

    #[test]
    fn frequency_uses_six_decimals() {
        let mut lockin = scripted(&["128.500001"]);
        let achieved = lockin.set_reference_frequency(128.5).unwrap();
        assert_eq!(achieved, 128.500001);
        assert_eq!(lockin.transport.sent[0], "FREQ 128.500000");
    }

    #[test]
    fn phase_outside_instrument_range_is_rejected() {
        let mut lockin = scripted(&[]);
        assert!(lockin.set_reference_phase(730.0).is_err());
        assert!(lockin.set_reference_phase(-360.01).is_err());
        lockin.set_reference_phase(729.99).unwrap();
        assert_eq!(lockin.transport.sent, ["PHAS 729.99"]);
    }

    #[test]
    fn unlock_bit_parses_and_rejects_garbage() {
        let mut lockin = scripted(&["1", "0", "2"]);
        assert!(lockin.is_phase_lock_unlocked().unwrap());
        assert!(!lockin.is_phase_lock_unlocked().unwrap());
        assert!(matches!(
            lockin.is_phase_lock_unlocked(),
            Err(LockinError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn time_constant_read_back_is_validated() {
        let mut lockin = scripted(&["25"]);
        assert!(matches!(
            lockin.time_constant_index(),
            Err(LockinError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn dual_and_chop_references_are_rejected() {
        let mut lockin = scripted(&[]);
        assert!(lockin.set_reference_source(ReferenceSource::Dual).is_err());
        assert!(lockin.set_reference_source(ReferenceSource::Chop).is_err());
        lockin
            .set_reference_source(ReferenceSource::External)
            .unwrap();
        assert_eq!(lockin.transport.sent, ["FMOD 0"]);
    }

    #[test]
    fn ladder_orientation_matches_register_order() {
        let lockin = scripted(&[]);
        assert!(lockin.sensitivity_ladder().is_increasing());
        assert_eq!(lockin.sensitivity_step_direction(), 1);
        assert_eq!(lockin.sensitivity_ladder().len(), 27);
        assert_eq!(lockin.time_constant_ladder().len(), 20);
    }
}

//! SR860 command profile.
//!
//! Unlike the SR830, the SR860 indexes its sensitivity table from 1 V
//! downward, so stepping toward a larger full scale means decrementing the
//! SCAL register. Amplitude setpoints are written with a unit suffix
//! (NV/UV/MV/V) instead of plain volts.

use std::time::Duration;

use visa_rs::DefaultRM;

use crate::error::LockinError;
use crate::instrument::visa::{find_instrument, ScpiTransport, VisaSession, SRS_VENDOR};
use crate::instrument::{parse_float, parse_int, parse_pair, LockinInterface};
use crate::ladder::Ladder;
use crate::types::{
    FilterSlope, InputConfig, InputCoupling, ReferenceImpedance, ReferenceSource,
    ReferenceTrigger,
};

const MODEL: &str = "SR860";

/// Full-scale sensitivities in volts, SCAL register order (0-27).
pub const SENSITIVITY: &[f64] = &[
    1.0, //
    5e-1, 2e-1, 1e-1, //
    5e-2, 2e-2, 1e-2, //
    5e-3, 2e-3, 1e-3, //
    5e-4, 2e-4, 1e-4, //
    5e-5, 2e-5, 1e-5, //
    5e-6, 2e-6, 1e-6, //
    5e-7, 2e-7, 1e-7, //
    5e-8, 2e-8, 1e-8, //
    5e-9, 2e-9, 1e-9,
];

/// Time constants in seconds, OFLT register order (0-21).
pub const TIME_CONSTANT: &[f64] = &[
    1e-6, 3e-6, //
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

pub struct Sr860<T> {
    transport: T,
    label: String,
}

impl Sr860<VisaSession> {
    /// Locate the only SR860 on the VISA bus, or the unit with the given
    /// serial number when several are connected.
    pub fn find(
        rm: &DefaultRM,
        serial: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LockinError> {
        let (session, identity) = find_instrument(rm, MODEL, serial, timeout)?;
        Ok(Sr860 {
            transport: session,
            label: format!("{} s/n {}", MODEL, identity.serial),
        })
    }

    /// Open a specific VISA resource and verify it answers as an SR860.
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
        Ok(Sr860 {
            transport: session,
            label: format!("{} s/n {}", MODEL, identity.serial),
        })
    }
}

impl<T: ScpiTransport> Sr860<T> {
    pub fn with_transport(transport: T) -> Self {
        Sr860 {
            transport,
            label: MODEL.to_string(),
        }
    }

    /// Enable or disable the advanced output filter (ADVFILT).
    pub fn set_advanced_filter(&mut self, enabled: bool) -> Result<(), LockinError> {
        self.transport
            .write_line(if enabled { "ADVFILT 1" } else { "ADVFILT 0" })
    }

    /// Select the external reference input impedance (REFZ).
    pub fn set_reference_impedance(
        &mut self,
        impedance: ReferenceImpedance,
    ) -> Result<(), LockinError> {
        self.transport
            .write_line(&format!("REFZ {}", impedance.code()))
    }
}

impl<T: ScpiTransport> LockinInterface for Sr860<T> {
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
        -1
    }

    fn sensitivity_index(&mut self) -> Result<i32, LockinError> {
        let response = self.transport.query("SCAL?")?;
        parse_int("SCAL?", &response)
    }

    fn set_sensitivity_index(&mut self, index: i32) -> Result<(), LockinError> {
        if index < 0 || index as usize >= SENSITIVITY.len() {
            return Err(LockinError::Config(format!(
                "sensitivity index {index} outside 0..{}",
                SENSITIVITY.len()
            )));
        }
        self.transport.write_line(&format!("SCAL {index}"))
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
        let response = self.transport.query("SNAP? 2,3")?;
        parse_pair("SNAP? 2,3", &response)
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
        if !volts.is_finite() || volts <= 0.0 {
            return Err(LockinError::Config(format!(
                "reference amplitude must be positive, got {volts}"
            )));
        }
        let decade = 3 * (volts.log10() / 3.0).floor() as i32;
        let mantissa = volts / 10f64.powi(decade);
        let suffix = match decade {
            0 => "V",
            -3 => "MV",
            -6 => "UV",
            -9 => "NV",
            _ => {
                return Err(LockinError::Config(format!(
                    "reference amplitude {volts:.3e} V outside the SR860 output range"
                )));
            }
        };
        self.transport
            .write_line(&format!("SLVL {mantissa:.4} {suffix}"))?;
        let response = self.transport.query("SLVL?")?;
        parse_float("SLVL?", &response)
    }

    fn set_reference_frequency(&mut self, hertz: f64) -> Result<f64, LockinError> {
        self.transport.write_line(&format!("FREQ {hertz:.6}"))?;
        let response = self.transport.query("FREQ?")?;
        parse_float("FREQ?", &response)
    }

    fn set_detection_harmonic(&mut self, harmonic: u32) -> Result<(), LockinError> {
        if harmonic < 1 || harmonic > 99 {
            return Err(LockinError::Config(format!(
                "harmonic {harmonic} outside 1..=99"
            )));
        }
        self.transport.write_line(&format!("HARM {harmonic}"))
    }

    fn set_filter_slope(&mut self, slope: FilterSlope) -> Result<(), LockinError> {
        self.transport.write_line(&format!("OFSL {}", slope.code()))
    }

    fn set_input_config(&mut self, input: InputConfig) -> Result<(), LockinError> {
        match input {
            InputConfig::VoltageA => {
                self.transport.write_line("IVMD 0")?;
                self.transport.write_line("ISRC 0")
            }
            InputConfig::VoltageDiff => {
                self.transport.write_line("IVMD 0")?;
                self.transport.write_line("ISRC 1")
            }
            InputConfig::Current1Meg => {
                self.transport.write_line("IVMD 1")?;
                self.transport.write_line("ICUR 0")
            }
            InputConfig::Current100Meg => {
                self.transport.write_line("IVMD 1")?;
                self.transport.write_line("ICUR 1")
            }
        }
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
        if !(-360e3..=360e3).contains(&degrees) {
            return Err(LockinError::Config(format!(
                "reference phase {degrees} outside +/-360000 deg"
            )));
        }
        self.transport.write_line(&format!("PHAS {degrees:.7}"))
    }

    fn set_reference_source(&mut self, source: ReferenceSource) -> Result<(), LockinError> {
        let code = match source {
            ReferenceSource::Internal => 0,
            ReferenceSource::External => 1,
            ReferenceSource::Dual => 2,
            ReferenceSource::Chop => 3,
        };
        self.transport.write_line(&format!("RSRC {code}"))
    }

    fn set_reference_trigger(&mut self, trigger: ReferenceTrigger) -> Result<(), LockinError> {
        self.transport
            .write_line(&format!("RTRG {}", trigger.code()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::ScriptTransport;

    fn scripted(replies: &[&str]) -> Sr860<ScriptTransport> {
        Sr860::with_transport(ScriptTransport::with_replies(replies))
    }

    #[test]
    fn snap_uses_sr860_indices() {
        let mut lockin = scripted(&["1.2e-6,45.0"]);
        let (r, theta) = lockin.read_magnitude_phase().unwrap();
        assert_eq!((r, theta), (1.2e-6, 45.0));
        assert_eq!(lockin.transport.sent, ["SNAP? 2,3"]);
    }

    #[test]
    fn amplitude_selects_unit_suffix() {
        let cases = [
            (1.0, "SLVL 1.0000 V"),
            (0.5, "SLVL 500.0000 MV"),
            (0.002, "SLVL 2.0000 MV"),
            (5e-5, "SLVL 50.0000 UV"),
            (2e-8, "SLVL 20.0000 NV"),
        ];
        for (volts, expected) in cases {
            let mut lockin = scripted(&["0.0"]);
            lockin.set_reference_amplitude(volts).unwrap();
            assert_eq!(lockin.transport.sent[0], expected, "for {volts} V");
        }
    }

    #[test]
    fn amplitude_below_one_nanovolt_is_rejected() {
        let mut lockin = scripted(&[]);
        assert!(lockin.set_reference_amplitude(5e-10).is_err());
        assert!(lockin.set_reference_amplitude(0.0).is_err());
        assert!(lockin.set_reference_amplitude(-0.1).is_err());
        assert!(lockin.transport.sent.is_empty());
    }

    #[test]
    fn input_config_writes_mode_then_range() {
        let mut lockin = scripted(&[]);
        lockin.set_input_config(InputConfig::Current100Meg).unwrap();
        assert_eq!(lockin.transport.sent, ["IVMD 1", "ICUR 1"]);

        let mut lockin = scripted(&[]);
        lockin.set_input_config(InputConfig::VoltageA).unwrap();
        assert_eq!(lockin.transport.sent, ["IVMD 0", "ISRC 0"]);
    }

    #[test]
    fn sensitivity_register_bounds() {
        let mut lockin = scripted(&["27"]);
        lockin.set_sensitivity_index(27).unwrap();
        assert_eq!(lockin.sensitivity_index().unwrap(), 27);
        assert!(lockin.set_sensitivity_index(28).is_err());
    }

    #[test]
    fn phase_uses_seven_decimals() {
        let mut lockin = scripted(&[]);
        lockin.set_reference_phase(10.0).unwrap();
        assert_eq!(lockin.transport.sent, ["PHAS 10.0000000"]);
        assert!(lockin.set_reference_phase(360001.0).is_err());
    }

    #[test]
    fn all_reference_sources_are_supported() {
        let mut lockin = scripted(&[]);
        lockin.set_reference_source(ReferenceSource::Internal).unwrap();
        lockin.set_reference_source(ReferenceSource::External).unwrap();
        lockin.set_reference_source(ReferenceSource::Dual).unwrap();
        lockin.set_reference_source(ReferenceSource::Chop).unwrap();
        assert_eq!(
            lockin.transport.sent,
            ["RSRC 0", "RSRC 1", "RSRC 2", "RSRC 3"]
        );
    }

    #[test]
    fn harmonic_limited_to_99() {
        let mut lockin = scripted(&[]);
        assert!(lockin.set_detection_harmonic(100).is_err());
        lockin.set_detection_harmonic(99).unwrap();
        assert_eq!(lockin.transport.sent, ["HARM 99"]);
    }

    #[test]
    fn model_specific_extras_encode_correctly() {
        let mut lockin = scripted(&[]);
        lockin.set_advanced_filter(true).unwrap();
        lockin
            .set_reference_impedance(ReferenceImpedance::Meg1)
            .unwrap();
        assert_eq!(lockin.transport.sent, ["ADVFILT 1", "REFZ 1"]);
    }

    #[test]
    fn ladder_orientation_matches_register_order() {
        let lockin = scripted(&[]);
        assert!(!lockin.sensitivity_ladder().is_increasing());
        assert_eq!(lockin.sensitivity_step_direction(), -1);
        assert_eq!(lockin.sensitivity_ladder().len(), 28);
        assert_eq!(lockin.time_constant_ladder().len(), 22);
    }
}

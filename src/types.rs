use serde::{Deserialize, Serialize};

/// Output low-pass filter slope (OFSL register, codes 0-3).
///
/// The slope determines both the harmonic rejection per octave and the
/// recommended settle multiplier before a reading is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterSlope {
    Db6,
    Db12,
    Db18,
    Db24,
}

impl FilterSlope {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Db6),
            1 => Some(Self::Db12),
            2 => Some(Self::Db18),
            3 => Some(Self::Db24),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Db6 => 0,
            Self::Db12 => 1,
            Self::Db18 => 2,
            Self::Db24 => 3,
        }
    }

    /// Attenuation gained per octave of separation from the filter corner,
    /// in positive dB.
    pub fn db_per_octave(self) -> f64 {
        match self {
            Self::Db6 => 6.0,
            Self::Db12 => 12.0,
            Self::Db18 => 18.0,
            Self::Db24 => 24.0,
        }
    }

    /// Settle multiplier: how many time constants to wait until the output
    /// has converged to within instrument noise for this slope.
    pub fn wait_factor(self) -> f64 {
        match self {
            Self::Db6 => 5.0,
            Self::Db12 => 7.0,
            Self::Db18 => 9.0,
            Self::Db24 => 10.0,
        }
    }
}

impl Default for FilterSlope {
    fn default() -> Self {
        Self::Db24
    }
}

/// Signal input coupling (ICPL register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputCoupling {
    Ac,
    Dc,
}

impl InputCoupling {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ac),
            1 => Some(Self::Dc),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Ac => 0,
            Self::Dc => 1,
        }
    }
}

impl Default for InputCoupling {
    fn default() -> Self {
        Self::Ac
    }
}

/// Reference oscillator source.
///
/// `Dual` and `Chop` exist only on the SR860; the SR830 profile rejects them
/// before any command is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceSource {
    Internal,
    External,
    Dual,
    Chop,
}

/// External reference trigger mode (RSLP on the SR830, RTRG on the SR860).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceTrigger {
    Sine,
    PosTtl,
    NegTtl,
}

impl ReferenceTrigger {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Sine),
            1 => Some(Self::PosTtl),
            2 => Some(Self::NegTtl),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Sine => 0,
            Self::PosTtl => 1,
            Self::NegTtl => 2,
        }
    }
}

/// External reference input impedance (SR860 REFZ register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceImpedance {
    #[serde(rename = "50ohm")]
    Ohm50,
    #[serde(rename = "1meg")]
    Meg1,
}

impl ReferenceImpedance {
    pub fn code(self) -> u8 {
        match self {
            Self::Ohm50 => 0,
            Self::Meg1 => 1,
        }
    }
}

/// Signal input configuration: single-ended or differential voltage, or
/// current with one of two shunt impedances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputConfig {
    VoltageA,
    VoltageDiff,
    Current1Meg,
    Current100Meg,
}

/// One measured grid cell, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub amplitude_setpoint: f64,
    pub amplitude_actual: f64,
    pub frequency_setpoint: f64,
    pub frequency_actual: f64,
    pub magnitude: f64,
    pub phase: f64,
    /// Complex-domain standard deviation; present only when averaging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stddev: Option<f64>,
}

impl SweepPoint {
    /// The four exported columns: achieved amplitude, achieved frequency,
    /// magnitude, phase.
    pub fn row(&self) -> [f64; 4] {
        [
            self.amplitude_actual,
            self.frequency_actual,
            self.magnitude,
            self.phase,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_slope_codes_round_trip() {
        for code in 0..4 {
            let slope = FilterSlope::from_code(code).unwrap();
            assert_eq!(slope.code() as i32, code);
        }
        assert!(FilterSlope::from_code(4).is_none());
        assert!(FilterSlope::from_code(-1).is_none());
    }

    #[test]
    fn wait_factor_grows_with_slope() {
        assert_eq!(FilterSlope::Db6.wait_factor(), 5.0);
        assert_eq!(FilterSlope::Db12.wait_factor(), 7.0);
        assert_eq!(FilterSlope::Db18.wait_factor(), 9.0);
        assert_eq!(FilterSlope::Db24.wait_factor(), 10.0);
    }

    #[test]
    fn exported_row_uses_achieved_values() {
        let point = SweepPoint {
            amplitude_setpoint: 0.1,
            amplitude_actual: 0.102,
            frequency_setpoint: 100.0,
            frequency_actual: 99.998,
            magnitude: 1.5e-3,
            phase: -12.0,
            stddev: None,
        };
        assert_eq!(point.row(), [0.102, 99.998, 1.5e-3, -12.0]);
    }
}

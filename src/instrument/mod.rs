//! Instrument profiles and VISA transport for the SRS lock-in family.
//!
//! [`LockinInterface`] is the model-independent surface the settle,
//! auto-range and sweep layers run against. [`Sr830`] and [`Sr860`]
//! implement it on top of any [`ScpiTransport`], normally a
//! [`VisaSession`].

pub mod interface;
#[cfg(test)]
pub(crate) mod mock;
pub mod sr830;
pub mod sr860;
pub mod visa;

pub use interface::LockinInterface;
pub use sr830::Sr830;
pub use sr860::Sr860;
pub use visa::{find_instrument, Identity, ScpiTransport, VisaSession, SRS_VENDOR};

use crate::error::LockinError;

fn unexpected(command: &str, response: &str) -> LockinError {
    LockinError::UnexpectedResponse {
        command: command.to_string(),
        response: response.to_string(),
    }
}

pub(crate) fn parse_int(command: &str, response: &str) -> Result<i32, LockinError> {
    response
        .trim()
        .parse()
        .map_err(|_| unexpected(command, response))
}

pub(crate) fn parse_float(command: &str, response: &str) -> Result<f64, LockinError> {
    response
        .trim()
        .parse()
        .map_err(|_| unexpected(command, response))
}

/// Parse a `SNAP?` style reply: two comma-separated floats.
pub(crate) fn parse_pair(command: &str, response: &str) -> Result<(f64, f64), LockinError> {
    let mut fields = response.split(',');
    let first = fields
        .next()
        .ok_or_else(|| unexpected(command, response))?;
    let second = fields
        .next()
        .ok_or_else(|| unexpected(command, response))?;
    Ok((
        first
            .trim()
            .parse()
            .map_err(|_| unexpected(command, response))?,
        second
            .trim()
            .parse()
            .map_err(|_| unexpected(command, response))?,
    ))
}

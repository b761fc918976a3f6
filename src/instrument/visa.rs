//! VISA session handling for SRS lock-in amplifiers.
//!
//! Wraps a [`visa_rs::Instrument`] in a line-oriented SCPI transport and
//! provides bus discovery by `*IDN?` vendor/model/serial matching. The
//! instrument profiles ([`Sr830`](crate::instrument::Sr830),
//! [`Sr860`](crate::instrument::Sr860)) are generic over [`ScpiTransport`]
//! so their command encoding can be exercised without hardware.

use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::result::Result;
use std::time::Duration;

use log::{debug, trace, warn};
use visa_rs::prelude::*;

use crate::error::LockinError;

/// `*IDN?` vendor field shared by the whole SR8xx family.
pub const SRS_VENDOR: &str = "Stanford_Research_Systems";

fn io_to_vs_err(err: std::io::Error) -> visa_rs::Error {
    visa_rs::io_to_vs_err(err)
}

/// Line-oriented command channel to one instrument.
///
/// Commands are sent LF-terminated and responses are read up to the first
/// LF, which matches the SR830/SR860 GPIB-over-VISA framing.
pub trait ScpiTransport {
    fn write_line(&mut self, command: &str) -> Result<(), LockinError>;
    fn query(&mut self, command: &str) -> Result<String, LockinError>;
}

/// Parsed `*IDN?` reply.
///
/// The SR830 reports its serial as `s/n47245`; the prefix is stripped so
/// serial numbers compare the way operators write them down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub vendor: String,
    pub model: String,
    pub serial: String,
}

impl Identity {
    pub fn parse(response: &str) -> Result<Self, LockinError> {
        let fields: Vec<&str> = response.trim().split(',').collect();
        if fields.len() < 3 {
            return Err(LockinError::UnexpectedResponse {
                command: "*IDN?".to_string(),
                response: response.to_string(),
            });
        }
        let serial = fields[2].trim();
        let serial = serial.strip_prefix("s/n").unwrap_or(serial);
        Ok(Identity {
            vendor: fields[0].trim().to_string(),
            model: fields[1].trim().to_string(),
            serial: serial.to_string(),
        })
    }
}

/// An open VISA session to a single instrument.
pub struct VisaSession {
    instr: Instrument,
    resource: String,
}

impl VisaSession {
    /// Open the given VISA resource (e.g. `GPIB0::8::INSTR`).
    pub fn open(rm: &DefaultRM, resource: &str, timeout: Duration) -> Result<Self, LockinError> {
        let rsc = CString::new(resource)
            .map_err(|e| LockinError::Config(format!("bad resource string {resource:?}: {e}")))?;
        let instr = rm.open(&rsc.into(), AccessMode::NO_LOCK, timeout)?;
        debug!("Opened VISA session to {}", resource);
        Ok(VisaSession {
            instr,
            resource: resource.to_string(),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Query `*IDN?` and parse the reply.
    pub fn identify(&mut self) -> Result<Identity, LockinError> {
        let response = self.query("*IDN?")?;
        Identity::parse(&response)
    }
}

impl ScpiTransport for VisaSession {
    fn write_line(&mut self, command: &str) -> Result<(), LockinError> {
        trace!("{} <- {}", self.resource, command);
        let line = format!("{command}\n");
        self.instr.write_all(line.as_bytes()).map_err(io_to_vs_err)?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, LockinError> {
        self.write_line(command)?;
        let mut response = String::new();
        {
            // Scope the reader so the session is usable again afterwards
            let mut reader = BufReader::new(&self.instr);
            reader.read_line(&mut response).map_err(io_to_vs_err)?;
        }
        trace!("{} -> {}", self.resource, response.trim_end());
        Ok(response.trim().to_string())
    }
}

/// Find exactly one instrument of `model` on the VISA bus.
///
/// Walks every `?*::INSTR` resource, identifies each responder and keeps
/// those whose vendor is [`SRS_VENDOR`] and whose model matches. With
/// `serial` given only that unit is accepted; without it the model must be
/// unique on the bus.
///
/// # Errors
///
/// [`LockinError::DeviceNotFound`] when nothing matches and
/// [`LockinError::AmbiguousDevice`] when several units match and no serial
/// was given.
pub fn find_instrument(
    rm: &DefaultRM,
    model: &str,
    serial: Option<&str>,
    timeout: Duration,
) -> Result<(VisaSession, Identity), LockinError> {
    let expr = CString::new("?*::INSTR")
        .map_err(|e| LockinError::Config(format!("bad search expression: {e}")))?;
    let mut list = rm.find_res_list(&expr.into())?;

    let mut matches: Vec<(VisaSession, Identity)> = Vec::new();
    while let Some(rsc) = list.find_next()? {
        let resource = rsc.to_string();
        // Unrelated or powered-down resources are expected on a shared bus
        let mut session = match VisaSession::open(rm, &resource, timeout) {
            Ok(session) => session,
            Err(e) => {
                debug!("Skipping {}: {}", resource, e);
                continue;
            }
        };
        let identity = match session.identify() {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Skipping {}: {}", resource, e);
                continue;
            }
        };
        if identity.vendor != SRS_VENDOR || identity.model != model {
            continue;
        }
        if let Some(wanted) = serial {
            if identity.serial != wanted {
                debug!(
                    "Ignoring {} {} s/n {} (looking for s/n {})",
                    identity.model, resource, identity.serial, wanted
                );
                continue;
            }
        }
        debug!(
            "Found {} s/n {} at {}",
            identity.model, identity.serial, resource
        );
        matches.push((session, identity));
    }

    match matches.len() {
        0 => Err(LockinError::DeviceNotFound(model.to_string())),
        1 => Ok(matches.remove(0)),
        count => {
            warn!("Found {} {} units; refusing to guess", count, model);
            Err(LockinError::AmbiguousDevice {
                model: model.to_string(),
                count,
            })
        }
    }
}

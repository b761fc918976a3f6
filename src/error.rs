use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockinError {
    #[error("VISA error: {0}")]
    Visa(#[from] visa_rs::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Ladder index {index} out of range (0..{len})")]
    IndexOutOfRange { index: i32, len: usize },
    #[error("Requested value {requested:.3e} exceeds largest available step {available:.3e}")]
    QuantizationLimit { requested: f64, available: f64 },
    #[error("Unexpected response to {command}: {response:?}")]
    UnexpectedResponse { command: String, response: String },
    #[error("No {0} found on the VISA bus")]
    DeviceNotFound(String),
    #[error("Found {count} {model} instruments; specify a serial number")]
    AmbiguousDevice { model: String, count: usize },
    #[error("Auto-ranging gave up after {steps} sensitivity adjustments")]
    RangingTimedOut { steps: usize },
    #[error("Sweep cancelled by operator")]
    Cancelled,
}

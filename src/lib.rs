pub mod autorange;
pub mod config;
pub mod error;
pub mod export;
pub mod instrument;
pub mod ladder;
pub mod logger;
pub mod plotting;
pub mod settle;
pub mod sweep;
pub mod types;
pub mod utils;

pub use autorange::{
    read_validated, RangeOptions, RangeWindow, WINDOW_CEILING_FRACTION, WINDOW_FLOOR_FRACTION,
};
pub use config::{
    load_config, load_config_or_default, AppConfig, InstrumentConfig, InstrumentModel,
};
pub use error::LockinError;
pub use export::{write_settings_json, timestamped_stem, ResultTable, TEXT_HEADER};
pub use instrument::{find_instrument, LockinInterface, ScpiTransport, Sr830, Sr860, VisaSession};
pub use ladder::Ladder;
pub use logger::PointLog;
pub use plotting::{determine_scale, NullView, SweepView, TerminalView};
pub use settle::{
    required_attenuation, required_settle_time, select_time_constants, SettleOutcome,
    SettleRequest,
};
pub use sweep::{
    average_readings, DualGridData, DualGridOptions, SweepDriver, SweepOptions,
    LOCK_POLLS_REQUIRED, STEP_CHANGE_EXTRA,
};
pub use types::{
    FilterSlope, InputConfig, InputCoupling, ReferenceImpedance, ReferenceSource,
    ReferenceTrigger, SweepPoint,
};

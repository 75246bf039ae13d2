pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod telemetry;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};

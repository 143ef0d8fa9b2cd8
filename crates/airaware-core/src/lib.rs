pub mod config;
pub mod error;
pub mod stats;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{
    Alert, AlertType, BusLinkState, ChannelKind, Channels, PushSubscription, Reading, Sensor,
    SensorStatus, Severity, User,
};

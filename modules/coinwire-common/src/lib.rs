pub mod config;
pub mod error;
pub mod types;

pub use config::{
    load_config, AppConfig, FileConfig, LifecycleConfig, MatchingConfig, ScheduleConfig,
};
pub use error::CoinwireError;
pub use types::*;

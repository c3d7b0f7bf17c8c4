pub mod config;
pub mod logging;

pub use config::{ContextConfig, RaceConfig, RaceMode, ReplyMode, StaggerConfig, TierConfig};

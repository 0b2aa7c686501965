pub mod schema;

pub use schema::{
    ComposerConfig, Config, CoordinatorConfig, DiscordConfig, GatewayConfig, ReliabilityConfig,
    TimersConfig, MIN_TIMER_POLL_MS,
};

//! Outbound chat transports.
//!
//! Every transport implements [`MessageTransport`]; the daemon builds the
//! configured one with [`build_transport`].

pub mod discord;
pub mod traits;

pub use discord::DiscordTransport;
pub use traits::{MessageTransport, TransportError};

use crate::config::Config;
use std::sync::Arc;

/// Build the transport described by `config.discord`.
pub fn build_transport(config: &Config) -> anyhow::Result<Arc<dyn MessageTransport>> {
    let token = config
        .discord
        .bot_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Discord bot token is not configured (set [discord].bot_token or DUOCAST_DISCORD_TOKEN)"
            )
        })?;

    Ok(Arc::new(DiscordTransport::new(
        token.to_string(),
        config.discord.api_base.clone(),
        config.discord.max_retries,
    )))
}

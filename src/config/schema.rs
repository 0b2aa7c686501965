use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Floor for the timer poll cadence.
pub const MIN_TIMER_POLL_MS: u64 = 200;

/// Top-level duocast configuration, loaded from `config.toml`.
///
/// Resolution order: `DUOCAST_CONFIG_DIR` env → `DUOCAST_WORKSPACE` env → `~/.duocast/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Correlation actor tuning (`[coordinator]`).
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Durable timer scheduler (`[timers]`).
    #[serde(default)]
    pub timers: TimersConfig,

    /// Event ingestion gateway (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Discord transport (`[discord]`).
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Default notification templates (`[composer]`).
    #[serde(default)]
    pub composer: ComposerConfig,

    /// Daemon supervisor backoff (`[reliability]`).
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

// ── Coordinator ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoordinatorConfig {
    /// How long a linked record waits for the other platform before
    /// notifying on its own (default: 12).
    #[serde(default = "default_wait_window_secs")]
    pub wait_window_secs: u64,
    /// Snapshots untouched for longer than this are treated as expired on
    /// startup (default: 172800, two days).
    #[serde(default = "default_stale_snapshot_secs")]
    pub stale_snapshot_secs: u64,
}

fn default_wait_window_secs() -> u64 {
    12
}

fn default_stale_snapshot_secs() -> u64 {
    172_800
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            wait_window_secs: default_wait_window_secs(),
            stale_snapshot_secs: default_stale_snapshot_secs(),
        }
    }
}

impl CoordinatorConfig {
    pub fn wait_window(&self) -> Duration {
        Duration::from_secs(self.wait_window_secs)
    }
}

// ── Timers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TimersConfig {
    /// Poll cadence for due timers in milliseconds (default: 1000, min: 200).
    #[serde(default = "default_timer_poll_ms")]
    pub poll_interval_ms: u64,
    /// Maximum timers fired concurrently per poll (default: 4).
    #[serde(default = "default_timer_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_timer_poll_ms() -> u64 {
    1000
}

fn default_timer_max_concurrent() -> usize {
    4
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_timer_poll_ms(),
            max_concurrent: default_timer_max_concurrent(),
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 42690)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Shared secret expected in `X-Webhook-Secret` on `POST /events`.
    /// Unset disables the check.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    42690
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            webhook_secret: None,
        }
    }
}

// ── Discord ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiscordConfig {
    /// Bot token. Overridden by `DUOCAST_DISCORD_TOKEN` or `DISCORD_BOT_TOKEN`.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// REST API base URL (default: `https://discord.com/api/v10`).
    #[serde(default)]
    pub api_base: Option<String>,
    /// Retries after HTTP 429 before giving up (default: 3).
    #[serde(default = "default_discord_max_retries")]
    pub max_retries: u32,
}

fn default_discord_max_retries() -> u32 {
    3
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: None,
            max_retries: default_discord_max_retries(),
        }
    }
}

// ── Composer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ComposerConfig {
    /// Live text used when a subscription has no template of its own.
    /// Placeholders: `{name}`, `{title}`, `{category}`, `{url}`, `{platform}`.
    #[serde(default = "default_live_template")]
    pub live_template: String,
    /// Offline text used when a subscription has no template of its own.
    #[serde(default = "default_offline_template")]
    pub offline_template: String,
    /// Embed accent colour as `0xRRGGBB`.
    #[serde(default = "default_embed_color")]
    pub embed_color: u32,
}

fn default_live_template() -> String {
    "{name} is now live on {platform}!".into()
}

fn default_offline_template() -> String {
    "{name} is now offline.".into()
}

fn default_embed_color() -> u32 {
    0x0091_46FF
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            live_template: default_live_template(),
            offline_template: default_offline_template(),
            embed_color: default_embed_color(),
        }
    }
}

// ── Reliability ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityConfig {
    /// Initial backoff for component restarts.
    #[serde(default = "default_component_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Max backoff for component restarts.
    #[serde(default = "default_component_backoff_max_secs")]
    pub component_max_backoff_secs: u64,
}

fn default_component_backoff_secs() -> u64 {
    2
}

fn default_component_backoff_max_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            component_initial_backoff_secs: default_component_backoff_secs(),
            component_max_backoff_secs: default_component_backoff_max_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let duocast_dir = default_config_dir().unwrap_or_else(|_| PathBuf::from(".duocast"));
        Self {
            workspace_dir: duocast_dir.join("workspace"),
            config_path: duocast_dir.join("config.toml"),
            coordinator: CoordinatorConfig::default(),
            timers: TimersConfig::default(),
            gateway: GatewayConfig::default(),
            discord: DiscordConfig::default(),
            composer: ComposerConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

// ── Directory resolution ─────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".duocast"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigResolutionSource {
    EnvConfigDir,
    EnvWorkspace,
    DefaultConfigDir,
}

impl ConfigResolutionSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::EnvConfigDir => "DUOCAST_CONFIG_DIR",
            Self::EnvWorkspace => "DUOCAST_WORKSPACE",
            Self::DefaultConfigDir => "default",
        }
    }
}

/// A workspace named `workspace` lives inside its config dir; any other path
/// is its own config dir.
fn resolve_config_dir_for_workspace(workspace_dir: &Path) -> (PathBuf, PathBuf) {
    match workspace_dir.file_name().and_then(|n| n.to_str()) {
        Some("workspace") => match workspace_dir.parent() {
            Some(parent) => (parent.to_path_buf(), workspace_dir.to_path_buf()),
            None => (workspace_dir.to_path_buf(), workspace_dir.join("workspace")),
        },
        _ => (workspace_dir.to_path_buf(), workspace_dir.join("workspace")),
    }
}

fn resolve_runtime_config_dirs(
    default_duocast_dir: &Path,
) -> (PathBuf, PathBuf, ConfigResolutionSource) {
    if let Ok(custom_config_dir) = std::env::var("DUOCAST_CONFIG_DIR") {
        let custom_config_dir = custom_config_dir.trim();
        if !custom_config_dir.is_empty() {
            let duocast_dir = PathBuf::from(custom_config_dir);
            return (
                duocast_dir.clone(),
                duocast_dir.join("workspace"),
                ConfigResolutionSource::EnvConfigDir,
            );
        }
    }

    if let Ok(custom_workspace) = std::env::var("DUOCAST_WORKSPACE") {
        if !custom_workspace.trim().is_empty() {
            let (duocast_dir, workspace_dir) =
                resolve_config_dir_for_workspace(&PathBuf::from(custom_workspace.trim()));
            return (
                duocast_dir,
                workspace_dir,
                ConfigResolutionSource::EnvWorkspace,
            );
        }
    }

    (
        default_duocast_dir.to_path_buf(),
        default_duocast_dir.join("workspace"),
        ConfigResolutionSource::DefaultConfigDir,
    )
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let default_dir = default_config_dir()?;
        let (duocast_dir, workspace_dir, source) = resolve_runtime_config_dirs(&default_dir);
        Self::load_or_init_in(&duocast_dir, workspace_dir, source.as_str()).await
    }

    /// Load `<duocast_dir>/config.toml`, creating it with defaults on first run.
    pub async fn load_or_init_at(duocast_dir: &Path) -> Result<Self> {
        Self::load_or_init_in(duocast_dir, duocast_dir.join("workspace"), "explicit").await
    }

    async fn load_or_init_in(
        duocast_dir: &Path,
        workspace_dir: PathBuf,
        source: &str,
    ) -> Result<Self> {
        let config_path = duocast_dir.join("config.toml");

        fs::create_dir_all(duocast_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                duocast_dir.display()
            )
        })?;
        fs::create_dir_all(&workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config {
                config_path: config_path.clone(),
                workspace_dir,
                ..Config::default()
            };
            config.save().await?;

            // Restrict permissions on newly created config file (holds the bot token)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            // Warn if config file is world-readable (may contain the bot token)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            source,
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    ///
    /// Called after TOML deserialization and env-override application to catch
    /// obviously invalid values early instead of failing at arbitrary runtime points.
    pub fn validate(&self) -> Result<()> {
        // Gateway
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }

        // Coordinator
        if self.coordinator.wait_window_secs == 0 {
            anyhow::bail!("coordinator.wait_window_secs must be greater than 0");
        }
        if self.coordinator.stale_snapshot_secs <= self.coordinator.wait_window_secs {
            anyhow::bail!("coordinator.stale_snapshot_secs must exceed coordinator.wait_window_secs");
        }

        // Timers
        if self.timers.max_concurrent == 0 {
            anyhow::bail!("timers.max_concurrent must be greater than 0");
        }

        // Reliability
        if self.reliability.component_initial_backoff_secs == 0 {
            anyhow::bail!("reliability.component_initial_backoff_secs must be greater than 0");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Workspace directory: DUOCAST_WORKSPACE
        if let Ok(workspace) = std::env::var("DUOCAST_WORKSPACE") {
            if !workspace.trim().is_empty() {
                let (_, workspace_dir) =
                    resolve_config_dir_for_workspace(&PathBuf::from(workspace.trim()));
                self.workspace_dir = workspace_dir;
            }
        }

        // Bot token: DUOCAST_DISCORD_TOKEN or DISCORD_BOT_TOKEN
        if let Ok(token) =
            std::env::var("DUOCAST_DISCORD_TOKEN").or_else(|_| std::env::var("DISCORD_BOT_TOKEN"))
        {
            if !token.trim().is_empty() {
                self.discord.bot_token = Some(token.trim().to_string());
            }
        }

        // Gateway port: DUOCAST_GATEWAY_PORT
        if let Ok(port_str) = std::env::var("DUOCAST_GATEWAY_PORT") {
            if let Ok(port) = port_str.trim().parse::<u16>() {
                self.gateway.port = port;
            } else {
                tracing::warn!(value = %port_str, "Ignoring invalid DUOCAST_GATEWAY_PORT");
            }
        }

        // Gateway host: DUOCAST_GATEWAY_HOST
        if let Ok(host) = std::env::var("DUOCAST_GATEWAY_HOST") {
            if !host.trim().is_empty() {
                self.gateway.host = host.trim().to_string();
            }
        }

        // Webhook secret: DUOCAST_WEBHOOK_SECRET
        if let Ok(secret) = std::env::var("DUOCAST_WEBHOOK_SECRET") {
            if !secret.trim().is_empty() {
                self.gateway.webhook_secret = Some(secret.trim().to_string());
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        Ok(())
    }

    /// `<workspace>/state/duocast.db`
    pub fn state_db_path(&self) -> PathBuf {
        crate::store::state_db_path(&self.workspace_dir)
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.coordinator.wait_window_secs, 12);
        assert_eq!(config.coordinator.stale_snapshot_secs, 172_800);
        assert_eq!(config.timers.poll_interval_ms, 1000);
        assert_eq!(config.timers.max_concurrent, 4);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 42690);
        assert_eq!(config.discord.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_fills_every_section_with_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.coordinator.wait_window_secs, 12);
        assert!(config.composer.live_template.contains("{name}"));
        assert_eq!(config.reliability.component_max_backoff_secs, 60);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
[coordinator]
wait_window_secs = 15

[gateway]
port = 9000
webhook_secret = "s3cret"
"#,
        )
        .unwrap();
        assert_eq!(config.coordinator.wait_window_secs, 15);
        assert_eq!(config.coordinator.stale_snapshot_secs, 172_800);
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.webhook_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn validate_rejects_zero_wait_window() {
        let mut config = Config::default();
        config.coordinator.wait_window_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wait_window_secs"));
    }

    #[test]
    fn validate_rejects_empty_host_and_zero_concurrency() {
        let mut config = Config::default();
        config.gateway.host = "  ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timers.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn workspace_named_workspace_lives_inside_its_config_dir() {
        let (config_dir, workspace) =
            resolve_config_dir_for_workspace(Path::new("/srv/duocast/workspace"));
        assert_eq!(config_dir, PathBuf::from("/srv/duocast"));
        assert_eq!(workspace, PathBuf::from("/srv/duocast/workspace"));

        let (config_dir, workspace) = resolve_config_dir_for_workspace(Path::new("/srv/custom"));
        assert_eq!(config_dir, PathBuf::from("/srv/custom"));
        assert_eq!(workspace, PathBuf::from("/srv/custom/workspace"));
    }

    #[test]
    fn wait_window_converts_to_duration() {
        assert_eq!(
            CoordinatorConfig::default().wait_window(),
            Duration::from_secs(12)
        );
    }
}

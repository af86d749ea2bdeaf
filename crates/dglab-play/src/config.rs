//! Service configuration: TOML file + CLI overrides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use dglab_client::validate_relay_uri;
use dglab_core::pulse::{playback_duration, MAX_PULSES_PER_MESSAGE};
use dglab_core::{DgLabError, DgLabResult};

use crate::session::QUEUE_CAPACITY;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub pulse: PulseSection,
    #[serde(default)]
    pub game: GameSection,
}

/// `[server]` section: where Apps reach the relay.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Connect outward to `remote_uri` instead of hosting a relay.
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub remote_uri: Option<String>,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Address written into pairing codes; must be reachable by the App.
    #[serde(default = "default_publish_uri")]
    pub publish_uri: String,
    /// Seconds between relay heartbeats; absent disables them.
    #[serde(default)]
    pub heartbeat_interval: Option<f64>,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            remote: false,
            remote_uri: None,
            local_host: default_local_host(),
            local_port: default_local_port(),
            publish_uri: default_publish_uri(),
            heartbeat_interval: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// `[client]` section: terminal lifecycle timeouts in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_bind_timeout")]
    pub bind_timeout: f64,
    #[serde(default = "default_register_timeout")]
    pub register_timeout: f64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            bind_timeout: default_bind_timeout(),
            register_timeout: default_register_timeout(),
        }
    }
}

/// `[pulse]` section: waveform replay tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PulseSection {
    #[serde(default = "default_custom_pulse_data")]
    pub custom_pulse_data: String,
    #[serde(default = "default_duration_per_post")]
    pub duration_per_post: f64,
    #[serde(default = "default_post_interval")]
    pub post_interval: f64,
    #[serde(default = "default_sleep_after_clear")]
    pub sleep_after_clear: f64,
}

impl Default for PulseSection {
    fn default() -> Self {
        Self {
            custom_pulse_data: default_custom_pulse_data(),
            duration_per_post: default_duration_per_post(),
            post_interval: default_post_interval(),
            sleep_after_clear: default_sleep_after_clear(),
        }
    }
}

/// `[game]` section: dice round settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GameSection {
    #[serde(default = "default_max_round")]
    pub max_round: u32,
    #[serde(default = "default_roll_timeout")]
    pub timeout: f64,
    #[serde(default = "default_punish")]
    pub punish: u8,
}

impl Default for GameSection {
    fn default() -> Self {
        Self {
            max_round: default_max_round(),
            timeout: default_roll_timeout(),
            punish: default_punish(),
        }
    }
}

fn default_local_host() -> String {
    "0.0.0.0".to_string()
}
fn default_local_port() -> u16 {
    4567
}
fn default_publish_uri() -> String {
    "ws://127.0.0.1:4567".to_string()
}
fn default_bind_timeout() -> f64 {
    60.0
}
fn default_register_timeout() -> f64 {
    30.0
}
fn default_custom_pulse_data() -> String {
    "~/.dglab-play/custom-pulse-data.json".to_string()
}
fn default_duration_per_post() -> f64 {
    10.0
}
fn default_post_interval() -> f64 {
    1.0
}
fn default_sleep_after_clear() -> f64 {
    0.5
}
fn default_max_round() -> u32 {
    5
}
fn default_roll_timeout() -> f64 {
    30.0
}
fn default_punish() -> u8 {
    10
}

/// PEM files for serving the local relay over `wss://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Locally hosted relay settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRelaySettings {
    pub host: String,
    pub port: u16,
    pub publish_uri: String,
    pub heartbeat_interval: Option<Duration>,
    pub tls: Option<TlsFiles>,
}

/// Where terminals get their relay from.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMode {
    /// Terminals connect outward to a relay at this address.
    Remote { uri: String },
    /// Terminals live inside a relay hosted by this process.
    Local(LocalRelaySettings),
}

impl RelayMode {
    /// Base address embedded in pairing codes.
    pub fn pairing_base(&self) -> &str {
        match self {
            Self::Remote { uri } => uri,
            Self::Local(local) => &local.publish_uri,
        }
    }
}

/// Terminal lifecycle timeouts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientTimeouts {
    pub register_timeout: Duration,
    pub bind_timeout: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            register_timeout: Duration::from_secs(30),
            bind_timeout: Duration::from_secs(60),
        }
    }
}

/// Waveform replay settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseSettings {
    pub custom_pulse_data: PathBuf,
    /// Upper bound on the playback time of one submission.
    pub duration_per_post: Duration,
    /// Pause between submissions while filling the App queue.
    pub post_interval: Duration,
    /// Pause after clearing the queue before the first submission.
    pub sleep_after_clear: Duration,
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            custom_pulse_data: expand_tilde_str(&default_custom_pulse_data()),
            duration_per_post: Duration::from_secs(10),
            post_interval: Duration::from_secs(1),
            sleep_after_clear: Duration::from_millis(500),
        }
    }
}

/// Replay settings that load fine but will misbehave at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseWarning {
    /// Posts longer than half the queue leave gaps during steady state.
    PostExceedsHalfQueue,
    /// Posts longer than one App message will be rejected.
    PostExceedsMessageLimit,
    ZeroPostInterval,
}

impl fmt::Display for PulseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PostExceedsHalfQueue => write!(
                f,
                "pulse.duration_per_post exceeds half of the {}s App queue; playback may stutter",
                QUEUE_CAPACITY.as_secs()
            ),
            Self::PostExceedsMessageLimit => write!(
                f,
                "pulse.duration_per_post exceeds the {}s per-message limit; submissions will be rejected",
                playback_duration(MAX_PULSES_PER_MESSAGE).as_secs()
            ),
            Self::ZeroPostInterval => write!(f, "pulse.post_interval is zero; the queue fill will burst"),
        }
    }
}

impl PulseSettings {
    pub fn warnings(&self) -> Vec<PulseWarning> {
        let mut warnings = Vec::new();
        if self.duration_per_post > QUEUE_CAPACITY / 2 {
            warnings.push(PulseWarning::PostExceedsHalfQueue);
        }
        if self.duration_per_post > playback_duration(MAX_PULSES_PER_MESSAGE) {
            warnings.push(PulseWarning::PostExceedsMessageLimit);
        }
        if self.post_interval.is_zero() {
            warnings.push(PulseWarning::ZeroPostInterval);
        }
        warnings
    }
}

/// Dice round settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameSettings {
    pub max_round: u32,
    pub roll_timeout: Duration,
    /// Strength added to both channels of the round's loser.
    pub punish: u8,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            max_round: default_max_round(),
            roll_timeout: Duration::from_secs(30),
            punish: default_punish(),
        }
    }
}

/// Everything a session needs to drive its terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub timeouts: ClientTimeouts,
    pub pulse: PulseSettings,
    pub pairing_base: String,
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone, PartialEq)]
pub struct PlayConfig {
    pub relay: RelayMode,
    pub timeouts: ClientTimeouts,
    pub pulse: PulseSettings,
    pub game: GameSettings,
}

/// CLI values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub remote_uri: Option<String>,
    pub port: Option<u16>,
    pub publish_uri: Option<String>,
}

impl PlayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> DgLabResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| DgLabError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides)?;
        for warning in config.pulse.warnings() {
            warn!(%warning, "questionable pulse settings");
        }
        Ok(config)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &Overrides) -> DgLabResult<Self> {
        let mut server = file.server;
        if let Some(uri) = &overrides.remote_uri {
            server.remote = true;
            server.remote_uri = Some(uri.clone());
        }
        if let Some(port) = overrides.port {
            server.local_port = port;
        }
        if let Some(uri) = &overrides.publish_uri {
            server.publish_uri = uri.clone();
        }

        let relay = if server.remote {
            let uri = server
                .remote_uri
                .filter(|u| !u.is_empty())
                .ok_or_else(|| DgLabError::Config("server.remote is set but server.remote_uri is missing".into()))?;
            validate_relay_uri(&uri).map_err(|e| DgLabError::Config(e.to_string()))?;
            RelayMode::Remote { uri }
        } else {
            if server.local_host.is_empty() || server.local_port == 0 || server.publish_uri.is_empty() {
                return Err(DgLabError::Config(
                    "local relay needs server.local_host, server.local_port and server.publish_uri".into(),
                ));
            }
            let tls = match (server.tls_cert, server.tls_key) {
                (Some(cert), Some(key)) => Some(TlsFiles {
                    cert: expand_tilde_str(&cert),
                    key: expand_tilde_str(&key),
                }),
                (None, None) => None,
                _ => {
                    return Err(DgLabError::Config(
                        "server.tls_cert and server.tls_key must be set together".into(),
                    ))
                }
            };
            RelayMode::Local(LocalRelaySettings {
                host: server.local_host,
                port: server.local_port,
                publish_uri: server.publish_uri,
                heartbeat_interval: server
                    .heartbeat_interval
                    .map(|s| seconds("server.heartbeat_interval", s))
                    .transpose()?,
                tls,
            })
        };

        Ok(Self {
            relay,
            timeouts: ClientTimeouts {
                register_timeout: seconds("client.register_timeout", file.client.register_timeout)?,
                bind_timeout: seconds("client.bind_timeout", file.client.bind_timeout)?,
            },
            pulse: PulseSettings {
                custom_pulse_data: expand_tilde_str(&file.pulse.custom_pulse_data),
                duration_per_post: seconds("pulse.duration_per_post", file.pulse.duration_per_post)?,
                post_interval: seconds("pulse.post_interval", file.pulse.post_interval)?,
                sleep_after_clear: seconds("pulse.sleep_after_clear", file.pulse.sleep_after_clear)?,
            },
            game: GameSettings {
                max_round: file.game.max_round,
                roll_timeout: seconds("game.timeout", file.game.timeout)?,
                punish: file.game.punish,
            },
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            timeouts: self.timeouts,
            pulse: self.pulse.clone(),
            pairing_base: self.relay.pairing_base().to_string(),
        }
    }
}

fn seconds(name: &str, value: f64) -> DgLabResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| DgLabError::Config(format!("{name} = {value}: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use huddle_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::access::TokenTtls;
use crate::server::listener::ListenerSettings;
use crate::server::realtime::RealtimeSettings;
use crate::store::CacheTtls;

/// Default config path: `~/.huddle/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".huddle").join("config.toml"))
}

/// Load the server config from TOML at `path` (missing file means defaults),
/// then apply `HUDDLE_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Parse a TOML document without touching the environment.
pub fn parse_server_config(toml_src: &str) -> anyhow::Result<ServerConfig> {
	let file: FileConfig = toml::from_str(toml_src).context("parse TOML")?;
	Ok(ServerConfig::from_file(file))
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub cache: CacheSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Websocket bind endpoint (`ws://host:port`).
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional token-exchange HTTP bind address (host:port). Meant for the
	/// authenticating gateway, not for direct client access.
	pub api_bind: Option<String>,
	pub outbound_queue_capacity: usize,
	pub max_message_chars: usize,
	pub max_frame_bytes: usize,
	/// Messages sent to a connection right after it registers. 0 disables.
	pub history_on_join: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		let listener = ListenerSettings::default();
		let realtime = RealtimeSettings::default();
		Self {
			bind: None,
			metrics_bind: None,
			health_bind: None,
			api_bind: None,
			outbound_queue_capacity: listener.outbound_queue_capacity,
			max_message_chars: realtime.max_message_chars,
			max_frame_bytes: listener.max_frame_bytes,
			history_on_join: realtime.history_on_join,
		}
	}
}

impl ServerSettings {
	pub fn listener_settings(&self) -> ListenerSettings {
		ListenerSettings {
			outbound_queue_capacity: self.outbound_queue_capacity,
			max_frame_bytes: self.max_frame_bytes,
		}
	}

	pub fn realtime_settings(&self) -> RealtimeSettings {
		RealtimeSettings {
			max_message_chars: self.max_message_chars,
			history_on_join: self.history_on_join,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// Secret the token key is derived from. Required to start.
	pub token_secret: Option<SecretString>,
	pub room_token_ttl_secs: i64,
	pub connection_token_ttl_secs: i64,
}

impl Default for AuthSettings {
	fn default() -> Self {
		let ttls = TokenTtls::default();
		Self {
			token_secret: None,
			room_token_ttl_secs: ttls.room_secs,
			connection_token_ttl_secs: ttls.connection_secs,
		}
	}
}

impl AuthSettings {
	pub fn token_ttls(&self) -> TokenTtls {
		TokenTtls {
			room_secs: self.room_token_ttl_secs,
			connection_secs: self.connection_token_ttl_secs,
		}
	}
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
	pub enabled: bool,
	pub ttls: CacheTtls,
	pub max_entries: usize,
}

impl Default for CacheSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			ttls: CacheTtls::default(),
			max_entries: 100_000,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). `None` selects the in-memory store.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	cache: FileCacheSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	api_bind: Option<String>,
	outbound_queue_capacity: Option<usize>,
	max_message_chars: Option<usize>,
	max_frame_bytes: Option<usize>,
	history_on_join: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	token_secret: Option<String>,
	room_token_ttl_secs: Option<i64>,
	connection_token_ttl_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	enabled: Option<bool>,
	authz_ttl_secs: Option<u64>,
	room_ttl_secs: Option<u64>,
	profile_ttl_secs: Option<u64>,
	message_ttl_secs: Option<u64>,
	max_entries: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let auth_defaults = AuthSettings::default();
		let cache_defaults = CacheSettings::default();

		let ttl = |v: Option<u64>, default: Duration| v.filter(|s| *s > 0).map(Duration::from_secs).unwrap_or(default);

		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				api_bind: non_empty(file.server.api_bind),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.outbound_queue_capacity),
				max_message_chars: file
					.server
					.max_message_chars
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_message_chars),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_frame_bytes),
				history_on_join: file
					.server
					.history_on_join
					.unwrap_or(server_defaults.history_on_join),
			},
			auth: AuthSettings {
				token_secret: non_empty(file.auth.token_secret).map(SecretString::new),
				room_token_ttl_secs: file
					.auth
					.room_token_ttl_secs
					.filter(|v| *v > 0)
					.unwrap_or(auth_defaults.room_token_ttl_secs),
				connection_token_ttl_secs: file
					.auth
					.connection_token_ttl_secs
					.filter(|v| *v > 0)
					.unwrap_or(auth_defaults.connection_token_ttl_secs),
			},
			cache: CacheSettings {
				enabled: file.cache.enabled.unwrap_or(cache_defaults.enabled),
				ttls: CacheTtls {
					authz: ttl(file.cache.authz_ttl_secs, cache_defaults.ttls.authz),
					room: ttl(file.cache.room_ttl_secs, cache_defaults.ttls.room),
					profile: ttl(file.cache.profile_ttl_secs, cache_defaults.ttls.profile),
					message: ttl(file.cache.message_ttl_secs, cache_defaults.ttls.message),
				},
				max_entries: file
					.cache
					.max_entries
					.filter(|v| *v > 0)
					.unwrap_or(cache_defaults.max_entries),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	non_empty(std::env::var(name).ok())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("HUDDLE_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_API_BIND") {
		cfg.server.api_bind = Some(v);
		info!("server config: api_bind overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_HISTORY_ON_JOIN")
		&& let Ok(count) = v.parse::<usize>()
	{
		cfg.server.history_on_join = count;
		info!(count, "server config: history_on_join overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_MAX_MESSAGE_CHARS")
		&& let Ok(chars) = v.parse::<usize>()
		&& chars > 0
	{
		cfg.server.max_message_chars = chars;
		info!(chars, "server config: max_message_chars overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_TOKEN_SECRET") {
		cfg.auth.token_secret = Some(SecretString::new(v));
		info!("server auth: token_secret overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_ROOM_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.parse::<i64>()
		&& secs > 0
	{
		cfg.auth.room_token_ttl_secs = secs;
		info!(secs, "server auth: room_token_ttl_secs overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_CONNECTION_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.parse::<i64>()
		&& secs > 0
	{
		cfg.auth.connection_token_ttl_secs = secs;
		info!(secs, "server auth: connection_token_ttl_secs overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_CACHE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.cache.enabled = enabled;
		info!(enabled, "cache: enabled overridden by env");
	}

	if let Some(v) = env_string("HUDDLE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.cache.ttls.authz > Duration::from_secs(60) {
		warn!(
			authz_ttl_secs = cfg.cache.ttls.authz.as_secs(),
			"cache: authz ttl above 60s widens the window for stale memberships"
		);
	}
}

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use huddle_server::config::{self, ServerConfig};
use huddle_server::server::access::AccessService;
use huddle_server::server::api::spawn_api_server;
use huddle_server::server::health::{HealthState, spawn_health_server};
use huddle_server::server::hub::{Hub, HubConfig};
use huddle_server::server::listener;
use huddle_server::server::realtime::RealtimeService;
use huddle_server::server::token::TokenAuthority;
use huddle_server::store::{CacheBackend, CachedStore, ChatStore, MemoryCache, MemoryStore, NoopCache, SqlStore};
use huddle_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_BIND: &str = "ws://127.0.0.1:18204";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: huddle_server [--bind ws://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: ws://127.0.0.1:18204)\n\
\t          Format: ws://host:port\n\
\t--config   Config file (default: ~/.huddle/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(cli: Option<&str>, cfg: &ServerConfig) -> anyhow::Result<SocketAddr> {
	let raw = cli.or(cfg.server.bind.as_deref()).unwrap_or(DEFAULT_BIND);
	let endpoint = WsEndpoint::parse(raw).map_err(|e| anyhow!(e))?;
	endpoint.to_socket_addr_if_ip_literal().map_err(|e| anyhow!(e))
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,huddle_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("huddle_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
	let durable: Arc<dyn ChatStore> = match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let store = SqlStore::connect(url).await?;
			info!(backend = store.backend_name(), "durable store connected");
			Arc::new(store)
		}
		None => {
			warn!("no database_url configured; using in-memory store (data is lost on restart)");
			Arc::new(MemoryStore::new())
		}
	};

	let cache: Arc<dyn CacheBackend> = if cfg.cache.enabled {
		info!(max_entries = cfg.cache.max_entries, "in-process cache enabled");
		Arc::new(MemoryCache::new(cfg.cache.max_entries))
	} else {
		info!("cache disabled; every read goes to the store");
		Arc::new(NoopCache)
	};

	Ok(Arc::new(CachedStore::new(durable, cache, cfg.cache.ttls)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = resolve_bind(args.bind.as_deref(), &server_cfg)?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				let addr = spawn_health_server(addr, health_state.clone()).await?;
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let Some(secret) = server_cfg.auth.token_secret.as_ref() else {
		return Err(anyhow!("auth.token_secret must be set (or HUDDLE_TOKEN_SECRET)"));
	};
	let tokens = Arc::new(TokenAuthority::new(secret.expose()));

	let store = build_store(&server_cfg).await?;
	let hub = Hub::new(store.clone(), HubConfig::default());
	let access = AccessService::new(tokens.clone(), store.clone(), hub.clone(), server_cfg.auth.token_ttls());
	let realtime = RealtimeService::new(tokens, store, hub, server_cfg.server.realtime_settings());

	if let Some(bind) = server_cfg.server.api_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				let addr = spawn_api_server(addr, access).await?;
				info!(%addr, "token exchange api listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid api bind address (expected host:port)"),
		}
	} else {
		info!("no api_bind configured; token exchange api disabled");
	}

	let tcp = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind websocket listener on {bind_addr}"))?;

	health_state.mark_ready();

	let result = listener::serve(tcp, realtime, server_cfg.server.listener_settings()).await;
	health_state.mark_not_ready();
	result
}

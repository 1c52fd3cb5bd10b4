#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use donerelay_platform::api::{ChzzkApi, SoopApi};
use donerelay_platform::transport::websocket_connector;
use donerelay_platform::{AlwaysEnabled, LiveDrivers};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::FileConfigProvider;
use crate::server::control::run_control;
use crate::server::host::{ConsoleExecutor, LogEventSink, PresenceRegistry};
use crate::server::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: donerelay_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: $DONERELAY_CONFIG or ~/.donerelay/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,donerelay_server=debug,donerelay_platform=debug".to_string());

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
				let tracer = tracer_provider.tracer("donerelay_server");
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

	match bind.parse::<std::net::SocketAddr>() {
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

/// Reload on SIGHUP until `stop` fires.
#[cfg(unix)]
async fn reload_on_hangup(orch: Arc<Orchestrator>, stop: CancellationToken) {
	use tokio::signal::unix::{SignalKind, signal};

	let mut hangups = match signal(SignalKind::hangup()) {
		Ok(s) => s,
		Err(e) => {
			warn!(error = %e, "cannot listen for SIGHUP; reload via the console only");
			return;
		}
	};

	loop {
		tokio::select! {
			_ = stop.cancelled() => break,
			got = hangups.recv() => {
				if got.is_none() {
					break;
				}
				info!("SIGHUP received; reloading");
				match orch.reload().await {
					Ok(report) => info!(connected = report.connected, total = report.total, "reload complete"),
					Err(e) => warn!(error = %e, "reload failed"),
				}
			}
		}
	}
}

#[cfg(not(unix))]
async fn reload_on_hangup(_orch: Arc<Orchestrator>, stop: CancellationToken) {
	stop.cancelled().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = crate::config::resolve_config_path(parse_args())?;
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded relay config (toml + env overrides)");

	let runtime = cfg.runtime;
	init_metrics(runtime.server.metrics_bind.as_deref());

	let drivers = LiveDrivers::new(
		ChzzkApi::new(runtime.chzzk_api.clone())?,
		SoopApi::new(runtime.soop_api.clone())?,
		websocket_connector(),
	);
	let presence = Arc::new(PresenceRegistry::new(runtime.presence.iter().cloned()));

	let orch = Arc::new(Orchestrator::new(
		Collaborators {
			executor: Arc::new(ConsoleExecutor::stdout()),
			sink: Arc::new(LogEventSink),
			presence: presence.clone(),
			gate: Arc::new(AlwaysEnabled),
			drivers: Arc::new(drivers),
			provider: Arc::new(FileConfigProvider::new(&config_path).with_startup(&runtime)),
		},
		runtime.connection.session.clone(),
		OrchestratorSettings::from(&runtime.connection),
	));

	let report = orch.start().await.map_err(|e| {
		error!(error = %e, path = %config_path.display(), "initial configuration rejected");
		e
	})?;
	info!(connected = report.connected, total = report.total, "relay started");

	let stop = CancellationToken::new();
	let control = tokio::spawn(run_control(
		BufReader::new(tokio::io::stdin()),
		Arc::clone(&orch),
		presence,
		stop.clone(),
	));
	let hangup = tokio::spawn(reload_on_hangup(Arc::clone(&orch), stop.clone()));

	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
	}
	info!("shutdown requested");
	stop.cancel();

	orch.shutdown().await;
	let _ = tokio::join!(control, hangup);
	Ok(())
}

use clap::Parser;
use cli::CliOpts;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use config::RuntimeConfig;
use nap_core::{
	dispatcher::EventDispatcher,
	pubsub::local,
	session::{listener, OutputEvent, SessionMultiplexer, Store},
	shutdown::Controller,
	telemetry::{self, MetricCounter, MetricValue, Metrics},
	utils::spawn_in_span,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, select, sync::mpsc::UnboundedReceiver, time};
use tracing::{error, info, warn, Level, Subscriber};
use tracing_subscriber::{
	fmt::format::{self},
	EnvFilter, FmtSubscriber,
};

mod cli;
mod config;
mod server;

const SERVICE_NAME: &str = "nap-gateway";

pub fn json_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.json()
		.with_env_filter(EnvFilter::new(format!(
			"nap_gateway={log_level},nap_core={log_level}"
		)))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
}

pub fn default_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(EnvFilter::new(format!(
			"nap_gateway={log_level},nap_core={log_level}"
		)))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
}

async fn run(cfg: RuntimeConfig, shutdown: Controller<String>) -> Result<()> {
	let version = clap::crate_version!();
	info!(version, "Running {}", clap::crate_name!());
	info!("Using config: {:?}", cfg);

	let (broker, broker_event_loop) = local::init(shutdown.clone());
	spawn_in_span(shutdown.with_cancel(broker_event_loop.run()));

	let (pubsub, pubsub_events) = broker
		.attach(cfg.proxy.node_id)
		.wrap_err("Unable to attach to the pub/sub substrate")?;

	let (event_sender, event_receiver) = tokio::sync::mpsc::unbounded_channel();
	let multiplexer = SessionMultiplexer::new(
		cfg.proxy.clone(),
		Arc::new(pubsub),
		shutdown.clone(),
		event_sender,
	);

	let dispatcher = EventDispatcher::new(multiplexer.clone(), pubsub_events, shutdown.clone());
	spawn_in_span(dispatcher.run());

	if cfg.proxy.role.is_server() {
		multiplexer
			.subscribe_served()
			.await
			.wrap_err("Unable to subscribe to served FQDNs")?;
	}

	if cfg.proxy.role.is_client() {
		let address = cfg.proxy.proxy_address()?;
		let proxy_listener = TcpListener::bind(address)
			.await
			.wrap_err_with(|| format!("Unable to bind HTTP proxy to {address}"))?;
		spawn_in_span(listener::run(multiplexer.clone(), proxy_listener));
	}

	let cleaner = multiplexer.clone();
	let buffers = cfg.buffers.clone();
	spawn_in_span(shutdown.with_cancel(async move { cleaner.run_cleaners(buffers).await }));

	spawn_in_span(shutdown.with_cancel(server::run((&cfg).into(), multiplexer.clone())));

	let resource_attributes = vec![
		("version", version.to_string()),
		("role", cfg.proxy.role.to_string()),
		("node_id", cfg.proxy.node_id.to_string()),
	];

	let metrics = telemetry::otlp::initialize(SERVICE_NAME, cfg.otel.clone(), resource_attributes)
		.wrap_err("Unable to initialize OpenTelemetry service")?;

	let flush_interval = Duration::from_secs(cfg.otel.ot_flush_interval);
	let mut state = ClientState::new(metrics, multiplexer);
	spawn_in_span(shutdown.with_cancel(async move {
		state.handle_events(event_receiver, flush_interval).await;
	}));

	Ok(())
}

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(cfg_path) = &opts.config {
		confy::load_path(cfg_path)
			.wrap_err(format!("Failed to load configuration from: {cfg_path}"))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	if let Some(role) = opts.role {
		cfg.proxy.role = role;
	}

	if let Some(proxy_port) = opts.http_proxy_port {
		cfg.proxy.http_proxy_port = proxy_port;
	}

	if let Some(http_port) = opts.http_server_port {
		cfg.http_server_port = http_port;
	}

	if let Some(http_host) = opts.http_server_host.clone() {
		cfg.http_server_host = http_host;
	}

	if cfg.proxy.mitu <= nap_core::transport::DATA_HEADER_LENGTH {
		return Err(eyre!(
			"MITU of {} bytes leaves no room for LTP payload",
			cfg.proxy.mitu
		));
	}

	Ok(cfg)
}

struct ClientState {
	metrics: telemetry::otlp::Metrics,
	multiplexer: SessionMultiplexer,
}

impl ClientState {
	fn new(metrics: telemetry::otlp::Metrics, multiplexer: SessionMultiplexer) -> Self {
		ClientState {
			metrics,
			multiplexer,
		}
	}

	async fn handle_event(&mut self, event: OutputEvent) {
		match event {
			OutputEvent::ConnectionAccepted => {
				self.metrics
					.count(MetricCounter::AcceptedConnections)
					.await;
			},
			OutputEvent::RequestBuffered => {
				self.metrics.count(MetricCounter::BufferedRequests).await;
			},
			OutputEvent::FragmentsPublished(count) => {
				for _ in 0..count {
					self.metrics
						.count(MetricCounter::PublishedFragments)
						.await;
				}
			},
			OutputEvent::PacketReassembled => {
				self.metrics
					.count(MetricCounter::ReassembledPackets)
					.await;
			},
			OutputEvent::PacketDropped => {
				self.metrics.count(MetricCounter::DroppedPackets).await;
			},
			OutputEvent::SessionEnded => {
				self.metrics.count(MetricCounter::EndedSessions).await;
			},
			OutputEvent::SurrogateRelayed => {
				self.metrics.count(MetricCounter::SurrogateRelays).await;
			},
			OutputEvent::BufferSize { store, size } => {
				let value = match store {
					Store::Fragments => MetricValue::FragmentBufferSize(size),
					Store::Requests => MetricValue::RequestBufferSize(size),
					Store::ReverseLookup => MetricValue::ReverseLookupSize(size),
					Store::Dns => MetricValue::DnsCacheSize(size),
				};
				self.metrics.record(value).await;
			},
			OutputEvent::CmcGroupLocked { members } => {
				self.metrics
					.record(MetricValue::CmcGroupSize(members))
					.await;
			},
		}
	}

	async fn handle_events(
		&mut self,
		mut receiver: UnboundedReceiver<OutputEvent>,
		flush_interval: Duration,
	) {
		self.metrics.count(MetricCounter::Starts).await;
		let mut flush = time::interval(flush_interval);
		loop {
			select! {
				Some(event) = receiver.recv() => self.handle_event(event).await,
				_ = flush.tick() => {
					self.metrics.count(MetricCounter::Up).await;
					let groups = self.multiplexer.status().cmc_groups;
					self.metrics.record(MetricValue::CmcGroups(groups)).await;
					if let Err(error) = self.metrics.flush().await {
						warn!("Unable to flush metrics: {error:#}");
					}
				},
				// break the loop if all channels are closed
				else => break,
			}
		}
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// spawn a task to watch for ctrl-c signals from user to trigger the shutdown
	spawn_in_span(shutdown.on_user_signal("User signaled shutdown".to_string()));

	if let Err(error) = run(cfg, shutdown.clone()).await {
		error!("{error:#}");
		return Err(error.wrap_err("Starting the gateway failed"));
	};

	let reason = shutdown.completed_shutdown().await;

	// we are not logging error here since expectation is
	// to log terminating condition before sending message to this channel
	Err(eyre!(reason).wrap_err("Running the gateway encountered an error"))
}

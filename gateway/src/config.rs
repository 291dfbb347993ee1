use color_eyre::eyre::{self, Context};
use nap_core::{
	configuration::{BufferConfig, ProxyConfig},
	telemetry::otlp::OtelConfig,
	types::tracing_level_format,
};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, net::SocketAddr, str::FromStr};
use tracing::Level;

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
	/// Status HTTP server host name (default: 127.0.0.1).
	pub http_server_host: String,
	/// Status HTTP server port (default: 7700).
	pub http_server_port: u16,
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	#[serde(flatten)]
	pub buffers: BufferConfig,
	#[serde(flatten)]
	pub otel: OtelConfig,
	// tables of the proxy section have to be serialized last
	#[serde(flatten)]
	pub proxy: ProxyConfig,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			http_server_host: "127.0.0.1".to_owned(),
			http_server_port: 7700,
			log_level: Level::INFO,
			log_format_json: false,
			proxy: Default::default(),
			buffers: Default::default(),
			otel: Default::default(),
		}
	}
}

pub struct Addr {
	pub host: String,
	pub port: u16,
}

impl From<&RuntimeConfig> for Addr {
	fn from(value: &RuntimeConfig) -> Self {
		Addr {
			host: value.http_server_host.clone(),
			port: value.http_server_port,
		}
	}
}

impl TryInto<SocketAddr> for Addr {
	type Error = eyre::Error;

	fn try_into(self) -> Result<SocketAddr, Self::Error> {
		SocketAddr::from_str(&format!("{self}")).wrap_err("Unable to parse host and port")
	}
}

impl Display for Addr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nap_core::configuration::NodeRole;
	use test_case::test_case;

	#[test_case("127.0.0.1", 7700 => true)]
	#[test_case("0.0.0.0", 80 => true)]
	#[test_case("localhost", 7700 => false; "host names are not resolved")]
	fn addr_parsing(host: &str, port: u16) -> bool {
		let addr = Addr {
			host: host.to_string(),
			port,
		};
		TryInto::<SocketAddr>::try_into(addr).is_ok()
	}

	#[test]
	fn flattened_sections_deserialize() {
		let config: RuntimeConfig = serde_json::from_str(
			r#"{
				"role": "server",
				"http_proxy_port": 8080,
				"fragment_buffer_timeout": 30,
				"fqdns": { "example.com": "127.0.0.1:8000" },
				"log_level": "DEBUG"
			}"#,
		)
		.unwrap();
		assert_eq!(config.proxy.role, NodeRole::Server);
		assert_eq!(config.proxy.http_proxy_port, 8080);
		assert_eq!(config.proxy.origin("example.com"), Some("127.0.0.1:8000"));
		assert_eq!(config.buffers.fragment_buffer_timeout.as_secs(), 30);
		assert_eq!(config.buffers.request_buffer_timeout.as_secs(), 529);
		assert_eq!(config.log_level, Level::DEBUG);
		assert_eq!(config.http_server_port, 7700);
	}
}

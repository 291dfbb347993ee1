use crate::types::{duration_seconds_format, Enigma, NodeId};
use clap::ValueEnum;
use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, time::Duration};
use strum::Display;

/// Sides of the gateway a node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeRole {
	/// Accepts HTTP requests from IP endpoints and publishes them (cNAP).
	Client,
	/// Serves published requests from HTTP origins (sNAP).
	Server,
	Both,
}

impl NodeRole {
	pub fn is_client(&self) -> bool {
		matches!(self, NodeRole::Client | NodeRole::Both)
	}

	pub fn is_server(&self) -> bool {
		matches!(self, NodeRole::Server | NodeRole::Both)
	}
}

/// Timeouts of the keyed stores.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
	/// Time after which partially reassembled LTP packets are dropped. (default: 60 sec)
	#[serde(with = "duration_seconds_format")]
	pub fragment_buffer_timeout: Duration,
	/// Time after which requests waiting for a forwarding path are dropped. (default: 529 sec)
	#[serde(with = "duration_seconds_format")]
	pub request_buffer_timeout: Duration,
	/// Time after which idle session contexts are dropped. (default: 540 sec)
	#[serde(with = "duration_seconds_format")]
	pub reverse_lookup_timeout: Duration,
	/// Time an unused DNS resolution is kept. (default: 1200 sec)
	#[serde(with = "duration_seconds_format")]
	pub dns_ttl: Duration,
	/// Interval between two cleaner passes over every store. (default: 10 sec)
	#[serde(with = "duration_seconds_format")]
	pub buffer_cleaner_interval: Duration,
}

impl Default for BufferConfig {
	fn default() -> Self {
		Self {
			fragment_buffer_timeout: Duration::from_secs(60),
			request_buffer_timeout: Duration::from_secs(23 * 23),
			reverse_lookup_timeout: Duration::from_secs(540),
			dns_ttl: Duration::from_secs(1200),
			buffer_cleaner_interval: Duration::from_secs(10),
		}
	}
}

/// HTTP origin on the same host, reached without going through ICN.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LocalSurrogate {
	/// FQDN requests are matched against.
	pub fqdn: String,
	/// Port of the surrogate on localhost. (default: 80)
	pub port: u16,
}

impl Default for LocalSurrogate {
	fn default() -> Self {
		Self {
			fqdn: String::new(),
			port: 80,
		}
	}
}

/// HTTP handler configuration.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
	/// Sides of the gateway this node runs. (default: both)
	pub role: NodeRole,
	/// Address the HTTP proxy listens on. (default: 0.0.0.0)
	pub http_proxy_host: String,
	/// Port the HTTP proxy listens on. (default: 3127)
	pub http_proxy_port: u16,
	/// Proxy rule identifier of HTTP flows. (default: 23)
	pub enigma: Enigma,
	/// Maximum size of a single publication, LTP header included. (default: 1304)
	pub mitu: usize,
	/// Read buffer size of sockets accepted from IP endpoints. (default: 4096)
	pub tcp_server_buffer_size: usize,
	/// Read buffer size of sockets opened towards HTTP origins. (default: 4096)
	pub tcp_client_buffer_size: usize,
	/// Identifier of this node in the ICN substrate. (default: 1)
	pub node_id: NodeId,
	/// Origin on localhost which requests are relayed to directly. (default: None)
	pub local_surrogate: Option<LocalSurrogate>,
	/// FQDNs served by this node mapped to their origin `host:port`.
	/// If empty, every FQDN is served through DNS resolution. (default: empty)
	pub fqdns: BTreeMap<String, String>,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			role: NodeRole::Both,
			http_proxy_host: "0.0.0.0".to_string(),
			http_proxy_port: 3127,
			enigma: Enigma::default(),
			mitu: 1304,
			tcp_server_buffer_size: 4096,
			tcp_client_buffer_size: 4096,
			node_id: NodeId(1),
			local_surrogate: None,
			fqdns: BTreeMap::new(),
		}
	}
}

impl ProxyConfig {
	pub fn proxy_address(&self) -> Result<SocketAddr> {
		format!("{}:{}", self.http_proxy_host, self.http_proxy_port)
			.parse()
			.wrap_err("Unable to parse HTTP proxy host and port")
	}

	/// Whether requests for `fqdn` are answered by this node.
	pub fn serves(&self, fqdn: &str) -> bool {
		self.fqdns.is_empty() || self.fqdns.contains_key(&fqdn.to_lowercase())
	}

	/// Origin `host:port` of an FQDN, `None` if the FQDN is to be resolved through DNS.
	pub fn origin(&self, fqdn: &str) -> Option<&str> {
		self.fqdns.get(&fqdn.to_lowercase()).map(String::as_str)
	}

	pub fn is_local_surrogate(&self, fqdn: &str) -> bool {
		self.local_surrogate
			.as_ref()
			.is_some_and(|surrogate| surrogate.fqdn.eq_ignore_ascii_case(fqdn))
	}
}

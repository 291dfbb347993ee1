use clap::Parser;
use nap_core::configuration::NodeRole;
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Sides of the gateway to run: client, server or both
	#[arg(short, long, value_enum)]
	pub role: Option<NodeRole>,
	/// HTTP proxy port
	#[arg(short = 'p', long)]
	pub http_proxy_port: Option<u16>,
	/// Status server port
	#[arg(long)]
	pub http_server_port: Option<u16>,
	#[arg(long)]
	pub http_server_host: Option<String>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
}

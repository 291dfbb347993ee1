pub mod configuration;
pub mod dispatcher;
pub mod dns;
pub mod expiring_map;
pub mod http;
pub mod pubsub;
pub mod reverse_lookup;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod utils;

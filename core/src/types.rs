use derive_more::From;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
	fmt::{self, Debug, Display},
	time::Duration,
};
use strum::{Display as StrumDisplay, EnumString};

pub const CONTENT_ID_LENGTH: usize = 16;

/// Default proxy rule identifier, see <https://en.wikipedia.org/wiki/23_enigma>
pub const DEFAULT_ENIGMA: Enigma = Enigma(23);

/// Root namespaces known to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Namespace {
	Ip,
	Http,
	Coap,
}

impl Namespace {
	fn tag(&self) -> u8 {
		match self {
			Namespace::Ip => 0x00,
			Namespace::Http => 0x01,
			Namespace::Coap => 0x02,
		}
	}

	fn from_tag(tag: u8) -> Option<Self> {
		match tag {
			0x00 => Some(Namespace::Ip),
			0x01 => Some(Namespace::Http),
			0x02 => Some(Namespace::Coap),
			_ => None,
		}
	}
}

/// Identifier of a scope or an information item in the pub/sub substrate.
///
/// First byte carries the root namespace, the rest is a SHA-256 prefix of the
/// namespace-qualified name. Request identifiers are derived from the FQDN,
/// response identifiers from the FQDN and the requested resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId([u8; CONTENT_ID_LENGTH]);

impl ContentId {
	pub fn new(bytes: [u8; CONTENT_ID_LENGTH]) -> Self {
		ContentId(bytes)
	}

	/// Root scope of a namespace, the scope every per-FQDN scope is published under.
	pub fn root(namespace: Namespace) -> Self {
		let mut bytes = [0u8; CONTENT_ID_LENGTH];
		bytes[0] = namespace.tag();
		ContentId(bytes)
	}

	fn hashed(namespace: Namespace, name: &str) -> Self {
		let digest = Sha256::digest(format!("{namespace}/{name}").as_bytes());
		let mut bytes = [0u8; CONTENT_ID_LENGTH];
		bytes[0] = namespace.tag();
		bytes[1..].copy_from_slice(&digest[..CONTENT_ID_LENGTH - 1]);
		ContentId(bytes)
	}

	/// Request identifier of an HTTP host. Host names are case insensitive.
	pub fn for_fqdn(fqdn: &str) -> Self {
		Self::hashed(Namespace::Http, &fqdn.to_lowercase())
	}

	/// Response identifier of an HTTP resource.
	pub fn for_url(fqdn: &str, resource: &str) -> Self {
		Self::hashed(Namespace::Http, &format!("{}{resource}", fqdn.to_lowercase()))
	}

	pub fn namespace(&self) -> Option<Namespace> {
		Namespace::from_tag(self.0[0])
	}

	pub fn is_root(&self) -> bool {
		self.0[1..].iter().all(|byte| *byte == 0)
	}

	pub fn as_bytes(&self) -> &[u8; CONTENT_ID_LENGTH] {
		&self.0
	}
}

impl Display for ContentId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl Debug for ContentId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ContentId({self})")
	}
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, From, Serialize, Deserialize,
)]
pub struct Enigma(pub u32);

impl Default for Enigma {
	fn default() -> Self {
		DEFAULT_ENIGMA
	}
}

/// Disambiguates concurrent sessions of the same flow, allocated per socket.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, From, Serialize, Deserialize,
)]
pub struct SessionKey(pub u32);

impl SessionKey {
	pub const UNSPECIFIED: SessionKey = SessionKey(0);
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, From, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

pub type Sequence = u16;

/// Addresses one LTP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
	pub id: ContentId,
	pub enigma: Enigma,
	pub session_key: SessionKey,
}

impl FlowKey {
	pub fn new(id: ContentId, enigma: Enigma, session_key: SessionKey) -> Self {
		FlowKey {
			id,
			enigma,
			session_key,
		}
	}
}

impl Display for FlowKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} > {} > {}", self.id, self.enigma, self.session_key)
	}
}

/// Request methods from section 9 of RFC 2616.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay)]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
	Options,
	Get,
	Head,
	Post,
	Put,
	Delete,
	Trace,
	Connect,
	Extension,
}

impl HttpMethod {
	/// Requests which can be answered by one response shared among several subscribers.
	pub fn is_cacheable(&self) -> bool {
		matches!(self, HttpMethod::Get | HttpMethod::Head)
	}
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test]
	fn fqdn_identifiers_are_case_insensitive() {
		assert_eq!(
			ContentId::for_fqdn("Example.COM"),
			ContentId::for_fqdn("example.com")
		);
		assert_ne!(
			ContentId::for_fqdn("example.com"),
			ContentId::for_url("example.com", "/index.html")
		);
	}

	#[test_case(Namespace::Ip ; "ip")]
	#[test_case(Namespace::Http ; "http")]
	#[test_case(Namespace::Coap ; "coap")]
	fn root_scope_keeps_namespace(namespace: Namespace) {
		let root = ContentId::root(namespace);
		assert!(root.is_root());
		assert_eq!(root.namespace(), Some(namespace));
	}

	#[test]
	fn derived_identifiers_are_http() {
		let id = ContentId::for_url("example.com", "/");
		assert_eq!(id.namespace(), Some(Namespace::Http));
		assert!(!id.is_root());
		assert_eq!(id.to_string().len(), CONTENT_ID_LENGTH * 2);
	}
}

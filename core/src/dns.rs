use crate::expiring_map::ExpiringMap;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use std::{
	net::{IpAddr, SocketAddr},
	sync::Arc,
	time::Duration,
};
use tokio::{net::lookup_host, time::Instant};
use tracing::debug;

/// Resolved FQDNs, kept alive for as long as they are being used.
pub struct DnsCache {
	entries: Arc<ExpiringMap<String, IpAddr>>,
}

impl Default for DnsCache {
	fn default() -> Self {
		Self::new()
	}
}

impl DnsCache {
	pub fn new() -> Self {
		DnsCache {
			entries: Arc::new(ExpiringMap::with_refresh_on_get("dns")),
		}
	}

	pub fn lookup(&self, fqdn: &str) -> Option<IpAddr> {
		self.entries.get(&fqdn.to_lowercase())
	}

	pub fn insert(&self, fqdn: &str, address: IpAddr) {
		self.entries.insert(fqdn.to_lowercase(), address);
	}

	/// Resolves the FQDN, answering from the cache when possible. IP literals are never cached.
	pub async fn resolve(&self, fqdn: &str, port: u16) -> Result<SocketAddr> {
		if let Ok(address) = fqdn.parse::<IpAddr>() {
			return Ok(SocketAddr::new(address, port));
		}
		if let Some(address) = self.lookup(fqdn) {
			return Ok(SocketAddr::new(address, port));
		}

		let address = lookup_host((fqdn, port))
			.await
			.wrap_err_with(|| format!("Failed to resolve {fqdn}"))?
			.next()
			.ok_or_else(|| eyre!("No address found for {fqdn}"))?;

		debug!(fqdn, address = %address.ip(), "Resolved FQDN");
		self.insert(fqdn, address.ip());
		Ok(address)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn sweep(&self, now: Instant, ttl: Duration) -> usize {
		self.entries.sweep(now, ttl)
	}

	pub async fn run_cleaner(
		&self,
		interval: Duration,
		ttl: Duration,
		report: impl FnMut(usize, usize) + Send,
	) {
		self.entries.clone().run_sweeper(interval, ttl, report).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{net::Ipv4Addr, thread};

	#[tokio::test]
	async fn cached_addresses_skip_resolution() {
		let cache = DnsCache::new();
		let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
		cache.insert("Cached.invalid", address);

		assert_eq!(
			cache.resolve("cached.invalid", 8080).await.unwrap(),
			SocketAddr::new(address, 8080)
		);
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test]
	async fn ip_literals_bypass_the_cache() {
		let cache = DnsCache::new();
		assert_eq!(
			cache.resolve("127.0.0.1", 8000).await.unwrap(),
			SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000)
		);
		assert_eq!(
			cache.resolve("::1", 80).await.unwrap(),
			"[::1]:80".parse::<SocketAddr>().unwrap()
		);
		assert!(cache.is_empty());
	}

	#[test]
	fn hits_keep_entries_alive() {
		let cache = DnsCache::new();
		cache.insert("a.example", IpAddr::V4(Ipv4Addr::LOCALHOST));
		cache.insert("b.example", IpAddr::V4(Ipv4Addr::LOCALHOST));
		thread::sleep(Duration::from_millis(20));

		assert!(cache.lookup("a.example").is_some());
		assert_eq!(cache.sweep(Instant::now(), Duration::from_millis(10)), 1);
		assert!(cache.lookup("a.example").is_some());
		assert!(cache.lookup("b.example").is_none());
	}
}

use crate::{
	expiring_map::ExpiringMap,
	types::{ContentId, Enigma, NodeId, SessionKey},
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// Session context of a local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseEntry {
	pub request_id: ContentId,
	pub response_id: ContentId,
	pub enigma: Enigma,
	/// Remote node and its session key, set for upstream sockets opened on behalf of a peer.
	pub peer: Option<(NodeId, SessionKey)>,
}

impl ReverseEntry {
	pub fn matches(&self, response_id: &ContentId, enigma: Enigma) -> bool {
		self.response_id == *response_id && self.enigma == enigma
	}
}

/// Recovers the session context from the transient identifiers seen by the gateway:
/// local session keys, and node identifiers of implicit subscribers.
pub struct ReverseIdentifierTable {
	sessions: Arc<ExpiringMap<SessionKey, ReverseEntry>>,
	nodes: Arc<ExpiringMap<NodeId, Vec<ContentId>>>,
}

impl Default for ReverseIdentifierTable {
	fn default() -> Self {
		Self::new()
	}
}

impl ReverseIdentifierTable {
	pub fn new() -> Self {
		ReverseIdentifierTable {
			sessions: Arc::new(ExpiringMap::new("reverse_sessions")),
			nodes: Arc::new(ExpiringMap::new("reverse_nodes")),
		}
	}

	/// Registers (or re-registers) the context of a socket, resetting its age.
	pub fn register(&self, session_key: SessionKey, entry: ReverseEntry) -> Option<ReverseEntry> {
		self.sessions.insert(session_key, entry)
	}

	pub fn get(&self, session_key: SessionKey) -> Option<ReverseEntry> {
		self.sessions.get(&session_key)
	}

	pub fn refresh(&self, session_key: SessionKey) -> bool {
		self.sessions.refresh(&session_key)
	}

	/// Removes the context of a socket. Exactly one caller gets the entry back.
	pub fn remove(&self, session_key: SessionKey) -> Option<ReverseEntry> {
		self.sessions.remove(&session_key)
	}

	/// Local client sockets waiting on the given response flow.
	pub fn sessions_for(&self, response_id: &ContentId, enigma: Enigma) -> Vec<SessionKey> {
		let mut keys = self.sessions.filter_map(|session_key, entry| {
			(entry.peer.is_none() && entry.matches(response_id, enigma)).then_some(*session_key)
		});
		keys.sort();
		keys
	}

	pub fn add_node_response(&self, node: NodeId, response_id: ContentId) {
		self.nodes.upsert(node, Vec::new, |response_ids| {
			if !response_ids.contains(&response_id) {
				response_ids.push(response_id);
			}
		});
	}

	pub fn response_ids(&self, node: NodeId) -> Vec<ContentId> {
		self.nodes.get(&node).unwrap_or_default()
	}

	/// Drops a recorded response of the node, removing the node once it has none left.
	pub fn forget_node_response(&self, node: NodeId, response_id: &ContentId) {
		let empty = self.nodes.update(&node, |response_ids| {
			response_ids.retain(|id| id != response_id);
			response_ids.is_empty()
		});
		if empty == Some(true) {
			self.nodes.remove_if(&node, Vec::is_empty);
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	pub fn node_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn sweep(&self, now: Instant, timeout: Duration) -> usize {
		self.nodes.sweep(now, timeout);
		self.sessions.sweep(now, timeout)
	}

	/// Sweeps expired contexts, except those of sockets for which `live` holds.
	pub fn sweep_idle(
		&self,
		now: Instant,
		timeout: Duration,
		live: impl Fn(SessionKey) -> bool,
	) -> usize {
		self.nodes.sweep(now, timeout);
		self.sessions
			.sweep_unless(now, timeout, |session_key, _| live(*session_key))
	}

	/// Evicts contexts older than `timeout`. Contexts of sockets for which `live` holds are kept.
	pub async fn run_cleaner(
		&self,
		interval: Duration,
		timeout: Duration,
		live: impl Fn(SessionKey) -> bool + Send,
		report: impl FnMut(usize, usize) + Send,
	) {
		tokio::join!(
			self.sessions.clone().run_sweeper_unless(
				interval,
				timeout,
				move |session_key, _| live(*session_key),
				report
			),
			self.nodes.clone().run_sweeper(interval, timeout, |_, _| {}),
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(resource: &str, enigma: u32) -> ReverseEntry {
		ReverseEntry {
			request_id: ContentId::for_fqdn("example.com"),
			response_id: ContentId::for_url("example.com", resource),
			enigma: Enigma(enigma),
			peer: None,
		}
	}

	#[test]
	fn sessions_for_flow() {
		let table = ReverseIdentifierTable::new();
		table.register(SessionKey(1), entry("/a", 23));
		table.register(SessionKey(2), entry("/b", 23));
		table.register(SessionKey(3), entry("/a", 23));
		table.register(SessionKey(4), entry("/a", 24));

		let response_id = ContentId::for_url("example.com", "/a");
		assert_eq!(
			table.sessions_for(&response_id, Enigma(23)),
			vec![SessionKey(1), SessionKey(3)]
		);
		assert_eq!(table.sessions_for(&response_id, Enigma(24)), vec![SessionKey(4)]);
	}

	#[test]
	fn remove_returns_entry_once() {
		let table = ReverseIdentifierTable::new();
		table.register(SessionKey(1), entry("/a", 23));
		assert_eq!(table.remove(SessionKey(1)), Some(entry("/a", 23)));
		assert_eq!(table.remove(SessionKey(1)), None);
		assert!(table.is_empty());
	}

	#[test]
	fn node_responses() {
		let table = ReverseIdentifierTable::new();
		let first = ContentId::for_url("example.com", "/a");
		let second = ContentId::for_url("example.com", "/b");

		table.add_node_response(NodeId(7), first);
		table.add_node_response(NodeId(7), first);
		table.add_node_response(NodeId(7), second);
		assert_eq!(table.response_ids(NodeId(7)), vec![first, second]);
		assert!(table.response_ids(NodeId(8)).is_empty());

		table.forget_node_response(NodeId(7), &first);
		assert_eq!(table.response_ids(NodeId(7)), vec![second]);
		table.forget_node_response(NodeId(7), &second);
		assert_eq!(table.node_count(), 0);
	}

	#[test]
	fn expired_sessions_are_swept() {
		let table = ReverseIdentifierTable::new();
		table.register(SessionKey(1), entry("/a", 23));
		table.add_node_response(NodeId(1), ContentId::for_url("example.com", "/a"));

		let timeout = Duration::from_secs(540);
		assert_eq!(table.sweep(Instant::now() + timeout * 2, timeout), 1);
		assert!(table.is_empty());
		assert_eq!(table.node_count(), 0);
	}

	#[test]
	fn contexts_of_live_sockets_outlive_timeout() {
		let table = ReverseIdentifierTable::new();
		table.register(SessionKey(1), entry("/a", 23));
		table.register(SessionKey(2), entry("/b", 23));

		let timeout = Duration::from_secs(540);
		let swept = table.sweep_idle(Instant::now() + timeout * 2, timeout, |session_key| {
			session_key == SessionKey(1)
		});
		assert_eq!(swept, 1);
		assert_eq!(table.get(SessionKey(1)), Some(entry("/a", 23)));
		assert_eq!(table.get(SessionKey(2)), None);
	}
}

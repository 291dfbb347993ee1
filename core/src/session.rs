//! Bridge between TCP sockets and the pub/sub substrate.
//!
//! # Client side (cNAP)
//!
//! * Accept HTTP requests from IP endpoints, derive the request identifier from the host
//!   and the response identifier from host and resource
//! * Buffer requests until a forwarding path to the request identifier exists
//! * Publish requests as LTP fragments, implicitly subscribing to the response identifier
//! * Write reassembled responses back to the waiting sockets
//!
//! # Server side (sNAP)
//!
//! * Forward reassembled requests to HTTP origins, reusing the upstream connection of a remote session
//! * Let concurrent cacheable requests for the same response share one upstream connection (CMC group)
//! * Publish every response chunk to each member of the group

use crate::{
	configuration::{BufferConfig, ProxyConfig},
	dns::DnsCache,
	http::{parse_request, HeaderParser, Request},
	pubsub::PubSub,
	reverse_lookup::{ReverseEntry, ReverseIdentifierTable},
	shutdown::Controller,
	transport::{fragments, session_end, FragmentBuffer},
	types::{ContentId, FlowKey, Namespace, NodeId, SessionKey},
};
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use serde::Serialize;
use std::{
	net::SocketAddr,
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	},
};
use strum::Display;
use tokio::{net::TcpStream, sync::mpsc::UnboundedSender};
use tracing::{debug, info, trace, warn};

pub mod cmc;
pub mod forwarding;
pub mod listener;
pub mod requests;
pub mod sockets;
mod surrogate;
mod upstream;

use cmc::{CmcGroups, Member};
use forwarding::ForwardingTable;
use requests::{BufferedRequest, RequestBuffer};
use sockets::{PendingSocket, SocketRegistry};

const DEFAULT_HTTP_PORT: u16 = 80;

/// Keyed stores swept in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Store {
	Fragments,
	Requests,
	ReverseLookup,
	Dns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
	ConnectionAccepted,
	RequestBuffered,
	FragmentsPublished(usize),
	PacketReassembled,
	PacketDropped,
	SessionEnded,
	SurrogateRelayed,
	BufferSize { store: Store, size: usize },
	CmcGroupLocked { members: usize },
}

/// Outcome of [`SessionMultiplexer::accept_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
	Published { fragments: usize },
	/// Buffered until a forwarding path to the request identifier exists.
	Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
	pub node_id: NodeId,
	pub role: String,
	pub sockets: usize,
	pub fragment_buffer: usize,
	pub fragment_buffer_bytes: usize,
	pub request_buffer: usize,
	pub reverse_lookup: usize,
	pub reverse_lookup_nodes: usize,
	pub dns_cache: usize,
	pub cmc_groups: usize,
	pub cmc_multicast_groups: usize,
	pub active_ids: Vec<String>,
	pub active_nodes: Vec<NodeId>,
}

#[derive(Clone)]
pub struct SessionMultiplexer {
	config: Arc<ProxyConfig>,
	pubsub: Arc<dyn PubSub>,
	parser: Arc<HeaderParser>,
	fragments: Arc<FragmentBuffer>,
	requests: Arc<RequestBuffer>,
	reverse: Arc<ReverseIdentifierTable>,
	cmc: Arc<CmcGroups>,
	sockets: Arc<SocketRegistry>,
	forwarding: Arc<ForwardingTable>,
	dns: Arc<DnsCache>,
	session_keys: Arc<AtomicU32>,
	shutdown: Controller<String>,
	events: UnboundedSender<OutputEvent>,
}

/// Splits `host:port`, defaulting to the HTTP port.
fn split_origin(origin: &str) -> Result<(&str, u16)> {
	match origin.rsplit_once(':') {
		Some((host, port)) => {
			let port = port
				.parse()
				.wrap_err_with(|| format!("Invalid port in origin {origin}"))?;
			Ok((host, port))
		},
		None => Ok((origin, DEFAULT_HTTP_PORT)),
	}
}

impl SessionMultiplexer {
	pub fn new(
		config: ProxyConfig,
		pubsub: Arc<dyn PubSub>,
		shutdown: Controller<String>,
		events: UnboundedSender<OutputEvent>,
	) -> Self {
		SessionMultiplexer {
			config: Arc::new(config),
			pubsub,
			parser: Arc::new(HeaderParser::new()),
			fragments: Arc::new(FragmentBuffer::new()),
			requests: Arc::new(RequestBuffer::new()),
			reverse: Arc::new(ReverseIdentifierTable::new()),
			cmc: Arc::new(CmcGroups::new()),
			sockets: Arc::new(SocketRegistry::new(shutdown.clone())),
			forwarding: Arc::new(ForwardingTable::new()),
			dns: Arc::new(DnsCache::new()),
			session_keys: Arc::new(AtomicU32::new(rand::random())),
			shutdown,
			events,
		}
	}

	pub fn config(&self) -> &ProxyConfig {
		&self.config
	}

	pub fn pubsub(&self) -> &dyn PubSub {
		self.pubsub.as_ref()
	}

	pub fn sockets(&self) -> &SocketRegistry {
		&self.sockets
	}

	pub fn fragment_buffer(&self) -> &FragmentBuffer {
		&self.fragments
	}

	pub fn forwarding(&self) -> &ForwardingTable {
		&self.forwarding
	}

	pub fn reverse_lookup(&self) -> &ReverseIdentifierTable {
		&self.reverse
	}

	pub(crate) fn emit(&self, event: OutputEvent) {
		_ = self.events.send(event);
	}

	/// Allocates the session key of a new socket, never [`SessionKey::UNSPECIFIED`].
	pub fn next_session_key(&self) -> SessionKey {
		loop {
			let key = self.session_keys.fetch_add(1, Ordering::Relaxed);
			if key != SessionKey::UNSPECIFIED.0 {
				return SessionKey(key);
			}
		}
	}

	/// Subscribes to the request identifiers of the served FQDNs,
	/// or to the whole HTTP namespace if no FQDN is configured.
	pub async fn subscribe_served(&self) -> Result<()> {
		if self.config.fqdns.is_empty() {
			let root = ContentId::root(Namespace::Http);
			info!(scope = %root, "Serving every FQDN");
			return self.pubsub.subscribe_scope(root).await;
		}
		for fqdn in self.config.fqdns.keys() {
			let id = ContentId::for_fqdn(fqdn);
			info!(fqdn, %id, "Serving FQDN");
			self.pubsub.subscribe_scope(id).await?;
		}
		Ok(())
	}

	/// Publishes a request read from a client socket, or buffers it until a forwarding path exists.
	pub async fn accept_request(
		&self,
		session_key: SessionKey,
		request: &Request,
		bytes: Vec<u8>,
	) -> Result<Accepted> {
		let request_id = ContentId::for_fqdn(&request.fqdn);
		let response_id = ContentId::for_url(&request.fqdn, &request.resource);
		let enigma = self.config.enigma;
		self.reverse.register(
			session_key,
			ReverseEntry {
				request_id,
				response_id,
				enigma,
				peer: None,
			},
		);

		if self.forwarding.is_active(&request_id) {
			let published = self
				.publish_request(request_id, response_id, session_key, &bytes)
				.await?;
			return Ok(Accepted::Published {
				fragments: published,
			});
		}

		debug!(%session_key, fqdn = request.fqdn, resource = request.resource, "No forwarding path, buffering request");
		self.requests.push(BufferedRequest {
			request_id,
			response_id,
			enigma,
			session_key,
			method: request.method,
			data: bytes,
		});
		self.emit(OutputEvent::RequestBuffered);

		if self.forwarding.advertise(request_id) {
			let root = ContentId::root(Namespace::Http);
			self.pubsub
				.publish_scope(request_id, root)
				.await
				.wrap_err_with(|| format!("Failed to publish scope {request_id}"))?;
			self.pubsub
				.publish_info(request_id, root)
				.await
				.wrap_err_with(|| format!("Failed to advertise {request_id}"))?;
		}

		// The path may have become active while the request was buffered
		if self.forwarding.is_active(&request_id) {
			self.publish_from_buffer(request_id).await;
		}
		Ok(Accepted::Pending)
	}

	async fn publish_request(
		&self,
		request_id: ContentId,
		response_id: ContentId,
		session_key: SessionKey,
		bytes: &[u8],
	) -> Result<usize> {
		let fragments = fragments(self.config.enigma, session_key, bytes, self.config.mitu)?;
		let count = fragments.len();
		for fragment in fragments {
			self.pubsub
				.publish_data_isub(request_id, response_id, fragment)
				.await?;
		}
		trace!(%session_key, %request_id, count, "Request published");
		self.emit(OutputEvent::FragmentsPublished(count));
		Ok(count)
	}

	/// Marks the identifier forwarding-active and publishes every request buffered for it, once.
	pub async fn publish_from_buffer(&self, request_id: ContentId) -> usize {
		self.forwarding.activate(request_id);
		let buffered = self.requests.take_for(&request_id);
		let count = buffered.len();
		for request in buffered {
			if !self.sockets.is_alive(request.session_key) {
				debug!(session_key = %request.session_key, "Socket closed, dropping buffered request");
				continue;
			}
			if let Err(error) = self
				.publish_request(
					request.request_id,
					request.response_id,
					request.session_key,
					&request.data,
				)
				.await
			{
				warn!(session_key = %request.session_key, "Failed to publish buffered request: {error:#}");
			}
		}
		if count > 0 {
			debug!(%request_id, count, "Buffered requests published");
		}
		count
	}

	/// Sockets of the response flow: the addressed one, or every waiting socket if none is addressed.
	fn endpoints(&self, flow: &FlowKey) -> Vec<SessionKey> {
		if flow.session_key == SessionKey::UNSPECIFIED {
			return self.reverse.sessions_for(&flow.id, flow.enigma);
		}
		self.reverse
			.get(flow.session_key)
			.filter(|entry| entry.peer.is_none() && entry.matches(&flow.id, flow.enigma))
			.map(|_| vec![flow.session_key])
			.unwrap_or_default()
	}

	/// Writes a response to the local sockets of the flow, returns the number of sockets written to.
	pub fn send_to_endpoint(&self, flow: &FlowKey, bytes: Vec<u8>) -> usize {
		let endpoints = self.endpoints(flow);
		let written = endpoints
			.into_iter()
			.filter(|session_key| {
				self.reverse.refresh(*session_key);
				self.sockets.write(*session_key, bytes.clone())
			})
			.count();
		if written == 0 {
			debug!(flow = %flow, "No socket waiting for response");
		}
		written
	}

	/// Closes the local sockets of a response flow ended by the serving node.
	pub fn end_session(&self, flow: &FlowKey) -> usize {
		let endpoints = self.endpoints(flow);
		for session_key in &endpoints {
			self.reverse.remove(*session_key);
			self.sockets.close(*session_key);
		}
		if !endpoints.is_empty() {
			self.emit(OutputEvent::SessionEnded);
		}
		endpoints.len()
	}

	/// Cleans up after a closed client socket, telling the serving node the session has ended.
	pub async fn delete_session(&self, session_key: SessionKey) {
		self.parser.forget(session_key);
		self.sockets.close(session_key);
		let dropped = self.requests.remove_session(session_key);
		if dropped > 0 {
			debug!(%session_key, dropped, "Buffered requests of closed socket dropped");
		}
		let Some(entry) = self.reverse.remove(session_key) else {
			return;
		};

		if self.forwarding.is_active(&entry.request_id) {
			let end = session_end(entry.enigma, session_key);
			if let Err(error) = self
				.pubsub
				.publish_data_isub(entry.request_id, entry.response_id, end)
				.await
			{
				debug!(%session_key, "Failed to publish session end: {error:#}");
			}
		}
		self.emit(OutputEvent::SessionEnded);
	}

	async fn origin_address(&self, fqdn: &str) -> Result<SocketAddr> {
		match self.config.origin(fqdn) {
			Some(origin) => {
				let (host, port) = split_origin(origin)?;
				self.dns.resolve(host, port).await
			},
			None => self.dns.resolve(fqdn, DEFAULT_HTTP_PORT).await,
		}
	}

	/// Forwards a request reassembled from `node` to the HTTP origin.
	///
	/// The flow is keyed by the response identifier the node waits on. Requests of a remote
	/// session reuse its upstream connection. Cacheable requests join an open CMC group waiting
	/// for the same response instead of opening a new one. New connections are opened by a
	/// spawned task, bytes written meanwhile are queued.
	pub fn forward_request(
		&self,
		node: NodeId,
		request_id: ContentId,
		flow: FlowKey,
		bytes: Vec<u8>,
	) -> Result<()> {
		let response_id = flow.id;
		let member: Member = (node, flow.session_key);
		let entry = ReverseEntry {
			request_id,
			response_id,
			enigma: flow.enigma,
			peer: Some(member),
		};
		let request = parse_request(&bytes);

		if let Some(local) = self.sockets.upstream(node, flow.session_key) {
			if let Some(request) = &request {
				trace!(%node, session_key = %local, resource = request.resource, "Reusing upstream connection");
				self.reverse.register(local, entry);
				self.cmc.open(
					local,
					response_id,
					flow.enigma,
					member,
					request.method.is_cacheable(),
				);
			}
			if !self.sockets.write(local, bytes) {
				return Err(eyre!("Upstream connection {local} is closed"));
			}
			return Ok(());
		}

		let request = request.ok_or_else(|| {
			eyre!("No request line and no upstream connection for session {}", flow.session_key)
		})?;
		if !self.config.serves(&request.fqdn) {
			return Err(eyre!("FQDN {} is not served by this node", request.fqdn));
		}

		let cacheable = request.method.is_cacheable();
		if cacheable {
			if let Some(local) = self.cmc.join(&response_id, flow.enigma, member) {
				debug!(%node, remote_session_key = %flow.session_key, session_key = %local, "Joined CMC group");
				return Ok(());
			}
		}

		let local = self.next_session_key();
		let pending = self.sockets.reserve(local);
		self.reverse.register(local, entry);
		self.cmc
			.open(local, response_id, flow.enigma, member, cacheable);
		self.sockets.map_upstream(node, flow.session_key, local);
		self.sockets.write(local, bytes);
		debug!(%node, session_key = %local, fqdn = request.fqdn, "Opening upstream connection");
		self.shutdown
			.spawn(self.clone().connect_upstream(request.fqdn, pending));
		Ok(())
	}

	async fn open_upstream(&self, fqdn: &str) -> Result<TcpStream> {
		let address = self.origin_address(fqdn).await?;
		let stream = TcpStream::connect(address)
			.await
			.wrap_err_with(|| format!("Failed to connect to {fqdn} at {address}"))?;
		debug!(fqdn, %address, "Upstream connection opened");
		Ok(stream)
	}

	/// Connects a reserved upstream socket, then publishes what the origin answers.
	async fn connect_upstream(self, fqdn: String, pending: PendingSocket) {
		let session_key = pending.session_key();
		let closed = pending.closed();
		let connected = tokio::select! {
			_ = closed.cancelled() => {
				trace!(%session_key, "Session closed before the upstream connection was opened");
				return;
			},
			connected = self.open_upstream(&fqdn) => connected,
		};

		match connected {
			Ok(stream) => {
				let (reader, writer) = stream.into_split();
				self.sockets.attach(pending, writer);
				upstream::read_responses(self, session_key, reader, closed).await;
			},
			Err(error) => {
				warn!(%session_key, "Upstream connection failed: {error:#}");
				self.close_session(session_key).await;
			},
		}
	}

	/// Publishes a response chunk read from an upstream socket to every member of its CMC group.
	///
	/// The first chunk locks the group. Returns `false` if the session context is gone.
	pub async fn handle_response(&self, session_key: SessionKey, bytes: &[u8]) -> bool {
		let Some(entry) = self.reverse.get(session_key) else {
			return false;
		};
		self.reverse.refresh(session_key);
		let Some(locked) = self.cmc.lock(session_key) else {
			return false;
		};
		if locked.newly_locked {
			trace!(%session_key, members = locked.members.len(), "CMC group locked");
			self.emit(OutputEvent::CmcGroupLocked {
				members: locked.members.len(),
			});
		}

		for (node, remote) in locked.members {
			let fragments = match fragments(entry.enigma, remote, bytes, self.config.mitu) {
				Ok(fragments) => fragments,
				Err(error) => {
					warn!(%session_key, "Cannot fragment response: {error:#}");
					return false;
				},
			};
			let count = fragments.len();
			for fragment in fragments {
				if let Err(error) = self
					.pubsub
					.publish_data_to(entry.response_id, node, fragment)
					.await
				{
					debug!(%node, %session_key, "Failed to publish response: {error:#}");
				}
			}
			self.emit(OutputEvent::FragmentsPublished(count));
		}
		true
	}

	/// Tears down the session of an upstream socket, notifying the remaining CMC members.
	///
	/// The socket, its CMC group and its upstream mapping are released even if the
	/// session context has already been evicted. Returns `false` if nothing was left to close.
	pub async fn close_session(&self, session_key: SessionKey) -> bool {
		let entry = self.reverse.remove(session_key);
		let group = self.cmc.remove(session_key);
		let socket_closed = self.sockets.close(session_key);
		if entry.is_none() && group.is_none() && !socket_closed {
			return false;
		}

		if let Some(ReverseEntry {
			response_id,
			peer: Some((node, _)),
			..
		}) = entry
		{
			self.reverse.forget_node_response(node, &response_id);
		}
		if let Some(group) = group {
			for (node, remote) in group.members {
				self.reverse.forget_node_response(node, &group.response_id);
				let end = session_end(group.enigma, remote);
				if let Err(error) = self
					.pubsub
					.publish_data_to(group.response_id, node, end)
					.await
				{
					debug!(%node, %session_key, "Failed to publish session end: {error:#}");
				}
			}
		}
		debug!(%session_key, "Session closed");
		self.emit(OutputEvent::SessionEnded);
		true
	}

	/// Removes a remote session which has ended, closing upstream connections nobody waits on anymore.
	pub async fn close_upstream(&self, node: NodeId, remote: SessionKey) {
		let member = (node, remote);
		let mut idle: Vec<SessionKey> = self
			.cmc
			.leave(member)
			.into_iter()
			.filter_map(|(session_key, remaining)| (remaining == 0).then_some(session_key))
			.collect();

		if let Some(local) = self.sockets.unmap_upstream(node, remote) {
			if self.cmc.members(local).map_or(true, |members| members.is_empty()) {
				idle.push(local);
			}
		}

		idle.sort();
		idle.dedup();
		for session_key in idle {
			self.close_session(session_key).await;
		}
	}

	/// Runs every store cleaner, reporting store sizes after each pass.
	///
	/// Session contexts of live sockets are never evicted.
	pub async fn run_cleaners(&self, config: BufferConfig) {
		let interval = config.buffer_cleaner_interval;
		let sockets = self.sockets.clone();
		let report = |store: Store| {
			let events = self.events.clone();
			move |_removed: usize, size: usize| {
				_ = events.send(OutputEvent::BufferSize { store, size });
			}
		};
		tokio::join!(
			self.fragments.run_cleaner(
				interval,
				config.fragment_buffer_timeout,
				report(Store::Fragments)
			),
			self.requests.run_cleaner(
				interval,
				config.request_buffer_timeout,
				report(Store::Requests)
			),
			self.reverse.run_cleaner(
				interval,
				config.reverse_lookup_timeout,
				move |session_key| sockets.is_alive(session_key),
				report(Store::ReverseLookup)
			),
			self.dns
				.run_cleaner(interval, config.dns_ttl, report(Store::Dns)),
		);
	}

	pub fn status(&self) -> Status {
		Status {
			node_id: self.config.node_id,
			role: self.config.role.to_string(),
			sockets: self.sockets.len(),
			fragment_buffer: self.fragments.len(),
			fragment_buffer_bytes: self.fragments.buffered_bytes(),
			request_buffer: self.requests.len(),
			reverse_lookup: self.reverse.len(),
			reverse_lookup_nodes: self.reverse.node_count(),
			dns_cache: self.dns.len(),
			cmc_groups: self.cmc.len(),
			cmc_multicast_groups: self.cmc.multicast_count(),
			active_ids: self
				.forwarding
				.active_ids()
				.iter()
				.map(ToString::to_string)
				.collect(),
			active_nodes: self.forwarding.active_nodes(),
		}
	}

	/// Response identifiers a node is waiting on.
	pub fn node_responses(&self, node: NodeId) -> Vec<String> {
		self.reverse
			.response_ids(node)
			.iter()
			.map(ToString::to_string)
			.collect()
	}
}

use crate::{
	shutdown::Controller,
	types::{NodeId, SessionKey},
	utils::lock,
};
use std::{collections::HashMap, sync::Mutex};
use tokio::{
	io::{AsyncWrite, AsyncWriteExt},
	sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct SocketHandle {
	writer: UnboundedSender<Vec<u8>>,
	closed: CancellationToken,
}

/// Socket reserved with [`SocketRegistry::reserve`], waiting for its connection.
pub struct PendingSocket {
	session_key: SessionKey,
	queue: UnboundedReceiver<Vec<u8>>,
	closed: CancellationToken,
}

impl PendingSocket {
	pub fn session_key(&self) -> SessionKey {
		self.session_key
	}

	/// Cancelled once the socket gets closed through the registry.
	pub fn closed(&self) -> CancellationToken {
		self.closed.clone()
	}
}

/// Live sockets of the gateway, keyed by their local session key.
///
/// Writes are queued to a per-socket writer task, so no store lock is ever held across I/O.
pub struct SocketRegistry {
	sockets: Mutex<HashMap<SessionKey, SocketHandle>>,
	/// Upstream sockets opened on behalf of a remote session.
	upstream: Mutex<HashMap<(NodeId, SessionKey), SessionKey>>,
	shutdown: Controller<String>,
}

async fn write_loop<W>(session_key: SessionKey, mut writer: W, mut queue: UnboundedReceiver<Vec<u8>>)
where
	W: AsyncWrite + Unpin,
{
	while let Some(bytes) = queue.recv().await {
		if let Err(error) = writer.write_all(&bytes).await {
			debug!(%session_key, "Socket write failed: {error}");
			return;
		}
		trace!(%session_key, bytes = bytes.len(), "Written to socket");
	}
	_ = writer.shutdown().await;
}

impl SocketRegistry {
	pub fn new(shutdown: Controller<String>) -> Self {
		SocketRegistry {
			sockets: Mutex::new(HashMap::new()),
			upstream: Mutex::new(HashMap::new()),
			shutdown,
		}
	}

	/// Marks the socket live and spawns its writer task.
	///
	/// The returned token is cancelled once the socket gets closed through the registry.
	pub fn register<W>(&self, session_key: SessionKey, writer: W) -> CancellationToken
	where
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let pending = self.reserve(session_key);
		let closed = pending.closed.clone();
		self.attach(pending, writer);
		closed
	}

	/// Marks the socket live before its connection exists. Writes are queued until it gets attached.
	pub fn reserve(&self, session_key: SessionKey) -> PendingSocket {
		let (sender, receiver) = mpsc::unbounded_channel();
		let closed = CancellationToken::new();
		let previous = lock(&self.sockets).insert(
			session_key,
			SocketHandle {
				writer: sender,
				closed: closed.clone(),
			},
		);
		if let Some(previous) = previous {
			previous.closed.cancel();
		}
		PendingSocket {
			session_key,
			queue: receiver,
			closed,
		}
	}

	/// Spawns the writer task of a reserved socket, flushing what was queued meanwhile.
	pub fn attach<W>(&self, pending: PendingSocket, writer: W)
	where
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let PendingSocket {
			session_key, queue, ..
		} = pending;
		self.shutdown.spawn(write_loop(session_key, writer, queue));
	}

	/// Queues bytes for the socket. Returns `false` if the socket is gone.
	pub fn write(&self, session_key: SessionKey, bytes: Vec<u8>) -> bool {
		lock(&self.sockets)
			.get(&session_key)
			.is_some_and(|socket| socket.writer.send(bytes).is_ok())
	}

	pub fn is_alive(&self, session_key: SessionKey) -> bool {
		lock(&self.sockets).contains_key(&session_key)
	}

	/// Closes the socket once the queued bytes are written. Returns `false` if it was already closed.
	pub fn close(&self, session_key: SessionKey) -> bool {
		let removed = lock(&self.sockets).remove(&session_key);
		lock(&self.upstream).retain(|_, local| *local != session_key);
		match removed {
			Some(socket) => {
				socket.closed.cancel();
				true
			},
			None => false,
		}
	}

	pub fn map_upstream(&self, node: NodeId, remote: SessionKey, local: SessionKey) {
		lock(&self.upstream).insert((node, remote), local);
	}

	pub fn unmap_upstream(&self, node: NodeId, remote: SessionKey) -> Option<SessionKey> {
		lock(&self.upstream).remove(&(node, remote))
	}

	pub fn upstream(&self, node: NodeId, remote: SessionKey) -> Option<SessionKey> {
		lock(&self.upstream).get(&(node, remote)).copied()
	}

	pub fn len(&self) -> usize {
		lock(&self.sockets).len()
	}

	pub fn is_empty(&self) -> bool {
		lock(&self.sockets).is_empty()
	}
}

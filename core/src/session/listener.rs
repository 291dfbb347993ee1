//! HTTP proxy listener accepting connections from IP endpoints.

use super::{surrogate, OutputEvent, SessionMultiplexer};
use tokio::{
	io::{self, AsyncRead, AsyncReadExt, AsyncWrite},
	net::TcpListener,
};
use tracing::{debug, info, trace, warn};

/// Accepts client connections until shutdown, serving each one in its own tracked task.
pub async fn run(multiplexer: SessionMultiplexer, listener: TcpListener) {
	if let Ok(address) = listener.local_addr() {
		info!("HTTP proxy listening on {address}");
	}
	loop {
		tokio::select! {
			accepted = listener.accept() => match accepted {
				Ok((stream, peer)) => {
					trace!(%peer, "Connection accepted");
					if let Err(error) = stream.set_nodelay(true) {
						debug!(%peer, "Failed to disable Nagle's algorithm: {error}");
					}
					multiplexer
						.shutdown
						.track(handle_connection(multiplexer.clone(), stream));
				},
				Err(error) => warn!("Failed to accept connection: {error}"),
			},
			_ = multiplexer.shutdown.triggered_shutdown() => {
				info!("Shutdown triggered, stopping the HTTP proxy listener");
				break;
			}
		}
	}
}

/// Serves one client connection until it is closed by either side or the gateway shuts down.
pub async fn handle_connection<S>(multiplexer: SessionMultiplexer, stream: S)
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	let session_key = multiplexer.next_session_key();
	multiplexer.emit(OutputEvent::ConnectionAccepted);
	let (mut reader, writer) = io::split(stream);
	let mut buffer = vec![0u8; multiplexer.config.tcp_server_buffer_size];

	let read = tokio::select! {
		read = reader.read(&mut buffer) => read,
		_ = multiplexer.shutdown.triggered_shutdown() => return,
	};
	let first = match read {
		Ok(0) => return,
		Ok(length) => buffer[..length].to_vec(),
		Err(error) => {
			debug!(%session_key, "Client read failed: {error}");
			return;
		},
	};

	let request = multiplexer.parser.parse(session_key, &first);
	let surrogate_port = request.as_ref().and_then(|request| {
		multiplexer
			.config
			.local_surrogate
			.as_ref()
			.filter(|_| multiplexer.config.is_local_surrogate(&request.fqdn))
			.map(|surrogate| surrogate.port)
	});
	if let Some(port) = surrogate_port {
		multiplexer.parser.forget(session_key);
		if let Err(error) =
			surrogate::relay(&multiplexer, session_key, port, &first, reader, writer).await
		{
			warn!(%session_key, "Local surrogate relay failed: {error:#}");
		}
		return;
	}

	let closed = multiplexer.sockets.register(session_key, writer);
	let mut chunk = Some((request, first));
	loop {
		if let Some((request, bytes)) = chunk.take() {
			match request {
				Some(request) => {
					if let Err(error) = multiplexer
						.accept_request(session_key, &request, bytes)
						.await
					{
						warn!(%session_key, "Failed to accept request: {error:#}");
					}
				},
				None => debug!(%session_key, length = bytes.len(), "Dropping data without request context"),
			}
		}

		tokio::select! {
			_ = closed.cancelled() => {
				trace!(%session_key, "Client socket closed by the gateway");
				break;
			},
			_ = multiplexer.shutdown.triggered_shutdown() => {
				trace!(%session_key, "Shutdown triggered, closing client socket");
				break;
			},
			read = reader.read(&mut buffer) => match read {
				Ok(0) => {
					trace!(%session_key, "Client closed the connection");
					break;
				},
				Ok(length) => {
					let bytes = buffer[..length].to_vec();
					chunk = Some((multiplexer.parser.parse(session_key, &bytes), bytes));
				},
				Err(error) => {
					debug!(%session_key, "Client read failed: {error}");
					break;
				},
			},
		}
	}
	multiplexer.delete_session(session_key).await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		configuration::{LocalSurrogate, ProxyConfig},
		pubsub::MockPubSub,
		shutdown::Controller,
		types::ContentId,
	};
	use std::sync::Arc;
	use tokio::{
		io::{duplex, AsyncWriteExt},
		net::TcpListener,
		sync::mpsc,
	};

	#[tokio::test]
	async fn requests_are_buffered_until_path_exists() {
		let mut pubsub = MockPubSub::new();
		pubsub
			.expect_publish_scope()
			.times(1)
			.returning(|_, _| Box::pin(async move { Ok(()) }));
		pubsub
			.expect_publish_info()
			.times(1)
			.returning(|_, _| Box::pin(async move { Ok(()) }));
		let (sender, _receiver) = mpsc::unbounded_channel();
		let multiplexer = SessionMultiplexer::new(
			ProxyConfig::default(),
			Arc::new(pubsub),
			Controller::new(),
			sender,
		);

		let (mut client, server) = duplex(1024);
		let connection = tokio::spawn(handle_connection(multiplexer.clone(), server));
		client
			.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
			.await
			.unwrap();
		drop(client);
		connection.await.unwrap();

		// closing the socket drops its buffered request
		assert!(multiplexer.requests.is_empty());
		assert!(multiplexer.reverse.is_empty());
		assert!(!multiplexer
			.forwarding
			.is_active(&ContentId::for_fqdn("example.com")));
	}

	#[tokio::test]
	async fn shutdown_releases_client_session() {
		let mut pubsub = MockPubSub::new();
		pubsub
			.expect_publish_data_isub()
			.withf(|_, _, data| data[0] != 0x02)
			.times(1)
			.returning(|_, _, _| Box::pin(async move { Ok(()) }));
		// session end published on shutdown
		pubsub
			.expect_publish_data_isub()
			.withf(|_, _, data| data[0] == 0x02)
			.times(1)
			.returning(|_, _, _| Box::pin(async move { Ok(()) }));
		let (sender, mut receiver) = mpsc::unbounded_channel();
		let shutdown = Controller::new();
		let multiplexer =
			SessionMultiplexer::new(ProxyConfig::default(), Arc::new(pubsub), shutdown.clone(), sender);
		multiplexer
			.forwarding
			.activate(ContentId::for_fqdn("example.com"));

		let (mut client, server) = duplex(1024);
		let connection = shutdown.track(handle_connection(multiplexer.clone(), server));
		client
			.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
			.await
			.unwrap();
		assert_eq!(receiver.recv().await, Some(OutputEvent::ConnectionAccepted));
		assert_eq!(receiver.recv().await, Some(OutputEvent::FragmentsPublished(1)));
		assert_eq!(multiplexer.reverse.len(), 1);

		assert!(shutdown.trigger_shutdown("stop".to_string()).is_ok());
		connection.await.unwrap();
		assert_eq!(receiver.recv().await, Some(OutputEvent::SessionEnded));
		assert!(multiplexer.reverse.is_empty());
		assert!(multiplexer.sockets.is_empty());
	}

	#[tokio::test]
	async fn surrogate_requests_bypass_pubsub() {
		let surrogate = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = surrogate.local_addr().unwrap().port();
		tokio::spawn(async move {
			let (mut stream, _) = surrogate.accept().await.unwrap();
			let mut request = vec![0u8; 1024];
			let length = stream.read(&mut request).await.unwrap();
			assert!(request[..length].starts_with(b"GET /local"));
			stream
				.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
				.await
				.unwrap();
		});

		let config = ProxyConfig {
			local_surrogate: Some(LocalSurrogate {
				fqdn: "local.example".to_string(),
				port,
			}),
			..Default::default()
		};
		let (sender, mut receiver) = mpsc::unbounded_channel();
		let multiplexer = SessionMultiplexer::new(
			config,
			Arc::new(MockPubSub::new()),
			Controller::new(),
			sender,
		);

		let (mut client, server) = duplex(1024);
		let connection = tokio::spawn(handle_connection(multiplexer.clone(), server));
		client
			.write_all(b"GET /local HTTP/1.1\r\nHost: local.example\r\n\r\n")
			.await
			.unwrap();

		let mut response = vec![0u8; 64];
		let length = client.read(&mut response).await.unwrap();
		assert_eq!(&response[..length], b"HTTP/1.1 204 No Content\r\n\r\n");
		drop(client);
		connection.await.unwrap();

		assert_eq!(receiver.recv().await, Some(OutputEvent::ConnectionAccepted));
		assert_eq!(receiver.recv().await, Some(OutputEvent::SurrogateRelayed));
		assert!(multiplexer.reverse.is_empty());
	}
}

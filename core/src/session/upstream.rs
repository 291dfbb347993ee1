use super::SessionMultiplexer;
use crate::types::SessionKey;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Publishes everything the origin sends until it closes the connection or the session is closed.
pub(super) async fn read_responses<R>(
	multiplexer: SessionMultiplexer,
	session_key: SessionKey,
	mut reader: R,
	closed: CancellationToken,
) where
	R: AsyncRead + Unpin,
{
	let mut buffer = vec![0u8; multiplexer.config.tcp_client_buffer_size];
	loop {
		tokio::select! {
			_ = closed.cancelled() => {
				trace!(%session_key, "Upstream session closed");
				break;
			},
			read = reader.read(&mut buffer) => match read {
				Ok(0) => {
					debug!(%session_key, "Origin closed the connection");
					break;
				},
				Ok(length) => {
					if !multiplexer.handle_response(session_key, &buffer[..length]).await {
						debug!(%session_key, "Session context gone, dropping response");
						break;
					}
				},
				Err(error) => {
					debug!(%session_key, "Upstream read failed: {error}");
					break;
				},
			},
		}
	}
	multiplexer.close_session(session_key).await;
}

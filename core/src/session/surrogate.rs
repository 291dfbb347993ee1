use super::{OutputEvent, SessionMultiplexer};
use crate::types::SessionKey;
use color_eyre::{eyre::WrapErr, Result};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::{
	io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
	net::TcpStream,
};
use tracing::{debug, trace};

/// Relays the client connection verbatim to the surrogate on localhost.
pub(super) async fn relay<R, W>(
	multiplexer: &SessionMultiplexer,
	session_key: SessionKey,
	port: u16,
	first: &[u8],
	mut client_reader: R,
	mut client_writer: W,
) -> Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin + Send + 'static,
{
	let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
	let stream = TcpStream::connect(address)
		.await
		.wrap_err_with(|| format!("Failed to connect to local surrogate at {address}"))?;
	let (mut surrogate_reader, mut surrogate_writer) = stream.into_split();
	multiplexer.emit(OutputEvent::SurrogateRelayed);
	debug!(%session_key, %address, "Relaying to local surrogate");

	multiplexer.shutdown.spawn(async move {
		match io::copy(&mut surrogate_reader, &mut client_writer).await {
			Ok(bytes) => trace!(%session_key, bytes, "Surrogate response relayed"),
			Err(error) => debug!(%session_key, "Surrogate response relay failed: {error}"),
		}
		_ = client_writer.shutdown().await;
	});

	surrogate_writer
		.write_all(first)
		.await
		.wrap_err("Failed to relay request to local surrogate")?;
	let bytes = io::copy(&mut client_reader, &mut surrogate_writer)
		.await
		.wrap_err("Failed to relay request to local surrogate")?;
	trace!(%session_key, bytes = bytes + first.len() as u64, "Client request relayed");
	_ = surrogate_writer.shutdown().await;
	Ok(())
}

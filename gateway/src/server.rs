use crate::config::Addr;
use color_eyre::Result;
use nap_core::{session::SessionMultiplexer, types::NodeId};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr};
use tracing::info;
use warp::{http::StatusCode, Filter, Rejection, Reply};

#[derive(Serialize)]
struct NodeResponses {
	node: NodeId,
	response_ids: Vec<String>,
}

fn with_multiplexer(
	multiplexer: SessionMultiplexer,
) -> impl Filter<Extract = (SessionMultiplexer,), Error = Infallible> + Clone {
	warp::any().map(move || multiplexer.clone())
}

fn status(multiplexer: SessionMultiplexer) -> impl Reply {
	warp::reply::json(&multiplexer.status())
}

fn node_responses(node: u32, multiplexer: SessionMultiplexer) -> impl Reply {
	let node = NodeId(node);
	warp::reply::json(&NodeResponses {
		node,
		response_ids: multiplexer.node_responses(node),
	})
}

pub fn routes(
	multiplexer: SessionMultiplexer,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let health = warp::head()
		.or(warp::get())
		.and(warp::path("health"))
		.and(warp::path::end())
		.map(|_| warp::reply::with_status("", StatusCode::OK));

	let status = warp::path!("v1" / "status")
		.and(with_multiplexer(multiplexer.clone()))
		.map(status);

	let nodes = warp::path!("v1" / "nodes" / u32)
		.and(with_multiplexer(multiplexer))
		.map(node_responses);

	health.or(warp::get().and(status.or(nodes)))
}

pub async fn run(addr: Addr, multiplexer: SessionMultiplexer) -> Result<()> {
	info!("HTTP server running on http://{addr}. Health endpoint available at '/health'.");
	let socket_addr: SocketAddr = addr.try_into()?;
	warp::serve(routes(multiplexer)).run(socket_addr).await;
	Ok(())
}

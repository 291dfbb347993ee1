//! Pub/sub event handling.
//!
//! Events are handled one at a time in the order the substrate delivers them.
//! No handler blocks on socket I/O: writes are queued to the socket tasks and
//! upstream connections are opened by their own tasks.

use crate::{
	pubsub::Event,
	session::{OutputEvent, SessionMultiplexer},
	shutdown::Controller,
	transport::{Handled, TransportState},
	types::{ContentId, FlowKey, Namespace, NodeId, SessionKey},
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

pub struct EventDispatcher {
	multiplexer: SessionMultiplexer,
	events: UnboundedReceiver<Event>,
	shutdown: Controller<String>,
}

impl EventDispatcher {
	pub fn new(
		multiplexer: SessionMultiplexer,
		events: UnboundedReceiver<Event>,
		shutdown: Controller<String>,
	) -> Self {
		EventDispatcher {
			multiplexer,
			events,
			shutdown,
		}
	}

	pub async fn run(mut self) {
		info!("Event dispatcher started");
		loop {
			tokio::select! {
				event = self.events.recv() => match event {
					Some(event) => self.handle_event(event).await,
					None => {
						warn!("Pub/sub event stream closed, exiting the event dispatcher");
						break;
					},
				},
				_ = self.shutdown.triggered_shutdown() => {
					info!("Shutdown triggered, exiting the event dispatcher");
					break;
				}
			}
		}
	}

	pub async fn handle_event(&self, event: Event) {
		trace!(%event, "Handling pub/sub event");
		match event {
			Event::ScopePublished { id } => {
				debug!(%id, "Scope published, subscribing");
				if let Err(error) = self.multiplexer.pubsub().subscribe_scope(id).await {
					warn!(%id, "Failed to subscribe to scope: {error:#}");
				}
			},
			Event::StartPublish { id } => {
				info!(%id, "Forwarding path available");
				self.multiplexer.publish_from_buffer(id).await;
			},
			Event::StartPublishImplicitSub { node } => {
				debug!(%node, "Forwarding path to implicit subscriber available");
				self.multiplexer.forwarding().activate_node(node);
			},
			Event::StopPublish { id } | Event::PausePublish { id } => {
				debug!(%id, "Forwarding path lost");
				self.multiplexer.forwarding().deactivate(id);
			},
			Event::ResumePublish { id } => {
				debug!(%id, "Resume publish, nothing to do");
			},
			Event::RePublish { id } => {
				debug!(%id, "Republication requested");
				if let Err(error) = self.multiplexer.pubsub().unpublish_info(id).await {
					warn!(%id, "Failed to unpublish item: {error:#}");
				}
				self.multiplexer.forwarding().deactivate(id);
			},
			Event::PublishedData { id, data } => self.handle_response(id, &data).await,
			Event::PublishedDataImplicitSub {
				id,
				isub_id,
				node,
				data,
			} => self.handle_request(id, isub_id, node, &data).await,
			Event::Unrecognized { kind } => {
				warn!(kind, "Unrecognized pub/sub event, ignoring");
			},
		}
	}

	fn emit(&self, event: OutputEvent) {
		self.multiplexer.emit(event);
	}

	/// Client side: response data published to a response identifier.
	async fn handle_response(&self, id: ContentId, data: &[u8]) {
		let handled = match self.multiplexer.fragment_buffer().handle_publication(id, data) {
			Ok(handled) => handled,
			Err(error) => {
				debug!(%id, "Dropping response publication: {error}");
				self.emit(OutputEvent::PacketDropped);
				return;
			},
		};

		match handled {
			Handled::Unframed(payload) => {
				let flow = FlowKey::new(id, self.multiplexer.config().enigma, SessionKey::UNSPECIFIED);
				self.multiplexer.send_to_endpoint(&flow, payload);
			},
			Handled::Flow {
				key,
				state: TransportState::AllFragmentsReceived,
			} => match self.multiplexer.fragment_buffer().retrieve(&key) {
				Some(packet) => {
					self.emit(OutputEvent::PacketReassembled);
					self.multiplexer.send_to_endpoint(&key, packet);
				},
				None => {
					warn!(%key, "Reassembled response is gone");
					self.emit(OutputEvent::PacketDropped);
				},
			},
			Handled::Flow {
				key,
				state: TransportState::SessionEnded,
			} => {
				let closed = self.multiplexer.end_session(&key);
				debug!(%key, closed, "Response session ended");
			},
			Handled::Flow { .. } => {},
		}
	}

	/// Server side: request data published by `node`, which waits for the answer on `isub_id`.
	///
	/// Requests are reassembled per response identifier, so sessions of different nodes
	/// asking for different resources never share a flow.
	async fn handle_request(&self, id: ContentId, isub_id: ContentId, node: NodeId, data: &[u8]) {
		self.multiplexer
			.reverse_lookup()
			.add_node_response(node, isub_id);

		let handled = match self
			.multiplexer
			.fragment_buffer()
			.handle_publication(isub_id, data)
		{
			Ok(handled) => handled,
			Err(error) => {
				debug!(%id, %node, "Dropping request publication: {error}");
				self.emit(OutputEvent::PacketDropped);
				return;
			},
		};

		let (flow, packet) = match handled {
			Handled::Unframed(payload) => (
				FlowKey::new(isub_id, self.multiplexer.config().enigma, SessionKey::UNSPECIFIED),
				payload,
			),
			Handled::Flow {
				key,
				state: TransportState::AllFragmentsReceived,
			} => match self.multiplexer.fragment_buffer().retrieve(&key) {
				Some(packet) => {
					self.emit(OutputEvent::PacketReassembled);
					(key, packet)
				},
				None => {
					warn!(%key, "Reassembled request is gone");
					self.emit(OutputEvent::PacketDropped);
					return;
				},
			},
			Handled::Flow {
				key,
				state: TransportState::SessionEnded,
			} => {
				debug!(%key, %node, "Request session ended");
				self.multiplexer.close_upstream(node, key.session_key).await;
				return;
			},
			Handled::Flow { .. } => return,
		};

		match id.namespace() {
			Some(Namespace::Http) => {
				if let Err(error) = self.multiplexer.forward_request(node, id, flow, packet) {
					warn!(%node, %flow, "Failed to forward request: {error:#}");
				}
			},
			Some(namespace) => {
				warn!(%id, %namespace, "Namespace is not supported, dropping request");
			},
			None => {
				warn!(%id, "Unknown namespace, dropping request");
			},
		}
	}
}

//! In-process broker standing in for the ICN core.
//!
//! Every attached node gets an event channel. Item identifiers are matched
//! against subscriptions either directly or through the scope they were
//! published under; no forwarding identifiers are computed.

use super::{Event, PubSub};
use crate::{
	shutdown::Controller,
	types::{ContentId, NodeId},
};
use async_trait::async_trait;
use color_eyre::{
	eyre::{eyre, Report},
	Result,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

type Command = Box<dyn FnOnce(&mut EventLoop) -> Result<(), Report> + Send>;

pub struct EventLoop {
	command_receiver: UnboundedReceiver<Command>,
	nodes: HashMap<NodeId, UnboundedSender<Event>>,
	/// Scope each advertised item was published under.
	items: HashMap<ContentId, ContentId>,
	publishers: HashMap<ContentId, BTreeSet<NodeId>>,
	subscribers: HashMap<ContentId, BTreeSet<NodeId>>,
	/// Nodes which already have a path back to an implicit subscriber.
	implicit_routes: HashSet<(NodeId, NodeId)>,
	shutdown: Controller<String>,
}

/// Creates a broker handle and the event loop serving it.
pub fn init(shutdown: Controller<String>) -> (Broker, EventLoop) {
	let (command_sender, command_receiver) = mpsc::unbounded_channel();
	(
		Broker { command_sender },
		EventLoop {
			command_receiver,
			nodes: HashMap::new(),
			items: HashMap::new(),
			publishers: HashMap::new(),
			subscribers: HashMap::new(),
			implicit_routes: HashSet::new(),
			shutdown,
		},
	)
}

impl EventLoop {
	pub async fn run(mut self) {
		loop {
			tokio::select! {
				command = self.command_receiver.recv() => match command {
					Some(command) => {
						if let Err(error) = command(&mut self) {
							debug!("Broker command failed: {error:#}");
						}
					},
					None => {
						warn!("Command channel closed, exiting the broker event loop");
						break;
					},
				},
				_ = self.shutdown.triggered_shutdown() => {
					info!("Shutdown triggered, exiting the broker event loop");
					break;
				}
			}
		}
	}

	fn notify(&self, node: NodeId, event: Event) -> Result<()> {
		trace!(%node, %event, "Delivering event");
		self.nodes
			.get(&node)
			.ok_or_else(|| eyre!("Node {node} is not attached"))?
			.send(event)
			.map_err(|_| eyre!("Node {node} stopped receiving events"))
	}

	/// Nodes subscribed to the item directly or to the scope it was published under.
	fn subscribers_of(&self, id: &ContentId) -> BTreeSet<NodeId> {
		let direct = self.subscribers.get(id).into_iter().flatten();
		let scoped = self
			.items
			.get(id)
			.and_then(|scope| self.subscribers.get(scope))
			.into_iter()
			.flatten();
		direct.chain(scoped).copied().collect()
	}

	fn attach(&mut self, node: NodeId, sender: UnboundedSender<Event>) -> Result<()> {
		if self.nodes.insert(node, sender).is_some() {
			warn!(%node, "Node attached twice, previous event channel replaced");
		}
		Ok(())
	}

	fn publish_scope(&mut self, id: ContentId, prefix: ContentId) -> Result<()> {
		let subscribers = self.subscribers.get(&prefix).cloned().unwrap_or_default();
		for node in subscribers {
			self.notify(node, Event::ScopePublished { id })?;
		}
		Ok(())
	}

	fn publish_info(&mut self, node: NodeId, id: ContentId, prefix: ContentId) -> Result<()> {
		self.items.insert(id, prefix);
		self.publishers.entry(id).or_default().insert(node);
		if !self.subscribers_of(&id).is_empty() {
			self.notify(node, Event::StartPublish { id })?;
		}
		Ok(())
	}

	fn unpublish_info(&mut self, node: NodeId, id: ContentId) -> Result<()> {
		if let Some(publishers) = self.publishers.get_mut(&id) {
			publishers.remove(&node);
			if publishers.is_empty() {
				self.publishers.remove(&id);
				self.items.remove(&id);
			}
		}
		Ok(())
	}

	fn subscribe_scope(&mut self, node: NodeId, id: ContentId) -> Result<()> {
		if !self.subscribers.entry(id).or_default().insert(node) {
			return Ok(());
		}
		let matching: Vec<(ContentId, NodeId)> = self
			.publishers
			.iter()
			.filter(|(item, _)| **item == id || self.items.get(item) == Some(&id))
			.flat_map(|(item, publishers)| publishers.iter().map(|publisher| (*item, *publisher)))
			.collect();
		for (item, publisher) in matching {
			self.notify(publisher, Event::StartPublish { id: item })?;
		}
		Ok(())
	}

	fn publish_data_isub(
		&mut self,
		node: NodeId,
		id: ContentId,
		isub_id: ContentId,
		data: Vec<u8>,
	) -> Result<()> {
		let subscribers = self.subscribers_of(&id);
		if subscribers.is_empty() {
			return Err(eyre!("No subscribers of {id}"));
		}
		for subscriber in subscribers {
			if self.implicit_routes.insert((subscriber, node)) {
				self.notify(subscriber, Event::StartPublishImplicitSub { node })?;
			}
			self.notify(
				subscriber,
				Event::PublishedDataImplicitSub {
					id,
					isub_id,
					node,
					data: data.clone(),
				},
			)?;
		}
		Ok(())
	}
}

#[derive(Clone)]
pub struct Broker {
	command_sender: UnboundedSender<Command>,
}

impl Broker {
	/// Attaches a node to the broker, returning its command client and event stream.
	pub fn attach(&self, node: NodeId) -> Result<(Client, UnboundedReceiver<Event>)> {
		let (event_sender, event_receiver) = mpsc::unbounded_channel();
		let client = Client {
			node,
			command_sender: self.command_sender.clone(),
		};
		client.execute(move |event_loop| event_loop.attach(node, event_sender))?;
		Ok((client, event_receiver))
	}
}

/// Command client of one attached node.
#[derive(Clone)]
pub struct Client {
	node: NodeId,
	command_sender: UnboundedSender<Command>,
}

impl Client {
	pub fn node(&self) -> NodeId {
		self.node
	}

	fn execute(
		&self,
		command: impl FnOnce(&mut EventLoop) -> Result<()> + Send + 'static,
	) -> Result<()> {
		self.command_sender
			.send(Box::new(command))
			.map_err(|_| eyre!("receiver should not be dropped"))
	}
}

#[async_trait]
impl PubSub for Client {
	async fn publish_scope(&self, id: ContentId, prefix: ContentId) -> Result<()> {
		self.execute(move |event_loop| event_loop.publish_scope(id, prefix))
	}

	async fn publish_info(&self, id: ContentId, prefix: ContentId) -> Result<()> {
		let node = self.node;
		self.execute(move |event_loop| event_loop.publish_info(node, id, prefix))
	}

	async fn unpublish_info(&self, id: ContentId) -> Result<()> {
		let node = self.node;
		self.execute(move |event_loop| event_loop.unpublish_info(node, id))
	}

	async fn subscribe_scope(&self, id: ContentId) -> Result<()> {
		let node = self.node;
		self.execute(move |event_loop| event_loop.subscribe_scope(node, id))
	}


	async fn publish_data_isub(
		&self,
		id: ContentId,
		isub_id: ContentId,
		data: Vec<u8>,
	) -> Result<()> {
		let node = self.node;
		self.execute(move |event_loop| event_loop.publish_data_isub(node, id, isub_id, data))
	}

	async fn publish_data_to(&self, id: ContentId, node: NodeId, data: Vec<u8>) -> Result<()> {
		self.execute(move |event_loop| event_loop.notify(node, Event::PublishedData { id, data }))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Namespace;

	const CLIENT: NodeId = NodeId(1);
	const SERVER: NodeId = NodeId(2);

	fn start() -> (Broker, Controller<String>) {
		let shutdown = Controller::new();
		let (broker, event_loop) = init(shutdown.clone());
		tokio::spawn(event_loop.run());
		(broker, shutdown)
	}

	#[tokio::test]
	async fn request_response_exchange() {
		let (broker, _shutdown) = start();
		let (client, mut client_events) = broker.attach(CLIENT).unwrap();
		let (server, mut server_events) = broker.attach(SERVER).unwrap();

		let root = ContentId::root(Namespace::Http);
		let id = ContentId::for_fqdn("example.com");
		let isub_id = ContentId::for_url("example.com", "/");

		client.publish_info(id, root).await.unwrap();
		server.subscribe_scope(root).await.unwrap();
		assert_eq!(client_events.recv().await, Some(Event::StartPublish { id }));

		client
			.publish_data_isub(id, isub_id, b"request".to_vec())
			.await
			.unwrap();
		client
			.publish_data_isub(id, isub_id, b"again".to_vec())
			.await
			.unwrap();
		assert_eq!(
			server_events.recv().await,
			Some(Event::StartPublishImplicitSub { node: CLIENT })
		);
		assert_eq!(
			server_events.recv().await,
			Some(Event::PublishedDataImplicitSub {
				id,
				isub_id,
				node: CLIENT,
				data: b"request".to_vec()
			})
		);
		assert!(matches!(
			server_events.recv().await,
			Some(Event::PublishedDataImplicitSub { .. })
		));

		server
			.publish_data_to(isub_id, CLIENT, b"response".to_vec())
			.await
			.unwrap();
		assert_eq!(
			client_events.recv().await,
			Some(Event::PublishedData {
				id: isub_id,
				data: b"response".to_vec()
			})
		);
	}

	#[tokio::test]
	async fn subscription_before_publication() {
		let (broker, _shutdown) = start();
		let (client, mut client_events) = broker.attach(CLIENT).unwrap();
		let (server, mut server_events) = broker.attach(SERVER).unwrap();

		let id = ContentId::for_fqdn("example.com");
		server.subscribe_scope(id).await.unwrap();
		client
			.publish_scope(id, ContentId::root(Namespace::Http))
			.await
			.unwrap();
		client
			.publish_info(id, ContentId::root(Namespace::Http))
			.await
			.unwrap();
		assert_eq!(client_events.recv().await, Some(Event::StartPublish { id }));

		let isub_id = ContentId::for_url("example.com", "/");
		client
			.publish_data_isub(id, isub_id, b"data".to_vec())
			.await
			.unwrap();
		assert_eq!(
			server_events.recv().await,
			Some(Event::StartPublishImplicitSub { node: CLIENT })
		);
		assert_eq!(
			server_events.recv().await,
			Some(Event::PublishedDataImplicitSub {
				id,
				isub_id,
				node: CLIENT,
				data: b"data".to_vec()
			})
		);
	}

	#[tokio::test]
	async fn event_loop_stops_on_shutdown() {
		let shutdown = Controller::new();
		let (broker, event_loop) = init(shutdown.clone());
		let task = tokio::spawn(event_loop.run());

		shutdown.trigger_shutdown("test".to_string()).unwrap();
		task.await.unwrap();
		assert!(broker.attach(CLIENT).is_err());
	}
}

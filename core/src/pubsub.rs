//! Narrow interface to the ICN publish/subscribe substrate.

use crate::types::{ContentId, NodeId};
use async_trait::async_trait;
use color_eyre::Result;
use mockall::automock;
use strum::Display;

pub mod local;

/// Notifications delivered by the substrate, consumed one at a time by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Event {
	/// A scope was published under a scope this node is subscribed to.
	ScopePublished { id: ContentId },
	/// A forwarding path to subscribers of the item exists.
	StartPublish { id: ContentId },
	/// A forwarding path back to an implicitly subscribed node exists.
	StartPublishImplicitSub { node: NodeId },
	StopPublish { id: ContentId },
	PausePublish { id: ContentId },
	ResumePublish { id: ContentId },
	/// The item has to be advertised again.
	RePublish { id: ContentId },
	PublishedData { id: ContentId, data: Vec<u8> },
	/// Data published to `id` by `node`, which implicitly subscribed to `isub_id` for the answer.
	PublishedDataImplicitSub {
		id: ContentId,
		isub_id: ContentId,
		node: NodeId,
		data: Vec<u8>,
	},
	Unrecognized { kind: u8 },
}

/// Commands accepted by the substrate. All of them are fire-and-forget.
#[async_trait]
#[automock]
pub trait PubSub: Send + Sync {
	async fn publish_scope(&self, id: ContentId, prefix: ContentId) -> Result<()>;
	async fn publish_info(&self, id: ContentId, prefix: ContentId) -> Result<()>;
	async fn unpublish_info(&self, id: ContentId) -> Result<()>;
	async fn subscribe_scope(&self, id: ContentId) -> Result<()>;
	/// Publishes `data` to subscribers of `id`, implicitly subscribing this node to `isub_id`.
	async fn publish_data_isub(&self, id: ContentId, isub_id: ContentId, data: Vec<u8>)
		-> Result<()>;
	/// Publishes `data` under `id` to a single node.
	async fn publish_data_to(&self, id: ContentId, node: NodeId, data: Vec<u8>) -> Result<()>;
}

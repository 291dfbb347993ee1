use crate::{
	types::{ContentId, NodeId},
	utils::lock,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Mutex};
use strum::Display;

/// Publication state of an identifier or of the path back to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingState {
	/// Advertised, waiting for a subscriber.
	Advertised,
	Active,
	Inactive,
}

#[derive(Default)]
pub struct ForwardingTable {
	ids: Mutex<HashMap<ContentId, ForwardingState>>,
	nodes: Mutex<HashMap<NodeId, ForwardingState>>,
}

impl ForwardingTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn state(&self, id: &ContentId) -> Option<ForwardingState> {
		lock(&self.ids).get(id).copied()
	}

	pub fn is_active(&self, id: &ContentId) -> bool {
		self.state(id) == Some(ForwardingState::Active)
	}

	/// Marks the identifier advertised. Returns `true` if it has to be (re)published.
	pub fn advertise(&self, id: ContentId) -> bool {
		let mut ids = lock(&self.ids);
		match ids.get(&id) {
			Some(ForwardingState::Advertised | ForwardingState::Active) => false,
			Some(ForwardingState::Inactive) | None => {
				ids.insert(id, ForwardingState::Advertised);
				true
			},
		}
	}

	pub fn activate(&self, id: ContentId) {
		lock(&self.ids).insert(id, ForwardingState::Active);
	}

	pub fn deactivate(&self, id: ContentId) {
		lock(&self.ids).insert(id, ForwardingState::Inactive);
	}

	pub fn activate_node(&self, node: NodeId) {
		lock(&self.nodes).insert(node, ForwardingState::Active);
	}

	pub fn is_node_active(&self, node: NodeId) -> bool {
		lock(&self.nodes).get(&node) == Some(&ForwardingState::Active)
	}

	pub fn active_ids(&self) -> Vec<ContentId> {
		let mut ids: Vec<ContentId> = lock(&self.ids)
			.iter()
			.filter(|(_, state)| **state == ForwardingState::Active)
			.map(|(id, _)| *id)
			.collect();
		ids.sort();
		ids
	}

	pub fn active_nodes(&self) -> Vec<NodeId> {
		let mut nodes: Vec<NodeId> = lock(&self.nodes)
			.iter()
			.filter(|(_, state)| **state == ForwardingState::Active)
			.map(|(node, _)| *node)
			.collect();
		nodes.sort();
		nodes
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn advertise_once_until_inactive() {
		let table = ForwardingTable::new();
		let id = ContentId::for_fqdn("example.com");

		assert!(table.advertise(id));
		assert!(!table.advertise(id));
		assert!(!table.is_active(&id));

		table.activate(id);
		assert!(!table.advertise(id));
		assert_eq!(table.active_ids(), vec![id]);

		table.deactivate(id);
		assert_eq!(table.state(&id), Some(ForwardingState::Inactive));
		assert!(table.advertise(id));
	}

	#[test]
	fn node_paths() {
		let table = ForwardingTable::new();
		assert!(!table.is_node_active(NodeId(4)));
		table.activate_node(NodeId(4));
		assert!(table.is_node_active(NodeId(4)));
		assert_eq!(table.active_nodes(), vec![NodeId(4)]);
	}
}

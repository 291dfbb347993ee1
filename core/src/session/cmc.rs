//! Combined multicast (CMC) groups: subscribers sharing one upstream response.

use crate::{
	types::{ContentId, Enigma, NodeId, SessionKey},
	utils::lock,
};
use std::{
	collections::{BTreeSet, HashMap},
	sync::Mutex,
};

/// Group member, the node and the session key it used for the request.
pub type Member = (NodeId, SessionKey);

#[derive(Debug, Clone)]
struct CmcGroup {
	response_id: ContentId,
	enigma: Enigma,
	members: BTreeSet<Member>,
	/// Other subscribers of the same response may join until the group is locked.
	joinable: bool,
	locked: bool,
}

impl CmcGroup {
	fn members(&self) -> Vec<Member> {
		self.members.iter().copied().collect()
	}
}

/// Members snapshot taken when response bytes are about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locked {
	pub members: Vec<Member>,
	/// Whether this call locked the group.
	pub newly_locked: bool,
}

/// Group removed by [`CmcGroups::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dissolved {
	pub response_id: ContentId,
	pub enigma: Enigma,
	pub members: Vec<Member>,
}

/// CMC groups keyed by the local session key of the upstream socket serving them.
#[derive(Default)]
pub struct CmcGroups {
	groups: Mutex<HashMap<SessionKey, CmcGroup>>,
}

impl CmcGroups {
	pub fn new() -> Self {
		Self::default()
	}

	/// Opens (or reopens, for a reused upstream socket) the group with its initiating member.
	pub fn open(
		&self,
		session_key: SessionKey,
		response_id: ContentId,
		enigma: Enigma,
		initiator: Member,
		joinable: bool,
	) {
		lock(&self.groups).insert(
			session_key,
			CmcGroup {
				response_id,
				enigma,
				members: BTreeSet::from([initiator]),
				joinable,
				locked: false,
			},
		);
	}

	/// Adds the member to an open group waiting for the same response.
	///
	/// Returns the session key of the upstream socket serving the group.
	pub fn join(&self, response_id: &ContentId, enigma: Enigma, member: Member) -> Option<SessionKey> {
		let mut groups = lock(&self.groups);
		let (session_key, group) = groups.iter_mut().find(|(_, group)| {
			group.joinable
				&& !group.locked
				&& group.response_id == *response_id
				&& group.enigma == enigma
		})?;
		group.members.insert(member);
		Some(*session_key)
	}

	/// Locks the membership, no node can join afterwards.
	pub fn lock(&self, session_key: SessionKey) -> Option<Locked> {
		let mut groups = lock(&self.groups);
		let group = groups.get_mut(&session_key)?;
		let newly_locked = !group.locked;
		group.locked = true;
		Some(Locked {
			members: group.members(),
			newly_locked,
		})
	}

	/// Removes the member from every group, returning the groups it left with their remaining size.
	pub fn leave(&self, member: Member) -> Vec<(SessionKey, usize)> {
		lock(&self.groups)
			.iter_mut()
			.filter_map(|(session_key, group)| {
				group
					.members
					.remove(&member)
					.then(|| (*session_key, group.members.len()))
			})
			.collect()
	}

	pub fn members(&self, session_key: SessionKey) -> Option<Vec<Member>> {
		lock(&self.groups).get(&session_key).map(CmcGroup::members)
	}

	/// Destroys the group, returning the response it was waiting on and its members.
	pub fn remove(&self, session_key: SessionKey) -> Option<Dissolved> {
		lock(&self.groups)
			.remove(&session_key)
			.map(|group| Dissolved {
				response_id: group.response_id,
				enigma: group.enigma,
				members: group.members(),
			})
	}

	pub fn len(&self) -> usize {
		lock(&self.groups).len()
	}

	pub fn is_empty(&self) -> bool {
		lock(&self.groups).is_empty()
	}

	/// Groups serving more than one member.
	pub fn multicast_count(&self) -> usize {
		lock(&self.groups)
			.values()
			.filter(|group| group.members.len() > 1)
			.count()
	}
}

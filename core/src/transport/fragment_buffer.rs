use super::{ControlType, DecodeError, Publication, Segment, TransportState};
use crate::{
	expiring_map::ExpiringMap,
	types::{ContentId, FlowKey, Sequence},
};
use std::{
	collections::{btree_map::Entry, BTreeMap},
	sync::Arc,
	time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Default)]
struct Reassembly {
	fragments: BTreeMap<Sequence, Vec<u8>>,
	last: Option<Sequence>,
}

impl Reassembly {
	fn is_complete(&self) -> bool {
		match self.last {
			// keys are unique and bounded by `last`, so the count proves contiguity
			Some(last) => {
				self.fragments.len() == last as usize + 1
					&& self.fragments.keys().next_back() == Some(&last)
			},
			None => false,
		}
	}

	fn add(&mut self, sequence: Sequence, payload: Vec<u8>, last: bool) -> TransportState {
		if self.is_complete() {
			return TransportState::NoActionRequired;
		}

		if matches!(self.last, Some(terminal) if sequence > terminal) {
			return TransportState::NoActionRequired;
		}

		if last {
			self.last = Some(sequence);
			self.fragments.retain(|stored, _| *stored <= sequence);
		}

		match self.fragments.entry(sequence) {
			Entry::Occupied(stored) if stored.get().len() == payload.len() => {},
			Entry::Occupied(mut stored) => {
				stored.insert(payload);
			},
			Entry::Vacant(slot) => {
				slot.insert(payload);
			},
		}

		if self.is_complete() {
			TransportState::AllFragmentsReceived
		} else {
			TransportState::FragmentsOutstanding
		}
	}

	fn size(&self) -> usize {
		self.fragments.values().map(Vec::len).sum()
	}
}

/// Result of feeding a publication to the [`FragmentBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
	Flow { key: FlowKey, state: TransportState },
	/// Publication without LTP framing, delivered as is.
	Unframed(Vec<u8>),
}

impl Handled {
	pub fn state(&self) -> TransportState {
		match self {
			Handled::Flow { state, .. } => *state,
			Handled::Unframed(_) => TransportState::NoTransportProtocolUsed,
		}
	}
}

/// Per-flow LTP reassembly state.
///
/// Entries are created by the first fragment of a flow and released either by
/// [`FragmentBuffer::retrieve`] or by the cleaner once they outlive the buffer timeout.
pub struct FragmentBuffer {
	packets: Arc<ExpiringMap<FlowKey, Reassembly>>,
	ended: Arc<ExpiringMap<FlowKey, ()>>,
}

impl Default for FragmentBuffer {
	fn default() -> Self {
		Self::new()
	}
}

impl FragmentBuffer {
	pub fn new() -> Self {
		FragmentBuffer {
			packets: Arc::new(ExpiringMap::new("ltp_packets")),
			ended: Arc::new(ExpiringMap::new("ltp_ended_sessions")),
		}
	}

	/// Decodes a publication received for `id` and feeds it to the reassembly state.
	pub fn handle_publication(&self, id: ContentId, data: &[u8]) -> Result<Handled, DecodeError> {
		match Publication::decode(data)? {
			Publication::Unframed(payload) => Ok(Handled::Unframed(payload)),
			Publication::Framed {
				enigma,
				session_key,
				segment,
			} => {
				let key = FlowKey::new(id, enigma, session_key);
				let state = self.handle(key, segment);
				Ok(Handled::Flow { key, state })
			},
		}
	}

	pub fn handle(&self, key: FlowKey, segment: Segment) -> TransportState {
		match segment {
			Segment::Control(ControlType::SessionEnd) => {
				if let Some(discarded) = self.packets.remove(&key) {
					debug!(%key, fragments = discarded.fragments.len(), "Session ended with outstanding fragments");
				}
				self.ended.insert(key, ());
				TransportState::SessionEnded
			},
			Segment::Control(control) => {
				debug!(%key, %control, "LTP control message not supported");
				TransportState::NoActionRequired
			},
			Segment::Data {
				sequence,
				payload,
				last,
			} => {
				if self.ended.contains_key(&key) {
					warn!(%key, sequence, "Dropping fragment of ended session");
					return TransportState::NoActionRequired;
				}
				let state = self
					.packets
					.upsert(key, Reassembly::default, |packet| packet.add(sequence, payload, last));
				trace!(%key, sequence, last, %state, "LTP fragment handled");
				state
			},
		}
	}

	/// Takes the reassembled packet out of the buffer.
	///
	/// Returns [`None`] if the packet is incomplete, was evicted, or was already retrieved.
	pub fn retrieve(&self, key: &FlowKey) -> Option<Vec<u8>> {
		let packet = self.packets.remove_if(key, Reassembly::is_complete)?;
		Some(packet.fragments.into_values().flatten().collect())
	}

	/// Drops any reassembly state of the flow, returns `true` if there was some.
	pub fn discard(&self, key: &FlowKey) -> bool {
		self.packets.remove(key).is_some()
	}

	pub fn len(&self) -> usize {
		self.packets.len()
	}

	pub fn is_empty(&self) -> bool {
		self.packets.is_empty()
	}

	pub fn buffered_bytes(&self) -> usize {
		self.packets
			.filter_map(|_, packet| Some(packet.size()))
			.into_iter()
			.sum()
	}

	pub fn sweep(&self, now: Instant, timeout: Duration) -> usize {
		self.ended.sweep(now, timeout);
		self.packets.sweep(now, timeout)
	}

	/// Evicts partially reassembled packets older than `timeout`, reporting the buffer size after every pass.
	pub async fn run_cleaner(
		&self,
		interval: Duration,
		timeout: Duration,
		report: impl FnMut(usize, usize) + Send,
	) {
		tokio::join!(
			self.packets.clone().run_sweeper(interval, timeout, report),
			self.ended
				.clone()
				.run_sweeper(interval, timeout, |_, _| {}),
		);
	}
}

use async_trait::async_trait;
use color_eyre::Result;

pub mod otlp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricCounter {
	Starts,
	Up,
	AcceptedConnections,
	BufferedRequests,
	PublishedFragments,
	ReassembledPackets,
	DroppedPackets,
	EndedSessions,
	SurrogateRelays,
}

pub trait MetricName {
	fn name(&self) -> &'static str;
}

impl MetricName for MetricCounter {
	fn name(&self) -> &'static str {
		use MetricCounter::*;
		match self {
			Starts => "nap.starts",
			Up => "nap.up",
			AcceptedConnections => "nap.proxy.accepted_connections",
			BufferedRequests => "nap.proxy.buffered_requests",
			PublishedFragments => "nap.ltp.published_fragments",
			ReassembledPackets => "nap.ltp.reassembled_packets",
			DroppedPackets => "nap.ltp.dropped_packets",
			EndedSessions => "nap.ltp.ended_sessions",
			SurrogateRelays => "nap.proxy.surrogate_relays",
		}
	}
}

impl MetricCounter {
	fn is_buffered(&self) -> bool {
		!matches!(self, MetricCounter::Starts)
	}

	fn as_last(&self) -> bool {
		matches!(self, MetricCounter::Up)
	}
}

#[derive(Clone, Debug)]
pub enum MetricValue {
	FragmentBufferSize(usize),
	RequestBufferSize(usize),
	ReverseLookupSize(usize),
	DnsCacheSize(usize),
	CmcGroups(usize),
	CmcGroupSize(usize),
}

impl MetricName for MetricValue {
	fn name(&self) -> &'static str {
		use MetricValue::*;
		match self {
			FragmentBufferSize(_) => "nap.buffer.fragments",
			RequestBufferSize(_) => "nap.buffer.requests",
			ReverseLookupSize(_) => "nap.buffer.reverse_lookup",
			DnsCacheSize(_) => "nap.buffer.dns",
			CmcGroups(_) => "nap.cmc.groups",
			CmcGroupSize(_) => "nap.cmc.group_size",
		}
	}
}

#[async_trait]
pub trait Metrics {
	async fn count(&self, counter: MetricCounter);
	async fn record(&self, value: MetricValue);
	async fn flush(&self) -> Result<()>;
}

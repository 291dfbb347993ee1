use crate::{
	expiring_map::ExpiringMap,
	types::{ContentId, Enigma, HttpMethod, SessionKey},
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// Request waiting for a forwarding path to its content identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRequest {
	pub request_id: ContentId,
	pub response_id: ContentId,
	pub enigma: Enigma,
	pub session_key: SessionKey,
	pub method: HttpMethod,
	pub data: Vec<u8>,
}

type RequestKey = (ContentId, ContentId, SessionKey);

/// Pending requests, in arrival order per socket.
pub struct RequestBuffer {
	requests: Arc<ExpiringMap<RequestKey, Vec<BufferedRequest>>>,
}

impl Default for RequestBuffer {
	fn default() -> Self {
		Self::new()
	}
}

impl RequestBuffer {
	pub fn new() -> Self {
		RequestBuffer {
			requests: Arc::new(ExpiringMap::new("requests")),
		}
	}

	pub fn push(&self, request: BufferedRequest) {
		let key = (request.request_id, request.response_id, request.session_key);
		self.requests
			.upsert(key, Vec::new, |requests| requests.push(request));
	}

	/// Removes and returns every request buffered for the content identifier.
	pub fn take_for(&self, request_id: &ContentId) -> Vec<BufferedRequest> {
		self.requests
			.drain_where(|(id, _, _), _| id == request_id)
			.into_iter()
			.flat_map(|(_, requests)| requests)
			.collect()
	}

	/// Drops the requests of a closed socket, returning how many were dropped.
	pub fn remove_session(&self, session_key: SessionKey) -> usize {
		self.requests
			.drain_where(|(_, _, key), _| *key == session_key)
			.into_iter()
			.map(|(_, requests)| requests.len())
			.sum()
	}

	/// Number of buffered requests.
	pub fn len(&self) -> usize {
		self.requests
			.filter_map(|_, requests| Some(requests.len()))
			.into_iter()
			.sum()
	}

	pub fn is_empty(&self) -> bool {
		self.requests.is_empty()
	}

	pub fn sweep(&self, now: Instant, timeout: Duration) -> usize {
		self.requests.sweep(now, timeout)
	}

	pub async fn run_cleaner(
		&self,
		interval: Duration,
		timeout: Duration,
		report: impl FnMut(usize, usize) + Send,
	) {
		self.requests
			.clone()
			.run_sweeper(interval, timeout, report)
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(fqdn: &str, session_key: u32, data: &[u8]) -> BufferedRequest {
		BufferedRequest {
			request_id: ContentId::for_fqdn(fqdn),
			response_id: ContentId::for_url(fqdn, "/"),
			enigma: Enigma(23),
			session_key: SessionKey(session_key),
			method: HttpMethod::Post,
			data: data.to_vec(),
		}
	}

	#[test]
	fn take_for_drains_once_in_order() {
		let buffer = RequestBuffer::new();
		buffer.push(request("example.com", 1, b"head"));
		buffer.push(request("example.com", 1, b"body"));
		buffer.push(request("other.com", 2, b"other"));
		assert_eq!(buffer.len(), 3);

		let taken = buffer.take_for(&ContentId::for_fqdn("example.com"));
		let data: Vec<&[u8]> = taken.iter().map(|request| request.data.as_slice()).collect();
		assert_eq!(data, vec![b"head".as_slice(), b"body".as_slice()]);
		assert!(buffer.take_for(&ContentId::for_fqdn("example.com")).is_empty());
		assert_eq!(buffer.len(), 1);
	}

	#[test]
	fn closed_sessions_drop_requests() {
		let buffer = RequestBuffer::new();
		buffer.push(request("example.com", 1, b"a"));
		buffer.push(request("other.com", 1, b"b"));
		buffer.push(request("other.com", 2, b"c"));
		assert_eq!(buffer.remove_session(SessionKey(1)), 2);
		assert_eq!(buffer.len(), 1);
	}

	#[test]
	fn expired_requests_are_swept() {
		let buffer = RequestBuffer::new();
		buffer.push(request("example.com", 1, b"a"));
		let timeout = Duration::from_secs(529);
		assert_eq!(buffer.sweep(Instant::now() + timeout * 2, timeout), 1);
		assert!(buffer.is_empty());
	}
}

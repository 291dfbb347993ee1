//! Minimal HTTP/1.x request inspection.
//!
//! Only the method, host and resource are extracted, the request itself is
//! forwarded untouched.

use crate::{
	types::{HttpMethod, SessionKey},
	utils::lock,
};
use std::{collections::HashMap, sync::Mutex};
use tracing::trace;

const METHOD_SCAN_LENGTH: usize = 50;
const HEADER_SCAN_LENGTH: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
	pub method: HttpMethod,
	pub fqdn: String,
	pub resource: String,
}

fn parse_method(token: &str) -> Option<HttpMethod> {
	let method = match token {
		"OPTIONS" => HttpMethod::Options,
		"GET" => HttpMethod::Get,
		"HEAD" => HttpMethod::Head,
		"POST" => HttpMethod::Post,
		"PUT" => HttpMethod::Put,
		"DELETE" => HttpMethod::Delete,
		"TRACE" => HttpMethod::Trace,
		"CONNECT" => HttpMethod::Connect,
		token if !token.is_empty() && token.bytes().all(|byte| byte.is_ascii_uppercase()) => {
			HttpMethod::Extension
		},
		_ => return None,
	};
	Some(method)
}

/// Splits `http://host:port/path` into host and path, leaves origin-form targets untouched.
fn split_target(target: &str) -> (Option<&str>, &str) {
	let Some(rest) = target
		.strip_prefix("http://")
		.or_else(|| target.strip_prefix("https://"))
	else {
		return (None, target);
	};
	match rest.find('/') {
		Some(index) => (Some(&rest[..index]), &rest[index..]),
		None => (Some(rest), "/"),
	}
}

fn strip_port(authority: &str) -> &str {
	authority
		.split_once(':')
		.map_or(authority, |(host, _)| host)
		.trim()
}

fn host_header(head: &str) -> Option<&str> {
	head.split("\r\n")
		.skip(1)
		.take_while(|line| !line.is_empty())
		.find_map(|line| {
			let (name, value) = line.split_once(':')?;
			name.trim()
				.eq_ignore_ascii_case("host")
				.then(|| strip_port(value.trim()))
		})
}

/// Parses the request line and the `Host` header of a request head.
pub fn parse_request(bytes: &[u8]) -> Option<Request> {
	let request_line_end = bytes.len().min(METHOD_SCAN_LENGTH);
	let token_end = bytes[..request_line_end]
		.iter()
		.position(|byte| *byte == b' ')?;
	let method = parse_method(std::str::from_utf8(&bytes[..token_end]).ok()?)?;

	let head = String::from_utf8_lossy(&bytes[..bytes.len().min(HEADER_SCAN_LENGTH)]);
	let request_line = head.split("\r\n").next()?;
	let target = request_line.split(' ').nth(1)?;
	let (authority, resource) = split_target(target);

	let fqdn = host_header(&head)
		.or(authority.map(strip_port))
		.filter(|fqdn| !fqdn.is_empty())?
		.to_lowercase();

	Some(Request {
		method,
		fqdn,
		resource: resource.to_string(),
	})
}

/// Tracks the request context of every client socket.
///
/// Reads which don't start with a request line (e.g. the remainder of a request
/// body) are attributed to the last request seen on the same socket.
#[derive(Default)]
pub struct HeaderParser {
	requests: Mutex<HashMap<SessionKey, Request>>,
}

impl HeaderParser {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn parse(&self, session_key: SessionKey, bytes: &[u8]) -> Option<Request> {
		match parse_request(bytes) {
			Some(request) => {
				lock(&self.requests).insert(session_key, request.clone());
				Some(request)
			},
			None => {
				let previous = lock(&self.requests).get(&session_key).cloned();
				trace!(%session_key, found = previous.is_some(), "Continuation of previous request");
				previous
			},
		}
	}

	pub fn forget(&self, session_key: SessionKey) {
		lock(&self.requests).remove(&session_key);
	}
}

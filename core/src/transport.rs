//! Lightweight transport protocol (LTP).
//!
//! Payloads which don't fit into a single publication are split into data
//! fragments, each prefixed with a header naming the flow (enigma, session key),
//! its sequence number and whether it's the last fragment of the packet.
//! Control messages share the flow addressing but carry no payload.
//!
//! ```text
//! unframed: 0x00 | payload
//! data:     0x01 | enigma u32 | session key u32 | sequence u16 | payload length u16 | state u8 | payload
//! control:  0x02 | control type u8 | enigma u32 | session key u32
//! ```
//!
//! All integers are big endian.

use crate::types::{Enigma, Sequence, SessionKey};
use color_eyre::{eyre::eyre, Result};
use strum::{Display, FromRepr};
use thiserror::Error;

pub mod fragment_buffer;

pub use fragment_buffer::{FragmentBuffer, Handled};

const MESSAGE_UNFRAMED: u8 = 0x00;
const MESSAGE_DATA: u8 = 0x01;
const MESSAGE_CONTROL: u8 = 0x02;

const STATE_FRAGMENT: u8 = 0x00;
const STATE_LAST: u8 = 0x01;

pub const DATA_HEADER_LENGTH: usize = 14;
pub const CONTROL_LENGTH: usize = 10;

/// Outcome of handling one inbound publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransportState {
	FragmentsOutstanding,
	AllFragmentsReceived,
	SessionEnded,
	NoTransportProtocolUsed,
	NoActionRequired,
}

/// LTP control messages. Only [`ControlType::SessionEnd`] drives reassembly state,
/// window management and retransmission are not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ControlType {
	Nack = 0,
	Reset = 1,
	Resetted = 2,
	SessionEnd = 3,
	SessionEnded = 4,
	WindowEnd = 5,
	WindowEnded = 6,
	WindowUpdate = 7,
	WindowUpdated = 8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
	Data {
		sequence: Sequence,
		payload: Vec<u8>,
		last: bool,
	},
	Control(ControlType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
	Unframed(Vec<u8>),
	Framed {
		enigma: Enigma,
		session_key: SessionKey,
		segment: Segment,
	},
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
	#[error("Publication is empty")]
	Empty,
	#[error("Unknown LTP message type {0}")]
	UnknownMessageType(u8),
	#[error("LTP {kind} header truncated to {length} bytes")]
	Truncated { kind: &'static str, length: usize },
	#[error("Declared payload length {declared} does not match {actual} received bytes")]
	PayloadLength { declared: usize, actual: usize },
	#[error("Unknown LTP fragment state {0}")]
	UnknownState(u8),
	#[error("Unknown LTP control type {0}")]
	UnknownControlType(u8),
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
	u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
	u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl Publication {
	pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
		let Some(&message_type) = bytes.first() else {
			return Err(DecodeError::Empty);
		};

		match message_type {
			MESSAGE_UNFRAMED => Ok(Publication::Unframed(bytes[1..].to_vec())),
			MESSAGE_DATA => {
				if bytes.len() < DATA_HEADER_LENGTH {
					return Err(DecodeError::Truncated {
						kind: "data",
						length: bytes.len(),
					});
				}
				let declared = read_u16(bytes, 11) as usize;
				let payload = &bytes[DATA_HEADER_LENGTH..];
				if declared != payload.len() {
					return Err(DecodeError::PayloadLength {
						declared,
						actual: payload.len(),
					});
				}
				let last = match bytes[13] {
					STATE_FRAGMENT => false,
					STATE_LAST => true,
					state => return Err(DecodeError::UnknownState(state)),
				};
				Ok(Publication::Framed {
					enigma: Enigma(read_u32(bytes, 1)),
					session_key: SessionKey(read_u32(bytes, 5)),
					segment: Segment::Data {
						sequence: read_u16(bytes, 9),
						payload: payload.to_vec(),
						last,
					},
				})
			},
			MESSAGE_CONTROL => {
				if bytes.len() < CONTROL_LENGTH {
					return Err(DecodeError::Truncated {
						kind: "control",
						length: bytes.len(),
					});
				}
				let control = ControlType::from_repr(bytes[1])
					.ok_or(DecodeError::UnknownControlType(bytes[1]))?;
				Ok(Publication::Framed {
					enigma: Enigma(read_u32(bytes, 2)),
					session_key: SessionKey(read_u32(bytes, 6)),
					segment: Segment::Control(control),
				})
			},
			other => Err(DecodeError::UnknownMessageType(other)),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		match self {
			Publication::Unframed(payload) => {
				let mut bytes = Vec::with_capacity(payload.len() + 1);
				bytes.push(MESSAGE_UNFRAMED);
				bytes.extend_from_slice(payload);
				bytes
			},
			Publication::Framed {
				enigma,
				session_key,
				segment: Segment::Data {
					sequence,
					payload,
					last,
				},
			} => {
				let mut bytes = Vec::with_capacity(DATA_HEADER_LENGTH + payload.len());
				bytes.push(MESSAGE_DATA);
				bytes.extend_from_slice(&enigma.0.to_be_bytes());
				bytes.extend_from_slice(&session_key.0.to_be_bytes());
				bytes.extend_from_slice(&sequence.to_be_bytes());
				bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
				bytes.push(if *last { STATE_LAST } else { STATE_FRAGMENT });
				bytes.extend_from_slice(payload);
				bytes
			},
			Publication::Framed {
				enigma,
				session_key,
				segment: Segment::Control(control),
			} => {
				let mut bytes = Vec::with_capacity(CONTROL_LENGTH);
				bytes.push(MESSAGE_CONTROL);
				bytes.push(*control as u8);
				bytes.extend_from_slice(&enigma.0.to_be_bytes());
				bytes.extend_from_slice(&session_key.0.to_be_bytes());
				bytes
			},
		}
	}
}

/// Splits `payload` into encoded data fragments of at most `mitu` bytes each (header included).
pub fn fragments(
	enigma: Enigma,
	session_key: SessionKey,
	payload: &[u8],
	mitu: usize,
) -> Result<Vec<Vec<u8>>> {
	let chunk_size = mitu
		.checked_sub(DATA_HEADER_LENGTH)
		.filter(|size| *size > 0)
		.ok_or_else(|| eyre!("MITU of {mitu} bytes leaves no room for LTP payload"))?
		.min(u16::MAX as usize);

	if payload.is_empty() {
		return Ok(vec![data(enigma, session_key, 0, Vec::new(), true)]);
	}

	let count = payload.len().div_ceil(chunk_size);
	if count > Sequence::MAX as usize + 1 {
		return Err(eyre!(
			"Payload of {} bytes needs {count} fragments, more than a sequence can address",
			payload.len()
		));
	}

	Ok(payload
		.chunks(chunk_size)
		.enumerate()
		.map(|(index, chunk)| {
			data(
				enigma,
				session_key,
				index as Sequence,
				chunk.to_vec(),
				index + 1 == count,
			)
		})
		.collect())
}

fn data(
	enigma: Enigma,
	session_key: SessionKey,
	sequence: Sequence,
	payload: Vec<u8>,
	last: bool,
) -> Vec<u8> {
	Publication::Framed {
		enigma,
		session_key,
		segment: Segment::Data {
			sequence,
			payload,
			last,
		},
	}
	.encode()
}

/// Encoded control message ending the session of a flow.
pub fn session_end(enigma: Enigma, session_key: SessionKey) -> Vec<u8> {
	Publication::Framed {
		enigma,
		session_key,
		segment: Segment::Control(ControlType::SessionEnd),
	}
	.encode()
}

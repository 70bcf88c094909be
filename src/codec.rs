//! Wire framing: fixed 4-byte header + payload, and the tagged message
//! variants carried over it.
//!
//! One on-wire message is `{ type:u8, special:u8, size:u16 BE }` followed by
//! `size` bytes of payload. All multi-byte fields are network byte order.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MeshErrorKind, MeshResult};
use crate::hwaddr::{HwAddr, HWADDR_LEN};

pub const HEADER_LEN: usize = 4;

/// Largest amount of framing overhead beyond the frame payload itself
/// (the 4-byte broadcast id). Used to bound `size` against the configured
/// MTU: `size > mtu + FIXED_OVERHEAD` is a protocol violation.
pub const FIXED_OVERHEAD: usize = 4;

const TYPE_DATA: u8 = 1;
const TYPE_BROADCAST: u8 = 2;
const TYPE_ROUTE_SET: u8 = 3;
const TYPE_ROUTE_DIFF: u8 = 4;
const TYPE_PING: u8 = 5;
const TYPE_PONG: u8 = 6;
const TYPE_ROUTE_REQUEST: u8 = 7;

/// A route-table record as carried in a route-set or route-diff payload.
/// `dist == WITHDRAW_DIST` means "withdraw this address".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteRecord {
    pub addr: HwAddr,
    pub ping: u32,
    pub dist: u16,
}

pub const WITHDRAW_DIST: u16 = 0xFFFF;
const ROUTE_RECORD_LEN: usize = HWADDR_LEN + 4 + 2;

impl RouteRecord {
    pub fn is_withdraw(&self) -> bool {
        self.dist == WITHDRAW_DIST
    }
}

/// A fully decoded on-wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Data(Bytes),
    Broadcast { id: u32, frame: Bytes },
    RouteSet(Vec<RouteRecord>),
    RouteDiff(Vec<RouteRecord>),
    Ping(u8),
    Pong(u8),
    RouteRequest,
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Message::Data(_) => TYPE_DATA,
            Message::Broadcast { .. } => TYPE_BROADCAST,
            Message::RouteSet(_) => TYPE_ROUTE_SET,
            Message::RouteDiff(_) => TYPE_ROUTE_DIFF,
            Message::Ping(_) => TYPE_PING,
            Message::Pong(_) => TYPE_PONG,
            Message::RouteRequest => TYPE_ROUTE_REQUEST,
        }
    }

    fn special_byte(&self) -> u8 {
        match self {
            Message::Ping(id) | Message::Pong(id) => *id,
            _ => 0,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Data(frame) => frame.len(),
            Message::Broadcast { frame, .. } => 4 + frame.len(),
            Message::RouteSet(records) | Message::RouteDiff(records) => records.len() * ROUTE_RECORD_LEN,
            Message::Ping(_) | Message::Pong(_) | Message::RouteRequest => 0,
        }
    }

    /// Encode this message as one contiguous header+payload buffer, so the
    /// channel sees a single gather-free write (see `squeue`).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload_len());

        buf.put_u8(self.type_byte());
        buf.put_u8(self.special_byte());
        buf.put_u16(self.payload_len() as u16);

        match self {
            Message::Data(frame) => buf.put_slice(frame),
            Message::Broadcast { id, frame } => {
                buf.put_u32(*id);
                buf.put_slice(frame);
            }
            Message::RouteSet(records) | Message::RouteDiff(records) => {
                for record in records {
                    buf.put_slice(record.addr.as_ref());
                    buf.put_u32(record.ping);
                    buf.put_u16(record.dist);
                }
            }
            Message::Ping(_) | Message::Pong(_) | Message::RouteRequest => {}
        }

        buf.freeze()
    }
}

struct Header {
    type_: u8,
    special: u8,
    size: u16,
}

fn parse_header(bytes: &[u8]) -> Header {
    debug_assert!(bytes.len() >= HEADER_LEN);

    Header {
        type_: bytes[0],
        special: bytes[1],
        size: BigEndian::read_u16(&bytes[2..4]),
    }
}

fn parse_route_records(payload: &[u8]) -> MeshResult<Vec<RouteRecord>> {
    if payload.len() % ROUTE_RECORD_LEN != 0 {
        return Err(MeshErrorKind::ProtocolViolation("route payload is not a multiple of the record size".into()).into());
    }

    let mut records = Vec::with_capacity(payload.len() / ROUTE_RECORD_LEN);
    for chunk in payload.chunks_exact(ROUTE_RECORD_LEN) {
        let addr = HwAddr::from_slice(&chunk[0..HWADDR_LEN]).expect("chunk is exactly HWADDR_LEN wide");
        let ping = BigEndian::read_u32(&chunk[HWADDR_LEN..HWADDR_LEN + 4]);
        let dist = BigEndian::read_u16(&chunk[HWADDR_LEN + 4..HWADDR_LEN + 6]);
        records.push(RouteRecord { addr, ping, dist });
    }
    Ok(records)
}

/// Stateful parser over a connection's inbound byte queue.
///
/// Reads a header once at least `HEADER_LEN` bytes are buffered, then waits
/// for `size` more bytes before dispatching and resetting. Holds onto the
/// half-parsed header between calls so partial reads resume correctly.
#[derive(Default)]
pub struct FrameParser {
    pending_header: Option<Header>,
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser { pending_header: None }
    }

    /// Try to parse one message out of `buf`, consuming the bytes it used.
    /// Returns `Ok(None)` if more bytes are needed. `mtu` bounds payload size:
    /// `size > mtu + FIXED_OVERHEAD` is a protocol violation.
    pub fn decode(&mut self, buf: &mut BytesMut, mtu: usize) -> MeshResult<Option<Message>> {
        if self.pending_header.is_none() {
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let header = parse_header(&buf[..HEADER_LEN]);
            if header.size as usize > mtu + FIXED_OVERHEAD {
                return Err(MeshErrorKind::ProtocolViolation(format!(
                    "oversize payload: {} bytes exceeds mtu {} + overhead {}",
                    header.size, mtu, FIXED_OVERHEAD
                ))
                .into());
            }
            buf.advance(HEADER_LEN);
            self.pending_header = Some(header);
        }

        let header = self.pending_header.as_ref().expect("checked above");
        let size = header.size as usize;
        if buf.len() < size {
            return Ok(None);
        }

        let payload = buf.split_to(size).freeze();
        let header = self.pending_header.take().expect("checked above");
        Ok(Some(dispatch(header, payload)?))
    }
}

fn dispatch(header: Header, payload: Bytes) -> MeshResult<Message> {
    match header.type_ {
        TYPE_DATA => Ok(Message::Data(payload)),
        TYPE_BROADCAST => {
            if payload.len() < 4 {
                return Err(MeshErrorKind::ProtocolViolation("broadcast payload shorter than its id".into()).into());
            }
            let id = BigEndian::read_u32(&payload[0..4]);
            Ok(Message::Broadcast { id, frame: payload.slice(4..) })
        }
        TYPE_ROUTE_SET => Ok(Message::RouteSet(parse_route_records(&payload)?)),
        TYPE_ROUTE_DIFF => Ok(Message::RouteDiff(parse_route_records(&payload)?)),
        TYPE_PING => Ok(Message::Ping(header.special)),
        TYPE_PONG => Ok(Message::Pong(header.special)),
        TYPE_ROUTE_REQUEST => Ok(Message::RouteRequest),
        other => Err(MeshErrorKind::ProtocolViolation(format!("unknown message type {}", other)).into()),
    }
}

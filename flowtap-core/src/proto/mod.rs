//! Protocol dissectors. Each module decodes one header format and acts as
//! a demultiplexer for whatever sits above it.

pub mod ip;
pub mod tcp;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::key::{IpKey, TcpKey};

/// Hot-path parse outcome. This is not an [`crate::error::EngineError`]: a
/// truncated capture or a malformed segment is an expected, frequent
/// condition on the packet path, not an exceptional one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Ok,
    ParseErr,
    TooShort,
}

/// Which side of a canonicalized flow key the packet's original source
/// endpoint landed on.
pub type Way = bool;

/// Protocol tag threaded through the demux chain. `Other` covers protocols
/// known only by number (via the connection tracker or port muxer) with no
/// parser shipped in this crate; they terminate at info-only delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtoKind {
    Ip,
    Tcp,
    Other(u16),
}

/// IP-specific fields of a [`ProtoInfo`], populated by [`ip::parse`].
#[derive(Debug, Clone, Copy)]
pub struct IpInfo {
    pub version: u8,
    pub ttl: u8,
    pub key: IpKey,
}

/// TCP-specific fields of a [`ProtoInfo`], populated by [`tcp::parse`].
#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub key: TcpKey,
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
    pub urg: bool,
    pub psh: bool,
    pub window: u16,
    pub urg_ptr: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Option kinds seen on the wire, in order, capped at `MAX_OPTIONS`.
    pub options: Vec<u8>,
    pub mss: Option<u16>,
    pub wsf: Option<u8>,
}

/// Protocol-specific half of a [`ProtoInfo`]. Kept as an enum rather than a
/// downcast target: a sub-parser owns a `SubParserState` variant and reads
/// the matching `Specific` variant out of the info it is handed, never the
/// other way around.
#[derive(Debug, Clone)]
pub enum Specific {
    Ip(IpInfo),
    Tcp(TcpInfo),
}

/// Per-packet decoded record handed down to a sub-parser's `parse` call.
/// Transient: its lifetime is bounded by the current parse call.
#[derive(Debug, Clone, Default)]
pub struct ProtoInfo {
    pub header_len: usize,
    pub payload_len: usize,
    /// The payload's declared length at this level, independent of
    /// whatever this capture actually got around to storing — derived
    /// from the enclosing header's own length field (IP's `total_length`;
    /// for TCP, the enclosing IP payload's wire length minus the TCP
    /// header), never from `payload_len`/`packet.len()`. Lets a child
    /// distinguish a malformed segment (`wire_len` itself doesn't add up)
    /// from one merely truncated by a short capture (`payload_len <
    /// wire_len` but otherwise consistent), per §4.4/§4.3's `ParseErr` vs.
    /// `TooShort` split.
    pub wire_len: usize,
    pub way: Way,
    /// `Some(true)` once the owning TCP sub-parser has inferred a
    /// client/server direction for this packet; `None` above TCP or before
    /// inference completes.
    pub to_srv: Option<bool>,
    pub specific: Option<Specific>,
}

impl ProtoInfo {
    pub fn as_ip(&self) -> Option<&IpInfo> {
        match &self.specific {
            Some(Specific::Ip(info)) => Some(info),
            _ => None,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpInfo> {
        match &self.specific {
            Some(Specific::Tcp(info)) => Some(info),
            _ => None,
        }
    }
}

/// The downstream parser contract: a payload's consumer either decodes it
/// (`payload` present) or the caller only wants the bookkeeping (`okfn`-style
/// notification), which is modeled here as `payload = None` ("info-only
/// delivery" in the spec's terms — there is still always a concrete
/// [`ChildParser`] to notify, unlike the original's `parser == NULL`).
pub trait ChildParser: Send + Sync {
    fn parse(&self, payload: Option<&Bytes>, info: &ProtoInfo, now: Instant) -> ParseStatus;

    /// Evicts this parser's own idle sub-parsers, if it caches any (e.g. the
    /// TCP dispatcher's per-port-pair mux). Leaf protocols that mux nothing
    /// of their own have nothing to sweep.
    fn sweep_idle(&self, _now: Instant) {}
}

pub type ChildParserRef = Arc<dyn ChildParser>;

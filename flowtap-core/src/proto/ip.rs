//! IPv4 header decoding and fragment reassembly.
//!
//! This module owns the per-flow reassembly state (the four-slot array
//! described in the spec); [`crate::engine::Engine`] owns the mux that
//! caches one [`IpSubParserState`] per canonical address pair and drives
//! this module's functions from its `process_ip_frame` entry point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use bytes::Bytes;

use crate::key::IpKey;
use crate::proto::{ChildParserRef, IpInfo, ParseStatus, ProtoInfo, Specific};
use crate::waitlist::WaitList;
use crate::config::WaitListConfig;

/// Number of concurrent reassembly slots carried by each IP sub-parser.
pub const NB_REASSEMBLY_SLOTS: usize = 4;

#[derive(Debug)]
pub struct IpHeader {
    pub version: u8,
    pub ihl_words: u8,
    pub total_length: u16,
    pub id: u16,
    pub more_fragments: bool,
    /// Fragment offset in bytes (already multiplied by 8 off the wire).
    pub frag_offset: u32,
    pub ttl: u8,
    pub protocol: u8,
    pub src: std::net::Ipv4Addr,
    pub dst: std::net::Ipv4Addr,
}

impl IpHeader {
    pub fn header_len(&self) -> usize {
        self.ihl_words as usize * 4
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.frag_offset != 0
    }
}

/// Decodes and validates a fixed IPv4 header per RFC 791.
///
/// `ParseErr` covers structurally bogus headers (wrong version, lengths
/// that don't fit); `TooShort` means the header itself wasn't fully
/// captured, which a caller may be able to retry with a bigger capture.
pub fn parse_header(packet: &[u8], cap_len: usize, wire_len: usize) -> Result<IpHeader, ParseStatus> {
    if cap_len < 1 {
        return Err(ParseStatus::TooShort);
    }
    let version = packet[0] >> 4;
    let ihl_words = packet[0] & 0x0f;
    if version != 4 {
        return Err(ParseStatus::ParseErr);
    }

    let min_hdr = 20usize;
    if cap_len < min_hdr {
        return Err(ParseStatus::TooShort);
    }

    let total_length = u16::from_be_bytes([packet[2], packet[3]]);
    if total_length as usize > wire_len {
        return Err(ParseStatus::ParseErr);
    }

    let ihl_len = ihl_words as usize * 4;
    if ihl_len > total_length as usize {
        return Err(ParseStatus::ParseErr);
    }
    if cap_len < ihl_len {
        return Err(ParseStatus::TooShort);
    }

    let id = u16::from_be_bytes([packet[4], packet[5]]);
    let flags_frag = u16::from_be_bytes([packet[6], packet[7]]);
    let more_fragments = flags_frag & 0x2000 != 0;
    let frag_offset = (flags_frag as u32 & 0x1fff) * 8;
    let ttl = packet[8];
    let protocol = packet[9];
    let src = std::net::Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = std::net::Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

    Ok(IpHeader {
        version,
        ihl_words,
        total_length,
        id,
        more_fragments,
        frag_offset,
        ttl,
        protocol,
        src,
        dst,
    })
}

/// Builds the [`ProtoInfo`] carried alongside a decoded IPv4 header.
///
/// `wire_len` is the datagram's declared payload length (`total_length`
/// minus the header), independent of how much of it this capture actually
/// stored — `payload_len` carries that instead.
pub fn build_info(header: &IpHeader, key: IpKey, way: bool, payload_len: usize, wire_len: usize) -> ProtoInfo {
    ProtoInfo {
        header_len: header.header_len(),
        payload_len,
        wire_len,
        way,
        to_srv: None,
        specific: Some(Specific::Ip(IpInfo { version: header.version, ttl: header.ttl, key })),
    }
}

/// One pending reassembly: `constructed` implies `in_use`; the wait-list
/// only exists while `constructed`. `got_last` implies `end_offset` holds
/// the datagram's total length.
pub struct ReassemblySlot {
    in_use: bool,
    got_last: bool,
    id: u16,
    end_offset: Option<u32>,
    wait_list: Option<WaitList>,
}

impl ReassemblySlot {
    fn free() -> Self {
        Self { in_use: false, got_last: false, id: 0, end_offset: None, wait_list: None }
    }
}

/// The reassembly array plus the cached child parser, guarded together by
/// the IP sub-parser's mutex (the mux cache guarantees a given sub-parser
/// is never parsed concurrently with itself, so a single lock suffices).
pub struct IpSubParserState {
    pub child: Option<ChildParserRef>,
    key: IpKey,
    reassembly: [ReassemblySlot; NB_REASSEMBLY_SLOTS],
}

impl Default for IpSubParserState {
    fn default() -> Self {
        Self { child: None, key: IpKey::default(), reassembly: std::array::from_fn(|_| ReassemblySlot::free()) }
    }
}

impl IpSubParserState {
    pub fn new(key: IpKey, child: Option<ChildParserRef>) -> Self {
        Self { key, child, ..Self::default() }
    }

    /// Finds the slot already tracking `id`, or allocates one: first an
    /// unused slot, otherwise the next slot in round-robin order (its
    /// pending data is discarded). Returns the slot index and whether a
    /// fresh wait-list was constructed for it (a brand new id never
    /// reuses a half-filled wait-list).
    fn lookup_slot(&mut self, id: u16, _now: Instant, rotating: &AtomicUsize, wl_config: &WaitListConfig) -> usize {
        if let Some(idx) = self.reassembly.iter().position(|s| s.in_use && s.id == id) {
            return idx;
        }

        let idx = match self.reassembly.iter().position(|s| !s.in_use) {
            Some(idx) => idx,
            None => rotating.fetch_add(1, Ordering::SeqCst) % NB_REASSEMBLY_SLOTS,
        };

        self.reassembly[idx] = ReassemblySlot {
            in_use: true,
            got_last: false,
            id,
            end_offset: None,
            wait_list: Some(WaitList::new(wl_config.clone(), 0)),
        };
        idx
    }

    /// Buffers one fragment, returning `Some(payload)` once the slot's
    /// datagram is fully covered (the slot is freed in that case).
    pub fn add_fragment(
        &mut self,
        id: u16,
        offset: u32,
        last: bool,
        payload: Bytes,
        now: Instant,
        rotating: &AtomicUsize,
        wl_config: &WaitListConfig,
    ) -> Option<Bytes> {
        let frag_len = payload.len() as u32;
        let idx = self.lookup_slot(id, now, rotating, wl_config);
        let slot = &mut self.reassembly[idx];
        let wl = slot.wait_list.get_or_insert_with(|| WaitList::new(wl_config.clone(), 0));
        wl.add(offset, payload, now);
        if last {
            slot.got_last = true;
            slot.end_offset = Some(offset + frag_len);
        }

        let complete = match slot.end_offset {
            Some(end) if slot.got_last => wl.is_complete(0, end),
            _ => false,
        };
        if !complete {
            return None;
        }

        let end = slot.end_offset.expect("complete slot always has an end_offset");
        let assembled = wl.reassemble(0, end);
        self.reassembly[idx] = ReassemblySlot::free();
        assembled
    }

    /// Force-drains any slot whose oldest fragment has aged past the
    /// wait-list's configured timeout: the datagram will never complete, so
    /// it is reported info-only (no assembled payload is possible) and the
    /// slot is freed for reuse. Driven by the engine's periodic idle sweep,
    /// not by packet arrival — an IP sub-parser may sit with one pending
    /// fragment for an arbitrarily long time between packets on other flows.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<ProtoInfo> {
        let mut stale = Vec::new();
        for slot in &mut self.reassembly {
            if slot.in_use {
                let stalled = slot.wait_list.as_ref().is_some_and(|wl| wl.is_stalled(now));
                if stalled {
                    stale.push(ProtoInfo {
                        header_len: 0,
                        payload_len: 0,
                        wire_len: 0,
                        way: false,
                        to_srv: None,
                        specific: Some(Specific::Ip(IpInfo { version: 4, ttl: 0, key: self.key })),
                    });
                    *slot = ReassemblySlot::free();
                }
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitListConfig;

    fn hdr(total_length: u16, ihl: u8, version: u8) -> [u8; 20] {
        let mut p = [0u8; 20];
        p[0] = (version << 4) | ihl;
        p[2..4].copy_from_slice(&total_length.to_be_bytes());
        p[9] = 6;
        p
    }

    #[test]
    fn rejects_non_ipv4_version() {
        let p = hdr(20, 5, 6);
        assert_eq!(parse_header(&p, 20, 20).unwrap_err(), ParseStatus::ParseErr);
    }

    #[test]
    fn rejects_total_length_exceeding_wire_len() {
        let p = hdr(1000, 5, 4);
        assert_eq!(parse_header(&p, 20, 20).unwrap_err(), ParseStatus::ParseErr);
    }

    #[test]
    fn too_short_when_header_not_fully_captured() {
        let p = hdr(20, 5, 4);
        assert_eq!(parse_header(&p[..10], 10, 20).unwrap_err(), ParseStatus::TooShort);
    }

    #[test]
    fn single_fragment_datagram_reassembles_in_one_shot() {
        let mut state = IpSubParserState::default();
        let rotating = AtomicUsize::new(0);
        let cfg = WaitListConfig::ip_default();
        let now = Instant::now();
        let payload = state.add_fragment(0x1234, 0, true, Bytes::from_static(b"hello"), now, &rotating, &cfg);
        assert_eq!(payload.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn two_fragments_reassemble_to_one_payload() {
        let mut state = IpSubParserState::default();
        let rotating = AtomicUsize::new(0);
        let cfg = WaitListConfig::ip_default();
        let now = Instant::now();
        let first = vec![b'A'; 1480];
        let second = vec![b'B'; 20];
        assert!(state
            .add_fragment(0x1234, 0, false, Bytes::from(first), now, &rotating, &cfg)
            .is_none());
        let payload = state
            .add_fragment(0x1234, 1480, true, Bytes::from(second), now, &rotating, &cfg)
            .unwrap();
        assert_eq!(payload.len(), 1500);
        assert_eq!(payload[0], b'A');
        assert_eq!(payload[1499], b'B');
    }

    #[test]
    fn round_robin_eviction_discards_oldest_slot_when_full() {
        let mut state = IpSubParserState::default();
        let rotating = AtomicUsize::new(0);
        let cfg = WaitListConfig::ip_default();
        let now = Instant::now();
        for id in 0..NB_REASSEMBLY_SLOTS as u16 {
            assert!(state
                .add_fragment(id, 0, false, Bytes::from_static(b"x"), now, &rotating, &cfg)
                .is_none());
        }
        // A fifth, distinct id forces an eviction rather than growing the array.
        assert!(state
            .add_fragment(999, 0, false, Bytes::from_static(b"y"), now, &rotating, &cfg)
            .is_none());
        assert_eq!(state.reassembly.iter().filter(|s| s.in_use).count(), NB_REASSEMBLY_SLOTS);
    }
}

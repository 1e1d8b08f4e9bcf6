//! TCP header decoding, per-direction reordering, connection tracking and
//! termination detection.
//!
//! [`crate::engine::Engine`] caches one [`TcpSubParserState`] per
//! canonicalized port pair (keyed the way [`crate::key::TcpKey`]
//! canonicalizes) and drives this module's functions from its TCP dispatch
//! path.

use std::time::Instant;

use bytes::Bytes;

use crate::config::WaitListConfig;
use crate::key::TcpKey;
use crate::proto::{ChildParserRef, ParseStatus, ProtoInfo, Specific, TcpInfo, Way};
use crate::waitlist::{seq_lt, AddOutcome, WaitList};

/// Recognized TCP option kinds beyond this many are still walked (so the
/// header parses correctly) but dropped rather than recorded.
pub const MAX_OPTIONS: usize = 8;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;
const FLAG_URG: u8 = 0x20;

/// Well-known destination ports consulted when a flow's direction can't be
/// read off the SYN/ACK flag pattern alone (see [`comes_from_client`]).
const WELL_KNOWN_SERVER_PORTS: &[u16] = &[80, 443, 21, 22, 25, 53, 110, 143, 993, 995];

#[derive(Debug)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub data_offset_words: u8,
    pub flags: u8,
    pub window: u16,
    pub urg_ptr: u16,
    pub options: Vec<u8>,
    pub mss: Option<u16>,
    pub wsf: Option<u8>,
}

impl TcpHeader {
    pub fn header_len(&self) -> usize {
        self.data_offset_words as usize * 4
    }
    pub fn syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }
    pub fn ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }
    pub fn rst(&self) -> bool {
        self.flags & FLAG_RST != 0
    }
    pub fn fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }
    pub fn urg(&self) -> bool {
        self.flags & FLAG_URG != 0
    }
    pub fn psh(&self) -> bool {
        self.flags & FLAG_PSH != 0
    }
}

/// Decodes and validates a TCP header, including its TLV option list.
pub fn parse_header(packet: &[u8], cap_len: usize, wire_len: usize) -> Result<TcpHeader, ParseStatus> {
    const FIXED_LEN: usize = 20;
    if wire_len < FIXED_LEN {
        return Err(ParseStatus::ParseErr);
    }
    if cap_len < FIXED_LEN {
        return Err(ParseStatus::TooShort);
    }

    let sport = u16::from_be_bytes([packet[0], packet[1]]);
    let dport = u16::from_be_bytes([packet[2], packet[3]]);
    let seq_num = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
    let ack_num = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
    let data_offset_words = packet[12] >> 4;
    let flags = packet[13];
    let window = u16::from_be_bytes([packet[14], packet[15]]);
    let urg_ptr = u16::from_be_bytes([packet[16], packet[17]]);

    let header_len = data_offset_words as usize * 4;
    if header_len < FIXED_LEN || header_len > wire_len {
        return Err(ParseStatus::ParseErr);
    }
    if cap_len < header_len {
        return Err(ParseStatus::TooShort);
    }

    let (options, mss, wsf) = parse_options(&packet[FIXED_LEN..header_len])?;

    Ok(TcpHeader {
        sport,
        dport,
        seq_num,
        ack_num,
        data_offset_words,
        flags,
        window,
        urg_ptr,
        options,
        mss,
        wsf,
    })
}

fn parse_options(mut opts: &[u8]) -> Result<(Vec<u8>, Option<u16>, Option<u8>), ParseStatus> {
    let mut kinds = Vec::new();
    let mut mss = None;
    let mut wsf = None;

    while !opts.is_empty() {
        let kind = opts[0];
        if kinds.len() < MAX_OPTIONS {
            kinds.push(kind);
        }
        match kind {
            0 => break, // END: stop: whatever padding remains is not re-examined.
            1 => {
                opts = &opts[1..];
            }
            2 => {
                if opts.len() < 2 || opts[1] != 4 || opts.len() < 4 {
                    return Err(ParseStatus::ParseErr);
                }
                mss = Some(u16::from_be_bytes([opts[2], opts[3]]));
                opts = &opts[4..];
            }
            3 => {
                if opts.len() < 2 || opts[1] != 3 || opts.len() < 3 {
                    return Err(ParseStatus::ParseErr);
                }
                wsf = Some(opts[2]);
                opts = &opts[3..];
            }
            _ => {
                if opts.len() < 2 {
                    return Err(ParseStatus::ParseErr);
                }
                let len = opts[1] as usize;
                if len < 2 || len > opts.len() {
                    return Err(ParseStatus::ParseErr);
                }
                opts = &opts[len..];
            }
        }
    }

    Ok((kinds, mss, wsf))
}

/// Builds the [`ProtoInfo`] for a decoded segment; `to_srv` is filled in
/// later, once the owning sub-parser has resolved direction.
///
/// `wire_len` is the segment's declared payload length (the enclosing IP
/// datagram's own `wire_len` minus this TCP header), independent of how
/// much of it this capture actually stored.
pub fn build_info(header: &TcpHeader, key: TcpKey, way: Way, payload_len: usize, wire_len: usize) -> ProtoInfo {
    ProtoInfo {
        header_len: header.header_len(),
        payload_len,
        wire_len,
        way,
        to_srv: None,
        specific: Some(Specific::Tcp(TcpInfo {
            key,
            syn: header.syn(),
            ack: header.ack(),
            rst: header.rst(),
            fin: header.fin(),
            urg: header.urg(),
            psh: header.psh(),
            window: header.window,
            urg_ptr: header.urg_ptr,
            seq_num: header.seq_num,
            ack_num: header.ack_num,
            options: header.options.clone(),
            mss: header.mss,
            wsf: header.wsf,
        })),
    }
}

/// `srv_set`'s three states. Once `Certain`, `srv_way` is frozen for the
/// life of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSet {
    Unset,
    Unsure,
    Certain,
}

/// Heuristic used to decide which side of a freshly-seen segment is the
/// client: a bare SYN identifies its sender as the client outright; a
/// SYN+ACK identifies its sender as the server; absent either, fall back
/// to well-known destination ports.
fn comes_from_client(sport: u16, dport: u16, syn: bool, ack: bool) -> bool {
    if syn && !ack {
        return true;
    }
    if syn && ack {
        return false;
    }
    let dport_well_known = WELL_KNOWN_SERVER_PORTS.contains(&dport);
    let sport_well_known = WELL_KNOWN_SERVER_PORTS.contains(&sport);
    if dport_well_known && !sport_well_known {
        return true;
    }
    if sport_well_known && !dport_well_known {
        return false;
    }
    sport > dport
}

/// All mutable per-flow state, held under one mutex by the owning
/// [`crate::mux::Mux`] entry (mirrors the spec's "mutex covering all
/// mutable state plus the child parser pointer").
pub struct TcpSubParserState {
    pub key: TcpKey,
    wl: [WaitList; 2],
    fin_seqnum: [u32; 2],
    max_acknum: [u32; 2],
    fin: [bool; 2],
    ack: [bool; 2],
    syn: [bool; 2],
    wl_set: [bool; 2],
    srv_set: ServerSet,
    srv_way: Way,
    pub child: Option<ChildParserRef>,
    pub requestor: Option<String>,
}

/// Outcome of feeding one segment through [`TcpSubParserState::accept_segment`].
pub struct SegmentOutcome {
    /// Contiguous, in-order deliveries unblocked on this segment's own
    /// direction by this call.
    pub delivered_this_way: Vec<(Way, Bytes, ProtoInfo)>,
    /// Deliveries unblocked on the *other* direction, e.g. by an ACK that
    /// let a stalled wait-list resume draining.
    pub delivered_other_way: Vec<(Way, Bytes, ProtoInfo)>,
    /// This segment itself, if it was a pure retransmit of already
    /// delivered bytes (info-only, no reordering performed).
    pub retransmit_info: Option<ProtoInfo>,
    pub terminated: bool,
}

impl TcpSubParserState {
    pub fn new(key: TcpKey, child: Option<ChildParserRef>, requestor: Option<String>, wl_config: WaitListConfig) -> Self {
        Self {
            key,
            wl: [WaitList::new(wl_config.clone(), 0), WaitList::new(wl_config, 0)],
            fin_seqnum: [0; 2],
            max_acknum: [0; 2],
            fin: [false; 2],
            ack: [false; 2],
            syn: [false; 2],
            wl_set: [false; 2],
            srv_set: ServerSet::Unset,
            srv_way: false,
            child,
            requestor,
        }
    }

    pub fn srv_set(&self) -> ServerSet {
        self.srv_set
    }

    pub fn srv_way(&self) -> Way {
        self.srv_way
    }

    fn idx(way: Way) -> usize {
        way as usize
    }

    /// Runs the full per-segment bookkeeping and reordering described in
    /// §4.4: direction inference, ack/fin/syn tracking, wait-list insertion
    /// (or retransmit classification), the cross-direction drain, and the
    /// termination check. `info` is mutated in place with the resolved
    /// `to_srv` bit before being handed back for each delivered payload.
    pub fn accept_segment(&mut self, mut info: ProtoInfo, way: Way, payload: Bytes, now: Instant) -> SegmentOutcome {
        let tcp = match info.specific.clone() {
            Some(Specific::Tcp(t)) => t,
            _ => panic!("tcp::accept_segment requires TCP-specific info"),
        };

        if !self.wl_set[Self::idx(way)] {
            self.wl[Self::idx(way)].set_next_offset(tcp.seq_num);
            self.wl_set[Self::idx(way)] = true;
        }
        if !self.wl_set[Self::idx(!way)] && tcp.ack {
            self.wl[Self::idx(!way)].set_next_offset(tcp.ack_num);
            self.wl_set[Self::idx(!way)] = true;
        }

        if tcp.ack {
            if !self.ack[Self::idx(way)] || seq_lt(self.max_acknum[Self::idx(way)], tcp.ack_num) {
                self.max_acknum[Self::idx(way)] = tcp.ack_num;
            }
            self.ack[Self::idx(way)] = true;
        }
        if tcp.fin {
            self.fin[Self::idx(way)] = true;
            self.fin_seqnum[Self::idx(way)] = tcp.seq_num.wrapping_add(info.payload_len as u32);
        }
        if tcp.syn {
            self.syn[Self::idx(way)] = true;
        }

        if self.srv_set == ServerSet::Unset || (self.srv_set == ServerSet::Unsure && tcp.syn) {
            // Recover this packet's actual (sport, dport) from the
            // canonicalized key plus its `way` bit: `way` only tells us
            // which side of the ordered pair is which, not who's talking.
            let (sport, dport) = if way { (tcp.key.port[1], tcp.key.port[0]) } else { (tcp.key.port[0], tcp.key.port[1]) };
            let from_client = comes_from_client(sport, dport, tcp.syn, tcp.ack);
            self.srv_way = if from_client { !way } else { way };
            self.srv_set = if tcp.syn { ServerSet::Certain } else { ServerSet::Unsure };
        }
        info.to_srv = Some(self.srv_way != way);

        // SYN and FIN each consume one sequence number beyond the payload
        // bytes themselves; the wait-list's frontier must advance past
        // them too, even though they carry no content byte.
        let span = (info.payload_len as u32).wrapping_add(tcp.syn as u32).wrapping_add(tcp.fin as u32);

        let mut delivered_this_way = Vec::new();
        let mut delivered_other_way = Vec::new();
        let mut retransmit_info = None;

        if seq_lt(tcp.seq_num, self.wl[Self::idx(way)].next_offset()) {
            retransmit_info = Some(info.clone());
        } else {
            match self.wl[Self::idx(way)].add_spanning(tcp.seq_num, span, payload, now) {
                AddOutcome::Buffered | AddOutcome::Retransmit => {
                    let info_template = info.clone();
                    // This segment's own ACK confirms the partner direction's
                    // bytes up to `ack_num` were genuinely sent, even where our
                    // wait-list hasn't buffered a contiguous prefix that far —
                    // an acquirable wait-list (TCP; IP reassembly configures
                    // `acquirable = false`) takes that as license to jump the
                    // gap on the partner side rather than wait for its timeout.
                    let force_partner = tcp.ack && self.wl[Self::idx(!way)].acquirable();
                    let (mine, theirs) = {
                        let (a, b) = self.wl.split_at_mut(1);
                        let (this, other) = if way { (&mut b[0], &mut a[0]) } else { (&mut a[0], &mut b[0]) };
                        this.try_both(other, now, false, force_partner)
                    };
                    delivered_this_way = mine.into_iter().map(|(_, p)| (way, p, info_template.clone())).collect();
                    delivered_other_way = theirs.into_iter().map(|(_, p)| (!way, p, info_template.clone())).collect();
                }
                AddOutcome::Dropped => {
                    retransmit_info = Some(info.clone());
                }
            }
        }

        let terminated = self.is_terminated();

        SegmentOutcome { delivered_this_way, delivered_other_way, retransmit_info, terminated }
    }

    fn is_terminated(&self) -> bool {
        let closed0 = self.fin[0] && self.ack[1] && seq_lt(self.fin_seqnum[0], self.max_acknum[1]);
        let closed1 = self.fin[1] && self.ack[0] && seq_lt(self.fin_seqnum[1], self.max_acknum[0]);
        closed0 && closed1
    }

    /// Parse-error recovery: drop the child and requestor so the next
    /// segment re-runs protocol selection from scratch.
    pub fn reset_child(&mut self) {
        self.child = None;
        self.requestor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TcpKey;

    fn seg(seq: u32, ack: u32, flags: u8, payload_len: usize) -> (TcpHeader, ProtoInfo) {
        let (key, _way) = TcpKey::new(40000, 80);
        let header = TcpHeader {
            sport: 40000,
            dport: 80,
            seq_num: seq,
            ack_num: ack,
            data_offset_words: 5,
            flags,
            window: 0,
            urg_ptr: 0,
            options: vec![],
            mss: None,
            wsf: None,
        };
        let info = build_info(&header, key, false, payload_len, payload_len);
        (header, info)
    }

    #[test]
    fn syn_without_ack_marks_sender_as_client() {
        let (_h, info) = seg(100, 0, FLAG_SYN, 0);
        let key = info.as_tcp().unwrap().key;
        let mut sub = TcpSubParserState::new(key, None, None, WaitListConfig::tcp_default());
        let outcome = sub.accept_segment(info, false, Bytes::new(), Instant::now());
        assert_eq!(sub.srv_set(), ServerSet::Certain);
        assert!(sub.srv_way()); // the SYN's sender (way=false) is the client, so the server is way=true
        assert!(outcome.delivered_this_way.iter().all(|(_, _, i)| i.to_srv == Some(true)));
    }

    #[test]
    fn synack_marks_sender_as_server() {
        let (_h, info) = seg(500, 101, FLAG_SYN | FLAG_ACK, 0);
        let key = info.as_tcp().unwrap().key;
        let mut sub = TcpSubParserState::new(key, None, None, WaitListConfig::tcp_default());
        // First packet (the client's SYN) to establish way=false as client.
        let (_h0, info0) = seg(100, 0, FLAG_SYN, 0);
        sub.accept_segment(info0, false, Bytes::new(), Instant::now());
        let outcome = sub.accept_segment(info, true, Bytes::new(), Instant::now());
        assert_eq!(sub.srv_set(), ServerSet::Certain);
        assert!(outcome.delivered_this_way.iter().all(|(_, _, i)| i.to_srv == Some(false)));
    }

    #[test]
    fn out_of_order_segments_drain_in_sequence_order() {
        let (key, _) = TcpKey::new(1, 2);
        let mut sub = TcpSubParserState::new(key, None, None, WaitListConfig::tcp_default());
        let mk = |seq: u32| {
            let h = TcpHeader {
                sport: 1,
                dport: 2,
                seq_num: seq,
                ack_num: 0,
                data_offset_words: 5,
                flags: 0,
                window: 0,
                urg_ptr: 0,
                options: vec![],
                mss: None,
                wsf: None,
            };
            build_info(&h, key, false, 100, 100)
        };
        let now = Instant::now();
        // The very first segment in a direction seeds next_offset from its
        // own seq_num, so it is delivered immediately on arrival.
        let o1 = sub.accept_segment(mk(100), false, Bytes::from(vec![1u8; 100]), now);
        assert_eq!(o1.delivered_this_way.len(), 1);
        assert_eq!(o1.delivered_this_way[0].1[0], 1u8);
        // seq=300 arrives with a gap before it (next_offset is 200): held.
        let o2 = sub.accept_segment(mk(300), false, Bytes::from(vec![3u8; 100]), now);
        assert!(o2.delivered_this_way.is_empty());
        // seq=200 fills the gap, unblocking both 200 and 300 in order.
        let o3 = sub.accept_segment(mk(200), false, Bytes::from(vec![2u8; 100]), now);
        assert_eq!(o3.delivered_this_way.len(), 2);
        assert_eq!(o3.delivered_this_way[0].1[0], 2u8);
        assert_eq!(o3.delivered_this_way[1].1[0], 3u8);
    }

    #[test]
    fn retransmit_below_next_offset_is_info_only() {
        let (key, _) = TcpKey::new(1, 2);
        let mut sub = TcpSubParserState::new(key, None, None, WaitListConfig::tcp_default());
        let mk = |seq: u32, len: usize| {
            let h = TcpHeader {
                sport: 1,
                dport: 2,
                seq_num: seq,
                ack_num: 0,
                data_offset_words: 5,
                flags: 0,
                window: 0,
                urg_ptr: 0,
                options: vec![],
                mss: None,
                wsf: None,
            };
            build_info(&h, key, false, len, len)
        };
        let now = Instant::now();
        sub.accept_segment(mk(100, 10), false, Bytes::from(vec![0u8; 10]), now);
        let o = sub.accept_segment(mk(99, 1), false, Bytes::from(vec![0u8; 1]), now);
        assert!(o.retransmit_info.is_some());
        assert!(o.delivered_this_way.is_empty());
    }

    #[test]
    fn malformed_mss_option_length_is_rejected() {
        let mut opts = vec![2u8, 3, 0]; // kind=MSS, len=3 (must be 4)
        opts.resize(4, 0);
        assert!(parse_options(&opts[..3]).is_err());
    }

    #[test]
    fn nop_and_end_options_parse_cleanly() {
        let opts = [1u8, 1, 0, 0];
        let (kinds, mss, wsf) = parse_options(&opts).unwrap();
        assert_eq!(kinds, vec![1, 1, 0]);
        assert!(mss.is_none());
        assert!(wsf.is_none());
    }

    #[test]
    fn clean_close_terminates_once_both_fins_are_acked() {
        let (key, _) = TcpKey::new(1, 2);
        let mut sub = TcpSubParserState::new(key, None, None, WaitListConfig::tcp_default());
        let mk = |seq: u32, ack: u32, flags: u8| {
            let h = TcpHeader {
                sport: 1,
                dport: 2,
                seq_num: seq,
                ack_num: ack,
                data_offset_words: 5,
                flags,
                window: 0,
                urg_ptr: 0,
                options: vec![],
                mss: None,
                wsf: None,
            };
            build_info(&h, key, false, 0, 0)
        };
        let now = Instant::now();

        // way=false sends FIN at seq=100.
        let o = sub.accept_segment(mk(100, 0, FLAG_FIN), false, Bytes::new(), now);
        assert!(!o.terminated);
        // way=true ACKs past it (101 > fin_seqnum[0]=100): half-closed.
        let o = sub.accept_segment(mk(500, 101, FLAG_ACK), true, Bytes::new(), now);
        assert!(!o.terminated);
        // way=true sends its own FIN.
        let o = sub.accept_segment(mk(500, 101, FLAG_FIN), true, Bytes::new(), now);
        assert!(!o.terminated);
        // way=false ACKs past it (501 > fin_seqnum[1]=500): both sides closed.
        let o = sub.accept_segment(mk(101, 501, FLAG_ACK), false, Bytes::new(), now);
        assert!(o.terminated);
    }
}

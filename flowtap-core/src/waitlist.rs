//! Offset-ordered fragment buffering shared by IP reassembly and TCP reordering.
//!
//! Delivery is synchronous within the caller's thread: draining a wait-list
//! never spawns a task or suspends, it just walks a sorted map.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::config::WaitListConfig;

struct Fragment {
    payload: Bytes,
    /// Sequence-space units this fragment consumes, normally `payload.len()`
    /// but one larger on each side carrying a TCP SYN or FIN (those flags
    /// consume a sequence number without carrying a content byte).
    span: u32,
    inserted_at: Instant,
}

/// Outcome of [`WaitList::add`].
pub enum AddOutcome {
    /// The fragment was buffered; it may or may not have unblocked a drain.
    Buffered,
    /// `offset` was below `next_offset`: the bytes were already delivered.
    /// The caller should treat this as a retransmit and deliver it info-only.
    Retransmit,
    /// The fragment was rejected because a configured bound was exceeded.
    Dropped,
}

pub struct WaitList {
    config: WaitListConfig,
    next_offset: u32,
    fragments: BTreeMap<u32, Fragment>,
    pending_bytes: usize,
}

impl WaitList {
    pub fn new(config: WaitListConfig, start_offset: u32) -> Self {
        Self { config, next_offset: start_offset, fragments: BTreeMap::new(), pending_bytes: 0 }
    }

    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn set_next_offset(&mut self, offset: u32) {
        self.next_offset = offset;
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether an out-of-band sync point (e.g. a TCP ACK on the opposing
    /// direction) is allowed to force this wait-list to drain past a
    /// leading gap early, rather than only once its timeout elapses.
    pub fn acquirable(&self) -> bool {
        self.config.acquirable
    }

    /// Buffers `payload` starting at `offset`. Fragments below the current
    /// `next_offset` are reported as retransmits rather than buffered.
    pub fn add(&mut self, offset: u32, payload: Bytes, now: Instant) -> AddOutcome {
        let span = payload.len() as u32;
        self.add_spanning(offset, span, payload, now)
    }

    /// As [`WaitList::add`], but lets the caller advance `next_offset` by
    /// more than the payload's byte length — used by TCP to account for a
    /// SYN or FIN consuming a sequence number with no content byte of its
    /// own.
    pub fn add_spanning(&mut self, offset: u32, span: u32, payload: Bytes, now: Instant) -> AddOutcome {
        if seq_lt(offset, self.next_offset) {
            return AddOutcome::Retransmit;
        }
        let gap = offset.wrapping_sub(self.next_offset);
        if gap > self.config.max_acquire_gap
            || self.pending_bytes + payload.len() > self.config.max_pending_bytes
            || self.fragments.len() >= self.config.max_pending_packets
        {
            return AddOutcome::Dropped;
        }
        self.pending_bytes += payload.len();
        self.fragments.insert(offset, Fragment { payload, span, inserted_at: now });
        AddOutcome::Buffered
    }

    /// True once the oldest pending fragment has aged past this wait-list's
    /// configured timeout. Exposed so IP reassembly slots (which never call
    /// [`WaitList::try_drain`] themselves — a partially-covered datagram has
    /// nothing useful to jump a gap toward) can detect and discard a stalled
    /// datagram on their own sweep.
    pub(crate) fn is_stalled(&self, now: Instant) -> bool {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        self.fragments
            .values()
            .next()
            .is_some_and(|f| now.duration_since(f.inserted_at) >= timeout)
    }

    /// Drains every leading contiguous fragment, advancing `next_offset`
    /// past it. With `force`, or once the oldest pending fragment has aged
    /// past the configured timeout, a leading gap is jumped over instead of
    /// waited on — the skipped span is reported info-only by the caller.
    pub fn try_drain(&mut self, now: Instant, force: bool) -> Vec<(u32, Bytes)> {
        if (force || self.is_stalled(now)) && !self.fragments.contains_key(&self.next_offset) {
            if let Some(&off) = self.fragments.keys().next() {
                if seq_lt(self.next_offset, off) {
                    self.next_offset = off;
                }
            }
        }

        let mut drained = Vec::new();
        while let Some(frag) = self.fragments.remove(&self.next_offset) {
            self.pending_bytes -= frag.payload.len();
            let offset = self.next_offset;
            self.next_offset = self.next_offset.wrapping_add(frag.span);
            drained.push((offset, frag.payload));
        }
        drained
    }

    /// Drains `self`, then `partner`, repeating until neither advances.
    /// Used so an ACK observed on one direction can unblock a drain that was
    /// waiting on a gap in the other. `force_self`/`force_partner` are taken
    /// separately because an ACK's sync offset only justifies jumping the
    /// gap on the acknowledged (partner) direction, not on the direction the
    /// segment itself arrived on.
    pub fn try_both(
        &mut self,
        partner: &mut WaitList,
        now: Instant,
        force_self: bool,
        force_partner: bool,
    ) -> (Vec<(u32, Bytes)>, Vec<(u32, Bytes)>) {
        let mut mine = Vec::new();
        let mut theirs = Vec::new();
        loop {
            let a = self.try_drain(now, force_self);
            let b = partner.try_drain(now, force_partner);
            let progressed = !a.is_empty() || !b.is_empty();
            mine.extend(a);
            theirs.extend(b);
            if !progressed {
                break;
            }
        }
        (mine, theirs)
    }

    /// True iff every byte in `[start, end)` is covered by a buffered fragment.
    pub fn is_complete(&self, start: u32, end: u32) -> bool {
        let mut pos = start;
        for (&off, frag) in self.fragments.range(start..) {
            if seq_lt(pos, off) {
                return false;
            }
            let frag_end = off.wrapping_add(frag.payload.len() as u32);
            if seq_lt(pos, frag_end) {
                pos = frag_end;
            }
            if !seq_lt(pos, end) {
                return true;
            }
        }
        !seq_lt(pos, end)
    }

    /// Copies the contiguous region `[start, end)` into one buffer, or
    /// returns `None` if any byte in that range is missing.
    pub fn reassemble(&self, start: u32, end: u32) -> Option<Bytes> {
        if !self.is_complete(start, end) {
            return None;
        }
        let mut buf = BytesMut::with_capacity(end.wrapping_sub(start) as usize);
        let mut pos = start;
        for (&off, frag) in self.fragments.range(start..) {
            let frag_end = off.wrapping_add(frag.payload.len() as u32);
            if !seq_lt(pos, frag_end) {
                continue;
            }
            let skip = pos.wrapping_sub(off) as usize;
            let take_end = if seq_lt(end, frag_end) { end } else { frag_end };
            let take = take_end.wrapping_sub(pos) as usize;
            buf.extend_from_slice(&frag.payload[skip..skip + take]);
            pos = take_end;
            if !seq_lt(pos, end) {
                break;
            }
        }
        Some(buf.freeze())
    }

    pub fn pending_packets(&self) -> usize {
        self.fragments.len()
    }
}

/// Modulo-2^32 sequence number comparison: `a < b`.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_drain_delivers_in_order() {
        let cfg = WaitListConfig::tcp_default();
        let mut wl = WaitList::new(cfg, 100);
        let now = Instant::now();
        wl.add(300, Bytes::from_static(b"c"), now);
        wl.add(200, Bytes::from_static(b"b"), now);
        wl.add(100, Bytes::from_static(b"a"), now);
        let drained = wl.try_drain(now, false);
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].0, 100);
        assert_eq!(drained[1].0, 200);
        assert_eq!(drained[2].0, 300);
    }

    #[test]
    fn retransmit_detected_below_next_offset() {
        let cfg = WaitListConfig::tcp_default();
        let mut wl = WaitList::new(cfg, 100);
        let now = Instant::now();
        wl.add(100, Bytes::from_static(b"a"), now);
        wl.try_drain(now, false);
        assert!(matches!(wl.add(50, Bytes::from_static(b"x"), now), AddOutcome::Retransmit));
    }

    #[test]
    fn gap_holds_until_filled() {
        let cfg = WaitListConfig::tcp_default();
        let mut wl = WaitList::new(cfg, 0);
        let now = Instant::now();
        wl.add(10, Bytes::from_static(b"b"), now);
        assert!(wl.try_drain(now, false).is_empty());
        wl.add(0, Bytes::from_static(b"aaaaaaaaaa"), now);
        let drained = wl.try_drain(now, false);
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn ip_reassembly_complete_region() {
        let cfg = WaitListConfig::ip_default();
        let mut wl = WaitList::new(cfg, 0);
        let now = Instant::now();
        wl.add(0, Bytes::from(vec![1u8; 1480]), now);
        wl.add(1480, Bytes::from(vec![2u8; 20]), now);
        assert!(wl.is_complete(0, 1500));
        let payload = wl.reassemble(0, 1500).unwrap();
        assert_eq!(payload.len(), 1500);
        assert_eq!(payload[0], 1);
        assert_eq!(payload[1499], 2);
    }

    #[test]
    fn incomplete_region_returns_none() {
        let cfg = WaitListConfig::ip_default();
        let mut wl = WaitList::new(cfg, 0);
        let now = Instant::now();
        wl.add(0, Bytes::from(vec![1u8; 1480]), now);
        assert!(!wl.is_complete(0, 1500));
        assert!(wl.reassemble(0, 1500).is_none());
    }
}

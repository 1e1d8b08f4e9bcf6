//! Connection tracker: a short-lived table of *expected* future flows,
//! populated by control-channel parsers (the canonical example being an
//! FTP control connection announcing the port its data connection will
//! use) so the next segment on that flow is dispatched to the right
//! protocol without going through port-based guesswork.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ahash::AHashMap;

/// The 5-tuple an expectation is keyed on. Unlike the IP/TCP flow keys,
/// this one is *not* canonicalized: an expectation names a specific
/// direction (the control channel knows exactly which side will open the
/// data connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expectation {
    pub l4_proto: u8,
    pub addr_a: Ipv4Addr,
    pub port_a: u16,
    pub addr_b: Ipv4Addr,
    pub port_b: u16,
}

struct Entry {
    proto_name: String,
    requestor: Option<String>,
    expires_at: Instant,
}

/// Registered by a control-channel parser, consumed by the protocol whose
/// mux eventually sees the matching flow.
pub struct ConnectionTracker {
    table: Mutex<AHashMap<Expectation, Entry>>,
    ttl: Duration,
}

impl ConnectionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self { table: Mutex::new(AHashMap::new()), ttl }
    }

    /// Registers an expectation: the next flow matching `expectation`
    /// should be dispatched to `proto_name`, biasing it ahead of the port
    /// muxer table. `requestor` names the control-channel parser that
    /// asked for this, carried through so the spawned child can attribute
    /// its origin.
    pub fn expect(&self, expectation: Expectation, proto_name: impl Into<String>, requestor: Option<String>, now: Instant) {
        let mut table = self.table.lock().expect("cnxtrack mutex poisoned");
        table.insert(expectation, Entry { proto_name: proto_name.into(), requestor, expires_at: now + self.ttl });
    }

    /// Looks up and consumes a matching expectation (entries are single
    /// use: once the data connection has been biased, the table entry has
    /// served its purpose). Expired entries are treated as absent and
    /// opportunistically swept.
    pub fn lookup(&self, expectation: &Expectation, now: Instant) -> Option<(String, Option<String>)> {
        let mut table = self.table.lock().expect("cnxtrack mutex poisoned");
        table.retain(|_, entry| entry.expires_at > now);
        table.remove(expectation).map(|entry| (entry.proto_name, entry.requestor))
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("cnxtrack mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

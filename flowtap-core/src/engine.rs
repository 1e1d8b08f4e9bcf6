//! Engine facade: wires the mux caches, wait-lists, connection tracker,
//! port muxer table and netmatch registry into the single entry point a
//! capture loop drives, [`Engine::process_ip_frame`].

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;

use crate::cnxtrack::{ConnectionTracker, Expectation};
use crate::config::Config;
use crate::key::{IpKey, TcpKey};
use crate::mux::Mux;
use crate::netmatch::NetmatchRegistry;
use crate::portmux::PortMuxerTable;
use crate::proto::{self, ChildParser, ChildParserRef, ParseStatus, ProtoInfo};
use crate::telemetry::Metrics;

/// Builds a [`ChildParserRef`] for a newly seen flow. Registered per IP
/// protocol number (for sub-parsers hung off the IP layer) and per
/// application protocol name (for sub-parsers hung off TCP).
pub type ProtoFactory = Arc<dyn Fn() -> ChildParserRef + Send + Sync>;

/// Shared engine state. `Engine` itself is a thin `Arc` wrapper so that
/// factories registered with the IP sub-parser registry can capture their
/// own handle back into the engine without a reference cycle (the registry
/// lives inside `EngineInner`, the factories hold `Arc<EngineInner>` by
/// value, never the reverse).
pub struct EngineInner {
    ip_mux: Mux<IpKey, Mutex<crate::proto::ip::IpSubParserState>>,
    ip_subprotos: Mutex<AHashMap<u8, ProtoFactory>>,
    app_protos: Mutex<AHashMap<String, ProtoFactory>>,
    tcp_port_muxers: PortMuxerTable,
    cnxtrack: ConnectionTracker,
    netmatch: NetmatchRegistry,
    metrics: Option<Metrics>,
    ip_wl_config: crate::config::WaitListConfig,
    tcp_wl_config: crate::config::WaitListConfig,
    tcp_mux_timeout: Duration,
    tcp_mux_hash_size: usize,
    ip_rotating_slot: AtomicUsize,
}

/// The engine facade. Cloning is cheap (an `Arc` bump) and is how a capture
/// loop's worker threads share one engine instance.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl Engine {
    /// Builds an engine from a loaded [`Config`], registering the TCP
    /// dispatcher at IP protocol 6 and loading any configured netmatch
    /// filters. Application-level protocol factories (HTTP, DNS, …) are
    /// registered afterward via [`Engine::register_app_proto`] — this
    /// crate ships none itself.
    pub fn new(config: &Config, metrics: Option<Metrics>) -> crate::error::Result<Self> {
        let netmatch = NetmatchRegistry::load_all(&config.netmatch)?;

        let inner = Arc::new(EngineInner {
            ip_mux: Mux::new(config.mux.ip_hash_size, Duration::from_secs(config.mux.ip_timeout_secs)),
            ip_subprotos: Mutex::new(AHashMap::new()),
            app_protos: Mutex::new(AHashMap::new()),
            tcp_port_muxers: PortMuxerTable::new(config.tcp_ports.clone()),
            cnxtrack: ConnectionTracker::new(Duration::from_secs(60)),
            netmatch,
            metrics,
            ip_wl_config: config.ip_wait_list_config(),
            tcp_wl_config: config.tcp_wait_list_config(),
            tcp_mux_timeout: Duration::from_secs(config.mux.tcp_timeout_secs),
            tcp_mux_hash_size: config.mux.tcp_hash_size,
            ip_rotating_slot: AtomicUsize::new(0),
        });

        let tcp_dispatcher_inner = Arc::clone(&inner);
        inner.ip_subprotos.lock().expect("ip_subprotos mutex poisoned").insert(
            6,
            Arc::new(move || -> ChildParserRef { Arc::new(TcpDispatcher::new(Arc::clone(&tcp_dispatcher_inner))) }),
        );

        Ok(Self(inner))
    }

    fn metrics(&self) -> Option<&Metrics> {
        self.0.metrics.as_ref()
    }

    /// Registers (or replaces) the sub-parser factory for IP protocol
    /// number `proto`. Mirrors the original dissector's `ip_subproto_ctor`.
    pub fn register_ip_subproto(&self, proto: u8, factory: ProtoFactory) {
        self.0.ip_subprotos.lock().expect("ip_subprotos mutex poisoned").insert(proto, factory);
    }

    pub fn unregister_ip_subproto(&self, proto: u8) {
        self.0.ip_subprotos.lock().expect("ip_subprotos mutex poisoned").remove(&proto);
    }

    /// Registers the factory invoked when a TCP flow is bound (by port
    /// muxer or connection tracker hit) to application protocol `name`.
    pub fn register_app_proto(&self, name: impl Into<String>, factory: ProtoFactory) {
        self.0.app_protos.lock().expect("app_protos mutex poisoned").insert(name.into(), factory);
    }

    pub fn tcp_ports(&self) -> Vec<(String, u16, u16)> {
        self.0.tcp_port_muxers.snapshot().into_iter().map(|b| (b.name, b.port_min, b.port_max)).collect()
    }

    pub fn tcp_add_port(&self, name: impl Into<String>, port_min: u16, port_max: u16) -> bool {
        let binding = crate::config::PortBinding { name: name.into(), port_min, port_max };
        self.0.tcp_port_muxers.add(binding).is_ok()
    }

    pub fn tcp_del_port(&self, name: &str, _port_min: u16, _port_max: u16) -> bool {
        self.0.tcp_port_muxers.del(name) > 0
    }

    /// Registers an expectation for a future flow (e.g. an FTP control
    /// channel announcing its data connection), biasing TCP dispatch ahead
    /// of port-based fallback.
    pub fn cnxtrack_expect(&self, expectation: Expectation, proto_name: impl Into<String>, requestor: Option<String>, now: Instant) {
        self.0.cnxtrack.expect(expectation, proto_name, requestor, now);
    }

    /// Invokes netmatch filter `name` against `data`, returning `None` if no
    /// filter by that name was loaded. This is the "register-file and
    /// symbol-lookup contract" the core exposes to whatever dynamically
    /// loaded user filters are registered in configuration; the engine
    /// itself never calls this on the packet path.
    pub fn netmatch_match(&self, name: &str, data: &[u8]) -> Option<bool> {
        let matched = self.0.netmatch.get(name)?.matches(data);
        if let Some(metrics) = self.metrics() {
            metrics.netmatch_invocations_total.add(1, &[]);
        }
        Some(matched)
    }

    pub fn netmatch_filter_count(&self) -> usize {
        self.0.netmatch.len()
    }

    /// Evicts idle entries from the IP mux and, transitively, from every
    /// live TCP dispatcher's own per-address-pair mux; also force-drains
    /// any reassembly slot on a still-active IP sub-parser whose fragments
    /// have sat past the configured wait-list timeout (§4.2's "forced
    /// flush", driven here rather than on packet arrival since a stalled
    /// datagram may never see another packet on its flow). Intended to be
    /// driven periodically by the caller (a capture loop's maintenance
    /// tick); nothing in this crate spawns a background timer itself.
    pub fn sweep_idle(&self, now: Instant) {
        let evicted = self.0.ip_mux.sweep_idle(now);
        for state in &evicted {
            let guard = state.lock().expect("ip sub-parser mutex poisoned");
            if let Some(child) = &guard.child {
                child.sweep_idle(now);
            }
        }
        if let Some(metrics) = self.metrics() {
            if !evicted.is_empty() {
                metrics.flows_expired_total.add(evicted.len() as u64, &[]);
            }
        }

        for (_, state) in self.0.ip_mux.entries() {
            let (child, stale) = {
                let mut guard = state.lock().expect("ip sub-parser mutex poisoned");
                let stale = guard.sweep_stale(now);
                (guard.child.clone(), stale)
            };
            if let Some(child) = &child {
                // The IP sub-parser itself can stay busy indefinitely (any
                // other traffic on this address pair resets its own idle
                // clock), so its nested TCP dispatcher never gets swept
                // just by being evicted above — it has to be swept here,
                // on every still-live IP sub-parser, for `tcp_mux_timeout`
                // to ever fire on its own cadence.
                child.sweep_idle(now);
            }
            if stale.is_empty() {
                continue;
            }
            if let Some(metrics) = self.metrics() {
                metrics.fragments_dropped_total.add(stale.len() as u64, &[]);
            }
            if let Some(child) = child {
                for info in &stale {
                    let _ = child.parse(None, info, now);
                }
            }
        }
    }

    /// Processes one raw IPv4 datagram: validates the header, looks up or
    /// creates the owning sub-parser, reassembles fragments if needed, and
    /// dispatches the (possibly reassembled) payload to the registered
    /// child for this datagram's protocol number.
    pub fn process_ip_frame(&self, packet: &[u8], cap_len: usize, wire_len: usize, now: Instant) -> ParseStatus {
        if let Some(metrics) = self.metrics() {
            metrics.frames_total.add(1, &[]);
        }

        let header = match proto::ip::parse_header(packet, cap_len, wire_len) {
            Ok(h) => h,
            Err(status) => {
                if status == ParseStatus::ParseErr {
                    if let Some(metrics) = self.metrics() {
                        metrics.parse_errors_total.add(1, &[]);
                    }
                }
                return status;
            }
        };

        let (key, way) = IpKey::new(header.protocol, header.src, header.dst);
        let header_len = header.header_len();
        // The datagram's declared payload length, independent of how much
        // of it this capture actually stored: `total_length` is already
        // validated against `wire_len` in `parse_header`, so this never
        // underflows.
        let payload_wire_len = header.total_length as usize - header_len;
        // parse_header already guarantees cap_len and total_length both
        // cover header_len; cap_len may still fall short of total_length
        // on a truncated capture, so clamp to what was actually captured.
        let payload_end = (header.total_length as usize).min(packet.len().min(cap_len));
        let payload = Bytes::copy_from_slice(&packet[header_len..payload_end]);
        let payload_len = payload.len();

        let protocol = header.protocol;
        let metrics_for_factory = self.metrics().cloned();
        let factory_opt = self.0.ip_subprotos.lock().expect("ip_subprotos mutex poisoned").get(&protocol).cloned();
        let (state, created) = self.0.ip_mux.lookup_or_create(key, now, || {
            Mutex::new(crate::proto::ip::IpSubParserState::new(key, factory_opt.as_ref().map(|f| f())))
        });
        if created {
            if let Some(metrics) = &metrics_for_factory {
                metrics.flows_opened_total.add(1, &[]);
            }
        }

        let info = proto::ip::build_info(&header, key, way, payload_len, payload_wire_len);

        let mut guard = state.lock().expect("ip sub-parser mutex poisoned");
        let assembled = if header.is_fragment() {
            let assembled = guard.add_fragment(
                header.id,
                header.frag_offset,
                !header.more_fragments,
                payload,
                now,
                &self.0.ip_rotating_slot,
                &self.0.ip_wl_config,
            );
            if assembled.is_some() {
                if let Some(metrics) = self.metrics() {
                    metrics.fragments_reassembled_total.add(1, &[]);
                }
            }
            assembled
        } else {
            Some(payload)
        };

        let Some(assembled) = assembled else {
            return ParseStatus::Ok;
        };

        match &guard.child {
            Some(child) => child.parse(Some(&assembled), &info, now),
            None => ParseStatus::Ok,
        }
    }
}

/// The IP layer's child for protocol 6: parses the TCP header, dispatches
/// into a `Mux` scoped to this one address pair (ports alone disambiguate
/// flows once the address pair is already fixed by the IP sub-parser that
/// owns this dispatcher), and drives the per-flow state machine.
struct TcpDispatcher {
    inner: Arc<EngineInner>,
    mux: Mux<TcpKey, Mutex<proto::tcp::TcpSubParserState>>,
}

impl TcpDispatcher {
    fn new(inner: Arc<EngineInner>) -> Self {
        let timeout = inner.tcp_mux_timeout;
        let hash_size = inner.tcp_mux_hash_size;
        Self { mux: Mux::new(hash_size, timeout), inner }
    }

    fn resolve_child(&self, addr_key: &IpKey, sport: u16, dport: u16, way: proto::Way, now: Instant) -> (Option<ChildParserRef>, Option<String>) {
        let (a, b) = if way { (addr_key.addr[1], addr_key.addr[0]) } else { (addr_key.addr[0], addr_key.addr[1]) };
        let expectation = Expectation { l4_proto: 6, addr_a: a, port_a: sport, addr_b: b, port_b: dport };
        if let Some((name, requestor)) = self.inner.cnxtrack.lookup(&expectation, now) {
            if let Some(factory) = self.inner.app_protos.lock().expect("app_protos mutex poisoned").get(&name) {
                return (Some(factory()), requestor);
            }
        }
        if let Some(name) = self.inner.tcp_port_muxers.find(sport, dport) {
            if let Some(factory) = self.inner.app_protos.lock().expect("app_protos mutex poisoned").get(&name) {
                return (Some(factory()), None);
            }
        }
        (None, None)
    }
}

fn ip_addr_pair(info: &ProtoInfo) -> Option<IpKey> {
    info.as_ip().map(|ip| ip.key)
}

impl ChildParser for TcpDispatcher {
    fn parse(&self, payload: Option<&Bytes>, info: &ProtoInfo, now: Instant) -> ParseStatus {
        let Some(segment) = payload else {
            return ParseStatus::Ok;
        };
        let Some(addr_key) = ip_addr_pair(info) else {
            return ParseStatus::ParseErr;
        };

        // `segment.len()` is how much of this TCP segment the capture
        // actually stored; `info.wire_len` is the IP layer's declared
        // payload length for it, which may be larger on a snaplen-
        // truncated capture. Passing the real wire length lets
        // `parse_header` tell a malformed header (`ParseErr`) apart from
        // one merely cut short by capture (`TooShort`).
        let header = match proto::tcp::parse_header(segment, segment.len(), info.wire_len) {
            Ok(h) => h,
            Err(status) => {
                if status == ParseStatus::ParseErr {
                    if let Some(metrics) = &self.inner.metrics {
                        metrics.parse_errors_total.add(1, &[]);
                    }
                }
                return status;
            }
        };

        let (key, mut way) = TcpKey::new(header.sport, header.dport);
        // Loopback correction: with both endpoints on the same address,
        // the address pair can't disambiguate direction at all; recompute
        // `way` strictly from ports, same convention `TcpKey::new` uses.
        if addr_key.addr[0] == addr_key.addr[1] {
            way = header.sport < header.dport;
        }

        let tcp_wire_len = info.wire_len - header.header_len();
        let tcp_info = proto::tcp::build_info(&header, key, way, segment.len() - header.header_len(), tcp_wire_len);
        let segment_payload = segment.slice(header.header_len()..);

        let wl_config = self.inner.tcp_wl_config.clone();
        let metrics = self.inner.metrics.clone();
        let (sub, created) = self.mux.lookup_or_create(key, now, || {
            let (child, requestor) = self.resolve_child(&addr_key, header.sport, header.dport, way, now);
            Mutex::new(proto::tcp::TcpSubParserState::new(key, child, requestor, wl_config))
        });
        if created {
            if let Some(m) = &metrics {
                m.flows_opened_total.add(1, &[]);
            }
        }

        let mut guard = sub.lock().expect("tcp sub-parser mutex poisoned");
        // A sub-parser with no child yet (never resolved, or nulled out by
        // a prior parse error) re-runs protocol selection on every segment:
        // a connection-tracker expectation can arrive after the flow did,
        // and a parser that failed once may succeed now that more of the
        // stream is visible.
        if guard.child.is_none() {
            let (child, requestor) = self.resolve_child(&addr_key, header.sport, header.dport, way, now);
            if child.is_some() {
                guard.child = child;
                guard.requestor = requestor;
            }
        }
        let outcome = guard.accept_segment(tcp_info, way, segment_payload, now);

        let mut worst = ParseStatus::Ok;
        for (_way, bytes, deliver_info) in outcome.delivered_this_way.into_iter().chain(outcome.delivered_other_way) {
            let status = match &guard.child {
                Some(child) => child.parse(Some(&bytes), &deliver_info, now),
                None => ParseStatus::Ok,
            };
            if status == ParseStatus::ParseErr {
                guard.reset_child();
                if let Some(m) = &metrics {
                    m.parse_errors_total.add(1, &[]);
                }
                worst = ParseStatus::ParseErr;
            }
        }

        if let Some(retransmit) = outcome.retransmit_info {
            if let Some(child) = &guard.child {
                let _ = child.parse(None, &retransmit, now);
            }
        }

        if outcome.terminated {
            drop(guard);
            self.mux.remove(&key);
            if let Some(m) = &metrics {
                m.flows_terminated_total.add(1, &[]);
            }
        }

        worst
    }

    fn sweep_idle(&self, now: Instant) {
        let evicted = self.mux.sweep_idle(now);
        if let Some(metrics) = &self.inner.metrics {
            if !evicted.is_empty() {
                metrics.flows_expired_total.add(evicted.len() as u64, &[]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        toml::from_str("").unwrap()
    }

    #[test]
    fn malformed_ip_header_is_a_parse_error() {
        let engine = Engine::new(&default_config(), None).unwrap();
        let packet = [0u8; 1];
        let status = engine.process_ip_frame(&packet, 1, 1, Instant::now());
        assert_eq!(status, ParseStatus::TooShort);
    }

    #[test]
    fn unfragmented_udp_datagram_with_no_registered_child_is_info_only() {
        let engine = Engine::new(&default_config(), None).unwrap();
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&28u16.to_be_bytes());
        packet[9] = 17; // UDP, not registered
        packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
        packet[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let status = engine.process_ip_frame(&packet, 28, 28, Instant::now());
        assert_eq!(status, ParseStatus::Ok);
    }

    #[test]
    fn netmatch_match_is_none_for_an_unregistered_filter() {
        let engine = Engine::new(&default_config(), None).unwrap();
        assert_eq!(engine.netmatch_filter_count(), 0);
        assert!(engine.netmatch_match("nope", b"data").is_none());
    }

    #[test]
    fn tcp_add_and_del_port_round_trip() {
        let engine = Engine::new(&default_config(), None).unwrap();
        assert!(engine.tcp_add_port("http", 80, 80));
        assert!(engine.tcp_ports().iter().any(|(name, lo, hi)| name == "http" && *lo == 80 && *hi == 80));
        assert!(engine.tcp_del_port("http", 80, 80));
        assert!(engine.tcp_ports().is_empty());
    }
}

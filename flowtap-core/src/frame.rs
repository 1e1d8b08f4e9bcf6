//! Frame ingest boundary. Capture itself (pcap, AF_PACKET, a replay file)
//! is outside this crate's scope; `FrameSource` is the seam a host binary
//! implements to hand raw IPv4 datagrams to the engine.

use std::time::Instant;

use tracing::debug;

use crate::engine::Engine;
use crate::proto::ParseStatus;

/// Produces raw IPv4 datagrams in capture order. `Instant` is the frame's
/// own capture timestamp (used for wait-list aging and mux idle timeouts),
/// not the time `next_frame` happens to be called.
pub trait FrameSource {
    /// Returns the next captured frame, or `None` once the source is
    /// exhausted (end of a replay file, a closed socket).
    fn next_frame(&mut self) -> std::io::Result<Option<(Instant, Vec<u8>)>>;
}

/// Drives `engine` from `source` until the source is exhausted, logging
/// (but not stopping on) per-frame parse errors.
///
/// The wire length passed to [`Engine::process_ip_frame`] is the captured
/// length itself: `FrameSource` implementations that know a frame was
/// truncated on the wire (e.g. a snaplen-limited pcap capture) should carry
/// that separately and are not served by this helper — they should drive
/// `process_ip_frame` directly instead.
pub fn run_ingest<S: FrameSource>(engine: &Engine, source: &mut S) -> std::io::Result<u64> {
    let mut processed = 0u64;
    while let Some((captured_at, bytes)) = source.next_frame()? {
        let len = bytes.len();
        let status = engine.process_ip_frame(&bytes, len, len, captured_at);
        match status {
            ParseStatus::Ok => {}
            ParseStatus::TooShort => debug!(len, "frame too short to parse"),
            ParseStatus::ParseErr => debug!(len, "frame failed to parse"),
        }
        processed += 1;
    }
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        frames: std::vec::IntoIter<Vec<u8>>,
    }

    impl FrameSource for FixedSource {
        fn next_frame(&mut self) -> std::io::Result<Option<(Instant, Vec<u8>)>> {
            Ok(self.frames.next().map(|f| (Instant::now(), f)))
        }
    }

    #[test]
    fn run_ingest_counts_every_frame_including_malformed_ones() {
        let config: crate::config::Config = toml::from_str("").unwrap();
        let engine = Engine::new(&config, None).unwrap();
        let mut source = FixedSource { frames: vec![vec![0xff], vec![0u8; 4]].into_iter() };
        let processed = run_ingest(&engine, &mut source).unwrap();
        assert_eq!(processed, 2);
    }
}

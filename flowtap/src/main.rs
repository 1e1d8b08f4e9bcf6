#![forbid(unsafe_code)]

use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use flowtap_core::{load_from_path, run_ingest, telemetry, Engine, FrameSource};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "IPv4/TCP demultiplexing and reassembly engine")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "flowtap.toml")]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    telemetry::init_tracing(&cfg.logging.level, cfg.logging.show_target);

    let metrics = match telemetry::init_metrics() {
        Ok((metrics, registry)) => Some((metrics, registry)),
        Err(err) => {
            error!(%err, "metrics initialization failed, continuing without telemetry");
            None
        }
    };

    let engine = match Engine::new(&cfg, metrics.as_ref().map(|(m, _)| m.clone())) {
        Ok(engine) => engine,
        Err(err) => {
            error!(%err, "engine initialization failed");
            std::process::exit(1);
        }
    };

    info!(bindings = cfg.tcp_ports.len(), netmatch = cfg.netmatch.len(), "engine ready");

    let mut source = StdinFrameSource::new();
    match run_ingest(&engine, &mut source) {
        Ok(processed) => info!(processed, "ingest finished"),
        Err(err) => {
            error!(%err, "ingest loop failed");
            std::process::exit(1);
        }
    }

    if let Some((_, registry)) = &metrics {
        print!("{}", telemetry::render_prometheus(registry));
    }
}

/// Reads length-prefixed raw IPv4 datagrams from stdin: a 4-byte
/// big-endian length followed by that many bytes, repeated until EOF.
/// Suitable for piping frames captured by an external tool (pcap, tcpdump
/// `-w -`, a replay script) without this crate depending on a capture
/// library directly.
struct StdinFrameSource {
    stdin: io::Stdin,
}

impl StdinFrameSource {
    fn new() -> Self {
        Self { stdin: io::stdin() }
    }
}

impl FrameSource for StdinFrameSource {
    fn next_frame(&mut self) -> io::Result<Option<(Instant, Vec<u8>)>> {
        let mut len_buf = [0u8; 4];
        match self.stdin.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        self.stdin.read_exact(&mut frame)?;
        Ok(Some((Instant::now(), frame)))
    }
}

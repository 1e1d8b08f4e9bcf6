#![deny(unsafe_code)]

pub mod cnxtrack;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod key;
pub mod mux;
pub mod netmatch;
pub mod portmux;
pub mod proto;
pub mod telemetry;
pub mod waitlist;

pub use cnxtrack::{ConnectionTracker, Expectation};
pub use config::{load_from_path, Config};
pub use engine::{Engine, ProtoFactory};
pub use error::{EngineError, Result};
pub use frame::{run_ingest, FrameSource};
pub use proto::{ChildParser, ChildParserRef, ParseStatus, ProtoInfo};

pub mod metrics;
pub mod tracing;

pub use metrics::{init_metrics, render_prometheus, Metrics};
pub use tracing::init_tracing;

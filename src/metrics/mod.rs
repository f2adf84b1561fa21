pub mod collector;
pub mod exporter;

pub use collector::{FileMetrics, GcplogMetrics, SyslogMetrics};
pub use exporter::PrometheusExporter;

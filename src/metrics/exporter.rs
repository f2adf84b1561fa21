use crate::Result;
use prometheus::{Encoder, Registry, TextEncoder};
use std::path::Path;
use tracing::info;

/// Renders a registry in the Prometheus text exposition format.
pub struct PrometheusExporter {
    registry: Registry,
}

impl PrometheusExporter {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn format_current_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder.encode(&families, &mut buffer)?;

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let body = self.format_current_metrics()?;
        std::fs::write(path, body)?;
        info!("Wrote metrics to {}", path.display());
        Ok(())
    }
}

//! Partitions scrape configs by backend kind.

use crate::config::ScrapeConfig;
use crate::targets::Kind;
use crate::{LogshipError, Result};
use std::collections::HashMap;

/// Configs per kind. Only kinds with at least one config are present, and
/// each group keeps the input order.
pub type Groups = HashMap<Kind, Vec<ScrapeConfig>>;

/// Backend kind of a single config.
///
/// Exactly one backend section must be populated. The predicates are tested
/// in `Kind::ALL` order.
pub fn kind_of(cfg: &ScrapeConfig) -> Result<Kind> {
    let sections = cfg.populated_sections();
    if sections.len() > 1 {
        return Err(LogshipError::UnknownScrapeConfig {
            job_name: cfg.job_name.clone(),
            reason: format!("populates multiple backends: {}", sections.join(", ")),
        });
    }

    if cfg.has_service_discovery_config() {
        Ok(Kind::File)
    } else if cfg.journal.is_some() {
        Ok(Kind::Journal)
    } else if cfg.syslog.is_some() {
        Ok(Kind::Syslog)
    } else if cfg.gcplog.is_some() {
        Ok(Kind::Gcplog)
    } else if cfg.push.is_some() {
        Ok(Kind::Push)
    } else {
        Err(LogshipError::UnknownScrapeConfig {
            job_name: cfg.job_name.clone(),
            reason: "populates no backend".to_string(),
        })
    }
}

/// Group configs by kind, failing on the first unrecognized config.
pub fn classify(configs: &[ScrapeConfig]) -> Result<Groups> {
    let mut groups = Groups::with_capacity(Kind::ALL.len());

    for cfg in configs {
        let kind = kind_of(cfg)?;
        groups.entry(kind).or_default().push(cfg.clone());
    }

    Ok(groups)
}

use anyhow::{Result, ensure};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::dispatch::DEFAULT_CHANNEL_CAPACITY;

pub const IPFIX_PORT: u16 = 4739;
pub const DEFAULT_SOURCE_PORT: u16 = 55117;

/// Generator settings, fixed before the run starts
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub max_simulated_sources: u32,
    pub source_base: Ipv4Addr,
    pub template_interval: Duration,
    pub target: Ipv4Addr,
    pub target_port: u16,
    pub source_port: u16,
    /// Packets per second, 0 = as fast as the channel drains
    pub rate_limit: u64,
    pub channel_capacity: usize,
    /// Head start given to templates before data starts flowing
    pub warmup: Duration,
    pub transmitter_core: Option<usize>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_simulated_sources: 10,
            source_base: Ipv4Addr::new(192, 168, 1, 0),
            template_interval: Duration::from_secs(10),
            target: Ipv4Addr::LOCALHOST,
            target_port: IPFIX_PORT,
            source_port: DEFAULT_SOURCE_PORT,
            rate_limit: 0,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            warmup: Duration::from_secs(1),
            transmitter_core: None,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_simulated_sources >= 2,
            "at least 2 simulated sources are required (got {}), the first index is never used",
            self.max_simulated_sources
        );
        ensure!(
            !self.template_interval.is_zero(),
            "template refresh interval must be non-zero"
        );
        ensure!(self.channel_capacity > 0, "channel capacity must be at least 1");
        ensure!(
            u32::from(self.source_base)
                .checked_add(self.max_simulated_sources - 1)
                .is_some(),
            "{} simulated sources do not fit above {}",
            self.max_simulated_sources,
            self.source_base
        );
        Ok(())
    }

    /// Spoofed exporter addresses: `source_base + j` for `j` in
    /// `1..max_simulated_sources`, so N configured sources yield N - 1
    /// addresses.
    pub fn source_set(&self) -> Result<Vec<Ipv4Addr>> {
        self.validate()?;
        let base = u32::from(self.source_base);
        Ok((1..self.max_simulated_sources)
            .map(|j| Ipv4Addr::from(base + j))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_source_set_skips_index_zero() {
        let config = GeneratorConfig::default();
        let sources = config.source_set().unwrap();

        assert_eq!(sources.len(), 9);
        assert_eq!(sources[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(sources[8], Ipv4Addr::new(192, 168, 1, 9));
    }

    #[test]
    fn test_source_set_crosses_octet_boundary() {
        let config = GeneratorConfig {
            max_simulated_sources: 300,
            ..Default::default()
        };
        let sources = config.source_set().unwrap();

        assert_eq!(sources.len(), 299);
        assert_eq!(sources[254], Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(sources[255], Ipv4Addr::new(192, 168, 2, 0));
    }

    #[test]
    fn test_too_few_sources_rejected() {
        for max in [0, 1] {
            let config = GeneratorConfig {
                max_simulated_sources: max,
                ..Default::default()
            };
            assert!(config.source_set().is_err());
        }
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let config = GeneratorConfig {
            template_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GeneratorConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GeneratorConfig {
            source_base: Ipv4Addr::new(255, 255, 255, 250),
            max_simulated_sources: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

use crate::error::ConfigError;

/// Coherence protocol variant: MESI adds the exclusive-clean state so an
/// uncontended load does not require a later upgrade transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Msi,
    Mesi,
}

impl Protocol {
    /// Case-normalizing parse, mirroring the original's acceptance of
    /// `"MSI"`, `"msi"`, `"MESI"`, etc.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MSI" => Some(Self::Msi),
            "MESI" => Some(Self::Mesi),
            _ => None,
        }
    }

    pub fn is_mesi(self) -> bool {
        matches!(self, Self::Mesi)
    }
}

/// Static configuration for one directory controller instance.
///
/// Field names and defaults mirror the parameter set a simulator harness
/// would supply; `validate` enforces the invariants that are fatal at
/// startup rather than at first use.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub cache_line_size: u64,
    pub coherence_protocol: Protocol,
    pub addr_range_start: u64,
    pub addr_range_end: u64,
    pub interleave_size: u64,
    pub interleave_step: u64,
    pub entry_cache_size: usize,
    /// `None` means unbounded (the sentinel `-1` in the original).
    pub mshr_num_entries: Option<usize>,
    pub access_latency_cycles: u64,
    pub mshr_latency_cycles: u64,
    pub direct_mem_link: bool,
    pub net_memory_name: Option<String>,
    pub clock: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_line_size: 64,
            coherence_protocol: Protocol::Mesi,
            addr_range_start: 0,
            addr_range_end: 0,
            interleave_size: 0,
            interleave_step: 0,
            entry_cache_size: 32768,
            mshr_num_entries: None,
            access_latency_cycles: 1,
            mshr_latency_cycles: 1,
            direct_mem_link: true,
            net_memory_name: None,
            clock: "1GHz".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cache_line_size.is_power_of_two() {
            return Err(ConfigError::InvalidCacheLineSize(self.cache_line_size));
        }
        if self.addr_range_end != 0 && self.addr_range_end <= self.addr_range_start {
            return Err(ConfigError::InvalidAddressRange {
                start: self.addr_range_start,
                end: self.addr_range_end,
            });
        }
        if self.interleave_size > 0 && self.interleave_step < self.interleave_size {
            return Err(ConfigError::InterleaveStepTooSmall {
                step: self.interleave_step,
                size: self.interleave_size,
            });
        }
        if !self.direct_mem_link && self.net_memory_name.is_none() {
            return Err(ConfigError::MissingNetMemoryName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_interleave_step_smaller_than_size() {
        let mut cfg = Config::default();
        cfg.interleave_size = 1024 * 4;
        cfg.interleave_step = 1024 * 2;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InterleaveStepTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_missing_net_memory_name() {
        let mut cfg = Config::default();
        cfg.direct_mem_link = false;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingNetMemoryName)
        ));
    }

    #[test]
    fn parses_protocol_case_insensitively() {
        assert_eq!(Protocol::parse("mesi"), Some(Protocol::Mesi));
        assert_eq!(Protocol::parse("MSI"), Some(Protocol::Msi));
        assert_eq!(Protocol::parse("bogus"), None);
    }
}

//! Runtime configuration of the hardware manager.
//!
//! The service loads these knobs once at startup (typically from a TOML
//! file when the `serde` feature is enabled) and passes them to
//! [`HwContext::new`](crate::HwContext::new).

/// Tunables for discovery and resource allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HwConfig {
    /// Minimum alignment mask applied to memory windows (page size - 1).
    pub min_alignment: u64,
    /// Probe expansion ROM BARs during discovery.
    pub probe_rom: bool,
    /// Renumber bridges whose primary/secondary bus numbers are inconsistent.
    pub reassign_buses: bool,
    /// Maximum bridge nesting depth the walker descends into.
    pub max_walk_depth: usize,
    /// Log the device tree once discovery has finished.
    pub dump_tree: bool,
    /// Report bridge MSI source ids for the whole subordinate range.
    pub transparent_msi: bool,
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            min_alignment: 0xFFF,
            probe_rom: true,
            reassign_buses: true,
            max_walk_depth: 16,
            dump_tree: false,
            transparent_msi: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = HwConfig::default();
        assert_eq!(cfg.min_alignment, 0xFFF);
        assert!(cfg.probe_rom);
        assert!(cfg.reassign_buses);
        assert_eq!(cfg.max_walk_depth, 16);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: HwConfig = toml::from_str("probe_rom = false\nmax_walk_depth = 4\n").unwrap();
        assert!(!cfg.probe_rom);
        assert_eq!(cfg.max_walk_depth, 4);
        assert_eq!(cfg.min_alignment, 0xFFF);
        assert!(!cfg.dump_tree);
    }
}

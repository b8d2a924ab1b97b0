//! Host bridges: the start of every PCI hierarchy.

use alloc::sync::Arc;
use core::any::Any;

use super::cfg::ConfigSpace;
use crate::device::DevFeature;

/// Feature marking a device as a PCI root bridge.
///
/// The bus numbering itself lives in the device's
/// [`BusAttrs`](crate::device::BusAttrs).
pub struct RootBridge {
    segment: u16,
    base_bus: u8,
    cfg: Arc<dyn ConfigSpace>,
}

impl RootBridge {
    /// Creates a root bridge for bus `base_bus` of `segment`.
    #[must_use]
    pub fn new(segment: u16, base_bus: u8, cfg: Arc<dyn ConfigSpace>) -> Self {
        Self {
            segment,
            base_bus,
            cfg,
        }
    }

    /// Returns the PCI segment group.
    #[must_use]
    pub const fn segment(&self) -> u16 {
        self.segment
    }

    /// Returns the first bus number decoded by this bridge.
    #[must_use]
    pub const fn base_bus(&self) -> u8 {
        self.base_bus
    }

    /// Returns the transport reaching every function below this bridge.
    #[must_use]
    pub fn cfg(&self) -> &Arc<dyn ConfigSpace> {
        &self.cfg
    }
}

impl DevFeature for RootBridge {
    fn name(&self) -> &'static str {
        "pci-root"
    }

    fn match_cid(&self, cid: &str) -> bool {
        matches!(cid, "PNP0A03" | "PNP0A08")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

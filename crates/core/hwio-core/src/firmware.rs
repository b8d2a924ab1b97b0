//! Firmware-described devices.
//!
//! The firmware-table collaborator hands the core a flat resource list and,
//! for bridges, a PCI routing table. Both are carried by the
//! [`FirmwareNode`] feature.

use alloc::string::String;
use alloc::vec::Vec;
use core::any::Any;

use hwio_driver_api::{FwResource, PrtEntry};

use crate::device::{glob_match, DevFeature};

/// The firmware description of one device.
#[derive(Debug, Clone, Default)]
pub struct FirmwareNode {
    /// Hardware id (e.g. `"PNP0A08"`).
    pub hid: Option<String>,
    /// Compatible ids.
    pub cids: Vec<String>,
    /// Address relative to the parent bus (`device << 16 | function`).
    pub adr: Option<u32>,
    /// Current resource settings.
    pub resources: Vec<FwResource>,
    /// PCI interrupt routing table, for bridges.
    pub prt: Vec<PrtEntry>,
}

impl FirmwareNode {
    /// Creates a node with hardware id `hid`.
    #[must_use]
    pub fn with_hid(hid: &str) -> Self {
        Self {
            hid: Some(String::from(hid)),
            ..Self::default()
        }
    }

    /// Adds a resource descriptor.
    #[must_use]
    pub fn resource(mut self, r: FwResource) -> Self {
        self.resources.push(r);
        self
    }

    /// Sets the routing table.
    #[must_use]
    pub fn routing(mut self, prt: Vec<PrtEntry>) -> Self {
        self.prt = prt;
        self
    }

    /// Sets the bus address.
    #[must_use]
    pub const fn at(mut self, adr: u32) -> Self {
        self.adr = Some(adr);
        self
    }
}

impl DevFeature for FirmwareNode {
    fn name(&self) -> &'static str {
        "firmware-node"
    }

    fn match_cid(&self, cid: &str) -> bool {
        self.hid.as_deref().is_some_and(|h| glob_match(cid, h)) || self.cids.iter().any(|c| c == cid)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

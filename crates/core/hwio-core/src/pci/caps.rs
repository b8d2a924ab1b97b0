//! PCI capability linked-list walker.
//!
//! Walks the list starting at the Capabilities Pointer register (offset
//! 0x34). Malformed lists that point back at an earlier entry are cut at
//! the first repeated offset.

use hwio_driver_api::PciAddress;
use log::warn;

use super::cfg::{CfgAddr, ConfigSpace};
use super::regs;

/// A raw PCI capability header: capability ID and its config-space offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCapability {
    /// PCI capability ID (e.g. 0x05 for MSI, 0x10 for PCI Express).
    pub id: u8,
    /// Config-space offset of this capability header.
    pub offset: u8,
}

/// Iterator over the capabilities of one function.
pub struct CapabilityIter<'a> {
    cfg: &'a dyn ConfigSpace,
    addr: CfgAddr,
    next_offset: u8,
    visited: u64,
}

impl Iterator for CapabilityIter<'_> {
    type Item = RawCapability;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next_offset & 0xFC;
        // Capabilities live after the 64-byte standard header.
        if offset < 0x40 {
            return None;
        }
        let bit = 1u64 << (offset / 4);
        if self.visited & bit != 0 {
            warn!(
                "pci: {}: capability list loops back to {offset:#x}",
                self.addr.function()
            );
            self.next_offset = 0;
            return None;
        }
        self.visited |= bit;

        let at = self.addr.at(u16::from(offset));
        let Ok(header) = self.cfg.read_u16(at) else {
            self.next_offset = 0;
            return None;
        };
        self.next_offset = (header >> 8) as u8;
        Some(RawCapability {
            id: header as u8,
            offset,
        })
    }
}

/// Returns an iterator over all capabilities of the function at `addr`.
///
/// Returns `None` if the function has no capabilities list (status
/// register bit 4 is clear) or the registers cannot be read.
pub fn walk_capabilities(cfg: &dyn ConfigSpace, addr: PciAddress) -> Option<CapabilityIter<'_>> {
    let base = CfgAddr::of(addr, 0);
    let status = cfg.read_u16(base.at(regs::STATUS)).ok()?;
    if status & regs::STATUS_CAPABILITIES_LIST == 0 {
        return None;
    }
    let cap_ptr = cfg.read_u8(base.at(regs::CAPABILITIES_PTR)).ok()?;
    Some(CapabilityIter {
        cfg,
        addr: base,
        next_offset: cap_ptr,
        visited: 0,
    })
}

/// Returns the offset of the first capability with `id`.
#[must_use]
pub fn find_capability(cfg: &dyn ConfigSpace, addr: PciAddress, id: u8) -> Option<u8> {
    walk_capabilities(cfg, addr)?
        .find(|c| c.id == id)
        .map(|c| c.offset)
}

// ---------------------------------------------------------------------------
// PCI Express capability
// ---------------------------------------------------------------------------

/// The fields of the PCI Express capability the walker cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcieCap {
    /// Config-space offset of the capability.
    pub offset: u8,
    /// Device/port type (capability register bits 7:4).
    pub port_type: u8,
    /// Number of function-number bits used as phantom functions (0..=3).
    pub phantom_fns: u8,
}

impl PcieCap {
    /// PCI Express endpoint.
    pub const TYPE_ENDPOINT: u8 = 0x0;
    /// Root port of a root complex.
    pub const TYPE_ROOT_PORT: u8 = 0x4;
    /// Upstream port of a switch.
    pub const TYPE_UPSTREAM: u8 = 0x5;
    /// Downstream port of a switch.
    pub const TYPE_DOWNSTREAM: u8 = 0x6;
    /// PCI Express to conventional PCI bridge.
    pub const TYPE_PCIE_TO_PCI: u8 = 0x7;

    /// Returns `true` if the secondary side of this port is a conventional
    /// PCI bus.
    #[must_use]
    pub const fn bridges_to_conventional(&self) -> bool {
        self.port_type == Self::TYPE_PCIE_TO_PCI
    }
}

/// Reads the PCI Express capability at `offset`.
#[must_use]
pub fn read_pcie_cap(cfg: &dyn ConfigSpace, addr: PciAddress, offset: u8) -> Option<PcieCap> {
    let base = CfgAddr::of(addr, u16::from(offset));
    let flags = cfg.read_u16(base.at(u16::from(offset) + 2)).ok()?;
    let devcap = cfg.read_u32(base.at(u16::from(offset) + 4)).ok()?;
    Some(PcieCap {
        offset,
        port_type: ((flags >> 4) & 0xF) as u8,
        phantom_fns: ((devcap >> 3) & 3) as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::sim::{SimFabric, SimFunction};

    #[test]
    fn walks_chain_in_order() {
        let fab = SimFabric::new();
        fab.insert(
            0,
            3,
            0,
            SimFunction::endpoint(0x1AF4, 0x1000, 0x02_0000)
                .with_caps(&[(0x40, regs::CAP_ID_MSIX), (0x50, regs::CAP_ID_VENDOR), (0x60, regs::CAP_ID_MSI)]),
        );
        let addr = PciAddress::new(0, 3, 0);
        let caps: Vec<_> = walk_capabilities(&fab, addr).unwrap().collect();
        assert_eq!(
            caps,
            vec![
                RawCapability { id: regs::CAP_ID_MSIX, offset: 0x40 },
                RawCapability { id: regs::CAP_ID_VENDOR, offset: 0x50 },
                RawCapability { id: regs::CAP_ID_MSI, offset: 0x60 },
            ]
        );
        assert_eq!(find_capability(&fab, addr, regs::CAP_ID_MSI), Some(0x60));
        assert_eq!(find_capability(&fab, addr, regs::CAP_ID_PCIE), None);
    }

    #[test]
    fn cyclic_chain_terminates() {
        let fab = SimFabric::new();
        // 0x40 -> 0x50 -> 0x40 -> ...
        let f = SimFunction::endpoint(0x1234, 0x5678, 0x0C_0300)
            .with_caps(&[(0x40, regs::CAP_ID_PM), (0x50, regs::CAP_ID_MSI)])
            .with_dword(0x50, 0x4000 | u32::from(regs::CAP_ID_MSI));
        fab.insert(0, 4, 0, f);
        let caps: Vec<_> = walk_capabilities(&fab, PciAddress::new(0, 4, 0)).unwrap().collect();
        assert_eq!(caps.len(), 2);
    }

    #[test]
    fn no_capability_list() {
        let fab = SimFabric::new();
        fab.insert(0, 5, 0, SimFunction::endpoint(0x1234, 0x5678, 0x01_0600));
        assert!(walk_capabilities(&fab, PciAddress::new(0, 5, 0)).is_none());
    }

    #[test]
    fn pcie_phantom_functions() {
        let fab = SimFabric::new();
        let f = SimFunction::endpoint(0x8086, 0x1234, 0x01_0802)
            .with_caps(&[(0x40, regs::CAP_ID_PCIE)])
            .with_dword(0x40, (0x0002 << 16) | u32::from(regs::CAP_ID_PCIE))
            .with_dword(0x44, 2 << 3);
        fab.insert(1, 0, 0, f);
        let addr = PciAddress::new(1, 0, 0);
        let off = find_capability(&fab, addr, regs::CAP_ID_PCIE).unwrap();
        let cap = read_pcie_cap(&fab, addr, off).unwrap();
        assert_eq!(cap.port_type, PcieCap::TYPE_ENDPOINT);
        assert_eq!(cap.phantom_fns, 2);
    }
}

//! DMA source identifiers.
//!
//! A table-based IOMMU identifies traffic by a source id that encodes what
//! the platform sees on the bus:
//!
//! - an endpoint: `0x40000 | bus << 8 | devfn`;
//! - everything forwarded by a conventional bridge, which takes ownership
//!   of the transactions of its whole downstream range:
//!   `0x80000 | secondary << 8 | subordinate`.
//!
//! A PCI Express function with phantom functions enabled may use the upper
//! function-number bits as extra tags, so it owns `1 << phantom` devfn
//! aliases.

use alloc::vec::Vec;

use hwio_driver_api::PciAddress;

/// Tag bit of an endpoint source id.
pub const SRC_ENDPOINT: u64 = 0x4_0000;
/// Tag bit of a bus-range source id.
pub const SRC_BUS: u64 = 0x8_0000;

/// Returns the source id of one endpoint devfn.
#[must_use]
pub const fn endpoint_source_id(bus: u8, devfn: u8) -> u64 {
    SRC_ENDPOINT | ((bus as u64) << 8) | devfn as u64
}

/// Returns the source id covering buses `secondary..=subordinate`.
#[must_use]
pub const fn bus_source_id(secondary: u8, subordinate: u8) -> u64 {
    SRC_BUS | ((secondary as u64) << 8) | subordinate as u64
}

/// Returns every devfn the function at `addr` may emit with `phantom`
/// phantom-function bits (0..=3).
#[must_use]
pub fn phantom_devfns(addr: PciAddress, phantom: u8) -> Vec<u8> {
    let phantom = phantom.min(3);
    let base = addr.devfn() & ((7 >> phantom) | 0xF8);
    (0..1u8 << phantom)
        .map(|i| base | (i << (3 - phantom)))
        .collect()
}

/// Returns the endpoint source ids of the function at `addr`.
#[must_use]
pub fn endpoint_source_ids(addr: PciAddress, phantom: u8) -> Vec<u64> {
    phantom_devfns(addr, phantom)
        .into_iter()
        .map(|devfn| endpoint_source_id(addr.bus, devfn))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encoding() {
        let a = PciAddress::new(2, 3, 1);
        assert_eq!(endpoint_source_id(a.bus, a.devfn()), 0x4_0219);
        assert_eq!(endpoint_source_ids(a, 0), vec![0x4_0219]);
    }

    #[test]
    fn bus_range_encoding() {
        assert_eq!(bus_source_id(3, 5), 0x8_0305);
    }

    #[test]
    fn phantom_aliases() {
        // devfn 0x18 (dev 3, fn 0) with one phantom bit: fn 0 and fn 4.
        let a = PciAddress::new(0, 3, 0);
        assert_eq!(phantom_devfns(a, 1), vec![0x18, 0x1C]);
        // Two phantom bits: function bit 0 stays, bits 2..1 vary.
        let b = PciAddress::new(0, 3, 1);
        assert_eq!(phantom_devfns(b, 2), vec![0x19, 0x1B, 0x1D, 0x1F]);
        // Three bits: all eight functions of the slot.
        assert_eq!(phantom_devfns(a, 3).len(), 8);
    }
}

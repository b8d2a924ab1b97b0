//! PCI configuration access, function probing and recursive bus discovery.
//!
//! Config space is reached through one of two [`ConfigSpace`] transports:
//! the legacy `0xCF8`/`0xCFC` port pair ([`PortTransport`]) or a memory-mapped
//! ECAM window ([`EcamTransport`]). Discovery starts at every root bridge and
//! recurses through PCI-PCI bridges, recording functions, BARs and bridge
//! windows as devices and resources in the [`HwContext`](crate::HwContext).

pub mod bar;
pub mod bridge;
pub mod caps;
pub mod cfg;
pub mod function;
pub mod root;
#[cfg(test)]
pub(crate) mod sim;
mod walk;

pub use bar::BarProbe;
pub use caps::{CapabilityIter, PcieCap, RawCapability};
pub use cfg::{CfgAddr, CfgError, CfgWidth, ConfigSpace, EcamTransport, PortIo, PortTransport};
pub use function::PciFunction;
pub use root::RootBridge;

/// Config-space register offsets and bits.
#[allow(missing_docs)]
pub mod regs {
    /// 16-bit.
    pub const VENDOR_ID: u16 = 0x00;
    /// 16-bit.
    pub const DEVICE_ID: u16 = 0x02;
    /// 16-bit, see [`PciCommand`](hwio_driver_api::PciCommand).
    pub const COMMAND: u16 = 0x04;
    /// 16-bit.
    pub const STATUS: u16 = 0x06;
    /// Low byte of the class/revision dword.
    pub const REVISION: u16 = 0x08;
    pub const PROG_IF: u16 = 0x09;
    pub const SUBCLASS: u16 = 0x0A;
    pub const CLASS: u16 = 0x0B;
    /// Bit 7 flags a multi-function slot.
    pub const HEADER_TYPE: u16 = 0x0E;
    /// First of six (type 0) or two (type 1) BAR dwords.
    pub const BAR0: u16 = 0x10;
    pub const SUBSYSTEM_VENDOR_ID: u16 = 0x2C;
    pub const SUBSYSTEM_DEVICE_ID: u16 = 0x2E;
    /// Expansion ROM BAR of a type 0 header.
    pub const ROM_BASE: u16 = 0x30;
    pub const CAPABILITIES_PTR: u16 = 0x34;
    /// Expansion ROM BAR of a type 1 header.
    pub const BRIDGE_ROM_BASE: u16 = 0x38;
    pub const INTERRUPT_LINE: u16 = 0x3C;
    pub const INTERRUPT_PIN: u16 = 0x3D;

    /// Primary, secondary, subordinate and latency bytes of a bridge.
    pub const PRIMARY_BUS: u16 = 0x18;
    pub const SUBORDINATE_BUS: u16 = 0x1A;
    /// I/O base and limit bytes of a bridge.
    pub const IO_BASE: u16 = 0x1C;
    /// Memory base/limit words of a bridge.
    pub const MEM_BASE: u16 = 0x20;
    /// Prefetchable base/limit words of a bridge.
    pub const PREF_MEM_BASE: u16 = 0x24;
    pub const PREF_BASE_UPPER: u16 = 0x28;
    pub const PREF_LIMIT_UPPER: u16 = 0x2C;
    /// Upper halves of the I/O base and limit.
    pub const IO_UPPER: u16 = 0x30;

    /// Status bit advertising a capability list.
    pub const STATUS_CAPABILITIES_LIST: u16 = 1 << 4;

    pub const CAP_ID_PM: u8 = 0x01;
    pub const CAP_ID_MSI: u8 = 0x05;
    pub const CAP_ID_VENDOR: u8 = 0x09;
    pub const CAP_ID_PCIE: u8 = 0x10;
    pub const CAP_ID_MSIX: u8 = 0x11;
}

/// Short label for a class/subclass pair, used in discovery logs.
#[must_use]
pub fn class_name(class: u8, subclass: u8) -> &'static str {
    match (class, subclass) {
        (0x01, 0x01) => "ide",
        (0x01, 0x06) => "sata",
        (0x01, 0x08) => "nvme",
        (0x01, _) => "storage",
        (0x02, _) => "network",
        (0x03, _) => "display",
        (0x04, _) => "multimedia",
        (0x06, 0x00) => "host bridge",
        (0x06, 0x01) => "isa bridge",
        (0x06, 0x04) => "pci bridge",
        (0x06, 0x07) => "cardbus bridge",
        (0x06, _) => "bridge",
        (0x08, _) => "system peripheral",
        (0x0C, 0x03) => "usb",
        (0x0C, 0x05) => "smbus",
        (0x0C, _) => "serial bus",
        _ => "other",
    }
}

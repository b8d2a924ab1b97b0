//! PCI function identity types for discovery and driver matching.

use bitflags::bitflags;

/// Location of a function on its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// Bus.
    pub bus: u8,
    /// Slot, five bits.
    pub device: u8,
    /// Function, three bits.
    pub function: u8,
}

impl PciAddress {
    /// Creates an address, masking device and function to their field widths.
    #[must_use]
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device: device & 0x1F,
            function: function & 0x07,
        }
    }

    /// Returns the combined device/function byte (`device << 3 | function`).
    #[must_use]
    pub const fn devfn(&self) -> u8 {
        (self.device << 3) | self.function
    }

    /// Builds an address from a bus number and a combined devfn byte.
    #[must_use]
    pub const fn from_devfn(bus: u8, devfn: u8) -> Self {
        Self::new(bus, devfn >> 3, devfn & 7)
    }

    /// Returns the firmware-style address value (`device << 16 | function`).
    #[must_use]
    pub const fn adr(&self) -> u32 {
        ((self.device as u32) << 16) | self.function as u32
    }

    /// Returns the 16-bit requester id (`bus << 8 | devfn`).
    #[must_use]
    pub const fn requester_id(&self) -> u16 {
        ((self.bus as u16) << 8) | self.devfn() as u16
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Configuration header layout of a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciHeaderKind {
    /// Type 0: an ordinary endpoint with six BARs.
    Normal,
    /// Type 1: a PCI-to-PCI bridge with two BARs and forwarding windows.
    PciBridge,
    /// Type 2: a CardBus bridge.
    CardBus,
    /// Any other (reserved) header type.
    Unknown(u8),
}

impl PciHeaderKind {
    /// Decodes the header type register, ignoring the multi-function bit.
    #[must_use]
    pub const fn from_raw(header_type: u8) -> Self {
        match header_type & 0x7F {
            0 => Self::Normal,
            1 => Self::PciBridge,
            2 => Self::CardBus,
            other => Self::Unknown(other),
        }
    }

    /// Returns the number of BAR slots this header layout carries.
    #[must_use]
    pub const fn bar_count(self) -> usize {
        match self {
            Self::Normal => 6,
            Self::PciBridge => 2,
            Self::CardBus => 1,
            Self::Unknown(_) => 0,
        }
    }
}

bitflags! {
    /// PCI command register bits (offset 0x04).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        /// Respond to I/O space accesses.
        const IO_SPACE = 1 << 0;
        /// Respond to memory space accesses.
        const MEMORY_SPACE = 1 << 1;
        /// Allow the function to initiate DMA.
        const BUS_MASTER = 1 << 2;
        /// Disable legacy INTx assertion.
        const INTX_DISABLE = 1 << 10;
    }
}

/// Id field value that matches anything.
pub const PCI_ANY_ID: u16 = 0xFFFF;

const fn id_matches(want: u16, have: u16) -> bool {
    want == PCI_ANY_ID || want == have
}

/// A driver match entry over the identification registers of a function.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceId {
    /// Vendor, or [`PCI_ANY_ID`].
    pub vendor: u16,
    /// Device, or [`PCI_ANY_ID`].
    pub device: u16,
    /// Subsystem vendor, or [`PCI_ANY_ID`].
    pub subvendor: u16,
    /// Subsystem device, or [`PCI_ANY_ID`].
    pub subdevice: u16,
    /// Packed class code to compare under `class_mask`.
    pub class: u32,
    /// Bits of the class code that must match; zero ignores the class.
    pub class_mask: u32,
}

impl PciDeviceId {
    const ANY: Self = Self {
        vendor: PCI_ANY_ID,
        device: PCI_ANY_ID,
        subvendor: PCI_ANY_ID,
        subdevice: PCI_ANY_ID,
        class: 0,
        class_mask: 0,
    };

    /// Matches one vendor/device pair under any subsystem.
    #[must_use]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self {
            vendor,
            device,
            ..Self::ANY
        }
    }

    /// Matches every function of a base class and subclass.
    #[must_use]
    pub const fn with_class(class: u8, subclass: u8) -> Self {
        Self {
            class: u32::from_be_bytes([0, class, subclass, 0]),
            class_mask: 0x00FF_FF00,
            ..Self::ANY
        }
    }

    /// Returns `true` if `info` satisfies every non-wildcard field.
    #[must_use]
    pub const fn matches(&self, info: &PciDeviceInfo) -> bool {
        id_matches(self.vendor, info.vendor_id)
            && id_matches(self.device, info.device_id)
            && id_matches(self.subvendor, info.subsystem_vendor_id)
            && id_matches(self.subdevice, info.subsystem_device_id)
            && (info.class_code() ^ self.class) & self.class_mask == 0
    }
}

/// One decoded BAR slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBar {
    /// A memory window.
    Memory {
        /// Programmed address.
        base: u64,
        /// Window length.
        size: u64,
        /// Prefetchable bit.
        prefetchable: bool,
        /// Set when the slot pairs with the next one for a 64-bit address.
        is_64bit: bool,
    },
    /// A port window.
    Io {
        /// Programmed port.
        base: u32,
        /// Window length.
        size: u32,
    },
    /// Upper half of the 64-bit memory BAR in the preceding slot.
    Continuation,
    /// BAR slot is unused or did not respond to sizing.
    Unused,
}

impl PciBar {
    /// Returns the window length, zero for slots without one.
    #[must_use]
    pub const fn size(&self) -> u64 {
        match *self {
            Self::Memory { size, .. } => size,
            Self::Io { size, .. } => size as u64,
            Self::Continuation | Self::Unused => 0,
        }
    }
}

/// Identification registers of a function, as read by the bus walker.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    /// Where the function lives.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Revision ID.
    pub revision: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Class code.
    pub class: u8,
    /// Raw header type register, multi-function bit included.
    pub header_type: u8,
    /// Subsystem vendor ID.
    pub subsystem_vendor_id: u16,
    /// Subsystem device ID.
    pub subsystem_device_id: u16,
    /// Line the firmware wrote into the interrupt line register.
    pub interrupt_line: u8,
    /// INTx pin, 1-based; zero when the function has none.
    pub interrupt_pin: u8,
    /// Decoded BAR slots; slots past the header's BAR count stay unused.
    pub bars: [PciBar; 6],
}

impl PciDeviceInfo {
    /// Returns the 24-bit class code (`class << 16 | subclass << 8 | prog_if`).
    #[must_use]
    pub const fn class_code(&self) -> u32 {
        ((self.class as u32) << 16) | ((self.subclass as u32) << 8) | self.prog_if as u32
    }

    /// Returns the decoded header layout.
    #[must_use]
    pub const fn header_kind(&self) -> PciHeaderKind {
        PciHeaderKind::from_raw(self.header_type)
    }

    /// Returns `true` if function 0 of this slot advertises further functions.
    #[must_use]
    pub const fn is_multi_function(&self) -> bool {
        self.header_type & 0x80 != 0
    }

    /// Returns `true` for PCI-to-PCI and subtractive-decode bridges.
    #[must_use]
    pub const fn is_pci_bridge(&self) -> bool {
        self.class == 0x06 && self.subclass == 0x04
    }

    /// Returns `true` for CardBus bridges.
    #[must_use]
    pub const fn is_cardbus_bridge(&self) -> bool {
        self.class == 0x06 && self.subclass == 0x07
    }

    /// Returns the packed subsystem id (`device << 16 | vendor`).
    #[must_use]
    pub const fn subsystem(&self) -> u32 {
        ((self.subsystem_device_id as u32) << 16) | self.subsystem_vendor_id as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vendor: u16, device: u16, class: u8, subclass: u8) -> PciDeviceInfo {
        PciDeviceInfo {
            address: PciAddress::new(0, 0, 0),
            vendor_id: vendor,
            device_id: device,
            revision: 0,
            prog_if: 0,
            subclass,
            class,
            header_type: 0,
            subsystem_vendor_id: 0,
            subsystem_device_id: 0,
            interrupt_line: 0,
            interrupt_pin: 0,
            bars: [PciBar::Unused; 6],
        }
    }

    #[test]
    fn vendor_device_entry_ignores_other_ids() {
        let id = PciDeviceId::new(0x1af4, 0x1041);
        assert!(id.matches(&info(0x1af4, 0x1041, 0x02, 0x00)));
        assert!(!id.matches(&info(0x1234, 0x1041, 0x02, 0x00)));
        assert!(!id.matches(&info(0x1af4, 0x1000, 0x02, 0x00)));
    }

    #[test]
    fn class_match() {
        let id = PciDeviceId::with_class(0x06, 0x04);
        assert!(id.matches(&info(0x8086, 0x244e, 0x06, 0x04)));
        assert!(!id.matches(&info(0x8086, 0x244e, 0x02, 0x00)));
    }

    #[test]
    fn devfn_packing() {
        let addr = PciAddress::new(3, 0x1f, 7);
        assert_eq!(addr.devfn(), 0xff);
        assert_eq!(PciAddress::from_devfn(3, 0xff), addr);
        assert_eq!(addr.adr(), 0x001f_0007);
        assert_eq!(addr.requester_id(), 0x03ff);
        assert_eq!(format!("{addr}"), "03:1f.7");
    }

    #[test]
    fn header_kind_ignores_multifunction_bit() {
        assert_eq!(PciHeaderKind::from_raw(0x81), PciHeaderKind::PciBridge);
        assert_eq!(PciHeaderKind::from_raw(0x02), PciHeaderKind::CardBus);
        assert_eq!(PciHeaderKind::from_raw(0x00).bar_count(), 6);
        assert_eq!(PciHeaderKind::from_raw(0x7f), PciHeaderKind::Unknown(0x7f));
    }

    #[test]
    fn info_helpers() {
        let mut bridge = info(0x8086, 0x244e, 0x06, 0x04);
        bridge.header_type = 0x81;
        bridge.prog_if = 0x01;
        bridge.subsystem_vendor_id = 0x1af4;
        bridge.subsystem_device_id = 0x1100;
        assert!(bridge.is_pci_bridge());
        assert!(bridge.is_multi_function());
        assert_eq!(bridge.class_code(), 0x0006_0401);
        assert_eq!(bridge.subsystem(), 0x1100_1af4);
    }
}

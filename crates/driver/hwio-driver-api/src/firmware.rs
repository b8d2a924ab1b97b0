//! Descriptors produced by the firmware-table collaborator.
//!
//! The core never parses firmware tables itself. A collaborator walks the
//! platform's tables and hands over two flat forms: a list of
//! [`FwResource`] descriptors per device, and the PCI routing table of a
//! bridge as [`PrtEntry`] values.

use alloc::string::String;

/// Interrupt trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqTrigger {
    /// Level-triggered.
    Level,
    /// Edge-triggered.
    Edge,
}

/// Interrupt polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqPolarity {
    /// Active-high / rising edge.
    High,
    /// Active-low / falling edge.
    Low,
}

/// Kind of range a firmware descriptor claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwResourceKind {
    /// Memory-mapped I/O range.
    Mmio,
    /// I/O port range.
    Io,
    /// Interrupt line (global system interrupt).
    Irq,
    /// PCI bus-number range.
    Bus,
    /// ISA DMA channel.
    Dma,
}

/// One resource descriptor from a device's current-resource list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwResource {
    /// Kind of range.
    pub kind: FwResourceKind,
    /// First address/line of the range (inclusive).
    pub start: u64,
    /// Last address/line of the range (inclusive).
    pub end: u64,
    /// Trigger mode (meaningful for [`FwResourceKind::Irq`] only).
    pub trigger: IrqTrigger,
    /// Polarity (meaningful for [`FwResourceKind::Irq`] only).
    pub polarity: IrqPolarity,
    /// Whether a memory range may be mapped prefetchable.
    pub prefetchable: bool,
}

impl FwResource {
    /// Creates a memory range of `length` bytes at `base`.
    #[must_use]
    pub const fn mmio(base: u64, length: u64) -> Self {
        Self::range(FwResourceKind::Mmio, base, length)
    }

    /// Creates an I/O port range of `length` ports at `base`.
    #[must_use]
    pub const fn io(base: u64, length: u64) -> Self {
        Self::range(FwResourceKind::Io, base, length)
    }

    /// Creates a bus-number range `first..=last`.
    #[must_use]
    pub const fn bus(first: u8, last: u8) -> Self {
        Self::range(FwResourceKind::Bus, first as u64, (last - first) as u64 + 1)
    }

    /// Creates a single interrupt line.
    #[must_use]
    pub const fn irq(gsi: u32, trigger: IrqTrigger, polarity: IrqPolarity) -> Self {
        Self {
            kind: FwResourceKind::Irq,
            start: gsi as u64,
            end: gsi as u64,
            trigger,
            polarity,
            prefetchable: false,
        }
    }

    const fn range(kind: FwResourceKind, base: u64, length: u64) -> Self {
        Self {
            kind,
            start: base,
            end: base + length.saturating_sub(1),
            trigger: IrqTrigger::Edge,
            polarity: IrqPolarity::High,
            prefetchable: false,
        }
    }
}

/// Where a routing-table entry delivers its interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrtSource {
    /// Hard-wired global system interrupt.
    Gsi(u32),
    /// A programmable link device, named by its firmware path or id.
    Link {
        /// Name of the link device (e.g. `"LNKA"`).
        name: String,
        /// Index into the link device's resource list.
        index: u32,
    },
}

/// One entry of a bridge's PCI interrupt routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrtEntry {
    /// Firmware address of the slot (`device << 16 | 0xFFFF`).
    pub adr: u32,
    /// Interrupt pin, 0 = INTA through 3 = INTD.
    pub pin: u8,
    /// Interrupt source.
    pub source: PrtSource,
    /// Trigger mode, used unless the link device reports its own.
    pub trigger: IrqTrigger,
    /// Polarity, used unless the link device reports its own.
    pub polarity: IrqPolarity,
}

impl PrtEntry {
    /// Creates an entry for a hard-wired interrupt with PCI defaults
    /// (level-triggered, active-low).
    #[must_use]
    pub const fn gsi(slot: u8, pin: u8, gsi: u32) -> Self {
        Self {
            adr: ((slot as u32) << 16) | 0xFFFF,
            pin,
            source: PrtSource::Gsi(gsi),
            trigger: IrqTrigger::Level,
            polarity: IrqPolarity::Low,
        }
    }

    /// Creates an entry routed through a link device with PCI defaults.
    #[must_use]
    pub fn link(slot: u8, pin: u8, name: &str) -> Self {
        Self {
            adr: ((slot as u32) << 16) | 0xFFFF,
            pin,
            source: PrtSource::Link {
                name: String::from(name),
                index: 0,
            },
            trigger: IrqTrigger::Level,
            polarity: IrqPolarity::Low,
        }
    }

    /// Returns the PCI device (slot) number this entry applies to.
    #[must_use]
    pub const fn slot(&self) -> u8 {
        ((self.adr >> 16) & 0x1F) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_constructors_are_inclusive() {
        let m = FwResource::mmio(0xFEB0_0000, 0x1000);
        assert_eq!(m.end, 0xFEB0_0FFF);
        let b = FwResource::bus(0, 0xFF);
        assert_eq!((b.start, b.end), (0, 0xFF));
        let z = FwResource::io(0x60, 0);
        assert_eq!(z.end, 0x60);
    }

    #[test]
    fn prt_entry_slot() {
        let e = PrtEntry::link(3, 1, "LNKA");
        assert_eq!(e.slot(), 3);
        assert_eq!(e.adr, 0x0003_FFFF);
        assert_eq!(e.trigger, IrqTrigger::Level);
        assert_eq!(e.polarity, IrqPolarity::Low);
        assert_eq!(PrtEntry::gsi(31, 0, 16).slot(), 31);
    }
}

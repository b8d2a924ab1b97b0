//! PCI-PCI bridge registers: bus numbers and forwarding windows.
//!
//! A bridge forwards three address windows to its secondary bus:
//! non-prefetchable memory ("WIN0"), prefetchable memory ("WIN1", optionally
//! 64-bit) and I/O ("WIN2"). A window whose base is above its limit is
//! closed; it is recorded as an empty movable resource so the allocator can
//! size and open it later.

use alloc::vec::Vec;

use hwio_driver_api::PciAddress;

use super::cfg::{CfgAddr, CfgError, ConfigSpace};
use super::regs;
use crate::resource::{Resource, ResourceFlags, ResourceType};

/// Memory windows have 1 MiB granularity.
pub const MEM_WINDOW_ALIGN: u64 = 0xF_FFFF;
/// I/O windows have 4 KiB granularity.
pub const IO_WINDOW_ALIGN: u64 = 0xFFF;

/// Primary, secondary and subordinate bus registers of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusNumbers {
    /// Bus the bridge sits on.
    pub primary: u8,
    /// First bus behind the bridge.
    pub secondary: u8,
    /// Last bus behind the bridge.
    pub subordinate: u8,
}

/// Reads the bus number registers of the bridge at `addr`.
///
/// # Errors
///
/// Propagates config-space access failures.
pub fn read_bus_numbers(cfg: &dyn ConfigSpace, addr: PciAddress) -> Result<BusNumbers, CfgError> {
    let v = cfg.read_u32(CfgAddr::of(addr, regs::PRIMARY_BUS))?;
    Ok(BusNumbers {
        primary: v as u8,
        secondary: (v >> 8) as u8,
        subordinate: (v >> 16) as u8,
    })
}

/// Writes the bus number registers, keeping the secondary latency timer.
///
/// # Errors
///
/// Propagates config-space access failures.
pub fn write_bus_numbers(cfg: &dyn ConfigSpace, addr: PciAddress, buses: BusNumbers) -> Result<(), CfgError> {
    let reg = CfgAddr::of(addr, regs::PRIMARY_BUS);
    let latency = cfg.read_u32(reg)? & 0xFF00_0000;
    cfg.write_u32(
        reg,
        latency
            | (u32::from(buses.subordinate) << 16)
            | (u32::from(buses.secondary) << 8)
            | u32::from(buses.primary),
    )
}

/// Writes only the subordinate bus register.
///
/// # Errors
///
/// Propagates config-space access failures.
pub fn write_subordinate(cfg: &dyn ConfigSpace, addr: PciAddress, subordinate: u8) -> Result<(), CfgError> {
    cfg.write_u8(CfgAddr::of(addr, regs::SUBORDINATE_BUS), subordinate)
}

fn window(ty: ResourceType, base: u64, limit: u64, align: u64, id: &'static str) -> Resource {
    if base > limit {
        Resource::new(ty, 0, 0)
            .with_flags(ResourceFlags::EMPTY | ResourceFlags::CAN_MOVE)
            .with_align(align)
            .with_id(id)
    } else {
        Resource::new(ty, base, limit).with_align(align).with_id(id)
    }
}

/// Decodes the three forwarding windows of the bridge at `addr`.
///
/// Programmed windows are fixed; closed windows are empty and movable.
///
/// # Errors
///
/// Propagates config-space access failures.
pub fn read_windows(cfg: &dyn ConfigSpace, addr: PciAddress) -> Result<Vec<Resource>, CfgError> {
    let at = |reg| CfgAddr::of(addr, reg);

    let mem = cfg.read_u32(at(regs::MEM_BASE))?;
    let mem_base = u64::from(mem & 0xFFF0) << 16;
    let mem_limit = (u64::from((mem >> 16) & 0xFFF0) << 16) | 0xF_FFFF;
    let win0 = window(ResourceType::Mmio, mem_base, mem_limit, MEM_WINDOW_ALIGN, "WIN0");

    let pref = cfg.read_u32(at(regs::PREF_MEM_BASE))?;
    let is_64 = pref & 0xF == 1;
    let (mut pbase, mut plimit) = (
        u64::from(pref & 0xFFF0) << 16,
        (u64::from((pref >> 16) & 0xFFF0) << 16) | 0xF_FFFF,
    );
    if is_64 {
        pbase |= u64::from(cfg.read_u32(at(regs::PREF_BASE_UPPER))?) << 32;
        plimit |= u64::from(cfg.read_u32(at(regs::PREF_LIMIT_UPPER))?) << 32;
    }
    let mut win1 = window(ResourceType::Mmio, pbase, plimit, MEM_WINDOW_ALIGN, "WIN1")
        .with_flags(ResourceFlags::PREFETCHABLE);
    if is_64 {
        win1 = win1.with_flags(ResourceFlags::WIDTH_64);
    }

    let io = cfg.read_u16(at(regs::IO_BASE))?;
    let (io_base_lo, io_limit_lo) = (io & 0xFF, io >> 8);
    let mut io_base = u64::from(io_base_lo & 0xF0) << 8;
    let mut io_limit = (u64::from(io_limit_lo & 0xF0) << 8) | 0xFFF;
    if io_base_lo & 0xF == 1 {
        let upper = cfg.read_u32(at(regs::IO_UPPER))?;
        io_base |= u64::from(upper & 0xFFFF) << 16;
        io_limit |= u64::from(upper >> 16) << 16;
    }
    let win2 = window(ResourceType::Io, io_base, io_limit, IO_WINDOW_ALIGN, "WIN2");

    Ok(alloc::vec![win0, win1, win2])
}

/// Programs a window resource back into the bridge registers.
///
/// Disabled or empty windows are closed (base above limit).
///
/// # Errors
///
/// Propagates config-space access failures.
pub fn program_window(cfg: &dyn ConfigSpace, addr: PciAddress, r: &Resource) -> Result<(), CfgError> {
    let at = |reg| CfgAddr::of(addr, reg);
    let open = !r.is_empty() && !r.is_disabled() && r.size() > 0;
    let (start, end) = if open { (r.start(), r.end()) } else { (u64::MAX, 0) };

    match (r.ty(), r.id()) {
        (ResourceType::Mmio, Some("WIN0")) => {
            let base = ((start >> 16) as u32) & 0xFFF0;
            let limit = ((end >> 16) as u32) & 0xFFF0;
            cfg.write_u32(at(regs::MEM_BASE), (limit << 16) | base)
        }
        (ResourceType::Mmio, Some("WIN1")) => {
            let low = cfg.read_u32(at(regs::PREF_MEM_BASE))? & 0x000F_000F;
            let base = ((start >> 16) as u32) & 0xFFF0;
            let limit = ((end >> 16) as u32) & 0xFFF0;
            cfg.write_u32(at(regs::PREF_MEM_BASE), (limit << 16) | base | low)?;
            if low & 0xF == 1 {
                cfg.write_u32(at(regs::PREF_BASE_UPPER), (start >> 32) as u32)?;
                cfg.write_u32(at(regs::PREF_LIMIT_UPPER), (end >> 32) as u32)?;
            }
            Ok(())
        }
        (ResourceType::Io, Some("WIN2")) => {
            let low = cfg.read_u16(at(regs::IO_BASE))? & 0x0F0F;
            let base = ((start >> 8) as u16) & 0xF0;
            let limit = ((end >> 8) as u16) & 0xF0;
            cfg.write_u16(at(regs::IO_BASE), (limit << 8) | base | low)?;
            if low & 0xF == 1 {
                let upper = (((end >> 16) as u32 & 0xFFFF) << 16) | ((start >> 16) as u32 & 0xFFFF);
                cfg.write_u32(at(regs::IO_UPPER), upper)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::sim::{SimFabric, SimFunction};

    #[test]
    fn closed_windows_are_empty_and_movable() {
        let fab = SimFabric::new();
        fab.insert(0, 1, 0, SimFunction::bridge(0x8086, 0x244E));
        let wins = read_windows(&fab, PciAddress::new(0, 1, 0)).unwrap();
        assert_eq!(wins.len(), 3);
        for w in &wins {
            assert!(w.is_empty());
            assert!(!w.is_fixed());
        }
        assert!(wins[1].is_prefetchable());
        assert_eq!(wins[2].ty(), ResourceType::Io);
        assert_eq!(wins[0].alignment(), MEM_WINDOW_ALIGN);
    }

    #[test]
    fn programmed_windows_decode() {
        let fab = SimFabric::new();
        let f = SimFunction::bridge(0x8086, 0x244E)
            .with_dword(regs::MEM_BASE, 0xFE10_FE00)
            .with_dword(regs::PREF_MEM_BASE, 0xC01F_C001)
            .with_dword(regs::PREF_BASE_UPPER, 0x1)
            .with_dword(regs::PREF_LIMIT_UPPER, 0x1)
            .with_dword(regs::IO_BASE, 0x0000_D0C0);
        fab.insert(0, 1, 0, f);
        let wins = read_windows(&fab, PciAddress::new(0, 1, 0)).unwrap();
        assert_eq!((wins[0].start(), wins[0].end()), (0xFE00_0000, 0xFE1F_FFFF));
        assert!(wins[0].is_fixed());
        assert_eq!((wins[1].start(), wins[1].end()), (0x1_C000_0000, 0x1_C01F_FFFF));
        assert!(wins[1].flags().contains(ResourceFlags::WIDTH_64));
        assert_eq!((wins[2].start(), wins[2].end()), (0xC000, 0xDFFF));
    }

    #[test]
    fn window_programming_round_trips() {
        let fab = SimFabric::new();
        fab.insert(0, 1, 0, SimFunction::bridge(0x8086, 0x244E));
        let addr = PciAddress::new(0, 1, 0);
        let mut w = Resource::new(ResourceType::Mmio, 0, 0).with_id("WIN0");
        w.set_range(0xE000_0000, 0x30_0000);
        program_window(&fab, addr, &w).unwrap();
        let mut io = Resource::new(ResourceType::Io, 0, 0).with_id("WIN2");
        io.set_range(0x3000, 0x1000);
        program_window(&fab, addr, &io).unwrap();

        let wins = read_windows(&fab, addr).unwrap();
        assert_eq!((wins[0].start(), wins[0].end()), (0xE000_0000, 0xE02F_FFFF));
        assert_eq!((wins[2].start(), wins[2].end()), (0x3000, 0x3FFF));
        assert!(wins[1].is_empty());
    }

    #[test]
    fn bus_numbers_keep_latency_timer() {
        let fab = SimFabric::new();
        fab.insert(0, 1, 0, SimFunction::bridge(0x8086, 0x244E).with_dword(regs::PRIMARY_BUS, 0x4000_0000));
        let addr = PciAddress::new(0, 1, 0);
        write_bus_numbers(&fab, addr, BusNumbers { primary: 0, secondary: 2, subordinate: 2 }).unwrap();
        write_subordinate(&fab, addr, 5).unwrap();
        assert_eq!(
            read_bus_numbers(&fab, addr),
            Ok(BusNumbers { primary: 0, secondary: 2, subordinate: 5 })
        );
        assert_eq!(fab.peek(0, 1, 0, regs::PRIMARY_BUS), 0x4005_0200);
    }
}

//! Base Address Register sizing.
//!
//! Each BAR is sized by saving it, writing all-ones, reading the size mask
//! back and restoring the saved value. Memory and I/O decoding is switched
//! off for the duration so the function never decodes the transient
//! all-ones address.

use alloc::vec::Vec;

use hwio_driver_api::{PciAddress, PciBar, PciCommand};
use log::{debug, warn};

use super::cfg::{CfgAddr, CfgError, ConfigSpace};
use super::regs;
use crate::resource::{Resource, ResourceFlags, ResourceType};

/// Resource ids of the six BAR slots.
pub const BAR_IDS: [&str; 6] = ["BAR0", "BAR1", "BAR2", "BAR3", "BAR4", "BAR5"];

/// Returns the BAR slot named by a resource id.
#[must_use]
pub fn bar_slot(id: &str) -> Option<usize> {
    BAR_IDS.iter().position(|&b| b == id)
}

/// Result of sizing all BARs of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarProbe {
    /// Decoded slots.
    pub bars: [PciBar; 6],
    /// Bit `i` is set if slot `i` could not be probed.
    pub failed: u8,
}

/// An expansion ROM found by [`probe_rom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomBar {
    /// Register holding the ROM base (0x30 or 0x38).
    pub reg: u16,
    /// Programmed base address.
    pub base: u32,
    /// Decoded size in bytes.
    pub size: u32,
}

/// Runs `f` with memory and I/O decoding switched off, then restores the
/// command register.
fn with_decoders_off<T>(
    cfg: &dyn ConfigSpace,
    addr: PciAddress,
    f: impl FnOnce() -> T,
) -> Result<T, CfgError> {
    let cmd_reg = CfgAddr::of(addr, regs::COMMAND);
    let cmd = cfg.read_u16(cmd_reg)?;
    let decode = PciCommand::IO_SPACE | PciCommand::MEMORY_SPACE;
    cfg.write_u16(cmd_reg, cmd & !decode.bits())?;
    let out = f();
    cfg.write_u16(cmd_reg, cmd)?;
    Ok(out)
}

fn size_register(cfg: &dyn ConfigSpace, reg: CfgAddr, ones: u32) -> Result<(u32, u32), CfgError> {
    let original = cfg.read_u32(reg)?;
    cfg.write_u32(reg, ones)?;
    let sizing = cfg.read_u32(reg);
    cfg.write_u32(reg, original)?;
    Ok((original, sizing?))
}

/// Sizes slot `i`; returns the decoded BAR and how many slots it used.
fn probe_slot(cfg: &dyn ConfigSpace, addr: PciAddress, i: usize, count: usize) -> Result<(PciBar, usize), CfgError> {
    let reg = CfgAddr::of(addr, regs::BAR0 + (i as u16) * 4);
    let (original, sizing) = size_register(cfg, reg, 0xFFFF_FFFF)?;
    if sizing == 0 || sizing == 0xFFFF_FFFF {
        return Ok((PciBar::Unused, 1));
    }

    if original & 1 != 0 {
        let mask = sizing & !0x03;
        let size = (!mask).wrapping_add(1) & 0xFFFF;
        if size == 0 {
            return Ok((PciBar::Unused, 1));
        }
        return Ok((
            PciBar::Io {
                base: original & !0x03,
                size,
            },
            1,
        ));
    }

    let prefetchable = original & 0x08 != 0;
    let is_64bit = (original >> 1) & 0x03 == 2;
    if is_64bit {
        if i + 1 >= count {
            warn!("pci: {addr}: 64-bit BAR{i} has no upper slot, ignoring it");
            return Ok((PciBar::Unused, 1));
        }
        let hi = reg.at(reg.reg + 4);
        let (original_high, sizing_high) = size_register(cfg, hi, 0xFFFF_FFFF)?;
        let mask = (u64::from(sizing_high) << 32) | u64::from(sizing & !0x0F);
        if mask == 0 {
            return Ok((PciBar::Unused, 2));
        }
        let base = (u64::from(original_high) << 32) | u64::from(original & !0x0F);
        return Ok((
            PciBar::Memory {
                base,
                size: (!mask).wrapping_add(1),
                prefetchable,
                is_64bit: true,
            },
            2,
        ));
    }

    let mask = sizing & !0x0F;
    if mask == 0 {
        return Ok((PciBar::Unused, 1));
    }
    Ok((
        PciBar::Memory {
            base: u64::from(original & !0x0F),
            size: u64::from((!mask).wrapping_add(1)),
            prefetchable,
            is_64bit: false,
        },
        1,
    ))
}

/// Sizes the first `count` BARs of the function at `addr`.
///
/// A slot that cannot be read is reported in [`BarProbe::failed`]; the
/// remaining slots are still probed.
///
/// # Errors
///
/// Fails only if the command register itself is unreachable.
pub fn probe_bars(cfg: &dyn ConfigSpace, addr: PciAddress, count: usize) -> Result<BarProbe, CfgError> {
    with_decoders_off(cfg, addr, || {
        let mut probe = BarProbe {
            bars: [PciBar::Unused; 6],
            failed: 0,
        };
        let count = count.min(6);
        let mut i = 0;
        while i < count {
            match probe_slot(cfg, addr, i, count) {
                Ok((bar, used)) => {
                    probe.bars[i] = bar;
                    if used == 2 && bar != PciBar::Unused {
                        probe.bars[i + 1] = PciBar::Continuation;
                    }
                    i += used;
                }
                Err(err) => {
                    warn!("pci: {addr}: BAR{i} probe failed: {err}");
                    probe.failed |= 1 << i;
                    i += 1;
                }
            }
        }
        probe
    })
}

/// Sizes the expansion ROM register `reg` (0x30 or 0x38).
///
/// # Errors
///
/// Fails if the command or ROM register is unreachable.
pub fn probe_rom(cfg: &dyn ConfigSpace, addr: PciAddress, reg: u16) -> Result<Option<RomBar>, CfgError> {
    let rom = CfgAddr::of(addr, reg);
    let (original, sizing) = with_decoders_off(cfg, addr, || size_register(cfg, rom, 0xFFFF_F800))??;
    let mask = sizing & 0xFFFF_F800;
    if mask == 0 {
        return Ok(None);
    }
    Ok(Some(RomBar {
        reg,
        base: original & 0xFFFF_F800,
        size: (!mask).wrapping_add(1),
    }))
}

fn place_or_defer(r: Resource, base: u64, size: u64) -> Resource {
    if base == 0 {
        r
    } else {
        let mut r = r;
        r.set_range(base, size);
        r
    }
}

/// Converts probed BARs into resources owned by the function.
///
/// BARs the firmware programmed keep their address but stay movable; a zero
/// base leaves the BAR for the allocator. The upper slot of a 64-bit BAR
/// becomes a continuation that is never allocated on its own.
#[must_use]
pub fn bar_resources(probe: &BarProbe) -> Vec<Resource> {
    let mut out = Vec::new();
    for (i, bar) in probe.bars.iter().enumerate() {
        if probe.failed & (1 << i) != 0 {
            out.push(
                Resource::new(ResourceType::Mmio, 0, 0)
                    .with_flags(ResourceFlags::DISABLED | ResourceFlags::EMPTY)
                    .with_id(BAR_IDS[i]),
            );
            continue;
        }
        let r = match *bar {
            PciBar::Memory {
                base,
                size,
                prefetchable,
                is_64bit,
            } => {
                let mut r = Resource::movable(ResourceType::Mmio, size, 0)
                    .with_flags(ResourceFlags::SIZE_ALIGNED);
                if prefetchable {
                    r = r.with_flags(ResourceFlags::PREFETCHABLE);
                }
                if is_64bit {
                    r = r.with_flags(ResourceFlags::WIDTH_64);
                }
                place_or_defer(r, base, size)
            }
            PciBar::Io { base, size } => {
                let r = Resource::movable(ResourceType::Io, u64::from(size), 0)
                    .with_flags(ResourceFlags::SIZE_ALIGNED);
                place_or_defer(r, u64::from(base), u64::from(size))
            }
            PciBar::Continuation => Resource::new(ResourceType::Mmio, 0, 0)
                .with_flags(ResourceFlags::CONTINUATION | ResourceFlags::EMPTY),
            PciBar::Unused => continue,
        };
        debug!("pci: BAR{i}: {r}");
        out.push(r.with_id(BAR_IDS[i]));
    }
    out
}

/// Converts a probed ROM into a resource.
#[must_use]
pub fn rom_resource(rom: &RomBar) -> Resource {
    let size = u64::from(rom.size);
    let r = Resource::movable(ResourceType::Mmio, size, 0)
        .with_flags(ResourceFlags::SIZE_ALIGNED | ResourceFlags::ROM | ResourceFlags::PREFETCHABLE)
        .with_id("ROM");
    place_or_defer(r, u64::from(rom.base), size)
}

/// Writes the start of an allocated BAR resource back into slot `slot`.
///
/// # Errors
///
/// Propagates config-space access failures.
pub fn program_bar(cfg: &dyn ConfigSpace, addr: PciAddress, slot: usize, r: &Resource) -> Result<(), CfgError> {
    let reg = CfgAddr::of(addr, regs::BAR0 + (slot as u16) * 4);
    let low = cfg.read_u32(reg)?;
    let flag_mask = if r.ty() == ResourceType::Io { 0x3 } else { 0xF };
    cfg.write_u32(reg, (r.start() as u32 & !flag_mask) | (low & flag_mask))?;
    if r.flags().contains(ResourceFlags::WIDTH_64) {
        cfg.write_u32(reg.at(reg.reg + 4), (r.start() >> 32) as u32)?;
    }
    Ok(())
}

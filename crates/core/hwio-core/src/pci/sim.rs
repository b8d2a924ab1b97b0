//! Simulated PCI fabric for unit tests.
//!
//! Functions are keyed by their literal (bus, device, function) triple.
//! Each 32-bit register has a write mask: identification registers are
//! read-only, BARs only keep their size-mask bits, and the command register
//! keeps the decode and bus-master bits. Missing functions read as all-ones.

use alloc::collections::BTreeMap;

use spin::Mutex;

use super::cfg::{CfgAddr, CfgError, CfgWidth, ConfigSpace};
use super::regs;

/// One emulated function: 256 bytes of config space plus write masks.
#[derive(Clone)]
pub struct SimFunction {
    cfg: [u32; 64],
    wmask: [u32; 64],
}

impl SimFunction {
    fn with_header(vendor: u16, device: u16, class_code: u32, header: u8) -> Self {
        let mut f = Self {
            cfg: [0; 64],
            wmask: [0xFFFF_FFFF; 64],
        };
        f.cfg[0] = (u32::from(device) << 16) | u32::from(vendor);
        f.wmask[0] = 0;
        f.cfg[2] = class_code << 8;
        f.wmask[2] = 0;
        f.cfg[3] = u32::from(header) << 16;
        f.wmask[3] = 0x0000_FFFF;
        // Command: I/O, memory, bus master, INTx disable. Status read-only.
        f.wmask[1] = 0x0000_0407;
        // Unimplemented BARs and ROM read as zero.
        let bars = if header == 0 { 0..6 } else { 0..2 };
        for i in bars {
            f.wmask[4 + i] = 0;
        }
        if header == 0 {
            f.wmask[12] = 0;
        } else {
            f.wmask[14] = 0;
        }
        f
    }

    /// Creates a type 0 function with `class_code` = class/subclass/prog-if.
    pub fn endpoint(vendor: u16, device: u16, class_code: u32) -> Self {
        Self::with_header(vendor, device, class_code, 0)
    }

    /// Creates a PCI-PCI bridge (class 0x0604, header type 1).
    pub fn bridge(vendor: u16, device: u16) -> Self {
        let mut f = Self::with_header(vendor, device, 0x06_0400, 1);
        // Closed windows: base above limit.
        f.cfg[7] = 0x0000_00F0;
        f.cfg[8] = 0x0000_FFF0;
        f.cfg[9] = 0x0000_FFF0;
        f
    }

    /// Creates a CardBus bridge (class 0x0607, header type 2).
    pub fn cardbus(vendor: u16, device: u16) -> Self {
        Self::with_header(vendor, device, 0x06_0700, 2)
    }

    /// Sets the multi-function bit of the header type.
    pub fn multi_function(mut self) -> Self {
        self.cfg[3] |= 0x80 << 16;
        self
    }

    /// Implements memory BAR `idx` of `size` bytes at `base`.
    pub fn with_mem_bar(mut self, idx: usize, base: u32, size: u32, prefetch: bool) -> Self {
        let flags = if prefetch { 0x8 } else { 0 };
        self.cfg[4 + idx] = (base & !0xF) | flags;
        self.wmask[4 + idx] = !(size - 1) & !0xF;
        self
    }

    /// Implements a 64-bit memory BAR in slots `idx` and `idx + 1`.
    pub fn with_mem64_bar(mut self, idx: usize, base: u64, size: u64, prefetch: bool) -> Self {
        let flags = if prefetch { 0xC } else { 0x4 };
        let mask = !(size - 1);
        self.cfg[4 + idx] = (base as u32 & !0xF) | flags;
        self.wmask[4 + idx] = mask as u32 & !0xF;
        self.cfg[5 + idx] = (base >> 32) as u32;
        self.wmask[5 + idx] = (mask >> 32) as u32;
        self
    }

    /// Implements I/O BAR `idx` of `size` ports at `base`.
    pub fn with_io_bar(mut self, idx: usize, base: u32, size: u32) -> Self {
        self.cfg[4 + idx] = (base & !0x3) | 0x1;
        self.wmask[4 + idx] = !(size - 1) & 0xFFFF_FFFC;
        self
    }

    /// Implements an expansion ROM of `size` bytes (type 0 header).
    pub fn with_rom(mut self, size: u32) -> Self {
        self.wmask[12] = (!(size - 1) & 0xFFFF_F800) | 1;
        self
    }

    /// Sets the interrupt pin (1 = INTA).
    pub fn with_irq_pin(mut self, pin: u8) -> Self {
        self.cfg[15] = (self.cfg[15] & !0xFF00) | (u32::from(pin) << 8);
        self
    }

    /// Links capabilities `(offset, id)` in order and sets the status bit.
    pub fn with_caps(mut self, caps: &[(u8, u8)]) -> Self {
        self.cfg[1] |= u32::from(regs::STATUS_CAPABILITIES_LIST) << 16;
        if let Some(&(first, _)) = caps.first() {
            self.cfg[13] = u32::from(first);
        }
        for (i, &(off, id)) in caps.iter().enumerate() {
            let next = caps.get(i + 1).map_or(0, |&(n, _)| n);
            let d = usize::from(off) / 4;
            self.cfg[d] = (self.cfg[d] & !0xFFFF) | (u32::from(next) << 8) | u32::from(id);
        }
        self
    }

    /// Writes a raw dword, bypassing the write mask.
    pub fn with_dword(mut self, reg: u16, value: u32) -> Self {
        self.cfg[usize::from(reg) / 4] = value;
        self
    }

    /// Makes the bus-master command bit hard-wired to zero.
    pub fn without_bus_master(mut self) -> Self {
        self.wmask[1] &= !0x4;
        self
    }

    /// Sets the bridge bus registers.
    pub fn with_buses(mut self, primary: u8, secondary: u8, subordinate: u8) -> Self {
        self.cfg[6] = (self.cfg[6] & 0xFF00_0000)
            | (u32::from(subordinate) << 16)
            | (u32::from(secondary) << 8)
            | u32::from(primary);
        self
    }
}

/// A set of emulated functions behind one transport.
#[derive(Default)]
pub struct SimFabric {
    funcs: Mutex<BTreeMap<(u8, u8, u8), SimFunction>>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bus: u8, dev: u8, func: u8, f: SimFunction) {
        self.funcs.lock().insert((bus, dev, func), f);
    }

    /// Returns the raw dword at `reg` of a function.
    pub fn peek(&self, bus: u8, dev: u8, func: u8, reg: u16) -> u32 {
        self.funcs
            .lock()
            .get(&(bus, dev, func))
            .map_or(0xFFFF_FFFF, |f| f.cfg[usize::from(reg) / 4])
    }
}

impl ConfigSpace for SimFabric {
    fn read(&self, addr: CfgAddr, width: CfgWidth) -> Result<u32, CfgError> {
        if addr.reg % width.bytes() != 0 {
            return Err(CfgError::Unaligned);
        }
        if addr.reg > 0xFF {
            return Ok(width.ones());
        }
        let funcs = self.funcs.lock();
        let Some(f) = funcs.get(&(addr.bus, addr.dev, addr.func)) else {
            return Ok(width.ones());
        };
        let shift = u32::from(addr.reg & 3) * 8;
        Ok((f.cfg[usize::from(addr.reg) / 4] >> shift) & width.ones())
    }

    fn write(&self, addr: CfgAddr, value: u32, width: CfgWidth) -> Result<(), CfgError> {
        if addr.reg % width.bytes() != 0 {
            return Err(CfgError::Unaligned);
        }
        if addr.reg > 0xFF {
            return Ok(());
        }
        let mut funcs = self.funcs.lock();
        let Some(f) = funcs.get_mut(&(addr.bus, addr.dev, addr.func)) else {
            return Ok(());
        };
        let d = usize::from(addr.reg) / 4;
        let shift = u32::from(addr.reg & 3) * 8;
        let lane = (width.ones() << shift) & f.wmask[d];
        f.cfg[d] = (f.cfg[d] & !lane) | ((value << shift) & lane);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_read_only_and_bars_masked() {
        let fab = SimFabric::new();
        fab.insert(0, 1, 0, SimFunction::endpoint(0x8086, 0x100E, 0x02_0000).with_mem_bar(0, 0xFEB0_0000, 0x2_0000, false));
        let a = CfgAddr::new(0, 1, 0, 0);
        fab.write_u32(a, 0).unwrap();
        assert_eq!(fab.read_u16(a), Ok(0x8086));
        fab.write_u32(a.at(regs::BAR0), 0xFFFF_FFFF).unwrap();
        assert_eq!(fab.read_u32(a.at(regs::BAR0)), Ok(0xFFFE_0000));
        assert_eq!(fab.read_u16(CfgAddr::new(0, 2, 0, 0)), Ok(0xFFFF));
    }
}

//! Configuration-space transports.
//!
//! [`ConfigSpace`] is the single interface the walker uses. Two transports
//! implement it:
//!
//! - [`PortTransport`]: the legacy `0xCF8` address / `0xCFC` data port pair.
//!   The pair is machine-wide state, so every index/data sequence runs under
//!   a [`spin::Mutex`].
//! - [`EcamTransport`]: a memory-mapped window covering `bus_count` buses
//!   starting at `base_bus`. Each root bridge owns its window, so no lock is
//!   taken.

use core::fmt;

use hwio_driver_api::{HwError, PciAddress};
use log::trace;
use spin::Mutex;

/// A config-space register of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgAddr {
    /// Bus number.
    pub bus: u8,
    /// Device (slot) number, 0..=31.
    pub dev: u8,
    /// Function number, 0..=7.
    pub func: u8,
    /// Register offset.
    pub reg: u16,
}

impl CfgAddr {
    /// Creates an address, masking device and function to their widths.
    #[must_use]
    pub const fn new(bus: u8, dev: u8, func: u8, reg: u16) -> Self {
        Self {
            bus,
            dev: dev & 0x1F,
            func: func & 0x07,
            reg,
        }
    }

    /// Returns register `reg` of the function at `addr`.
    #[must_use]
    pub const fn of(addr: PciAddress, reg: u16) -> Self {
        Self::new(addr.bus, addr.device, addr.function, reg)
    }

    /// Returns the same function at a different register.
    #[must_use]
    pub const fn at(self, reg: u16) -> Self {
        Self { reg, ..self }
    }

    /// Returns the function address without the register.
    #[must_use]
    pub const fn function(self) -> PciAddress {
        PciAddress::new(self.bus, self.dev, self.func)
    }
}

impl fmt::Display for CfgAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#05x}", self.function(), self.reg)
    }
}

/// Access width of a config-space read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgWidth {
    /// 8 bits.
    U8,
    /// 16 bits.
    U16,
    /// 32 bits.
    U32,
}

impl CfgWidth {
    /// Returns the access size in bytes.
    #[must_use]
    pub const fn bytes(self) -> u16 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Returns the all-ones value of this width.
    #[must_use]
    pub const fn ones(self) -> u32 {
        match self {
            Self::U8 => 0xFF,
            Self::U16 => 0xFFFF,
            Self::U32 => 0xFFFF_FFFF,
        }
    }
}

/// Config-space access failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgError {
    /// The bus is not covered by the transport or the register is past the
    /// end of the function's config space.
    OutOfRange,
    /// The register offset is not a multiple of the access width.
    Unaligned,
    /// No function responds at this address.
    NoDevice,
}

impl fmt::Display for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => f.write_str("config address out of range"),
            Self::Unaligned => f.write_str("unaligned config access"),
            Self::NoDevice => f.write_str("no device at config address"),
        }
    }
}

impl From<CfgError> for HwError {
    fn from(err: CfgError) -> Self {
        match err {
            CfgError::OutOfRange | CfgError::NoDevice => Self::NotFound,
            CfgError::Unaligned => Self::InvalidArgument,
        }
    }
}

const fn check_aligned(addr: CfgAddr, width: CfgWidth) -> Result<(), CfgError> {
    if addr.reg % width.bytes() == 0 {
        Ok(())
    } else {
        Err(CfgError::Unaligned)
    }
}

/// Access to the configuration space behind one root bridge.
pub trait ConfigSpace: Send + Sync {
    /// Reads `width` bits at `addr`.
    ///
    /// # Errors
    ///
    /// Returns a [`CfgError`] if the address is outside the transport's
    /// reach or misaligned.
    fn read(&self, addr: CfgAddr, width: CfgWidth) -> Result<u32, CfgError>;

    /// Writes the low `width` bits of `value` at `addr`.
    ///
    /// # Errors
    ///
    /// Returns a [`CfgError`] if the address is outside the transport's
    /// reach or misaligned.
    fn write(&self, addr: CfgAddr, value: u32, width: CfgWidth) -> Result<(), CfgError>;

    /// Reads an 8-bit register.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    fn read_u8(&self, addr: CfgAddr) -> Result<u8, CfgError> {
        self.read(addr, CfgWidth::U8).map(|v| v as u8)
    }

    /// Reads a 16-bit register.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    fn read_u16(&self, addr: CfgAddr) -> Result<u16, CfgError> {
        self.read(addr, CfgWidth::U16).map(|v| v as u16)
    }

    /// Reads a 32-bit register.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    fn read_u32(&self, addr: CfgAddr) -> Result<u32, CfgError> {
        self.read(addr, CfgWidth::U32)
    }

    /// Writes an 8-bit register.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    fn write_u8(&self, addr: CfgAddr, value: u8) -> Result<(), CfgError> {
        self.write(addr, u32::from(value), CfgWidth::U8)
    }

    /// Writes a 16-bit register.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    fn write_u16(&self, addr: CfgAddr, value: u16) -> Result<(), CfgError> {
        self.write(addr, u32::from(value), CfgWidth::U16)
    }

    /// Writes a 32-bit register.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    fn write_u32(&self, addr: CfgAddr, value: u32) -> Result<(), CfgError> {
        self.write(addr, value, CfgWidth::U32)
    }
}

// ---------------------------------------------------------------------------
// Port-indexed transport
// ---------------------------------------------------------------------------

/// Raw x86 port I/O supplied by the platform.
pub trait PortIo: Send {
    /// Reads `width` bits from `port`.
    fn read(&mut self, port: u16, width: CfgWidth) -> u32;

    /// Writes the low `width` bits of `value` to `port`.
    fn write(&mut self, port: u16, value: u32, width: CfgWidth);
}

const CONFIG_ADDRESS: u16 = 0x0CF8;
const CONFIG_DATA: u16 = 0x0CFC;

/// The maximum register offset reachable through the port pair.
const PIO_MAX_OFFSET: u16 = 0xFF;

/// Configuration Access Mechanism #1 over ports `0xCF8`/`0xCFC`.
pub struct PortTransport<P: PortIo> {
    ports: Mutex<P>,
}

impl<P: PortIo> PortTransport<P> {
    /// Wraps the platform's port accessor.
    #[must_use]
    pub const fn new(ports: P) -> Self {
        Self {
            ports: Mutex::new(ports),
        }
    }

    /// Builds the CONFIG_ADDRESS value for `addr`.
    #[must_use]
    pub const fn encode(addr: CfgAddr) -> u32 {
        // 1 << 31: configuration enable
        (1 << 31)
            | ((addr.bus as u32) << 16)
            | ((addr.dev as u32 & 0x1F) << 11)
            | ((addr.func as u32 & 0x07) << 8)
            | (addr.reg as u32 & 0xFC)
    }
}

impl<P: PortIo> ConfigSpace for PortTransport<P> {
    fn read(&self, addr: CfgAddr, width: CfgWidth) -> Result<u32, CfgError> {
        check_aligned(addr, width)?;
        if addr.reg > PIO_MAX_OFFSET {
            return Ok(width.ones());
        }
        let mut io = self.ports.lock();
        io.write(CONFIG_ADDRESS, Self::encode(addr), CfgWidth::U32);
        let value = io.read(CONFIG_DATA + (addr.reg & 3), width);
        trace!("pci: cfg read {addr} -> {value:#x}");
        Ok(value)
    }

    fn write(&self, addr: CfgAddr, value: u32, width: CfgWidth) -> Result<(), CfgError> {
        check_aligned(addr, width)?;
        if addr.reg > PIO_MAX_OFFSET {
            return Ok(());
        }
        trace!("pci: cfg write {addr} <- {value:#x}");
        let mut io = self.ports.lock();
        io.write(CONFIG_ADDRESS, Self::encode(addr), CfgWidth::U32);
        io.write(CONFIG_DATA + (addr.reg & 3), value & width.ones(), width);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ECAM transport
// ---------------------------------------------------------------------------

/// The maximum register offset in the 4 KiB extended config space.
const ECAM_MAX_OFFSET: u16 = 0xFFF;

/// Memory-mapped enhanced configuration access.
pub struct EcamTransport {
    base: *mut u8,
    base_bus: u8,
    bus_count: u16,
}

// SAFETY: the window is a plain MMIO mapping owned by this transport; the
// hardware tolerates concurrent accesses to distinct functions.
unsafe impl Send for EcamTransport {}
// SAFETY: see the `Send` impl above.
unsafe impl Sync for EcamTransport {}

impl EcamTransport {
    /// Creates a transport over a mapped window for buses
    /// `base_bus..base_bus + bus_count`.
    ///
    /// # Safety
    ///
    /// `base` must be 4-byte aligned and valid for volatile reads and writes
    /// of `bus_count << 20` bytes for the lifetime of the transport. `base`
    /// corresponds to `base_bus`, not to bus 0.
    #[must_use]
    pub const unsafe fn new(base: *mut u8, base_bus: u8, bus_count: u16) -> Self {
        Self {
            base,
            base_bus,
            bus_count,
        }
    }

    /// Returns the first bus covered by the window.
    #[must_use]
    pub const fn base_bus(&self) -> u8 {
        self.base_bus
    }

    /// Returns the number of buses covered by the window.
    #[must_use]
    pub const fn bus_count(&self) -> u16 {
        self.bus_count
    }

    /// Computes the byte offset of `addr` inside the window.
    ///
    /// # Errors
    ///
    /// [`CfgError::OutOfRange`] if the bus is not covered or the register
    /// lies past the 4 KiB function space.
    pub fn offset(&self, addr: CfgAddr) -> Result<usize, CfgError> {
        let rel = u16::from(addr.bus.wrapping_sub(self.base_bus));
        if addr.bus < self.base_bus || rel >= self.bus_count || addr.reg > ECAM_MAX_OFFSET {
            return Err(CfgError::OutOfRange);
        }
        Ok(((rel as usize) << 20)
            | ((addr.dev as usize) << 15)
            | ((addr.func as usize) << 12)
            | addr.reg as usize)
    }
}

impl ConfigSpace for EcamTransport {
    fn read(&self, addr: CfgAddr, width: CfgWidth) -> Result<u32, CfgError> {
        check_aligned(addr, width)?;
        let off = self.offset(addr)?;
        // SAFETY: `off` is inside the window validated by `offset`, and the
        // access is naturally aligned because the base is.
        let value = unsafe {
            let p = self.base.add(off);
            match width {
                CfgWidth::U8 => u32::from(p.read_volatile()),
                CfgWidth::U16 => u32::from(p.cast::<u16>().read_volatile()),
                CfgWidth::U32 => p.cast::<u32>().read_volatile(),
            }
        };
        trace!("pci: ecam read {addr} -> {value:#x}");
        Ok(value)
    }

    fn write(&self, addr: CfgAddr, value: u32, width: CfgWidth) -> Result<(), CfgError> {
        check_aligned(addr, width)?;
        let off = self.offset(addr)?;
        trace!("pci: ecam write {addr} <- {value:#x}");
        // SAFETY: see `read`.
        unsafe {
            let p = self.base.add(off);
            match width {
                CfgWidth::U8 => p.write_volatile(value as u8),
                CfgWidth::U16 => p.cast::<u16>().write_volatile(value as u16),
                CfgWidth::U32 => p.cast::<u32>().write_volatile(value),
            }
        }
        Ok(())
    }
}

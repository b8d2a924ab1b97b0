//! Recursive PCI bus discovery.
//!
//! Each root bridge is scanned slot by slot. Every function found becomes a
//! device record below its bus device, carrying its BARs, its INTx pin (as
//! a relative interrupt resource) and a [`PciFunction`] feature. PCI-PCI
//! bridges are numbered, get their forwarding windows and a swizzling
//! interrupt router, and are descended into.

use alloc::boxed::Box;
use alloc::sync::Arc;

use hwio_driver_api::{PciAddress, PciBar, PciCommand, PciDeviceInfo, PciHeaderKind};
use log::{debug, info, trace, warn};

use super::bar::{bar_resources, probe_bars, probe_rom, rom_resource};
use super::bridge::{read_bus_numbers, read_windows, write_bus_numbers, write_subordinate, BusNumbers};
use super::caps::{find_capability, read_pcie_cap, PcieCap};
use super::cfg::{CfgAddr, CfgError, ConfigSpace};
use super::{class_name, regs, PciFunction, RootBridge};
use crate::context::HwContext;
use crate::device::{BusAttrs, BusType, DeviceFlags, DeviceId};
use crate::irq::IrqRouter;
use crate::resource::{Resource, ResourceFlags, ResourceType, SpaceKind};

/// State of one root bridge's walk.
struct Walk {
    cfg: Arc<dyn ConfigSpace>,
    segment: u16,
    root: DeviceId,
    /// Highest bus number handed out so far.
    next_bus: u8,
}

/// Reads the identification registers of the function at `addr`.
fn read_info(cfg: &dyn ConfigSpace, addr: PciAddress) -> Result<PciDeviceInfo, CfgError> {
    let at = |reg| CfgAddr::of(addr, reg);
    let header_type = cfg.read_u8(at(regs::HEADER_TYPE))?;
    let (subsystem_vendor_id, subsystem_device_id) = if header_type & 0x7F == 0 {
        (
            cfg.read_u16(at(regs::SUBSYSTEM_VENDOR_ID))?,
            cfg.read_u16(at(regs::SUBSYSTEM_DEVICE_ID))?,
        )
    } else {
        (0, 0)
    };
    Ok(PciDeviceInfo {
        address: addr,
        vendor_id: cfg.read_u16(at(regs::VENDOR_ID))?,
        device_id: cfg.read_u16(at(regs::DEVICE_ID))?,
        revision: cfg.read_u8(at(regs::REVISION))?,
        prog_if: cfg.read_u8(at(regs::PROG_IF))?,
        subclass: cfg.read_u8(at(regs::SUBCLASS))?,
        class: cfg.read_u8(at(regs::CLASS))?,
        header_type,
        subsystem_vendor_id,
        subsystem_device_id,
        interrupt_line: cfg.read_u8(at(regs::INTERRUPT_LINE))?,
        interrupt_pin: cfg.read_u8(at(regs::INTERRUPT_PIN))?,
        bars: [PciBar::Unused; 6],
    })
}

/// Returns `true` if the function can be made a bus master.
fn probe_bus_master(cfg: &dyn ConfigSpace, addr: PciAddress) -> Result<bool, CfgError> {
    let reg = CfgAddr::of(addr, regs::COMMAND);
    let cmd = cfg.read_u16(reg)?;
    let master = PciCommand::BUS_MASTER.bits();
    if cmd & master != 0 {
        return Ok(true);
    }
    cfg.write_u16(reg, cmd | master)?;
    let sticky = cfg.read_u16(reg)? & master != 0;
    cfg.write_u16(reg, cmd)?;
    Ok(sticky)
}

fn present(cfg: &dyn ConfigSpace, addr: PciAddress) -> bool {
    cfg.read_u16(CfgAddr::of(addr, regs::VENDOR_ID))
        .is_ok_and(|v| v != 0xFFFF)
}

impl HwContext {
    /// Scans every registered root bridge and records what it finds.
    pub fn discover(&mut self) {
        for root in self.root_bridges().to_vec() {
            let Some(rb) = self.devices[root].feature::<RootBridge>() else {
                continue;
            };
            let mut walk = Walk {
                cfg: Arc::clone(rb.cfg()),
                segment: rb.segment(),
                root,
                next_bus: rb.base_bus(),
            };
            let bus = rb.base_bus();
            info!("pci: scanning {:04x}:{bus:02x}", walk.segment);
            self.scan_bus(&mut walk, root, bus, 0);

            let space = self.bus_root(walk.segment);
            if let Some(r) = self.resource_by_id(root, "BUS") {
                if !self.resources[r].is_allocated() {
                    if let Err(e) = self.resources.bind(space, r) {
                        warn!("pci: bus range {} of {}: {e}", self.resources[r], self.devices[root].name());
                    }
                }
            }
        }
    }

    fn scan_bus(&mut self, walk: &mut Walk, bus_dev: DeviceId, bus: u8, depth: usize) {
        for slot in 0..32u8 {
            let addr = PciAddress::new(bus, slot, 0);
            if !present(&*walk.cfg, addr) {
                continue;
            }
            let multi = walk
                .cfg
                .read_u8(CfgAddr::of(addr, regs::HEADER_TYPE))
                .is_ok_and(|h| h & 0x80 != 0);
            let functions = if multi { 8 } else { 1 };
            for func in 0..functions {
                let addr = PciAddress::new(bus, slot, func);
                if func > 0 && !present(&*walk.cfg, addr) {
                    continue;
                }
                if let Err(e) = self.probe_function(walk, bus_dev, addr, depth) {
                    warn!("pci: {addr}: {e}");
                }
            }
        }
    }

    fn probe_function(
        &mut self,
        walk: &mut Walk,
        bus_dev: DeviceId,
        addr: PciAddress,
        depth: usize,
    ) -> Result<(), CfgError> {
        let cfg = Arc::clone(&walk.cfg);
        let mut info = read_info(&*cfg, addr)?;
        let kind = info.header_kind();
        info!(
            "pci: {addr} [{:04x}:{:04x}] {}",
            info.vendor_id,
            info.device_id,
            class_name(info.class, info.subclass)
        );

        let dev = match self.devices.child_by_adr(bus_dev, addr.adr(), false) {
            Some(d) => d,
            None => self.add_device(bus_dev, alloc::format!("{addr}"), Some(addr.adr())),
        };

        if (1..=4).contains(&info.interrupt_pin) {
            let pin = u64::from(info.interrupt_pin - 1);
            self.add_resource(
                dev,
                Resource::new(ResourceType::Irq, pin, pin)
                    .with_flags(ResourceFlags::RELATIVE)
                    .with_id("PIN"),
            );
        }

        let probe = probe_bars(&*cfg, addr, kind.bar_count())?;
        info.bars = probe.bars;
        for r in bar_resources(&probe) {
            self.add_resource(dev, r);
        }

        let rom_reg = match kind {
            PciHeaderKind::Normal => Some(regs::ROM_BASE),
            PciHeaderKind::PciBridge => Some(regs::BRIDGE_ROM_BASE),
            _ => None,
        };
        if let Some(reg) = rom_reg.filter(|_| self.config().probe_rom) {
            if let Some(rom) = probe_rom(&*cfg, addr, reg)? {
                debug!("pci: {addr}: {} byte expansion ROM", rom.size);
                self.add_resource(dev, rom_resource(&rom));
            }
        }

        let pcie = find_capability(&*cfg, addr, regs::CAP_ID_PCIE)
            .and_then(|off| read_pcie_cap(&*cfg, addr, off));
        let msi = find_capability(&*cfg, addr, regs::CAP_ID_MSI);
        let msix = find_capability(&*cfg, addr, regs::CAP_ID_MSIX);
        if probe_bus_master(&*cfg, addr)? {
            self.devices[dev].add_flags(DeviceFlags::DMA_SUPPORTED);
        }

        let secondary = match kind {
            PciHeaderKind::PciBridge => {
                let windows = read_windows(&*cfg, addr)?;
                for w in windows {
                    self.add_space(dev, w, SpaceKind::Window);
                }
                self.add_space(
                    dev,
                    Resource::new(ResourceType::Irq, 0, 3).with_id("IRQ"),
                    SpaceKind::Router(IrqRouter::Swizzle),
                );
                Some(self.number_bridge(walk, dev, addr, pcie.as_ref())?)
            }
            PciHeaderKind::CardBus => Some(self.number_bridge(walk, dev, addr, None)?),
            _ => None,
        };

        let function = PciFunction::new(info, cfg).with_pcie(pcie).with_msi(msi, msix);
        self.add_feature(dev, Box::new(function));

        let Some(secondary) = secondary else {
            return Ok(());
        };
        if kind == PciHeaderKind::CardBus {
            debug!("pci: {addr}: CardBus sockets are numbered but not scanned");
        } else if depth < self.config().max_walk_depth {
            self.scan_bus(walk, dev, secondary, depth + 1);
        } else {
            warn!("pci: {addr}: not descending below depth {depth}");
        }
        if let Some(b) = self.devices[dev].bus() {
            walk.next_bus = walk.next_bus.max(b.subordinate);
        }
        self.bind_bus_range(dev);
        Ok(())
    }

    /// Numbers the bridge at `addr` and records its bus attributes and
    /// bus-number window. Returns the secondary bus.
    fn number_bridge(
        &mut self,
        walk: &mut Walk,
        dev: DeviceId,
        addr: PciAddress,
        pcie: Option<&PcieCap>,
    ) -> Result<u8, CfgError> {
        let cfg = Arc::clone(&walk.cfg);
        let mut buses = read_bus_numbers(&*cfg, addr)?;
        let bus = addr.bus;

        let inconsistent = buses.primary != bus || buses.secondary <= bus;
        if self.config().reassign_buses && inconsistent {
            let Some(next) = walk.next_bus.checked_add(1) else {
                warn!("pci: {addr}: out of bus numbers");
                return Err(CfgError::OutOfRange);
            };
            debug!(
                "pci: {addr}: renumbering {:02x}/{:02x}/{:02x} -> {bus:02x}/{next:02x}/{next:02x}",
                buses.primary, buses.secondary, buses.subordinate
            );
            walk.next_bus = next;
            buses = BusNumbers {
                primary: bus,
                secondary: next,
                subordinate: next,
            };
            write_bus_numbers(&*cfg, addr, buses)?;
        } else {
            walk.next_bus = walk.next_bus.max(buses.secondary);
        }

        let bus_type = match pcie {
            Some(p) if !p.bridges_to_conventional() => BusType::Express,
            _ => BusType::Conventional,
        };
        self.devices[dev].set_bus(BusAttrs {
            segment: walk.segment,
            primary: bus,
            secondary: buses.secondary,
            subordinate: buses.subordinate,
            bus_type,
        });
        self.add_space(
            dev,
            Resource::new(
                ResourceType::Bus,
                u64::from(buses.secondary),
                u64::from(buses.subordinate),
            )
            .with_id("BUS"),
            SpaceKind::Window,
        );
        self.propagate_subordinate(walk, dev, buses.subordinate);
        Ok(buses.secondary)
    }

    /// Raises the subordinate bus of every bus device above `from` to
    /// `subordinate`, up to and including the root bridge.
    fn propagate_subordinate(&mut self, walk: &Walk, from: DeviceId, subordinate: u8) {
        let mut cur = self.devices.parent(from);
        while let Some(dev) = cur {
            let Some(b) = self.devices[dev].bus_mut() else {
                break;
            };
            if b.subordinate < subordinate {
                b.subordinate = subordinate;
                trace!("pci: {} now forwards up to bus {subordinate:02x}", self.devices[dev].name());
                if let Some(r) = self.resource_by_id(dev, "BUS") {
                    self.resources[r].set_end(u64::from(subordinate));
                }
                let addr = self.devices[dev].feature::<PciFunction>().map(PciFunction::address);
                if let Some(addr) = addr {
                    if let Err(e) = write_subordinate(&*walk.cfg, addr, subordinate) {
                        warn!("pci: {addr}: {e}");
                    }
                }
            }
            if dev == walk.root {
                break;
            }
            cur = self.devices.parent(dev);
        }
    }

    /// Binds the bus-number window of bridge `dev` into its parent's.
    fn bind_bus_range(&mut self, dev: DeviceId) {
        let (Some(r), Some(parent)) = (self.resource_by_id(dev, "BUS"), self.devices.parent(dev)) else {
            return;
        };
        let Some(space) = self.resource_by_id(parent, "BUS") else {
            return;
        };
        if let Err(e) = self.resources.bind(space, r) {
            warn!(
                "pci: {}: bus range {} rejected by {}: {e}",
                self.devices[dev].name(),
                self.resources[r],
                self.devices[parent].name()
            );
        }
    }
}

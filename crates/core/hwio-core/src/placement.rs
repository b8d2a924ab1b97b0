//! Device-level resource allocation.
//!
//! Allocation runs in three passes over the device tree:
//!
//! 1. [`request_child_resources`](HwContext::request_child_resources), top
//!    down: every resource that already carries a range (firmware-fixed
//!    resources, BARs the firmware programmed, INTx pins) is requested from
//!    the nearest compatible provider above its device.
//! 2. [`allocate_pending_resources`](HwContext::allocate_pending_resources),
//!    bottom up: movable resources that are still unbound get a range.
//!    Closed bridge windows are sized from their children first and placed
//!    once their own bridge is reached.
//! 3. [`program_pci`](HwContext::program_pci): the final BAR and window
//!    addresses are written back and decoding is switched on.

use alloc::vec::Vec;

use hwio_driver_api::{HwError, PciCommand};
use log::{debug, error, info, warn};

use crate::context::HwContext;
use crate::device::{DeviceId, DeviceStatus};
use crate::pci::bar::{bar_slot, program_bar};
use crate::pci::bridge::program_window;
use crate::pci::cfg::CfgAddr;
use crate::pci::{regs, PciFunction};
use crate::resource::{ResourceId, ResourceType, SpaceKind};

impl HwContext {
    /// Returns `true` if the space `provider` may host `consumer`.
    fn can_host(&self, provider: ResourceId, consumer: ResourceId, exact: bool) -> bool {
        let (p, c) = (&self.resources[provider], &self.resources[consumer]);
        let Some(kind) = self.resources.space_kind(provider) else {
            return false;
        };
        if p.is_disabled() || !p.compatible(c, exact) {
            return false;
        }
        match kind {
            SpaceKind::Router(_) => c.is_relative(),
            _ if c.ty() == ResourceType::Irq => !c.is_relative(),
            _ => true,
        }
    }

    /// Picks the best provider for `child` among the spaces of `dev`.
    ///
    /// Exact matches (same prefetchability) win over fallbacks; among
    /// equals the smallest, least aligned space wins.
    fn find_provider(&self, dev: DeviceId, child: ResourceId) -> Option<ResourceId> {
        let spaces = self.devices.get(dev)?.resources();
        [true, false].into_iter().find_map(|exact| {
            spaces
                .iter()
                .copied()
                .filter(|&p| p != child && self.can_host(p, child, exact))
                .min_by_key(|&p| (self.resources[p].size(), self.resources[p].alignment()))
        })
    }

    /// Returns the first provider for `child` at or above `dev`.
    ///
    /// The search only moves to the parent when `dev` has no compatible
    /// space at all.
    fn provider_for(&self, dev: DeviceId, child: ResourceId) -> Result<ResourceId, HwError> {
        self.devices
            .ancestors(dev)
            .find_map(|d| self.find_provider(d, child))
            .ok_or(HwError::NotFound)
    }

    /// Requests `child`, owned by `cdev`, at its current range from the
    /// first compatible provider at or above `provider`.
    ///
    /// # Errors
    ///
    /// [`HwError::NotFound`] without a provider, otherwise the errors of
    /// [`HwContext::request`].
    pub fn request_child_resource(
        &mut self,
        provider: DeviceId,
        child: ResourceId,
        cdev: DeviceId,
    ) -> Result<(), HwError> {
        let space = self.provider_for(provider, child)?;
        self.request(space, child, cdev)
    }

    /// Allocates a range for `child`, owned by `cdev`, from the first
    /// compatible provider at or above `provider`.
    ///
    /// A provider window that has no range yet is sized instead
    /// ([`HwContext::assign`]); it is placed when its own device is
    /// allocated.
    ///
    /// # Errors
    ///
    /// [`HwError::NotFound`] without a provider, otherwise the errors of
    /// [`HwContext::assign`] or [`HwContext::alloc`].
    pub fn alloc_child_resource(
        &mut self,
        provider: DeviceId,
        child: ResourceId,
        cdev: DeviceId,
    ) -> Result<(), HwError> {
        let space = self.provider_for(provider, child)?;
        debug!(
            "resource: {} for {} from {}",
            self.resources[child],
            self.devices[cdev].name(),
            self.resources[space]
        );
        if self.resources[space].is_placed() {
            self.alloc(space, child, true)
        } else {
            self.assign(space, child)
        }
    }

    /// Requests every resource that already carries a range, parents before
    /// children.
    pub fn request_child_resources(&mut self) {
        let order: Vec<DeviceId> = self
            .devices
            .iter(DeviceId::ROOT, usize::MAX)
            .map(|(d, _)| d)
            .collect();
        for dev in order {
            let Some(parent) = self.devices.parent(dev) else {
                continue;
            };
            for r in self.devices[dev].resources().to_vec() {
                let res = &self.resources[r];
                let routed_space = matches!(
                    self.resources.space_kind(r),
                    Some(SpaceKind::Router(_) | SpaceKind::Root | SpaceKind::IrqRoot)
                );
                if routed_space
                    || res.is_allocated()
                    || res.is_disabled()
                    || res.is_empty()
                    || res.is_continuation()
                {
                    continue;
                }
                if !res.is_fixed() && res.start() == 0 {
                    continue;
                }
                if let Err(e) = self.request_child_resource(parent, r, dev) {
                    self.request_failed(dev, r, e);
                }
            }
        }
    }

    fn request_failed(&mut self, dev: DeviceId, r: ResourceId, e: HwError) {
        let res = &self.resources[r];
        if res.is_relative() {
            warn!("irq: {}: {res} not routable ({e})", self.devices.full_path(dev));
            self.resources[r].disable();
        } else if res.is_fixed() {
            error!(
                "resource: {}: inconsistent fixed resource {res} ({e})",
                self.devices.full_path(dev)
            );
            self.resources[r].disable();
        } else {
            debug!("resource: {}: {res} left for allocation ({e})", self.devices[dev].name());
        }
    }

    /// Allocates the unbound movable resources of `dev` and everything
    /// below it, children first.
    pub fn allocate_pending_resources(&mut self, dev: DeviceId) {
        for child in self.devices[dev].children().to_vec() {
            self.allocate_pending_resources(child);
        }
        let Some(parent) = self.devices.parent(dev) else {
            return;
        };

        let mut pending: Vec<ResourceId> = self.devices[dev]
            .resources()
            .iter()
            .copied()
            .filter(|&r| {
                let res = &self.resources[r];
                !(res.is_empty()
                    || res.is_allocated()
                    || res.is_disabled()
                    || res.is_continuation()
                    || res.is_fixed()
                    || res.is_relative())
            })
            .collect();
        pending.sort_by_key(|&r| core::cmp::Reverse(self.resources[r].alignment()));

        for r in pending {
            if let Err(e) = self.alloc_child_resource(parent, r, dev) {
                error!(
                    "resource: {}: cannot allocate {} ({e})",
                    self.devices.full_path(dev),
                    self.resources[r]
                );
                self.resources.release(r);
                self.resources[r].disable();
            }
        }
    }

    /// Runs the whole allocation: request, allocate, program.
    pub fn allocate_resources(&mut self) {
        self.request_child_resources();
        self.allocate_pending_resources(DeviceId::ROOT);
        self.program_pci();
        if self.config().dump_tree {
            self.dump();
        }
    }

    /// Writes allocated BAR and window ranges back to every PCI function and
    /// enables the decoders it now needs.
    pub fn program_pci(&mut self) {
        let order: Vec<DeviceId> = self
            .devices
            .iter(DeviceId::ROOT, usize::MAX)
            .map(|(d, _)| d)
            .collect();
        for dev in order {
            if self.devices[dev].status() == DeviceStatus::Disabled {
                continue;
            }
            let Some(f) = self.devices[dev].feature::<PciFunction>() else {
                continue;
            };
            let (cfg, addr) = (f.cfg().clone(), f.address());

            let mut decode = PciCommand::empty();
            for &r in self.devices[dev].resources() {
                let res = &self.resources[r];
                let Some(id) = res.id() else {
                    continue;
                };
                let result = if let Some(slot) = bar_slot(id) {
                    if !res.is_allocated() || res.is_disabled() {
                        continue;
                    }
                    decode |= match res.ty() {
                        ResourceType::Io => PciCommand::IO_SPACE,
                        _ => PciCommand::MEMORY_SPACE,
                    };
                    program_bar(&*cfg, addr, slot, res)
                } else if id.starts_with("WIN") {
                    if res.is_allocated() && !res.is_disabled() && !res.is_empty() {
                        decode |= match res.ty() {
                            ResourceType::Io => PciCommand::IO_SPACE,
                            _ => PciCommand::MEMORY_SPACE,
                        };
                    }
                    program_window(&*cfg, addr, res)
                } else {
                    continue;
                };
                if let Err(e) = result {
                    warn!("pci: {addr}: programming {res}: {e}");
                }
            }

            if decode.is_empty() {
                continue;
            }
            let reg = CfgAddr::of(addr, regs::COMMAND);
            match cfg.read_u16(reg) {
                Ok(cmd) => {
                    if let Err(e) = cfg.write_u16(reg, cmd | decode.bits()) {
                        warn!("pci: {addr}: enabling decode: {e}");
                    }
                }
                Err(e) => warn!("pci: {addr}: {e}"),
            }
        }
        info!("pci: resources programmed");
    }
}

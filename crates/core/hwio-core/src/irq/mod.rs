//! Legacy INTx interrupt routing.
//!
//! Every PCI bus has an interrupt router: an IRQ-typed space whose
//! consumers are *relative* pin resources (0 = INTA .. 3 = INTD) of the
//! functions on that bus. Routing rewrites the consumer in place:
//!
//! - [`IrqRouter::Swizzle`] (a bridge without firmware routing) rotates the
//!   pin by the requesting device's slot number and hands the resource to
//!   the router of the bus above, on behalf of the bridge.
//! - [`IrqRouter::PinMap`] (a root bus without firmware routing) rotates the
//!   pin the same way and looks the result up in the platform's fixed
//!   INTA..INTD table.
//! - [`IrqRouter::Prt`] looks up `(slot, pin)` in a firmware routing table.
//!   Entries may name a link device whose current interrupt resource
//!   supplies the line, trigger and polarity.
//!
//! The terminal routers make the resource absolute (clear
//! [`ResourceFlags::RELATIVE`], set the line and trigger mode) and record it
//! as a child of the router.

use alloc::vec::Vec;

use hwio_driver_api::{HwError, IrqPolarity, IrqTrigger, PrtEntry, PrtSource};
use log::{debug, warn};

use crate::context::HwContext;
use crate::device::DeviceId;
use crate::resource::{ResourceFlags, ResourceId, ResourceType, SpaceKind};

/// Routing policy of one bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrqRouter {
    /// Rotate the pin and forward to the upstream bus.
    Swizzle,
    /// Rotate the pin and map INTA..INTD to fixed global interrupts.
    PinMap {
        /// Global interrupt for each of INTA..INTD.
        int_map: [u32; 4],
    },
    /// Firmware routing table.
    Prt {
        /// Table entries.
        entries: Vec<PrtEntry>,
    },
}

impl IrqRouter {
    /// Returns a short name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Swizzle => "swizzle",
            Self::PinMap { .. } => "pin-map",
            Self::Prt { .. } => "prt",
        }
    }
}

/// Rotates `pin` (0 = INTA) for a device in slot `dev` crossing a bridge.
#[must_use]
pub const fn swizzle(pin: u8, dev: u8) -> u8 {
    (pin + dev) % 4
}

/// A concrete interrupt line with its trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqLine {
    /// Global system interrupt number.
    pub gsi: u32,
    /// Trigger mode.
    pub trigger: IrqTrigger,
    /// Polarity.
    pub polarity: IrqPolarity,
}

impl HwContext {
    /// Routes the relative pin resource `child`, requested by `cdev`,
    /// through the router space `space`.
    ///
    /// # Errors
    ///
    /// - [`HwError::InvalidArgument`] if `child` is not a relative IRQ or
    ///   `cdev` has no slot address.
    /// - [`HwError::NoRoute`] if no table entry or link matches.
    /// - [`HwError::PolicyViolation`] if `space` is not a router.
    pub fn route_irq(&mut self, space: ResourceId, child: ResourceId, cdev: DeviceId) -> Result<(), HwError> {
        let router = match self.resources.space_kind(space) {
            Some(SpaceKind::Router(r)) => r.clone(),
            _ => return Err(HwError::PolicyViolation),
        };
        let r = &self.resources[child];
        if r.ty() != ResourceType::Irq || !r.is_relative() {
            return Err(HwError::InvalidArgument);
        }
        let pin = (r.start() & 3) as u8;
        let slot = self.devices[cdev].device_nr().ok_or(HwError::InvalidArgument)?;
        let owner = self.resources[space].owner().ok_or(HwError::PolicyViolation)?;

        match router {
            IrqRouter::Swizzle => {
                let up = swizzle(pin, slot);
                debug!(
                    "irq: {}: INT{} -> INT{} at {}",
                    self.devices[cdev].name(),
                    pin_name(pin),
                    pin_name(up),
                    self.devices[owner].name()
                );
                self.resources[child].move_to(u64::from(up));
                let parent = self.devices.parent(owner).ok_or(HwError::NoRoute)?;
                self.request_child_resource(parent, child, owner)
            }
            IrqRouter::PinMap { int_map } => {
                let gsi = int_map[usize::from(swizzle(pin, slot))];
                self.bind_route(space, child, IrqLine {
                    gsi,
                    trigger: IrqTrigger::Level,
                    polarity: IrqPolarity::Low,
                })
            }
            IrqRouter::Prt { entries } => {
                let Some(entry) = entries.iter().find(|e| e.slot() == slot && e.pin == pin) else {
                    warn!(
                        "irq: no routing entry for slot {slot} INT{} below {}",
                        pin_name(pin),
                        self.devices[owner].name()
                    );
                    return Err(HwError::NoRoute);
                };
                let line = self.resolve_prt_entry(entry)?;
                self.bind_route(space, child, line)
            }
        }
    }

    /// Resolves a routing entry to a concrete line, consulting the link
    /// device for link entries.
    fn resolve_prt_entry(&self, entry: &PrtEntry) -> Result<IrqLine, HwError> {
        match &entry.source {
            PrtSource::Gsi(gsi) => Ok(IrqLine {
                gsi: *gsi,
                trigger: entry.trigger,
                polarity: entry.polarity,
            }),
            PrtSource::Link { name, index } => {
                let Some(link) = self.devices.find_by_name(name) else {
                    warn!("irq: link device {name} not found");
                    return Err(HwError::NoRoute);
                };
                let Some(&rid) = self.devices[link]
                    .resources()
                    .iter()
                    .filter(|&&r| self.resources[r].ty() == ResourceType::Irq)
                    .nth(*index as usize)
                else {
                    warn!("irq: link device {name} has no interrupt {index}");
                    return Err(HwError::NoRoute);
                };
                let r = &self.resources[rid];
                if r.is_disabled() {
                    return Err(HwError::NoRoute);
                }
                let gsi = u32::try_from(r.start()).map_err(|_| HwError::NoRoute)?;
                Ok(IrqLine {
                    gsi,
                    trigger: r.irq_trigger().unwrap_or(entry.trigger),
                    polarity: r.irq_polarity().unwrap_or(entry.polarity),
                })
            }
        }
    }

    fn bind_route(&mut self, router: ResourceId, child: ResourceId, line: IrqLine) -> Result<(), HwError> {
        let r = &mut self.resources[child];
        r.move_to(u64::from(line.gsi));
        r.set_irq_mode(line.trigger, line.polarity);
        r.clear_flags(ResourceFlags::RELATIVE);
        debug!("irq: routed to {}", self.resources[child]);
        self.resources.record(router, child);
        Ok(())
    }

    /// Returns the routed interrupt of `dev`'s INTx pin, once allocation
    /// has run.
    #[must_use]
    pub fn irq_route(&self, dev: DeviceId) -> Option<IrqLine> {
        let r = self.devices.get(dev)?.resources().iter().map(|&r| &self.resources[r]).find(|r| {
            r.ty() == ResourceType::Irq && r.id() == Some("PIN")
        })?;
        if r.is_relative() || r.is_disabled() || !r.is_allocated() {
            return None;
        }
        Some(IrqLine {
            gsi: u32::try_from(r.start()).ok()?,
            trigger: r.irq_trigger()?,
            polarity: r.irq_polarity()?,
        })
    }
}

fn pin_name(pin: u8) -> char {
    char::from(b'A' + (pin & 3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swizzle_triples() {
        assert_eq!(swizzle(0, 3), 3);
        assert_eq!(swizzle(1, 3), 0);
        assert_eq!(swizzle(2, 0), 2);
        assert_eq!(swizzle(3, 5), 0);
        assert_eq!(pin_name(2), 'C');
    }
}

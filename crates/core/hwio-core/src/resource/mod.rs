//! Typed address, port, interrupt, and bus-number ranges.
//!
//! A [`Resource`] is a claim on an inclusive range `[start, end]` of one
//! [`ResourceType`]. Resources live in a [`ResourceArena`] and refer to each
//! other (and to their owning device) by index. A resource that also hands
//! out sub-ranges to children carries a [`Space`] descriptor; the
//! allocation algorithms for spaces live in [`space`].

use alloc::vec::Vec;
use core::fmt;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;
use hwio_driver_api::{FwResource, FwResourceKind, IrqPolarity, IrqTrigger};
use log::warn;

use crate::device::DeviceId;

pub mod space;

pub use space::{Space, SpaceKind};

/// Index of a resource in the [`ResourceArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u32);

impl ResourceId {
    /// Returns the arena slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Kind of range a resource claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    /// Physical memory-mapped I/O.
    Mmio,
    /// x86 I/O ports.
    Io,
    /// Interrupt lines.
    Irq,
    /// PCI bus numbers.
    Bus,
    /// DMA address ranges or legacy DMA channels.
    Dma,
}

impl ResourceType {
    /// Returns a short lower-case name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mmio => "mmio",
            Self::Io => "io",
            Self::Irq => "irq",
            Self::Bus => "bus",
            Self::Dma => "dma",
        }
    }
}

impl From<FwResourceKind> for ResourceType {
    fn from(kind: FwResourceKind) -> Self {
        match kind {
            FwResourceKind::Mmio => Self::Mmio,
            FwResourceKind::Io => Self::Io,
            FwResourceKind::Irq => Self::Irq,
            FwResourceKind::Bus => Self::Bus,
            FwResourceKind::Dma => Self::Dma,
        }
    }
}

bitflags! {
    /// Attribute bits of a [`Resource`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceFlags: u32 {
        /// The resource is not decoded / must not be used.
        const DISABLED = 1 << 0;
        /// The resource provides sub-ranges to children.
        const HIERARCHICAL = 1 << 1;
        /// Memory that may be mapped prefetchable.
        const PREFETCHABLE = 1 << 2;
        /// Alignment equals the size (PCI BAR semantics).
        const SIZE_ALIGNED = 1 << 3;
        /// The range is not meaningful (e.g. a closed bridge window).
        const EMPTY = 1 << 4;
        /// Expansion ROM.
        const ROM = 1 << 5;
        /// A space that may grow when children do not fit.
        const CAN_RESIZE = 1 << 6;
        /// The range may be relocated by the allocator.
        const CAN_MOVE = 1 << 7;
        /// Decodes a 64-bit address.
        const WIDTH_64 = 1 << 8;
        /// Cacheable memory.
        const CACHED = 1 << 9;
        /// The range is relative to the consumer's router (IRQ pins).
        const RELATIVE = 1 << 10;
        /// Upper half of a 64-bit BAR; never allocatable on its own.
        const CONTINUATION = 1 << 11;
        /// Level-triggered interrupt.
        const IRQ_LEVEL = 1 << 16;
        /// Edge-triggered interrupt.
        const IRQ_EDGE = 1 << 17;
        /// Active-high / rising-edge interrupt.
        const IRQ_HIGH = 1 << 18;
        /// Active-low / falling-edge interrupt.
        const IRQ_LOW = 1 << 19;
        /// All interrupt mode bits.
        const IRQ_MODE = Self::IRQ_LEVEL.bits()
            | Self::IRQ_EDGE.bits()
            | Self::IRQ_HIGH.bits()
            | Self::IRQ_LOW.bits();
    }
}

/// Rounds `value` up to the alignment described by `mask` (`align - 1`).
///
/// Returns `None` on overflow.
#[must_use]
pub const fn align_up(value: u64, mask: u64) -> Option<u64> {
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// A claim on one inclusive range of a single resource type.
#[derive(Debug, Clone)]
pub struct Resource {
    ty: ResourceType,
    flags: ResourceFlags,
    start: u64,
    end: u64,
    align: u64,
    id: Option<&'static str>,
    owner: Option<DeviceId>,
    parent: Option<ResourceId>,
    space: Option<Space>,
}

impl Resource {
    /// Creates a resource covering `start..=end`.
    #[must_use]
    pub const fn new(ty: ResourceType, start: u64, end: u64) -> Self {
        Self {
            ty,
            flags: ResourceFlags::empty(),
            start,
            end,
            align: 0,
            id: None,
            owner: None,
            parent: None,
            space: None,
        }
    }

    /// Creates a movable, not yet placed resource of `size` units.
    #[must_use]
    pub const fn movable(ty: ResourceType, size: u64, align: u64) -> Self {
        let mut r = Self::new(ty, 0, size.saturating_sub(1));
        r.flags = ResourceFlags::CAN_MOVE;
        r.align = align;
        r
    }

    /// Creates a fixed resource from a firmware descriptor.
    #[must_use]
    pub fn from_firmware(fw: &FwResource) -> Self {
        let mut r = Self::new(fw.kind.into(), fw.start, fw.end);
        if fw.prefetchable {
            r.flags |= ResourceFlags::PREFETCHABLE;
        }
        if fw.kind == FwResourceKind::Irq {
            r.set_irq_mode(fw.trigger, fw.polarity);
        }
        r
    }

    /// Adds attribute flags.
    #[must_use]
    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the explicit alignment mask.
    #[must_use]
    pub const fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    /// Sets the short identifier (e.g. `"BAR0"`).
    #[must_use]
    pub const fn with_id(mut self, id: &'static str) -> Self {
        self.id = Some(id);
        self
    }

    /// Returns the resource type.
    #[must_use]
    pub const fn ty(&self) -> ResourceType {
        self.ty
    }

    /// Returns the attribute flags.
    #[must_use]
    pub const fn flags(&self) -> ResourceFlags {
        self.flags
    }

    /// Returns the first unit of the range.
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Returns the last unit of the range (inclusive).
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Returns the short identifier, if any.
    #[must_use]
    pub const fn id(&self) -> Option<&'static str> {
        self.id
    }

    /// Returns the device that owns this resource.
    #[must_use]
    pub const fn owner(&self) -> Option<DeviceId> {
        self.owner
    }

    /// Returns the space this resource is bound in.
    #[must_use]
    pub const fn parent(&self) -> Option<ResourceId> {
        self.parent
    }

    /// Returns the space descriptor if this resource provides sub-ranges.
    #[must_use]
    pub const fn space(&self) -> Option<&Space> {
        self.space.as_ref()
    }

    /// Returns the size of the range, 0 for empty resources.
    #[must_use]
    pub const fn size(&self) -> u64 {
        if self.flags.contains(ResourceFlags::EMPTY) || self.end < self.start {
            0
        } else {
            (self.end - self.start).saturating_add(1)
        }
    }

    /// Returns the alignment mask (`align - 1`).
    #[must_use]
    pub const fn alignment(&self) -> u64 {
        if self.flags.contains(ResourceFlags::SIZE_ALIGNED) {
            self.size().saturating_sub(1)
        } else {
            self.align
        }
    }

    /// Raises the explicit alignment mask.
    pub fn set_alignment(&mut self, align: u64) {
        self.align = align;
    }

    /// Returns `true` if the resource is disabled.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.flags.contains(ResourceFlags::DISABLED)
    }

    /// Returns `true` if the resource has no meaningful range.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.flags.contains(ResourceFlags::EMPTY)
    }

    /// Returns `true` for prefetchable memory.
    #[must_use]
    pub const fn is_prefetchable(&self) -> bool {
        self.flags.contains(ResourceFlags::PREFETCHABLE)
    }

    /// Returns `true` if the range is relative to a router.
    #[must_use]
    pub const fn is_relative(&self) -> bool {
        self.flags.contains(ResourceFlags::RELATIVE)
    }

    /// Returns `true` for the upper half of a 64-bit BAR.
    #[must_use]
    pub const fn is_continuation(&self) -> bool {
        self.flags.contains(ResourceFlags::CONTINUATION)
    }

    /// Returns `true` if the allocator must not relocate this resource.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        !self.flags.contains(ResourceFlags::CAN_MOVE)
    }

    /// Returns `true` if the resource is bound in some space.
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns `true` if the range is concrete: bound, or fixed and non-empty.
    #[must_use]
    pub const fn is_placed(&self) -> bool {
        self.parent.is_some() || (!self.is_empty() && self.is_fixed())
    }

    /// Marks the resource disabled.
    pub fn disable(&mut self) {
        self.flags |= ResourceFlags::DISABLED;
    }

    /// Clears the disabled flag.
    pub fn enable(&mut self) {
        self.flags &= !ResourceFlags::DISABLED;
    }

    /// Adds attribute flags in place.
    pub fn add_flags(&mut self, flags: ResourceFlags) {
        self.flags |= flags;
    }

    /// Removes attribute flags in place.
    pub fn clear_flags(&mut self, flags: ResourceFlags) {
        self.flags &= !flags;
    }

    /// Moves the range to begin at `start`, keeping its size.
    ///
    /// Returns `false` and disables the resource if the range would run
    /// past the end of the address space.
    pub fn move_to(&mut self, start: u64) -> bool {
        let size = self.size();
        self.set_bounds(start, size)
    }

    /// Sets the range to `start..start + size` and clears the empty flag.
    ///
    /// Returns `false` and disables the resource if the range would run
    /// past the end of the address space.
    pub fn set_range(&mut self, start: u64, size: u64) -> bool {
        self.flags &= !ResourceFlags::EMPTY;
        self.set_bounds(start, size)
    }

    fn set_bounds(&mut self, start: u64, size: u64) -> bool {
        let Some(end) = start.checked_add(size.saturating_sub(1)) else {
            warn!("resource: {self} cannot start at {start:#x}");
            self.disable();
            return false;
        };
        self.start = start;
        self.end = end;
        true
    }

    /// Sets the last unit of the range.
    pub fn set_end(&mut self, end: u64) {
        self.end = end;
    }

    /// Returns `true` if `other` lies completely inside this range.
    #[must_use]
    pub const fn contains(&self, other: &Resource) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Returns `true` if the two ranges share at least one unit.
    #[must_use]
    pub const fn overlaps(&self, other: &Resource) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns `true` if this provider can host `consumer`.
    ///
    /// With `exact`, prefetchability must match; otherwise a prefetchable
    /// consumer may fall back into a non-prefetchable provider. A
    /// non-prefetchable consumer never lands in a prefetchable window.
    #[must_use]
    pub const fn compatible(&self, consumer: &Resource, exact: bool) -> bool {
        if self.ty as u8 != consumer.ty as u8 {
            return false;
        }
        self.is_prefetchable() == (consumer.is_prefetchable() && exact)
    }

    /// Disables the resource if its range is inverted; returns validity.
    pub fn validate(&mut self) -> bool {
        if !self.is_empty() && self.end < self.start {
            self.disable();
            return false;
        }
        true
    }

    /// Returns the interrupt trigger mode, if one is set.
    #[must_use]
    pub const fn irq_trigger(&self) -> Option<IrqTrigger> {
        if self.flags.contains(ResourceFlags::IRQ_LEVEL) {
            Some(IrqTrigger::Level)
        } else if self.flags.contains(ResourceFlags::IRQ_EDGE) {
            Some(IrqTrigger::Edge)
        } else {
            None
        }
    }

    /// Returns the interrupt polarity, if one is set.
    #[must_use]
    pub const fn irq_polarity(&self) -> Option<IrqPolarity> {
        if self.flags.contains(ResourceFlags::IRQ_LOW) {
            Some(IrqPolarity::Low)
        } else if self.flags.contains(ResourceFlags::IRQ_HIGH) {
            Some(IrqPolarity::High)
        } else {
            None
        }
    }

    /// Replaces the interrupt mode bits.
    pub fn set_irq_mode(&mut self, trigger: IrqTrigger, polarity: IrqPolarity) {
        self.flags &= !ResourceFlags::IRQ_MODE;
        self.flags |= match trigger {
            IrqTrigger::Level => ResourceFlags::IRQ_LEVEL,
            IrqTrigger::Edge => ResourceFlags::IRQ_EDGE,
        };
        self.flags |= match polarity {
            IrqPolarity::High => ResourceFlags::IRQ_HIGH,
            IrqPolarity::Low => ResourceFlags::IRQ_LOW,
        };
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {:#x}-{:#x}", self.ty.name(), self.start, self.end)?;
        if let Some(id) = self.id {
            write!(f, " {id}")?;
        }
        for (flag, name) in [
            (ResourceFlags::DISABLED, "disabled"),
            (ResourceFlags::EMPTY, "empty"),
            (ResourceFlags::PREFETCHABLE, "pref"),
            (ResourceFlags::WIDTH_64, "64"),
            (ResourceFlags::RELATIVE, "rel"),
            (ResourceFlags::ROM, "rom"),
            (ResourceFlags::CONTINUATION, "cont"),
        ] {
            if self.flags.contains(flag) {
                write!(f, " {name}")?;
            }
        }
        if let (Some(t), Some(p)) = (self.irq_trigger(), self.irq_polarity()) {
            let t = if t == IrqTrigger::Level { "level" } else { "edge" };
            let p = if p == IrqPolarity::Low { "low" } else { "high" };
            write!(f, " {t}-{p}")?;
        }
        f.write_str("]")
    }
}

/// Storage for every resource known to the hardware manager.
#[derive(Debug, Default)]
pub struct ResourceArena {
    slots: Vec<Resource>,
}

impl ResourceArena {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Stores `resource` with its owning device and returns its index.
    pub fn insert(&mut self, mut resource: Resource, owner: Option<DeviceId>) -> ResourceId {
        let id = ResourceId(u32::try_from(self.slots.len()).unwrap_or(u32::MAX));
        resource.owner = owner;
        self.slots.push(resource);
        id
    }

    /// Returns the resource at `id`, if it exists.
    #[must_use]
    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.slots.get(id.index())
    }

    /// Returns the resource at `id` mutably, if it exists.
    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut Resource> {
        self.slots.get_mut(id.index())
    }

    /// Returns the number of stored resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no resource has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates over all resources with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &Resource)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, r)| (ResourceId(i as u32), r))
    }
}

impl Index<ResourceId> for ResourceArena {
    type Output = Resource;

    fn index(&self, id: ResourceId) -> &Resource {
        &self.slots[id.index()]
    }
}

impl IndexMut<ResourceId> for ResourceArena {
    fn index_mut(&mut self, id: ResourceId) -> &mut Resource {
        &mut self.slots[id.index()]
    }
}

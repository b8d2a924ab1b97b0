//! Resources that arbitrate sub-ranges among children.
//!
//! Four operations make up the space contract:
//!
//! - [`bind`](ResourceArena::bind) (request): accept a child at the range it
//!   already carries, rejecting overlaps with bound siblings of the same type.
//! - [`place`](ResourceArena::place) (alloc): pick a free, aligned gap for a
//!   movable child, optionally as a dry run.
//! - [`assign`](ResourceArena::assign): the sizing pass for windows that are
//!   not placed yet, or a verbatim bind for windows that are.
//! - [`adjust_children`](ResourceArena::adjust_children): repack children
//!   after the window itself moved.
//!
//! Root spaces and interrupt routers only support the first two; calling
//! `assign` or `adjust_children` on them is a [`HwError::PolicyViolation`].

use alloc::vec::Vec;

use hwio_driver_api::HwError;
use log::{debug, error, warn};

use super::{align_up, Resource, ResourceArena, ResourceFlags, ResourceId, ResourceType};
use crate::irq::IrqRouter;

/// The allocation policy of a space.
#[derive(Debug, Clone)]
pub enum SpaceKind {
    /// A bridge or root-bridge window: supports every operation.
    Window,
    /// A root address or bus-number space: request and alloc only.
    Root,
    /// The root interrupt space. IRQ lines are shareable, so children are
    /// recorded without an overlap test.
    IrqRoot,
    /// An interrupt router that rewrites relative pins (see [`crate::irq`]).
    Router(IrqRouter),
}

impl SpaceKind {
    /// Returns a short name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::Root => "root",
            Self::IrqRoot => "irq-root",
            Self::Router(_) => "irq-router",
        }
    }
}

/// Space descriptor attached to a provider [`Resource`].
#[derive(Debug, Clone)]
pub struct Space {
    kind: SpaceKind,
    children: Vec<ResourceId>,
}

impl Space {
    /// Creates an empty space of `kind`.
    #[must_use]
    pub const fn new(kind: SpaceKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    /// Returns the allocation policy.
    #[must_use]
    pub const fn kind(&self) -> &SpaceKind {
        &self.kind
    }

    /// Returns the bound children, ordered by start address once placed.
    #[must_use]
    pub fn children(&self) -> &[ResourceId] {
        &self.children
    }

    /// Returns `true` for interrupt routers.
    #[must_use]
    pub const fn is_router(&self) -> bool {
        matches!(self.kind, SpaceKind::Router(_))
    }
}

fn occupies(r: &Resource, ty: ResourceType) -> bool {
    r.ty() == ty && !r.is_disabled() && !r.is_empty()
}

impl ResourceArena {
    /// Turns the resource at `id` into a space of `kind`.
    pub fn make_space(&mut self, id: ResourceId, kind: SpaceKind) {
        let r = &mut self[id];
        match &mut r.space {
            Some(space) => space.kind = kind,
            None => r.space = Some(Space::new(kind)),
        }
        r.flags |= ResourceFlags::HIERARCHICAL;
    }

    /// Returns the space policy of `id`, if it is a space.
    #[must_use]
    pub fn space_kind(&self, id: ResourceId) -> Option<&SpaceKind> {
        self.get(id)?.space().map(Space::kind)
    }

    fn children_of(&self, space: ResourceId) -> Vec<ResourceId> {
        self[space]
            .space()
            .map(|s| s.children.clone())
            .unwrap_or_default()
    }

    fn space_mut(&mut self, space: ResourceId) -> Option<&mut Space> {
        self[space].space.as_mut()
    }

    /// Returns the first bound sibling in `space` that overlaps `child`.
    #[must_use]
    pub fn find_conflict(&self, space: ResourceId, child: ResourceId) -> Option<ResourceId> {
        let c = &self[child];
        self[space].space()?.children.iter().copied().find(|&o| {
            o != child && occupies(&self[o], c.ty()) && self[o].overlaps(c)
        })
    }

    /// Binds `child` into `space` at the range it already carries.
    ///
    /// # Errors
    ///
    /// - [`HwError::InvalidArgument`] if the child is disabled, empty, a
    ///   continuation slot, still relative, or lies outside the space.
    /// - [`HwError::Conflict`] if it overlaps a bound sibling of the same type.
    /// - [`HwError::PolicyViolation`] if `space` is not a space or is a router.
    pub fn bind(&mut self, space: ResourceId, child: ResourceId) -> Result<(), HwError> {
        let shared = match self.space_kind(space) {
            Some(SpaceKind::Window | SpaceKind::Root) => false,
            Some(SpaceKind::IrqRoot) => true,
            Some(SpaceKind::Router(_)) | None => return Err(HwError::PolicyViolation),
        };

        let c = &self[child];
        if c.is_disabled() || c.is_empty() || c.is_continuation() || c.is_relative() {
            return Err(HwError::InvalidArgument);
        }
        if !self[space].contains(c) {
            debug!("resource: {c} outside of {}", self[space]);
            return Err(HwError::InvalidArgument);
        }
        if !shared {
            if let Some(other) = self.find_conflict(space, child) {
                debug!("resource: {c} overlaps {}", self[other]);
                return Err(HwError::Conflict);
            }
        }

        let start = c.start();
        let pos = self
            .children_of(space)
            .iter()
            .position(|&o| self[o].start() > start);
        if let Some(s) = self.space_mut(space) {
            match pos {
                Some(p) => s.children.insert(p, child),
                None => s.children.push(child),
            }
        }
        self[child].parent = Some(space);
        Ok(())
    }

    /// Finds the first aligned gap in `space` that fits `child` and binds it
    /// there. With `commit == false` only checks that such a gap exists.
    ///
    /// Memory children are aligned to at least `min_align`. A space flagged
    /// [`ResourceFlags::CAN_RESIZE`] grows at its end instead of failing.
    ///
    /// # Errors
    ///
    /// - [`HwError::Busy`] if the child is already bound.
    /// - [`HwError::InvalidArgument`] for zero-sized, disabled, or
    ///   continuation children.
    /// - [`HwError::Exhausted`] if no gap is large enough.
    /// - [`HwError::Unsupported`] for interrupt spaces.
    pub fn place(
        &mut self,
        space: ResourceId,
        child: ResourceId,
        commit: bool,
        min_align: u64,
    ) -> Result<(), HwError> {
        match self.space_kind(space) {
            Some(SpaceKind::Window | SpaceKind::Root) => {}
            Some(SpaceKind::IrqRoot | SpaceKind::Router(_)) => return Err(HwError::Unsupported),
            None => return Err(HwError::PolicyViolation),
        }

        let c = &self[child];
        if c.is_allocated() {
            return Err(HwError::Busy);
        }
        let size = c.size();
        if size == 0 || c.is_disabled() || c.is_continuation() {
            return Err(HwError::InvalidArgument);
        }
        let mut mask = c.alignment();
        if c.ty() == ResourceType::Mmio {
            mask = mask.max(min_align);
        }

        let p = &self[space];
        if p.is_empty() {
            return Err(HwError::Exhausted);
        }
        let (pstart, pend) = (p.start(), p.end());
        let mut taken: Vec<(u64, u64)> = self
            .children_of(space)
            .into_iter()
            .filter(|&o| o != child && occupies(&self[o], c.ty()))
            .map(|o| (self[o].start(), self[o].end()))
            .collect();
        taken.sort_unstable();

        let fits_before = |cursor: u64, limit: u64| -> Option<u64> {
            let st = align_up(cursor, mask)?;
            let last = st.checked_add(size - 1)?;
            (last <= limit).then_some(st)
        };

        let mut cursor = pstart;
        let mut found = None;
        for (s, e) in taken {
            if s > cursor {
                if let Some(st) = fits_before(cursor, s - 1) {
                    found = Some(st);
                    break;
                }
            }
            if e >= cursor {
                match e.checked_add(1) {
                    Some(n) => cursor = n,
                    None => return Err(HwError::Exhausted),
                }
            }
        }

        let start = match found.or_else(|| fits_before(cursor, pend)) {
            Some(st) => st,
            None if p.flags().contains(ResourceFlags::CAN_RESIZE) => {
                let st = align_up(cursor, mask).ok_or(HwError::Exhausted)?;
                let last = st.checked_add(size - 1).ok_or(HwError::Exhausted)?;
                if commit {
                    debug!("resource: growing {} to {last:#x}", self[space]);
                    self[space].set_end(last);
                }
                st
            }
            None => return Err(HwError::Exhausted),
        };

        if !commit {
            return Ok(());
        }

        self[child].move_to(start);
        if matches!(self.space_kind(child), Some(SpaceKind::Window)) {
            self.adjust_children(child, min_align)?;
        }
        self.bind(space, child)
    }

    /// Assigns `child` to the window `space`.
    ///
    /// If the window is already placed, `child` is bound verbatim at its
    /// current range and becomes fixed. Otherwise this is the sizing pass:
    /// the child is queued by descending alignment, the window's alignment
    /// is raised to the child's, and the window grows to the packed size of
    /// all queued children. The children receive concrete ranges once the
    /// window is placed and [`adjust_children`](Self::adjust_children) runs.
    ///
    /// # Errors
    ///
    /// [`HwError::PolicyViolation`] if `space` is not a window, otherwise the
    /// errors of [`bind`](Self::bind).
    pub fn assign(&mut self, space: ResourceId, child: ResourceId) -> Result<(), HwError> {
        if !matches!(self.space_kind(space), Some(SpaceKind::Window)) {
            error!(
                "resource: assign on non-window space {} is not supported",
                self[space]
            );
            return Err(HwError::PolicyViolation);
        }

        if self[space].is_placed() && self[child].is_placed() {
            self[child].clear_flags(ResourceFlags::CAN_MOVE);
            return self.bind(space, child);
        }

        let align = self[child].alignment();
        let pos = self
            .children_of(space)
            .iter()
            .position(|&o| self[o].alignment() < align);
        if let Some(s) = self.space_mut(space) {
            match pos {
                Some(p) => s.children.insert(p, child),
                None => s.children.push(child),
            }
        }
        self[child].parent = Some(space);

        if self[space].alignment() < align {
            self[space].set_alignment(align);
        }

        let window_mask = self[space].alignment();
        let mut packed = 0u64;
        for o in self.children_of(space) {
            let r = &self[o];
            if r.is_disabled() || r.is_empty() {
                continue;
            }
            packed = align_up(packed, r.alignment())
                .and_then(|v| v.checked_add(r.size()))
                .ok_or(HwError::Exhausted)?;
        }
        let packed = align_up(packed, window_mask).ok_or(HwError::Exhausted)?;
        let start = self[space].start();
        self[space].set_range(start, packed);
        Ok(())
    }

    /// Repacks the movable children of the window `space` from its start.
    ///
    /// Fixed, relative, and empty children keep their ranges. A child that no
    /// longer fits is unbound and disabled. Returns the disabled children.
    ///
    /// # Errors
    ///
    /// [`HwError::PolicyViolation`] if `space` is not a window.
    pub fn adjust_children(
        &mut self,
        space: ResourceId,
        min_align: u64,
    ) -> Result<Vec<ResourceId>, HwError> {
        if !matches!(self.space_kind(space), Some(SpaceKind::Window)) {
            error!(
                "resource: adjust_children on non-window space {} is not supported",
                self[space]
            );
            return Err(HwError::PolicyViolation);
        }

        let (pstart, pend) = (self[space].start(), self[space].end());
        let children = self.children_of(space);

        let mut occupied = Vec::new();
        for &c in &children {
            let r = &self[c];
            if r.is_fixed() || r.is_relative() || r.is_empty() {
                warn!("resource: not moving fixed child {r} of {}", self[space]);
                if !r.is_empty() && !r.is_relative() && !r.is_disabled() {
                    occupied.push((r.start(), r.end()));
                }
            }
        }

        let mut cursor = pstart;
        let mut dropped = Vec::new();
        for c in children {
            let r = &self[c];
            if r.is_fixed() || r.is_relative() || r.is_empty() || r.is_disabled() {
                continue;
            }
            let size = r.size();
            let mut mask = r.alignment();
            if r.ty() == ResourceType::Mmio {
                mask = mask.max(min_align);
            }

            let slot = loop {
                let Some(st) = align_up(cursor, mask) else { break None };
                let Some(last) = st.checked_add(size.saturating_sub(1)) else { break None };
                match occupied.iter().find(|&&(s, e)| s <= last && st <= e) {
                    Some(&(_, e)) => match e.checked_add(1) {
                        Some(n) => cursor = n,
                        None => break None,
                    },
                    None => break Some((st, last)),
                }
            };

            match slot {
                Some((st, last)) if last <= pend => {
                    self[c].move_to(st);
                    cursor = last.saturating_add(1);
                    if matches!(self.space_kind(c), Some(SpaceKind::Window)) {
                        dropped.extend(self.adjust_children(c, min_align)?);
                    }
                }
                _ => {
                    error!(
                        "resource: {} no longer fits into {}, disabling",
                        self[c], self[space]
                    );
                    self.release(c);
                    self[c].disable();
                    dropped.push(c);
                }
            }
        }

        let mut sorted = self.children_of(space);
        sorted.sort_by_key(|&o| self[o].start());
        if let Some(s) = self.space_mut(space) {
            s.children = sorted;
        }
        Ok(dropped)
    }

    /// Records `child` as a consumer of `space` without any range check.
    ///
    /// Interrupt routers use this once they rewrote the child to a concrete
    /// line; lines are shareable, so there is nothing to arbitrate.
    pub fn record(&mut self, space: ResourceId, child: ResourceId) {
        if let Some(s) = self.space_mut(space) {
            s.children.push(child);
        }
        self[child].parent = Some(space);
    }

    /// Unbinds `child` from the space it is bound in.
    pub fn release(&mut self, child: ResourceId) {
        if let Some(parent) = self[child].parent.take() {
            if let Some(s) = self.space_mut(parent) {
                s.children.retain(|&o| o != child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(arena: &mut ResourceArena, start: u64, end: u64) -> ResourceId {
        let id = arena.insert(Resource::new(ResourceType::Mmio, start, end), None);
        arena.make_space(id, SpaceKind::Window);
        id
    }

    fn bar(arena: &mut ResourceArena, size: u64) -> ResourceId {
        arena.insert(
            Resource::movable(ResourceType::Mmio, size, 0).with_flags(ResourceFlags::SIZE_ALIGNED),
            None,
        )
    }

    fn assert_no_overlap(arena: &ResourceArena, space: ResourceId) {
        let children = arena[space].space().unwrap().children().to_vec();
        for (i, &a) in children.iter().enumerate() {
            for &b in &children[i + 1..] {
                assert!(
                    !arena[a].overlaps(&arena[b]),
                    "{} overlaps {}",
                    arena[a],
                    arena[b]
                );
            }
        }
    }

    #[test]
    fn bind_rejects_overlap_and_out_of_range() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0x1000, 0x1fff);
        let x = a.insert(Resource::new(ResourceType::Mmio, 0x1000, 0x10ff), None);
        let y = a.insert(Resource::new(ResourceType::Mmio, 0x1080, 0x117f), None);
        let z = a.insert(Resource::new(ResourceType::Mmio, 0x1f00, 0x20ff), None);
        assert_eq!(a.bind(w, x), Ok(()));
        assert_eq!(a.bind(w, y), Err(HwError::Conflict));
        assert_eq!(a.bind(w, z), Err(HwError::InvalidArgument));
        assert_eq!(a[x].parent(), Some(w));
        assert_eq!(a[y].parent(), None);
    }

    #[test]
    fn overlap_ignores_other_types() {
        let mut a = ResourceArena::new();
        let root = a.insert(Resource::new(ResourceType::Mmio, 0, u64::MAX), None);
        a.make_space(root, SpaceKind::Root);
        let m = a.insert(Resource::new(ResourceType::Mmio, 0x100, 0x1ff), None);
        let d = a.insert(Resource::new(ResourceType::Dma, 0x100, 0x1ff), None);
        assert_eq!(a.bind(root, m), Ok(()));
        // A DMA range is a different type and does not collide.
        assert_eq!(a.bind(root, d), Ok(()));
    }

    #[test]
    fn irq_root_shares_lines() {
        let mut a = ResourceArena::new();
        let root = a.insert(Resource::new(ResourceType::Irq, 0, 255), None);
        a.make_space(root, SpaceKind::IrqRoot);
        let i1 = a.insert(Resource::new(ResourceType::Irq, 11, 11), None);
        let i2 = a.insert(Resource::new(ResourceType::Irq, 11, 11), None);
        assert_eq!(a.bind(root, i1), Ok(()));
        assert_eq!(a.bind(root, i2), Ok(()));
    }

    #[test]
    fn place_fills_gaps_with_alignment() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0x10_0000, 0x1f_ffff);
        let fixed = a.insert(Resource::new(ResourceType::Mmio, 0x10_0000, 0x10_0fff), None);
        a.bind(w, fixed).unwrap();

        let b1 = bar(&mut a, 0x1000);
        let b2 = bar(&mut a, 0x4000);
        let b3 = bar(&mut a, 0x1000);
        for b in [b1, b2, b3] {
            a.place(w, b, true, 0xfff).unwrap();
        }
        assert_eq!(a[b1].start(), 0x10_1000);
        assert_eq!(a[b2].start(), 0x10_4000);
        assert_eq!(a[b3].start(), 0x10_2000);
        assert_no_overlap(&a, w);
    }

    #[test]
    fn place_dry_run_does_not_mutate() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0, 0xfff);
        let b = bar(&mut a, 0x1000);
        assert_eq!(a.place(w, b, false, 0xfff), Ok(()));
        assert_eq!(a[b].parent(), None);
        let big = bar(&mut a, 0x2000);
        assert_eq!(a.place(w, big, false, 0xfff), Err(HwError::Exhausted));
    }

    #[test]
    fn place_grows_resizable_space() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0x8000, 0x8fff);
        a[w].add_flags(ResourceFlags::CAN_RESIZE);
        let b1 = bar(&mut a, 0x1000);
        let b2 = bar(&mut a, 0x1000);
        a.place(w, b1, true, 0xfff).unwrap();
        a.place(w, b2, true, 0xfff).unwrap();
        assert_eq!(a[w].end(), 0x9fff);
        assert_no_overlap(&a, w);
    }

    #[test]
    fn continuation_is_never_allocatable() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0, 0xffff_ffff);
        let hi = a.insert(
            Resource::movable(ResourceType::Mmio, 0x1000, 0).with_flags(ResourceFlags::CONTINUATION),
            None,
        );
        assert_eq!(a.place(w, hi, true, 0xfff), Err(HwError::InvalidArgument));
        assert_eq!(a.bind(w, hi), Err(HwError::InvalidArgument));
    }

    #[test]
    fn sizing_pass_then_placement() {
        let mut a = ResourceArena::new();
        let root = window(&mut a, 0xc000_0000, 0xcfff_ffff);

        // Closed bridge window waiting for its children.
        let bw = a.insert(
            Resource::new(ResourceType::Mmio, 0, 0)
                .with_flags(ResourceFlags::EMPTY | ResourceFlags::CAN_MOVE)
                .with_align(0xf_ffff),
            None,
        );
        a.make_space(bw, SpaceKind::Window);

        let small = bar(&mut a, 0x1000);
        let large = bar(&mut a, 0x20_0000);
        a.assign(bw, small).unwrap();
        a.assign(bw, large).unwrap();
        assert_eq!(a[bw].alignment(), 0x1f_ffff);
        assert_eq!(a[bw].size(), 0x40_0000);
        assert_eq!(a[bw].space().unwrap().children(), &[large, small]);

        a.place(root, bw, true, 0xfff).unwrap();
        assert_eq!(a[bw].start(), 0xc000_0000);
        assert_eq!(a[large].start(), 0xc000_0000);
        assert_eq!(a[small].start(), 0xc020_0000);
        assert!(a[bw].contains(&a[small]));
        assert_no_overlap(&a, bw);
    }

    #[test]
    fn adjust_disables_children_that_no_longer_fit() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0x1000, 0x2fff);
        let b1 = bar(&mut a, 0x1000);
        let b2 = bar(&mut a, 0x1000);
        a.place(w, b1, true, 0xfff).unwrap();
        a.place(w, b2, true, 0xfff).unwrap();

        // Shrink the window: the second BAR is left without room.
        a[w].set_end(0x1fff);
        let dropped = a.adjust_children(w, 0xfff).unwrap();
        assert_eq!(dropped, vec![b2]);
        assert!(a[b2].is_disabled());
        assert_eq!(a[b2].parent(), None);
        assert_eq!(a[w].space().unwrap().children(), &[b1]);
    }

    #[test]
    fn adjust_keeps_fixed_children_in_place() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0x0, 0x3fff);
        let fixed = a.insert(Resource::new(ResourceType::Mmio, 0x0, 0xfff), None);
        a.bind(w, fixed).unwrap();
        let b = bar(&mut a, 0x1000);
        a.place(w, b, true, 0xfff).unwrap();

        a.adjust_children(w, 0xfff).unwrap();
        assert_eq!(a[fixed].start(), 0);
        assert_eq!(a[b].start(), 0x1000);
        assert_no_overlap(&a, w);
    }

    #[test]
    fn root_rejects_assign_and_adjust() {
        let mut a = ResourceArena::new();
        let root = a.insert(Resource::new(ResourceType::Io, 0, 0xffff), None);
        a.make_space(root, SpaceKind::Root);
        let io = a.insert(Resource::new(ResourceType::Io, 0x60, 0x60), None);
        assert_eq!(a.assign(root, io), Err(HwError::PolicyViolation));
        assert_eq!(a.adjust_children(root, 0), Err(HwError::PolicyViolation));
        assert_eq!(a.bind(root, io), Ok(()));
    }

    #[test]
    fn release_unbinds() {
        let mut a = ResourceArena::new();
        let w = window(&mut a, 0, 0xffff);
        let b = bar(&mut a, 0x1000);
        a.place(w, b, true, 0xfff).unwrap();
        a.release(b);
        assert_eq!(a[b].parent(), None);
        assert!(a[w].space().unwrap().children().is_empty());
    }
}

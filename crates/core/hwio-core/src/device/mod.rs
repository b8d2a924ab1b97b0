//! Arena of device records.
//!
//! Every discovered hardware node is a [`Device`] stored in a
//! [`DeviceTree`] and addressed by [`DeviceId`]. Parent and child links are
//! index lists, so traversal never chases pointers and the tree may be
//! mutated while an index-based walk is in progress. A device that also
//! forwards a PCI bus (root bridges and PCI-PCI bridges) carries its bus
//! numbering in a [`BusAttrs`] sub-structure of the same record.

use alloc::string::String;
use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;
use log::info;

use crate::dma::{DmaDomainId, DmaFactoryId};
use crate::resource::{ResourceArena, ResourceId};

pub mod feature;

pub use feature::{DevFeature, FeatureSet, FeatureWatcher, SetupFn, WatcherId, WatcherRegistry};

/// Index of a device in the [`DeviceTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    /// The system bus at the root of every tree.
    pub const ROOT: Self = Self(0);

    /// Returns the arena slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operational status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Present but not usable (e.g. a required resource could not be placed).
    Disabled,
    /// Usable.
    Active,
}

bitflags! {
    /// Capability bits of a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// The device can initiate DMA.
        const DMA_SUPPORTED = 1 << 0;
        /// The device hosts more than one bus segment.
        const MULTI_BUS = 1 << 1;
    }
}

/// Electrical flavour of a PCI bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    /// Conventional PCI (transactions may be aliased to the bridge).
    Conventional,
    /// PCI Express (every function has its own requester id).
    Express,
}

/// Bus numbering of a root bridge or PCI-PCI bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusAttrs {
    /// PCI segment group.
    pub segment: u16,
    /// Bus the bridge itself sits on (equal to `secondary` for roots).
    pub primary: u8,
    /// Bus number forwarded to downstream devices.
    pub secondary: u8,
    /// Highest bus number reachable below this bridge.
    pub subordinate: u8,
    /// Electrical flavour of the secondary bus.
    pub bus_type: BusType,
}

impl BusAttrs {
    /// Creates attributes for a root bus `num` in `segment`.
    #[must_use]
    pub const fn root(segment: u16, num: u8, bus_type: BusType) -> Self {
        Self {
            segment,
            primary: num,
            secondary: num,
            subordinate: num,
            bus_type,
        }
    }

    /// Returns `true` if bus `num` is reachable through this bridge.
    #[must_use]
    pub const fn forwards(&self, num: u8) -> bool {
        num >= self.secondary && num <= self.subordinate
    }
}

/// One hardware node.
#[derive(Debug)]
pub struct Device {
    uid: u64,
    adr: Option<u32>,
    name: String,
    hid: Option<String>,
    cids: Vec<String>,
    status: DeviceStatus,
    flags: DeviceFlags,
    refs: u32,
    alive: bool,
    parent: Option<DeviceId>,
    children: Vec<DeviceId>,
    resources: Vec<ResourceId>,
    features: FeatureSet,
    bus: Option<BusAttrs>,
    pub(crate) dma_factory: Option<DmaFactoryId>,
    pub(crate) dma_domain: Option<DmaDomainId>,
    pub(crate) downstream_dma: Option<DmaDomainId>,
}

impl Device {
    fn new(uid: u64, name: String, adr: Option<u32>) -> Self {
        Self {
            uid,
            adr,
            name,
            hid: None,
            cids: Vec::new(),
            status: DeviceStatus::Active,
            flags: DeviceFlags::empty(),
            refs: 1,
            alive: true,
            parent: None,
            children: Vec::new(),
            resources: Vec::new(),
            features: FeatureSet::default(),
            bus: None,
            dma_factory: None,
            dma_domain: None,
            downstream_dma: None,
        }
    }

    /// Returns the unique id assigned at creation.
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.uid
    }

    /// Returns the firmware-style address (`device << 16 | function`).
    #[must_use]
    pub const fn adr(&self) -> Option<u32> {
        self.adr
    }

    /// Returns the PCI device number encoded in the address, if any.
    #[must_use]
    pub const fn device_nr(&self) -> Option<u8> {
        match self.adr {
            Some(adr) => Some(((adr >> 16) & 0x1F) as u8),
            None => None,
        }
    }

    /// Returns the device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the device.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Returns the hardware id, if any.
    #[must_use]
    pub fn hid(&self) -> Option<&str> {
        self.hid.as_deref()
    }

    /// Sets the hardware id.
    pub fn set_hid(&mut self, hid: impl Into<String>) {
        self.hid = Some(hid.into());
    }

    /// Returns the compatible-id list.
    #[must_use]
    pub fn cids(&self) -> &[String] {
        &self.cids
    }

    /// Appends a compatible id.
    pub fn add_cid(&mut self, cid: impl Into<String>) {
        self.cids.push(cid.into());
    }

    /// Returns the operational status.
    #[must_use]
    pub const fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Sets the operational status.
    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
    }

    /// Returns the capability flags.
    #[must_use]
    pub const fn flags(&self) -> DeviceFlags {
        self.flags
    }

    /// Adds capability flags.
    pub fn add_flags(&mut self, flags: DeviceFlags) {
        self.flags |= flags;
    }

    /// Returns the current reference count.
    #[must_use]
    pub const fn refs(&self) -> u32 {
        self.refs
    }

    /// Returns `false` once the device has been torn down.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.alive
    }

    /// Returns the parent device, `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    /// Returns the children in insertion order.
    #[must_use]
    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    /// Returns the resources owned by this device.
    #[must_use]
    pub fn resources(&self) -> &[ResourceId] {
        &self.resources
    }

    /// Records a resource as owned by this device.
    pub fn add_resource(&mut self, id: ResourceId) {
        self.resources.push(id);
    }

    /// Returns the attached features.
    #[must_use]
    pub const fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Returns the attached features mutably.
    pub fn features_mut(&mut self) -> &mut FeatureSet {
        &mut self.features
    }

    /// Returns the first feature of type `T`.
    #[must_use]
    pub fn feature<T: DevFeature>(&self) -> Option<&T> {
        self.features.get::<T>()
    }

    /// Returns the bus attributes of a bridge or root.
    #[must_use]
    pub const fn bus(&self) -> Option<&BusAttrs> {
        self.bus.as_ref()
    }

    /// Returns the bus attributes mutably.
    pub fn bus_mut(&mut self) -> Option<&mut BusAttrs> {
        self.bus.as_mut()
    }

    /// Attaches bus attributes, making this device a bus.
    pub fn set_bus(&mut self, bus: BusAttrs) {
        self.bus = Some(bus);
    }

    /// Returns `true` if this device matches the compatible id `cid`.
    ///
    /// `cid` is matched as a glob against the hardware id, exactly against
    /// the compatible-id list, and finally by every feature.
    #[must_use]
    pub fn match_cid(&self, cid: &str) -> bool {
        if self.hid.as_deref().is_some_and(|hid| glob_match(cid, hid)) {
            return true;
        }
        if self.cids.iter().any(|c| c == cid) {
            return true;
        }
        self.features.iter().any(|f| f.match_cid(cid))
    }
}

/// Matches `text` against a shell-style pattern supporting `*` and `?`.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        match p.get(pi) {
            Some(b'*') => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == b'?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

/// Pre-order iterator over the descendants of a device.
pub struct DeviceIter<'a> {
    tree: &'a DeviceTree,
    stack: Vec<(DeviceId, usize)>,
    max_depth: usize,
}

impl Iterator for DeviceIter<'_> {
    type Item = (DeviceId, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let (id, depth) = self.stack.pop()?;
        if depth < self.max_depth {
            let children = &self.tree[id].children;
            self.stack
                .extend(children.iter().rev().map(|&c| (c, depth + 1)));
        }
        Some((id, depth))
    }
}

/// The device arena. Slot 0 is always the system bus.
#[derive(Debug)]
pub struct DeviceTree {
    slots: Vec<Device>,
    next_uid: u64,
}

impl DeviceTree {
    /// Creates a tree containing only the system bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: alloc::vec![Device::new(0, String::from("System Bus"), None)],
            next_uid: 1,
        }
    }

    /// Returns the system bus.
    #[must_use]
    pub const fn root(&self) -> DeviceId {
        DeviceId::ROOT
    }

    /// Returns the device at `id`, if it exists and is alive.
    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots.get(id.index()).filter(|d| d.alive)
    }

    /// Returns the device at `id` mutably, if it exists and is alive.
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots.get_mut(id.index()).filter(|d| d.alive)
    }

    /// Returns the number of live devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|d| d.alive).count()
    }

    /// Returns `true` if only the system bus exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Creates a new device below `parent` and returns its id.
    pub fn add_child(
        &mut self,
        parent: DeviceId,
        name: impl Into<String>,
        adr: Option<u32>,
    ) -> DeviceId {
        let id = DeviceId(u32::try_from(self.slots.len()).unwrap_or(u32::MAX));
        let mut dev = Device::new(self.next_uid, name.into(), adr);
        self.next_uid += 1;
        dev.parent = Some(parent);
        self.slots.push(dev);
        self[parent].children.push(id);
        id
    }

    /// Returns the parent of `id`.
    #[must_use]
    pub fn parent(&self, id: DeviceId) -> Option<DeviceId> {
        self.get(id)?.parent
    }

    /// Iterates over `id` and its ancestors up to the root.
    pub fn ancestors(&self, id: DeviceId) -> impl Iterator<Item = DeviceId> + '_ {
        core::iter::successors(Some(id), |&d| self.parent(d))
    }

    /// Iterates pre-order over the descendants of `from`.
    ///
    /// Direct children have depth 0; nodes deeper than `max_depth` are not
    /// visited.
    #[must_use]
    pub fn iter(&self, from: DeviceId, max_depth: usize) -> DeviceIter<'_> {
        let stack = self[from]
            .children
            .iter()
            .rev()
            .map(|&c| (c, 0))
            .collect();
        DeviceIter {
            tree: self,
            stack,
            max_depth,
        }
    }

    /// Finds the child of `parent` with address `adr`, creating it if
    /// `create` is set.
    pub fn child_by_adr(&mut self, parent: DeviceId, adr: u32, create: bool) -> Option<DeviceId> {
        let found = self[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self[c].adr == Some(adr));
        if found.is_some() || !create {
            return found;
        }
        Some(self.add_child(parent, alloc::format!("{adr:08x}"), Some(adr)))
    }

    /// Finds the first live device whose name or hardware id equals `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<DeviceId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, d)| d.alive)
            .find(|(_, d)| d.name == name || d.hid.as_deref() == Some(name))
            .map(|(i, _)| DeviceId(i as u32))
    }

    /// Returns the slash-separated path from the root to `id`.
    #[must_use]
    pub fn full_path(&self, id: DeviceId) -> String {
        let mut names: Vec<&str> = self.ancestors(id).map(|d| self[d].name()).collect();
        names.reverse();
        let mut path = String::new();
        for name in names {
            path.push('/');
            path.push_str(name);
        }
        path
    }

    /// Takes a reference on `id`.
    pub fn get_ref(&mut self, id: DeviceId) {
        if let Some(d) = self.get_mut(id) {
            d.refs += 1;
        }
    }

    /// Drops a reference on `id`.
    ///
    /// When the count reaches zero and the device has no children, it is
    /// detached from its parent and marked dead; returns `true` in that
    /// case. The root is never torn down.
    pub fn put(&mut self, id: DeviceId) -> bool {
        let Some(d) = self.get_mut(id) else {
            return false;
        };
        d.refs = d.refs.saturating_sub(1);
        if d.refs > 0 || !d.children.is_empty() || id == DeviceId::ROOT {
            return false;
        }
        d.alive = false;
        d.status = DeviceStatus::Disabled;
        if let Some(p) = d.parent.take() {
            self[p].children.retain(|&c| c != id);
        }
        true
    }

    /// Logs the tree below `from` with each device's resources.
    pub fn dump(&self, from: DeviceId, resources: &ResourceArena) {
        info!("{}", self[from].name());
        for (id, depth) in self.iter(from, usize::MAX) {
            let dev = &self[id];
            let indent = (depth + 1) * 2;
            match dev.hid() {
                Some(hid) => info!("{:indent$}{}: hid={hid}", "", dev.name()),
                None => info!("{:indent$}{}", "", dev.name()),
            }
            for &r in dev.resources() {
                info!("{:indent$}  {}", "", resources[r]);
            }
        }
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<DeviceId> for DeviceTree {
    type Output = Device;

    fn index(&self, id: DeviceId) -> &Device {
        &self.slots[id.index()]
    }
}

impl IndexMut<DeviceId> for DeviceTree {
    fn index_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.slots[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (DeviceTree, DeviceId, DeviceId, DeviceId) {
        let mut t = DeviceTree::new();
        let pci0 = t.add_child(DeviceId::ROOT, "PCI0", None);
        let bridge = t.add_child(pci0, "bridge", Some(0x0001_0000));
        let nic = t.add_child(bridge, "nic", Some(0));
        (t, pci0, bridge, nic)
    }

    #[test]
    fn preorder_with_depth_limit() {
        let (mut t, pci0, bridge, nic) = sample();
        let isa = t.add_child(pci0, "isa", Some(0x001f_0000));
        let all: Vec<_> = t.iter(DeviceId::ROOT, usize::MAX).collect();
        assert_eq!(all, vec![(pci0, 0), (bridge, 1), (nic, 2), (isa, 1)]);
        let shallow: Vec<_> = t.iter(DeviceId::ROOT, 1).map(|(d, _)| d).collect();
        assert_eq!(shallow, vec![pci0, bridge, isa]);
        let children: Vec<_> = t.iter(pci0, 0).map(|(d, _)| d).collect();
        assert_eq!(children, vec![bridge, isa]);
    }

    #[test]
    fn full_path_and_uid() {
        let (t, _, bridge, nic) = sample();
        assert_eq!(t.full_path(nic), "/System Bus/PCI0/bridge/nic");
        assert!(t[nic].uid() > t[bridge].uid());
        assert_eq!(t[bridge].device_nr(), Some(1));
    }

    #[test]
    fn child_by_adr_creates_on_demand() {
        let (mut t, pci0, bridge, _) = sample();
        assert_eq!(t.child_by_adr(pci0, 0x0001_0000, false), Some(bridge));
        assert_eq!(t.child_by_adr(pci0, 0x0002_0000, false), None);
        let created = t.child_by_adr(pci0, 0x0002_0000, true).unwrap();
        assert_eq!(t[created].adr(), Some(0x0002_0000));
        assert_eq!(t.parent(created), Some(pci0));
    }

    #[test]
    fn put_tears_down_leaves_only() {
        let (mut t, _, bridge, nic) = sample();
        t.get_ref(bridge);
        assert!(!t.put(bridge));
        assert!(!t.put(bridge));
        assert!(t.put(nic));
        assert!(t.get(nic).is_none());
        assert!(t[bridge].children().is_empty());
        assert!(t.put(bridge));
        assert!(!t.put(DeviceId::ROOT));
    }

    #[test]
    fn match_cid_sources() {
        let (mut t, pci0, _, _) = sample();
        t[pci0].set_hid("PNP0A08");
        t[pci0].add_cid("PNP0A03");
        assert!(t[pci0].match_cid("PNP0A08"));
        assert!(t[pci0].match_cid("PNP0A0?"));
        assert!(t[pci0].match_cid("PNP*"));
        assert!(t[pci0].match_cid("PNP0A03"));
        assert!(!t[pci0].match_cid("ACPI0003"));
        assert_eq!(t.find_by_name("PNP0A08"), Some(pci0));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", ""));
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("abc", "abcd"));
        assert!(glob_match("*d", "abcd"));
    }

    #[test]
    fn bus_attrs_forwarding() {
        let mut b = BusAttrs::root(0, 0, BusType::Express);
        b.secondary = 2;
        b.subordinate = 4;
        assert!(b.forwards(3));
        assert!(!b.forwards(5));
        assert!(!b.forwards(1));
    }
}

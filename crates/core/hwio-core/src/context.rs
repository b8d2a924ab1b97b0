//! The hardware manager state.
//!
//! [`HwContext`] is constructed once at service start and passed by
//! reference to discovery, resource allocation and DMA management. It owns
//! the device and resource arenas, the root address spaces, the registered
//! feature watchers and the DMA domain manager.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::TypeId;

use hwio_driver_api::{DmaSpace, FwResource, FwResourceKind, HwError, Iommu, PciDeviceId};
use log::{debug, info, warn};

use crate::config::HwConfig;
use crate::device::{
    BusAttrs, BusType, DevFeature, DeviceId, DeviceStatus, DeviceTree, FeatureWatcher, WatcherId,
    WatcherRegistry,
};
use crate::dma::{DmaBackend, DmaDomainId, DmaFactoryId, DmaManager, DmaScope};
use crate::firmware::FirmwareNode;
use crate::irq::IrqRouter;
use crate::pci::{ConfigSpace, PciFunction, RootBridge};
use crate::resource::{Resource, ResourceArena, ResourceId, ResourceType, SpaceKind};

/// Platform facts the core cannot discover on its own.
#[derive(Clone)]
pub struct Platform {
    /// Global interrupts wired to INTA..INTD of root buses without a
    /// firmware routing table.
    pub int_map: [u32; 4],
    /// The platform IOMMU, if any.
    pub iommu: Option<Arc<dyn Iommu>>,
    /// Stream-id offset for stream-table IOMMUs.
    pub stream_id_base: u64,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            int_map: [16, 17, 18, 19],
            iommu: None,
            stream_id_base: 0,
        }
    }
}

/// The hardware manager.
pub struct HwContext {
    config: HwConfig,
    pub(crate) devices: DeviceTree,
    pub(crate) resources: ResourceArena,
    watchers: WatcherRegistry<HwContext>,
    int_map: [u32; 4],
    roots: Vec<DeviceId>,
    mmio_root: ResourceId,
    io_root: ResourceId,
    irq_root: ResourceId,
    bus_roots: BTreeMap<u16, ResourceId>,
    pub(crate) dma: DmaManager,
}

impl HwContext {
    /// Creates the context with an empty tree below the system bus.
    #[must_use]
    pub fn new(config: HwConfig, platform: Platform) -> Self {
        let mut devices = DeviceTree::new();
        let mut resources = ResourceArena::new();
        let root = devices.root();

        let mut root_space = |r: Resource, kind: SpaceKind| {
            let id = resources.insert(r, Some(root));
            resources.make_space(id, kind);
            devices[root].add_resource(id);
            id
        };
        let mmio_root = root_space(
            Resource::new(ResourceType::Mmio, 0, u64::MAX).with_id("MMIO"),
            SpaceKind::Root,
        );
        let io_root = root_space(
            Resource::new(ResourceType::Io, 0, 0xFFFF).with_id("IO"),
            SpaceKind::Root,
        );
        let irq_root = root_space(
            Resource::new(ResourceType::Irq, 0, u64::from(u32::MAX)).with_id("IRQ"),
            SpaceKind::IrqRoot,
        );

        let mut dma = DmaManager::new();
        if let Some(iommu) = platform.iommu {
            let f = dma.add_factory(DmaBackend::for_iommu(iommu, platform.stream_id_base));
            devices[root].dma_factory = Some(f);
        }

        let mut ctx = Self {
            config,
            devices,
            resources,
            watchers: WatcherRegistry::new(),
            int_map: platform.int_map,
            roots: Vec::new(),
            mmio_root,
            io_root,
            irq_root,
            bus_roots: BTreeMap::new(),
            dma,
        };
        ctx.register_watcher(FeatureWatcher::pair::<PciFunction, FirmwareNode>(
            "pci-prt",
            Self::install_prt,
        ));
        ctx.register_watcher(FeatureWatcher::pair::<RootBridge, FirmwareNode>(
            "root-prt",
            Self::install_prt,
        ));
        ctx
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &HwConfig {
        &self.config
    }

    /// Returns the device tree.
    #[must_use]
    pub const fn devices(&self) -> &DeviceTree {
        &self.devices
    }

    /// Returns the device tree mutably.
    pub fn devices_mut(&mut self) -> &mut DeviceTree {
        &mut self.devices
    }

    /// Returns the resource arena.
    #[must_use]
    pub const fn resources(&self) -> &ResourceArena {
        &self.resources
    }

    /// Returns the DMA domain manager.
    #[must_use]
    pub const fn dma(&self) -> &DmaManager {
        &self.dma
    }

    /// Returns the root bridges in registration order.
    #[must_use]
    pub fn root_bridges(&self) -> &[DeviceId] {
        &self.roots
    }

    /// Returns the root memory space.
    #[must_use]
    pub const fn mmio_root(&self) -> ResourceId {
        self.mmio_root
    }

    /// Returns the root I/O port space.
    #[must_use]
    pub const fn io_root(&self) -> ResourceId {
        self.io_root
    }

    /// Returns the root interrupt space.
    #[must_use]
    pub const fn irq_root(&self) -> ResourceId {
        self.irq_root
    }

    /// Returns the bus-number space of `segment`, creating it on first use.
    pub fn bus_root(&mut self, segment: u16) -> ResourceId {
        if let Some(&id) = self.bus_roots.get(&segment) {
            return id;
        }
        let id = self.add_space(
            DeviceId::ROOT,
            Resource::new(ResourceType::Bus, 0, 0xFF).with_id("BUS"),
            SpaceKind::Root,
        );
        self.bus_roots.insert(segment, id);
        id
    }

    // -----------------------------------------------------------------------
    // Devices and resources
    // -----------------------------------------------------------------------

    /// Creates a device below `parent`.
    pub fn add_device(&mut self, parent: DeviceId, name: impl Into<String>, adr: Option<u32>) -> DeviceId {
        self.devices.add_child(parent, name, adr)
    }

    /// Attaches `r` to `dev` and returns its id.
    pub fn add_resource(&mut self, dev: DeviceId, r: Resource) -> ResourceId {
        let id = self.resources.insert(r, Some(dev));
        self.devices[dev].add_resource(id);
        id
    }

    /// Attaches `r` to `dev` as a space of `kind`.
    pub fn add_space(&mut self, dev: DeviceId, r: Resource, kind: SpaceKind) -> ResourceId {
        let id = self.add_resource(dev, r);
        self.resources.make_space(id, kind);
        id
    }

    /// Returns the first resource of `dev` with identifier `id`.
    #[must_use]
    pub fn resource_by_id(&self, dev: DeviceId, id: &str) -> Option<ResourceId> {
        self.devices
            .get(dev)?
            .resources()
            .iter()
            .copied()
            .find(|&r| self.resources[r].id() == Some(id))
    }

    /// Attaches a feature to `dev` and runs every watcher it completes.
    pub fn add_feature(&mut self, dev: DeviceId, feature: Box<dyn DevFeature>) {
        debug!("device: {} gains {}", self.devices[dev].name(), feature.name());
        let ty = self.devices[dev].features_mut().push(feature);
        self.fire_watchers(dev, Some(ty), None);
    }

    fn fire_watchers(&mut self, dev: DeviceId, added: Option<TypeId>, only: Option<WatcherId>) {
        let ready = self.watchers.ready(added, self.devices[dev].features());
        for w in ready {
            if only.is_some_and(|o| o != w) {
                continue;
            }
            self.devices[dev].features_mut().mark_fired(w);
            if let Some(setup) = self.watchers.setup(w) {
                if let Some(watcher) = self.watchers.get(w) {
                    debug!("device: {}: running {}", self.devices[dev].name(), watcher.name());
                }
                setup(self, dev);
            }
        }
    }

    /// Registers a watcher and runs it on every device it already matches.
    pub fn register_watcher(&mut self, watcher: FeatureWatcher<Self>) -> WatcherId {
        let id = self.watchers.register(watcher);
        let all: Vec<DeviceId> = core::iter::once(DeviceId::ROOT)
            .chain(self.devices.iter(DeviceId::ROOT, usize::MAX).map(|(d, _)| d))
            .collect();
        for dev in all {
            self.fire_watchers(dev, None, Some(id));
        }
        id
    }

    /// Creates a firmware-described device below `parent`.
    pub fn add_firmware_device(&mut self, parent: DeviceId, name: &str, node: FirmwareNode) -> DeviceId {
        let dev = self.devices.add_child(parent, name, node.adr);
        self.attach_firmware(dev, node);
        dev
    }

    /// Attaches a firmware description to an existing device: its ids, its
    /// resources (fixed) and the node itself as a feature.
    pub fn attach_firmware(&mut self, dev: DeviceId, node: FirmwareNode) {
        if let Some(hid) = &node.hid {
            self.devices[dev].set_hid(hid.clone());
        }
        for cid in &node.cids {
            self.devices[dev].add_cid(cid.clone());
        }
        for fw in &node.resources {
            self.add_resource(dev, Resource::from_firmware(fw));
        }
        self.add_feature(dev, Box::new(node));
    }

    /// Installs a firmware routing table as the interrupt router of a bus
    /// device whose firmware node carries one.
    fn install_prt(&mut self, dev: DeviceId) {
        let Some(node) = self.devices[dev].feature::<FirmwareNode>() else {
            return;
        };
        if node.prt.is_empty() || self.devices[dev].bus().is_none() {
            return;
        }
        let entries = node.prt.clone();
        let count = entries.len();
        let router = IrqRouter::Prt { entries };
        match self.resource_by_id(dev, "IRQ") {
            Some(id) => {
                let routed = self.resources[id].space().map_or(0, |s| s.children().len());
                if routed > 0 {
                    warn!(
                        "irq: {}: {routed} line(s) already routed by {}, keeping them",
                        self.devices[dev].name(),
                        self.resources.space_kind(id).map_or("none", SpaceKind::name)
                    );
                }
                self.resources.make_space(id, SpaceKind::Router(router));
            }
            None => {
                self.add_space(
                    dev,
                    Resource::new(ResourceType::Irq, 0, 3).with_id("IRQ"),
                    SpaceKind::Router(router),
                );
            }
        }
        info!("irq: {}: using firmware routing table ({count} entries)", self.devices[dev].name());
    }

    // -----------------------------------------------------------------------
    // Root bridges
    // -----------------------------------------------------------------------

    /// Registers a PCI root bridge for bus `bus` of `segment`.
    ///
    /// `windows` are the memory and I/O ranges the firmware says the bridge
    /// decodes. Without windows, allocations below the bridge fall through
    /// to the root spaces.
    pub fn add_root_bridge(
        &mut self,
        segment: u16,
        bus: u8,
        cfg: Arc<dyn ConfigSpace>,
        windows: &[FwResource],
    ) -> DeviceId {
        let name = alloc::format!("PCI{}", self.roots.len());
        let dev = self.devices.add_child(DeviceId::ROOT, name, None);
        self.devices[dev].set_hid("PNP0A08");
        self.devices[dev].set_bus(BusAttrs::root(segment, bus, BusType::Express));
        self.devices[dev].add_flags(crate::device::DeviceFlags::MULTI_BUS);
        self.bus_root(segment);

        for fw in windows {
            let id = match fw.kind {
                FwResourceKind::Io => "WIN2",
                FwResourceKind::Mmio if fw.prefetchable => "WIN1",
                FwResourceKind::Mmio => "WIN0",
                _ => {
                    debug!("pci: ignoring {:?} window of root bridge {segment:04x}:{bus:02x}", fw.kind);
                    continue;
                }
            };
            self.add_space(dev, Resource::from_firmware(fw).with_id(id), SpaceKind::Window);
        }
        self.add_space(
            dev,
            Resource::new(ResourceType::Bus, u64::from(bus), u64::from(bus)).with_id("BUS"),
            SpaceKind::Window,
        );
        let int_map = self.int_map;
        self.add_space(
            dev,
            Resource::new(ResourceType::Irq, 0, 3).with_id("IRQ"),
            SpaceKind::Router(IrqRouter::PinMap { int_map }),
        );

        info!("pci: root bridge {segment:04x}:{bus:02x}");
        self.roots.push(dev);
        self.add_feature(dev, Box::new(RootBridge::new(segment, bus, cfg)));
        dev
    }

    // -----------------------------------------------------------------------
    // Space dispatch
    // -----------------------------------------------------------------------

    /// Binds `child`, requested by `cdev`, into `space` according to the
    /// space's policy.
    ///
    /// # Errors
    ///
    /// The errors of [`ResourceArena::bind`] or [`HwContext::route_irq`].
    pub fn request(&mut self, space: ResourceId, child: ResourceId, cdev: DeviceId) -> Result<(), HwError> {
        match self.resources.space_kind(space) {
            Some(SpaceKind::Router(_)) => self.route_irq(space, child, cdev),
            Some(_) => self.resources.bind(space, child),
            None => Err(HwError::PolicyViolation),
        }
    }

    /// Finds and reserves a free range for `child` in `space`; with
    /// `commit == false` only checks that one exists.
    ///
    /// # Errors
    ///
    /// The errors of [`ResourceArena::place`].
    pub fn alloc(&mut self, space: ResourceId, child: ResourceId, commit: bool) -> Result<(), HwError> {
        let min = self.config.min_alignment;
        self.resources.place(space, child, commit, min)
    }

    /// Assigns `child` to the window `space` (sizing pass or verbatim bind).
    ///
    /// # Errors
    ///
    /// [`HwError::PolicyViolation`] on root spaces and routers.
    pub fn assign(&mut self, space: ResourceId, child: ResourceId) -> Result<(), HwError> {
        self.resources.assign(space, child)
    }

    /// Repacks the children of the window `space`; returns the children that
    /// had to be disabled.
    ///
    /// # Errors
    ///
    /// [`HwError::PolicyViolation`] on root spaces and routers.
    pub fn adjust_children(&mut self, space: ResourceId) -> Result<Vec<ResourceId>, HwError> {
        let min = self.config.min_alignment;
        self.resources.adjust_children(space, min)
    }

    // -----------------------------------------------------------------------
    // DMA
    // -----------------------------------------------------------------------

    /// Installs `backend` as the DMA factory for `dev` and its descendants.
    pub fn set_dma_factory(&mut self, dev: DeviceId, backend: DmaBackend) -> DmaFactoryId {
        let f = self.dma.add_factory(backend);
        self.devices[dev].dma_factory = Some(f);
        f
    }

    /// Returns the DMA domain of `dev`, resolving and caching it on first
    /// query.
    pub fn dma_domain_for(&mut self, dev: DeviceId) -> DmaDomainId {
        if let Some(d) = self.devices[dev].dma_domain {
            return d;
        }
        let d = self.resolve_dma_domain(dev);
        self.devices[dev].dma_domain = Some(d);
        d
    }

    fn nearest_factory(&self, dev: DeviceId) -> Option<DmaFactoryId> {
        self.devices.ancestors(dev).find_map(|a| self.devices[a].dma_factory)
    }

    fn resolve_dma_domain(&mut self, dev: DeviceId) -> DmaDomainId {
        let Some(factory) = self.nearest_factory(dev) else {
            return self.dma.identity();
        };

        if let Some(f) = self.devices[dev].feature::<PciFunction>() {
            let (address, phantom) = (f.address(), f.phantom_fns());
            if let Some(bridge) = self.conventional_upstream(dev) {
                return self.downstream_domain(bridge, factory);
            }
            return self.dma.create_domain(factory, DmaScope::Endpoint { address, phantom });
        }

        let own = self.devices[dev].dma_factory.is_some();
        match self.devices.parent(dev) {
            Some(parent) if !own && self.devices[dev].bus().is_none() => self.dma_domain_for(parent),
            _ => self.dma.create_domain(factory, DmaScope::Global),
        }
    }

    /// Returns the PCI-PCI bridge above `dev` whose secondary bus is
    /// conventional PCI, if `dev` sits directly behind one.
    fn conventional_upstream(&self, dev: DeviceId) -> Option<DeviceId> {
        let parent = self.devices.parent(dev)?;
        let p = &self.devices[parent];
        let is_bridge = p.feature::<PciFunction>().is_some();
        (is_bridge && p.bus()?.bus_type == BusType::Conventional).then_some(parent)
    }

    fn downstream_domain(&mut self, bridge: DeviceId, factory: DmaFactoryId) -> DmaDomainId {
        if let Some(d) = self.devices[bridge].downstream_dma {
            return d;
        }
        let (secondary, subordinate) = self.devices[bridge]
            .bus()
            .map_or((0, 0), |b| (b.secondary, b.subordinate));
        let d = self.dma.create_domain(factory, DmaScope::Bus { secondary, subordinate });
        self.devices[bridge].downstream_dma = Some(d);
        d
    }

    /// Creates (once) and returns the managed DMA space of `dev`'s domain.
    ///
    /// # Errors
    ///
    /// See [`DmaManager::create_managed_kern_dma_space`].
    pub fn create_managed_kern_dma_space(&mut self, dev: DeviceId) -> Result<DmaSpace, HwError> {
        let d = self.dma_domain_for(dev);
        self.dma.create_managed_kern_dma_space(d)
    }

    /// Binds or unbinds a driver-supplied DMA space for `dev`'s domain.
    ///
    /// # Errors
    ///
    /// See [`DmaManager::set_dma_task`].
    pub fn set_dma_task(&mut self, dev: DeviceId, set: bool, space: DmaSpace) -> Result<(), HwError> {
        let d = self.dma_domain_for(dev);
        self.dma.set_dma_task(d, set, space)
    }

    /// Returns the id MSI writes from `dev` carry.
    ///
    /// Functions behind a conventional bridge are seen with the bridge's
    /// bus id; with `transparent_msi` the id covers the whole subordinate
    /// range.
    #[must_use]
    pub fn msi_source_id(&self, dev: DeviceId) -> Option<u64> {
        let f = self.devices.get(dev)?.feature::<PciFunction>()?;
        if let Some(bridge) = self.conventional_upstream(dev) {
            let b = self.devices[bridge].bus()?;
            let last = if self.config.transparent_msi { b.subordinate } else { b.secondary };
            return Some(crate::dma::bus_source_id(b.secondary, last));
        }
        let a = f.address();
        Some(crate::dma::endpoint_source_id(a.bus, a.devfn()))
    }

    // -----------------------------------------------------------------------
    // Queries and power management
    // -----------------------------------------------------------------------

    /// Returns every PCI function matching `id`.
    #[must_use]
    pub fn pci_devices_matching(&self, id: &PciDeviceId) -> Vec<DeviceId> {
        self.devices
            .iter(DeviceId::ROOT, usize::MAX)
            .map(|(d, _)| d)
            .filter(|&d| {
                self.devices[d]
                    .feature::<PciFunction>()
                    .is_some_and(|f| id.matches(f.info()))
            })
            .collect()
    }

    /// Runs the suspend hooks of `dev` and its descendants, deepest first.
    ///
    /// # Errors
    ///
    /// Stops at the first failing hook.
    pub fn pm_suspend(&mut self, dev: DeviceId) -> Result<(), HwError> {
        let mut order: Vec<DeviceId> = self.devices.iter(dev, usize::MAX).map(|(d, _)| d).collect();
        order.reverse();
        order.push(dev);
        for d in order {
            self.devices[d].features_mut().suspend_all()?;
        }
        Ok(())
    }

    /// Runs the resume hooks of `dev` and its descendants, parents first.
    ///
    /// # Errors
    ///
    /// Stops at the first failing hook.
    pub fn pm_resume(&mut self, dev: DeviceId) -> Result<(), HwError> {
        let order: Vec<DeviceId> = core::iter::once(dev)
            .chain(self.devices.iter(dev, usize::MAX).map(|(d, _)| d))
            .collect();
        for d in order {
            self.devices[d].features_mut().resume_all()?;
        }
        Ok(())
    }

    /// Disables `dev` and every resource it owns.
    pub fn disable_device(&mut self, dev: DeviceId) {
        warn!("device: disabling {}", self.devices.full_path(dev));
        self.devices[dev].set_status(DeviceStatus::Disabled);
        for r in self.devices[dev].resources().to_vec() {
            self.resources.release(r);
            self.resources[r].disable();
        }
    }

    /// Logs the whole device tree.
    pub fn dump(&self) {
        self.devices.dump(DeviceId::ROOT, &self.resources);
    }
}

#[cfg(test)]
mod tests {
    use alloc::format;
    use core::any::Any;

    use hwio_driver_api::{IommuKind, PciAddress};

    use super::*;
    use crate::dma::bus_source_id;
    use crate::dma::tests::RecordingIommu;
    use crate::pci::cfg::CfgAddr;
    use crate::pci::regs;
    use crate::pci::sim::{SimFabric, SimFunction};

    fn with_iommu(fab: &Arc<SimFabric>, iommu: Option<Arc<RecordingIommu>>) -> (HwContext, DeviceId) {
        let platform = Platform {
            iommu: iommu.map(|i| i as Arc<dyn Iommu>),
            ..Platform::default()
        };
        let mut ctx = HwContext::new(HwConfig::default(), platform);
        let root = ctx.add_root_bridge(0, 0, Arc::clone(fab) as Arc<dyn ConfigSpace>, &[]);
        ctx.discover();
        (ctx, root)
    }

    fn nic() -> SimFunction {
        SimFunction::endpoint(0x8086, 0x100E, 0x02_0000)
    }

    #[test]
    fn no_iommu_means_identity() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 3, 0, nic());
        let (mut ctx, root) = with_iommu(&fab, None);
        let ep = ctx.devices()[root].children()[0];

        let d = ctx.dma_domain_for(ep);
        assert_eq!(d, ctx.dma().identity());
        assert_eq!(ctx.create_managed_kern_dma_space(ep), Err(HwError::NotFound));
        assert_eq!(ctx.set_dma_task(ep, true, DmaSpace(5)), Err(HwError::NotFound));
    }

    #[test]
    fn endpoint_domain_is_cached_and_bound_once() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 3, 0, nic());
        let iommu = Arc::new(RecordingIommu::new(IommuKind::TableBased));
        let (mut ctx, root) = with_iommu(&fab, Some(Arc::clone(&iommu)));
        let ep = ctx.devices()[root].children()[0];

        let d = ctx.dma_domain_for(ep);
        assert_eq!(ctx.dma_domain_for(ep), d);
        assert_eq!(
            ctx.dma().domain(d).map(|d| d.scope()),
            Some(DmaScope::Endpoint { address: PciAddress::new(0, 3, 0), phantom: 0 })
        );

        let space = ctx.create_managed_kern_dma_space(ep).unwrap();
        assert_eq!(ctx.create_managed_kern_dma_space(ep), Ok(space));
        assert_eq!(*iommu.bound.lock(), vec![(0x4_0018, space)]);
        assert_eq!(ctx.set_dma_task(ep, true, DmaSpace(99)), Err(HwError::Busy));
    }

    #[test]
    fn functions_behind_a_conventional_bridge_share_a_bus_domain() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 1, 0, SimFunction::bridge(0x8086, 0x244E).with_buses(0, 0, 0));
        fab.insert(1, 0, 0, nic());
        fab.insert(1, 4, 0, nic());
        let iommu = Arc::new(RecordingIommu::new(IommuKind::TableBased));
        let (mut ctx, root) = with_iommu(&fab, Some(Arc::clone(&iommu)));
        let bridge = ctx.devices()[root].children()[0];
        let kids = ctx.devices()[bridge].children().to_vec();
        assert_eq!(kids.len(), 2);

        let d = ctx.dma_domain_for(kids[0]);
        assert_eq!(ctx.dma_domain_for(kids[1]), d);
        assert_eq!(
            ctx.dma().domain(d).map(|d| d.scope()),
            Some(DmaScope::Bus { secondary: 1, subordinate: 1 })
        );
        assert_eq!(ctx.msi_source_id(kids[1]), Some(bus_source_id(1, 1)));

        ctx.set_dma_task(kids[0], true, DmaSpace(7)).unwrap();
        assert_eq!(*iommu.bound.lock(), vec![(0x8_0101, DmaSpace(7))]);
        ctx.set_dma_task(kids[1], false, DmaSpace(7)).unwrap();
        assert!(iommu.bound.lock().is_empty());
    }

    #[test]
    fn express_endpoint_msi_id_is_its_own() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 3, 0, nic());
        let (ctx, root) = with_iommu(&fab, None);
        let ep = ctx.devices()[root].children()[0];
        assert_eq!(ctx.msi_source_id(ep), Some(0x4_0018));
        assert_eq!(ctx.msi_source_id(root), None);
    }

    #[test]
    fn platform_devices_inherit_the_parent_domain() {
        let fab = Arc::new(SimFabric::new());
        let iommu = Arc::new(RecordingIommu::new(IommuKind::StreamIdBased));
        let (mut ctx, _) = with_iommu(&fab, Some(iommu));
        let uart = ctx.add_firmware_device(DeviceId::ROOT, "COM1", FirmwareNode::with_hid("PNP0501"));

        let d = ctx.dma_domain_for(uart);
        assert_eq!(ctx.dma_domain_for(DeviceId::ROOT), d);
        assert_eq!(ctx.dma().domain(d).map(|d| d.scope()), Some(DmaScope::Global));
    }

    #[test]
    fn device_level_factory_overrides_the_platform() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 3, 0, nic());
        let (mut ctx, root) = with_iommu(&fab, None);
        let iommu = Arc::new(RecordingIommu::new(IommuKind::StreamIdBased));
        ctx.set_dma_factory(root, DmaBackend::for_iommu(iommu, 0x1_0000));
        let ep = ctx.devices()[root].children()[0];

        let d = ctx.dma_domain_for(ep);
        assert_eq!(ctx.dma().source_ids(d), vec![0x1_0018]);
        assert_eq!(ctx.dma_domain_for(DeviceId::ROOT), ctx.dma().identity());
    }

    struct Tag;

    impl DevFeature for Tag {
        fn name(&self) -> &'static str {
            "tag"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn mark(ctx: &mut HwContext, dev: DeviceId) {
        let name = format!("{}+", ctx.devices()[dev].name());
        ctx.devices_mut()[dev].set_name(name);
    }

    #[test]
    fn watcher_fires_once_per_device() {
        let fab = Arc::new(SimFabric::new());
        let (mut ctx, _) = with_iommu(&fab, None);
        ctx.register_watcher(FeatureWatcher::pair::<FirmwareNode, Tag>("tagged", mark));

        let dev = ctx.add_firmware_device(DeviceId::ROOT, "DEV", FirmwareNode::default());
        assert_eq!(ctx.devices()[dev].name(), "DEV");
        ctx.add_feature(dev, Box::new(Tag));
        assert_eq!(ctx.devices()[dev].name(), "DEV+");
        ctx.add_feature(dev, Box::new(Tag));
        assert_eq!(ctx.devices()[dev].name(), "DEV+");
    }

    #[test]
    fn late_watcher_sees_existing_devices() {
        let fab = Arc::new(SimFabric::new());
        let (mut ctx, _) = with_iommu(&fab, None);
        let dev = ctx.add_device(DeviceId::ROOT, "OLD", None);
        ctx.add_feature(dev, Box::new(Tag));

        ctx.register_watcher(FeatureWatcher::new("tag", vec![TypeId::of::<Tag>()], mark));
        assert_eq!(ctx.devices()[dev].name(), "OLD+");
    }

    #[test]
    fn suspend_and_resume_restore_the_header() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 3, 0, nic().with_mem_bar(0, 0xFEB0_0000, 0x2_0000, false));
        let (mut ctx, root) = with_iommu(&fab, None);

        ctx.pm_suspend(root).unwrap();
        fab.write_u32(CfgAddr::new(0, 3, 0, regs::BAR0), 0).unwrap();
        assert_eq!(fab.peek(0, 3, 0, regs::BAR0), 0);
        ctx.pm_resume(root).unwrap();
        assert_eq!(fab.peek(0, 3, 0, regs::BAR0), 0xFEB0_0000);
    }

    #[test]
    fn driver_queries_by_pci_id() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 3, 0, nic());
        fab.insert(0, 4, 0, SimFunction::endpoint(0x1B36, 0x000D, 0x0C_0330));
        let (ctx, root) = with_iommu(&fab, None);

        let usb = ctx.pci_devices_matching(&PciDeviceId::with_class(0x0C, 0x03));
        assert_eq!(usb, vec![ctx.devices()[root].children()[1]]);
        assert_eq!(ctx.pci_devices_matching(&PciDeviceId::new(0x8086, 0x100E)).len(), 1);
        assert!(ctx.pci_devices_matching(&PciDeviceId::new(0x10EC, 0x8139)).is_empty());
    }

    #[test]
    fn root_bridge_routing_table_replaces_the_pin_map() {
        let fab = Arc::new(SimFabric::new());
        let (mut ctx, root) = with_iommu(&fab, None);
        let irq = ctx.resource_by_id(root, "IRQ").unwrap();
        assert!(matches!(
            ctx.resources().space_kind(irq),
            Some(SpaceKind::Router(IrqRouter::PinMap { .. }))
        ));
        ctx.attach_firmware(
            root,
            FirmwareNode::with_hid("PNP0A08").routing(vec![hwio_driver_api::PrtEntry::gsi(1, 0, 20)]),
        );
        assert!(matches!(
            ctx.resources().space_kind(irq),
            Some(SpaceKind::Router(IrqRouter::Prt { .. }))
        ));
    }

    #[test]
    fn late_routing_table_keeps_lines_already_routed() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(0, 3, 0, nic().with_irq_pin(1));
        let (mut ctx, root) = with_iommu(&fab, None);
        ctx.allocate_resources();
        let ep = ctx.devices()[root].children()[0];
        let pin = ctx.resource_by_id(ep, "PIN").unwrap();
        let irq = ctx.resource_by_id(root, "IRQ").unwrap();
        assert_eq!(ctx.resources()[pin].parent(), Some(irq));

        ctx.attach_firmware(
            root,
            FirmwareNode::with_hid("PNP0A08").routing(vec![hwio_driver_api::PrtEntry::gsi(3, 0, 20)]),
        );
        assert!(matches!(
            ctx.resources().space_kind(irq),
            Some(SpaceKind::Router(IrqRouter::Prt { .. }))
        ));
        assert_eq!(ctx.resources()[irq].space().unwrap().children(), &[pin]);
        assert_eq!(ctx.resources()[pin].parent(), Some(irq));
    }
}

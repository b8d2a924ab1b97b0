//! DMA remapping domains.
//!
//! A [`DmaDomain`] is the IOMMU context one device (or one conventional bus)
//! issues DMA through. Domains are created by a [`DmaBackend`] installed as
//! the *factory* of some device in the tree; every device below inherits
//! the nearest ancestor's factory. Without any factory a device resolves to
//! the shared identity domain, which forwards addresses unmodified.
//!
//! A domain is bound to at most one kernel DMA space at a time: either a
//! space the manager creates on demand
//! ([`create_managed_kern_dma_space`](DmaManager::create_managed_kern_dma_space))
//! or one a driver supplies ([`set_dma_task`](DmaManager::set_dma_task)).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hwio_driver_api::{DmaSpace, HwError, Iommu, IommuKind, PciAddress};
use log::{debug, warn};

pub mod source_id;

pub use source_id::{bus_source_id, endpoint_source_id, endpoint_source_ids};

/// Index of a domain in the [`DmaManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaDomainId(u32);

/// Index of a factory in the [`DmaManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaFactoryId(u32);

/// A platform DMA backend, selected once per factory.
#[derive(Clone)]
pub enum DmaBackend {
    /// No remapping: devices see physical addresses.
    Identity,
    /// A requester-id indexed IOMMU.
    TableBased(Arc<dyn Iommu>),
    /// A stream-table IOMMU; stream id = `sid_base` + requester id.
    StreamIdBased {
        /// The remapping unit.
        iommu: Arc<dyn Iommu>,
        /// Offset added to every requester id.
        sid_base: u64,
    },
}

impl DmaBackend {
    /// Wraps `iommu` in the backend matching its [`IommuKind`].
    #[must_use]
    pub fn for_iommu(iommu: Arc<dyn Iommu>, sid_base: u64) -> Self {
        match iommu.kind() {
            IommuKind::TableBased => Self::TableBased(iommu),
            IommuKind::StreamIdBased => Self::StreamIdBased { iommu, sid_base },
        }
    }

    /// Returns a short name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::TableBased(_) => "table",
            Self::StreamIdBased { .. } => "stream-id",
        }
    }

    fn iommu(&self) -> Option<&Arc<dyn Iommu>> {
        match self {
            Self::Identity => None,
            Self::TableBased(iommu) | Self::StreamIdBased { iommu, .. } => Some(iommu),
        }
    }
}

impl fmt::Debug for DmaBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What traffic a domain covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaScope {
    /// One function and its phantom aliases.
    Endpoint {
        /// Function address.
        address: PciAddress,
        /// Phantom-function bit count.
        phantom: u8,
    },
    /// Every function behind a conventional bridge.
    Bus {
        /// First bus behind the bridge.
        secondary: u8,
        /// Last bus behind the bridge.
        subordinate: u8,
    },
    /// Devices with no bus-level identity.
    Global,
}

/// One DMA domain.
#[derive(Debug, Clone)]
pub struct DmaDomain {
    factory: Option<DmaFactoryId>,
    scope: DmaScope,
    managed: Option<DmaSpace>,
    task: Option<DmaSpace>,
}

impl DmaDomain {
    /// Returns the coverage of this domain.
    #[must_use]
    pub const fn scope(&self) -> DmaScope {
        self.scope
    }

    /// Returns `true` for the identity domain.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.factory.is_none()
    }

    /// Returns the space created by the manager, if any.
    #[must_use]
    pub const fn managed_space(&self) -> Option<DmaSpace> {
        self.managed
    }

    /// Returns the space supplied by a driver, if any.
    #[must_use]
    pub const fn task_space(&self) -> Option<DmaSpace> {
        self.task
    }
}

/// Owner of every DMA factory and domain.
#[derive(Debug)]
pub struct DmaManager {
    factories: Vec<DmaBackend>,
    domains: Vec<DmaDomain>,
}

impl Default for DmaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaManager {
    /// Creates a manager holding only the identity domain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            domains: alloc::vec![DmaDomain {
                factory: None,
                scope: DmaScope::Global,
                managed: None,
                task: None,
            }],
        }
    }

    /// Returns the shared identity domain.
    #[must_use]
    pub const fn identity(&self) -> DmaDomainId {
        DmaDomainId(0)
    }

    /// Registers a backend and returns its factory id.
    pub fn add_factory(&mut self, backend: DmaBackend) -> DmaFactoryId {
        self.factories.push(backend);
        DmaFactoryId(u32::try_from(self.factories.len() - 1).unwrap_or(u32::MAX))
    }

    /// Returns the backend of `factory`.
    #[must_use]
    pub fn backend(&self, factory: DmaFactoryId) -> Option<&DmaBackend> {
        self.factories.get(factory.0 as usize)
    }

    /// Creates a domain of `factory` covering `scope`.
    ///
    /// An identity factory yields the shared identity domain.
    pub fn create_domain(&mut self, factory: DmaFactoryId, scope: DmaScope) -> DmaDomainId {
        match self.backend(factory) {
            None | Some(DmaBackend::Identity) => return self.identity(),
            Some(_) => {}
        }
        self.domains.push(DmaDomain {
            factory: Some(factory),
            scope,
            managed: None,
            task: None,
        });
        let id = DmaDomainId(u32::try_from(self.domains.len() - 1).unwrap_or(u32::MAX));
        debug!("dma: new domain {id:?} for {scope:?}");
        id
    }

    /// Returns the domain `id`.
    #[must_use]
    pub fn domain(&self, id: DmaDomainId) -> Option<&DmaDomain> {
        self.domains.get(id.0 as usize)
    }

    /// Returns the ids the platform uses to tag the traffic of `id`.
    #[must_use]
    pub fn source_ids(&self, id: DmaDomainId) -> Vec<u64> {
        let Some(d) = self.domain(id) else {
            return Vec::new();
        };
        let Some(backend) = d.factory.and_then(|f| self.backend(f)) else {
            return Vec::new();
        };
        match (backend, d.scope) {
            (DmaBackend::Identity, _) | (_, DmaScope::Global) => Vec::new(),
            (DmaBackend::TableBased(_), DmaScope::Endpoint { address, phantom }) => {
                endpoint_source_ids(address, phantom)
            }
            (DmaBackend::TableBased(_), DmaScope::Bus { secondary, subordinate }) => {
                alloc::vec![bus_source_id(secondary, subordinate)]
            }
            (DmaBackend::StreamIdBased { sid_base, .. }, DmaScope::Endpoint { address, phantom }) => {
                source_id::phantom_devfns(address, phantom)
                    .into_iter()
                    .map(|devfn| sid_base + ((u64::from(address.bus) << 8) | u64::from(devfn)))
                    .collect()
            }
            (DmaBackend::StreamIdBased { sid_base, .. }, DmaScope::Bus { secondary, .. }) => {
                alloc::vec![sid_base + (u64::from(secondary) << 8)]
            }
        }
    }

    fn iommu_of(&self, id: DmaDomainId) -> Result<Arc<dyn Iommu>, HwError> {
        let d = self.domain(id).ok_or(HwError::NotFound)?;
        d.factory
            .and_then(|f| self.backend(f))
            .and_then(DmaBackend::iommu)
            .cloned()
            .ok_or(HwError::NotFound)
    }

    /// Binds every source id of `id` to `space`, undoing partial progress
    /// on failure.
    fn bind(&self, id: DmaDomainId, space: DmaSpace) -> Result<(), HwError> {
        let iommu = self.iommu_of(id)?;
        let ids = self.source_ids(id);
        for (n, &sid) in ids.iter().enumerate() {
            if let Err(err) = iommu.bind(sid, space) {
                warn!("dma: binding source {sid:#x} failed: {err}");
                for &done in &ids[..n] {
                    let _ = iommu.unbind(done, space);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn unbind(&self, id: DmaDomainId, space: DmaSpace) -> Result<(), HwError> {
        let iommu = self.iommu_of(id)?;
        let mut result = Ok(());
        for sid in self.source_ids(id) {
            if let Err(err) = iommu.unbind(sid, space) {
                warn!("dma: unbinding source {sid:#x} failed: {err}");
                result = Err(err);
            }
        }
        result
    }

    /// Returns the managed kernel DMA space of `id`, creating and binding
    /// it on first use.
    ///
    /// # Errors
    ///
    /// - [`HwError::NotFound`] for the identity domain.
    /// - [`HwError::Busy`] while a driver-supplied space is bound.
    /// - Errors of the platform IOMMU; the domain stays unbound.
    pub fn create_managed_kern_dma_space(&mut self, id: DmaDomainId) -> Result<DmaSpace, HwError> {
        let d = self.domain(id).ok_or(HwError::NotFound)?;
        if let Some(space) = d.managed {
            return Ok(space);
        }
        if d.task.is_some() {
            return Err(HwError::Busy);
        }
        let iommu = self.iommu_of(id)?;
        let space = iommu.create_dma_space()?;
        self.bind(id, space)?;
        self.domains[id.0 as usize].managed = Some(space);
        debug!("dma: domain {id:?} bound to managed space {space:?}");
        Ok(space)
    }

    /// Binds (`set == true`) or unbinds a driver-supplied DMA space.
    ///
    /// # Errors
    ///
    /// - [`HwError::NotFound`] for the identity domain.
    /// - [`HwError::Busy`] if a managed space exists, or when setting while
    ///   another driver space is bound.
    /// - [`HwError::InvalidArgument`] when unsetting with nothing bound or
    ///   with a space other than the bound one.
    pub fn set_dma_task(&mut self, id: DmaDomainId, set: bool, space: DmaSpace) -> Result<(), HwError> {
        let d = self.domain(id).ok_or(HwError::NotFound)?;
        if d.is_identity() {
            return Err(HwError::NotFound);
        }
        if d.managed.is_some() {
            return Err(HwError::Busy);
        }
        if set {
            if d.task.is_some() {
                return Err(HwError::Busy);
            }
            self.bind(id, space)?;
            self.domains[id.0 as usize].task = Some(space);
        } else {
            if d.task != Some(space) {
                return Err(HwError::InvalidArgument);
            }
            self.unbind(id, space)?;
            self.domains[id.0 as usize].task = None;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use spin::Mutex;

    /// Records every bind and unbind.
    pub(crate) struct RecordingIommu {
        kind: IommuKind,
        next: Mutex<u64>,
        pub(crate) bound: Mutex<Vec<(u64, DmaSpace)>>,
        fail_on: Option<u64>,
    }

    impl RecordingIommu {
        pub(crate) fn new(kind: IommuKind) -> Self {
            Self {
                kind,
                next: Mutex::new(1),
                bound: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    impl Iommu for RecordingIommu {
        fn kind(&self) -> IommuKind {
            self.kind
        }

        fn create_dma_space(&self) -> Result<DmaSpace, HwError> {
            let mut n = self.next.lock();
            *n += 1;
            Ok(DmaSpace(*n))
        }

        fn bind(&self, source_id: u64, space: DmaSpace) -> Result<(), HwError> {
            if self.fail_on == Some(source_id) {
                return Err(HwError::Iommu);
            }
            self.bound.lock().push((source_id, space));
            Ok(())
        }

        fn unbind(&self, source_id: u64, space: DmaSpace) -> Result<(), HwError> {
            self.bound.lock().retain(|&b| b != (source_id, space));
            Ok(())
        }
    }

    fn endpoint(bus: u8, dev: u8) -> DmaScope {
        DmaScope::Endpoint {
            address: PciAddress::new(bus, dev, 0),
            phantom: 0,
        }
    }

    #[test]
    fn identity_factory_yields_identity_domain() {
        let mut m = DmaManager::new();
        let f = m.add_factory(DmaBackend::Identity);
        let d = m.create_domain(f, endpoint(0, 1));
        assert_eq!(d, m.identity());
        assert!(m.domain(d).unwrap().is_identity());
        assert_eq!(m.set_dma_task(d, true, DmaSpace(7)), Err(HwError::NotFound));
        assert_eq!(m.create_managed_kern_dma_space(d), Err(HwError::NotFound));
    }

    #[test]
    fn managed_space_is_created_once() {
        let iommu = Arc::new(RecordingIommu::new(IommuKind::TableBased));
        let mut m = DmaManager::new();
        let f = m.add_factory(DmaBackend::for_iommu(iommu.clone(), 0));
        let d = m.create_domain(f, endpoint(1, 2));
        let s1 = m.create_managed_kern_dma_space(d).unwrap();
        let s2 = m.create_managed_kern_dma_space(d).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(*iommu.bound.lock(), vec![(0x4_0110, s1)]);
        assert_eq!(m.set_dma_task(d, true, DmaSpace(99)), Err(HwError::Busy));
        assert_eq!(m.set_dma_task(d, false, s1), Err(HwError::Busy));
    }

    #[test]
    fn driver_space_set_and_unset() {
        let iommu = Arc::new(RecordingIommu::new(IommuKind::TableBased));
        let mut m = DmaManager::new();
        let f = m.add_factory(DmaBackend::TableBased(iommu.clone()));
        let d = m.create_domain(f, DmaScope::Bus { secondary: 3, subordinate: 4 });

        assert_eq!(m.set_dma_task(d, false, DmaSpace(5)), Err(HwError::InvalidArgument));
        m.set_dma_task(d, true, DmaSpace(5)).unwrap();
        assert_eq!(*iommu.bound.lock(), vec![(0x8_0304, DmaSpace(5))]);
        assert_eq!(m.set_dma_task(d, true, DmaSpace(6)), Err(HwError::Busy));
        assert_eq!(m.set_dma_task(d, false, DmaSpace(6)), Err(HwError::InvalidArgument));
        assert_eq!(m.create_managed_kern_dma_space(d), Err(HwError::Busy));
        m.set_dma_task(d, false, DmaSpace(5)).unwrap();
        assert!(iommu.bound.lock().is_empty());
        assert_eq!(m.domain(d).unwrap().task_space(), None);
    }

    #[test]
    fn stream_ids_are_offset_requester_ids() {
        let iommu = Arc::new(RecordingIommu::new(IommuKind::StreamIdBased));
        let mut m = DmaManager::new();
        let f = m.add_factory(DmaBackend::for_iommu(iommu, 0x1_0000));
        let d = m.create_domain(f, endpoint(2, 1));
        assert_eq!(m.source_ids(d), vec![0x1_0208]);
        let b = m.create_domain(f, DmaScope::Bus { secondary: 4, subordinate: 6 });
        assert_eq!(m.source_ids(b), vec![0x1_0400]);
    }

    #[test]
    fn failed_bind_rolls_back() {
        let mut iommu = RecordingIommu::new(IommuKind::TableBased);
        iommu.fail_on = Some(0x4_001C);
        let iommu = Arc::new(iommu);
        let mut m = DmaManager::new();
        let f = m.add_factory(DmaBackend::TableBased(iommu.clone()));
        let d = m.create_domain(
            f,
            DmaScope::Endpoint {
                address: PciAddress::new(0, 3, 0),
                phantom: 1,
            },
        );
        assert_eq!(m.create_managed_kern_dma_space(d), Err(HwError::Iommu));
        assert!(iommu.bound.lock().is_empty());
        assert_eq!(m.domain(d).unwrap().managed_space(), None);
    }
}

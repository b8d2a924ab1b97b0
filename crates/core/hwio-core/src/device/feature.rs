//! Capability features and feature-combination watchers.
//!
//! A device exposes what it *is* through features: "is a PCI function",
//! "has a firmware node", and so on. Features are attached once and never
//! replaced. Each device keeps a typed registry from [`TypeId`] to feature
//! slots so that code can ask for a concrete feature type directly.
//!
//! A [`FeatureWatcher`] declares a combination of feature types. Whenever a
//! device gains one of those types and the combination becomes complete,
//! the watcher's setup callback fires. Each device records which watchers
//! already fired, so a second feature of the same type never re-triggers
//! setup.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::any::{Any, TypeId};

use hwio_driver_api::HwError;

use super::DeviceId;

/// A capability attached to a device.
pub trait DevFeature: Any {
    /// Returns a short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns `true` if this feature identifies the device as `cid`.
    fn match_cid(&self, _cid: &str) -> bool {
        false
    }

    /// Saves hardware state before the device is suspended.
    ///
    /// # Errors
    ///
    /// Returns an error if the state could not be read.
    fn suspend(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    /// Restores hardware state after the device resumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state could not be written back.
    fn resume(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    /// Upcasts for typed lookup.
    fn as_any(&self) -> &dyn Any;

    /// Upcasts for typed mutable lookup.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Index of a registered [`FeatureWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherId(usize);

/// The features of one device plus its typed registry and fired watchers.
#[derive(Default)]
pub struct FeatureSet {
    features: Vec<Box<dyn DevFeature>>,
    registry: BTreeMap<TypeId, Vec<usize>>,
    fired: BTreeSet<WatcherId>,
}

impl FeatureSet {
    /// Appends a feature and returns its type id.
    pub fn push(&mut self, feature: Box<dyn DevFeature>) -> TypeId {
        let ty = (*feature.as_any()).type_id();
        self.registry.entry(ty).or_default().push(self.features.len());
        self.features.push(feature);
        ty
    }

    /// Returns the first feature of type `T`.
    #[must_use]
    pub fn get<T: DevFeature>(&self) -> Option<&T> {
        let &slot = self.registry.get(&TypeId::of::<T>())?.first()?;
        self.features[slot].as_any().downcast_ref()
    }

    /// Returns the first feature of type `T` mutably.
    pub fn get_mut<T: DevFeature>(&mut self) -> Option<&mut T> {
        let &slot = self.registry.get(&TypeId::of::<T>())?.first()?;
        self.features[slot].as_any_mut().downcast_mut()
    }

    /// Returns `true` if a feature with type id `ty` is attached.
    #[must_use]
    pub fn contains_type(&self, ty: TypeId) -> bool {
        self.registry.contains_key(&ty)
    }

    /// Returns how many features of type id `ty` are attached.
    #[must_use]
    pub fn count_type(&self, ty: TypeId) -> usize {
        self.registry.get(&ty).map_or(0, Vec::len)
    }

    /// Iterates over the features in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn DevFeature> {
        self.features.iter().map(|f| &**f)
    }

    /// Returns the number of attached features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Returns `true` if no feature is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Returns `true` if `watcher` already fired for this device.
    #[must_use]
    pub fn has_fired(&self, watcher: WatcherId) -> bool {
        self.fired.contains(&watcher)
    }

    /// Records that `watcher` fired for this device.
    pub fn mark_fired(&mut self, watcher: WatcherId) {
        self.fired.insert(watcher);
    }

    /// Runs every feature's suspend hook in insertion order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing hook's error.
    pub fn suspend_all(&mut self) -> Result<(), HwError> {
        self.features.iter_mut().try_for_each(|f| f.suspend())
    }

    /// Runs every feature's resume hook in reverse insertion order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failing hook's error.
    pub fn resume_all(&mut self) -> Result<(), HwError> {
        self.features.iter_mut().rev().try_for_each(|f| f.resume())
    }
}

impl core::fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.features.iter().map(|x| x.name())).finish()
    }
}

/// Callback run when a watcher's feature combination is complete.
pub type SetupFn<C> = fn(&mut C, DeviceId);

/// A feature combination and the setup to run once a device has all of it.
pub struct FeatureWatcher<C> {
    name: &'static str,
    types: Vec<TypeId>,
    setup: SetupFn<C>,
}

impl<C> FeatureWatcher<C> {
    /// Creates a watcher for an arbitrary combination of feature types.
    #[must_use]
    pub fn new(name: &'static str, types: Vec<TypeId>, setup: SetupFn<C>) -> Self {
        Self { name, types, setup }
    }

    /// Creates a watcher for the pair of feature types `A` and `B`.
    #[must_use]
    pub fn pair<A: DevFeature, B: DevFeature>(name: &'static str, setup: SetupFn<C>) -> Self {
        Self::new(name, alloc::vec![TypeId::of::<A>(), TypeId::of::<B>()], setup)
    }

    /// Returns the watcher's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// All registered watchers of a context type `C`.
pub struct WatcherRegistry<C> {
    watchers: Vec<FeatureWatcher<C>>,
}

impl<C> Default for WatcherRegistry<C> {
    fn default() -> Self {
        Self {
            watchers: Vec::new(),
        }
    }
}

impl<C> WatcherRegistry<C> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watcher and returns its id.
    pub fn register(&mut self, watcher: FeatureWatcher<C>) -> WatcherId {
        self.watchers.push(watcher);
        WatcherId(self.watchers.len() - 1)
    }

    /// Returns the watchers that are complete on `features` and have not
    /// fired yet.
    ///
    /// With `added == Some(ty)` only watchers that declare `ty` are
    /// considered, i.e. those the new feature could have completed.
    #[must_use]
    pub fn ready(&self, added: Option<TypeId>, features: &FeatureSet) -> Vec<WatcherId> {
        self.watchers
            .iter()
            .enumerate()
            .map(|(i, w)| (WatcherId(i), w))
            .filter(|(_, w)| added.is_none_or(|t| w.types.contains(&t)))
            .filter(|(id, _)| !features.has_fired(*id))
            .filter(|(_, w)| w.types.iter().all(|&t| features.contains_type(t)))
            .map(|(id, _)| id)
            .collect()
    }

    /// Returns the watcher with id `id`.
    #[must_use]
    pub fn get(&self, id: WatcherId) -> Option<&FeatureWatcher<C>> {
        self.watchers.get(id.0)
    }

    /// Returns the setup callback of watcher `id`.
    #[must_use]
    pub fn setup(&self, id: WatcherId) -> Option<SetupFn<C>> {
        self.watchers.get(id.0).map(|w| w.setup)
    }
}

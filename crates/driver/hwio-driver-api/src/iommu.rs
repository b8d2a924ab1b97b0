//! Platform IOMMU interface.
//!
//! The hardware manager resolves which source identifiers a device emits and
//! which kernel DMA space they belong to. Programming the translation
//! hardware itself is left to the platform, behind [`Iommu`].

use crate::error::HwError;

/// Opaque handle to a kernel DMA address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaSpace(pub u64);

/// How an IOMMU identifies the initiator of a DMA transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuKind {
    /// Per-segment context tables indexed by requester id (VT-d style).
    TableBased,
    /// Stream tables indexed by a stream id derived from the requester id.
    StreamIdBased,
}

/// A remapping unit provided by the platform.
///
/// Bind and unbind are synchronous: when they return `Ok`, the hardware
/// routes transactions from `source_id` through `space`.
pub trait Iommu: Send + Sync {
    /// Returns the addressing scheme this unit uses.
    fn kind(&self) -> IommuKind;

    /// Creates a fresh kernel DMA space owned by the hardware manager.
    ///
    /// # Errors
    ///
    /// Returns [`HwError::Exhausted`] if the kernel cannot allocate another
    /// space.
    fn create_dma_space(&self) -> Result<DmaSpace, HwError>;

    /// Binds the transactions tagged with `source_id` to `space`.
    ///
    /// # Errors
    ///
    /// Returns [`HwError::Iommu`] if the unit rejected the request.
    fn bind(&self, source_id: u64, space: DmaSpace) -> Result<(), HwError>;

    /// Removes a binding created by [`bind`](Self::bind).
    ///
    /// # Errors
    ///
    /// Returns [`HwError::Iommu`] if the unit rejected the request.
    fn unbind(&self, source_id: u64, space: DmaSpace) -> Result<(), HwError>;
}

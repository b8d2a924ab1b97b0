//! Boundary types for the hwio hardware manager.
//!
//! This crate holds everything that crosses the edge of the resource
//! arbitration core:
//!
//! - **PCI identity** -- [`PciAddress`], [`PciDeviceId`], [`PciBar`] and
//!   [`PciDeviceInfo`] describe discovered functions to client drivers.
//! - **Errors** -- [`HwError`] is the taxonomy shared by every operation.
//! - **Firmware input** -- [`FwResource`] and [`PrtEntry`] are the flat
//!   descriptors a firmware-table collaborator hands to the core.
//! - **IOMMU** -- the [`Iommu`] trait is implemented by the platform to bind
//!   DMA source identifiers to kernel DMA spaces.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod firmware;
pub mod iommu;
pub mod pci;

// Re-export all public types at the crate root for ergonomic imports.
pub use error::HwError;
pub use firmware::{FwResource, FwResourceKind, IrqPolarity, IrqTrigger, PrtEntry, PrtSource};
pub use iommu::{DmaSpace, Iommu, IommuKind};
pub use pci::{PciAddress, PciBar, PciCommand, PciDeviceId, PciDeviceInfo, PciHeaderKind};

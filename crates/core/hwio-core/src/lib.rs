//! Hardware arbitration core of the hwio device manager.
//!
//! The crate owns the model of the machine a user-space hardware service
//! hands out to drivers:
//!
//! - **Resources** ([`resource`]) -- typed ranges (memory, I/O ports,
//!   interrupts, bus numbers, DMA windows) arranged in a hierarchy of
//!   spaces that arbitrate sub-ranges among their children.
//! - **Devices** ([`device`]) -- an arena of device records with typed
//!   feature sets and watchers that fire once a device carries a given
//!   combination of features.
//! - **PCI** ([`pci`]) -- config-space transports and a recursive bus walker
//!   that sizes BARs, numbers bridges and records what it finds.
//! - **Interrupts** ([`irq`]) -- legacy INTx routing through bridges and
//!   firmware routing tables.
//! - **DMA** ([`dma`]) -- per-device DMA domains backed by the platform
//!   IOMMU, or identity mapping when there is none.
//!
//! Everything hangs off one [`HwContext`], which the service creates at
//! start-up and passes by reference.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod device;
pub mod dma;
pub mod firmware;
pub mod irq;
pub mod pci;
pub mod placement;
pub mod resource;

pub use config::HwConfig;
pub use context::{HwContext, Platform};
pub use hwio_driver_api::HwError;

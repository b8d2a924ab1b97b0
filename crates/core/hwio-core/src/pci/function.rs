//! The "is a PCI function" device feature.

use alloc::sync::Arc;
use core::any::Any;

use hwio_driver_api::{HwError, PciAddress, PciDeviceInfo};
use log::debug;

use super::caps::PcieCap;
use super::cfg::{CfgAddr, ConfigSpace};
use crate::device::DevFeature;

/// Number of config dwords saved across suspend (the standard header).
const SAVED_DWORDS: usize = 16;

/// A discovered PCI function attached to a device record.
pub struct PciFunction {
    info: PciDeviceInfo,
    cfg: Arc<dyn ConfigSpace>,
    pcie: Option<PcieCap>,
    msi: Option<u8>,
    msix: Option<u8>,
    saved: Option<[u32; SAVED_DWORDS]>,
}

impl PciFunction {
    /// Creates the feature for a probed function.
    #[must_use]
    pub fn new(info: PciDeviceInfo, cfg: Arc<dyn ConfigSpace>) -> Self {
        Self {
            info,
            cfg,
            pcie: None,
            msi: None,
            msix: None,
            saved: None,
        }
    }

    /// Records the PCI Express capability.
    #[must_use]
    pub fn with_pcie(mut self, pcie: Option<PcieCap>) -> Self {
        self.pcie = pcie;
        self
    }

    /// Records the MSI and MSI-X capability offsets.
    #[must_use]
    pub fn with_msi(mut self, msi: Option<u8>, msix: Option<u8>) -> Self {
        self.msi = msi;
        self.msix = msix;
        self
    }

    /// Returns the identification registers read at discovery.
    #[must_use]
    pub const fn info(&self) -> &PciDeviceInfo {
        &self.info
    }

    /// Returns the function's address.
    #[must_use]
    pub const fn address(&self) -> PciAddress {
        self.info.address
    }

    /// Returns the transport that reaches this function.
    #[must_use]
    pub fn cfg(&self) -> &Arc<dyn ConfigSpace> {
        &self.cfg
    }

    /// Returns the PCI Express capability, if present.
    #[must_use]
    pub const fn pcie(&self) -> Option<&PcieCap> {
        self.pcie.as_ref()
    }

    /// Returns `true` for PCI Express functions.
    #[must_use]
    pub const fn is_express(&self) -> bool {
        self.pcie.is_some()
    }

    /// Returns the phantom-function bit count (0 without PCI Express).
    #[must_use]
    pub const fn phantom_fns(&self) -> u8 {
        match &self.pcie {
            Some(p) => p.phantom_fns,
            None => 0,
        }
    }

    /// Returns the MSI capability offset.
    #[must_use]
    pub const fn msi(&self) -> Option<u8> {
        self.msi
    }

    /// Returns the MSI-X capability offset.
    #[must_use]
    pub const fn msix(&self) -> Option<u8> {
        self.msix
    }

    /// Returns `true` if the function can signal message interrupts.
    #[must_use]
    pub const fn supports_msi(&self) -> bool {
        self.msi.is_some() || self.msix.is_some()
    }

    fn reg(&self, reg: u16) -> CfgAddr {
        CfgAddr::of(self.info.address, reg)
    }

    /// Returns `true` if every token of a `PCI/...` compatible id matches.
    ///
    /// Tokens are separated by `&`: `VEN_xxxx`, `DEV_xxxx`,
    /// `CC_xx[xx[xx]]` (class, subclass, prog-if prefix), `REV_xx`,
    /// `SUBSYS_xxxxxxxx` (subsystem device << 16 | vendor) and `ADR_x`.
    /// Unknown tokens never match.
    #[must_use]
    pub fn match_pci_cid(&self, cid: &str) -> bool {
        let Some(rest) = cid.strip_prefix("PCI/") else {
            return false;
        };
        if rest.is_empty() {
            return false;
        }
        rest.split('&').all(|tok| self.match_token(tok))
    }

    fn match_token(&self, tok: &str) -> bool {
        let (key, hex) = match tok.split_once('_') {
            Some(kv) => kv,
            None => return false,
        };
        let Ok(value) = u32::from_str_radix(hex, 16) else {
            return false;
        };
        let info = &self.info;
        match key {
            "VEN" => value == u32::from(info.vendor_id),
            "DEV" => value == u32::from(info.device_id),
            "REV" => value == u32::from(info.revision),
            "SUBSYS" => value == info.subsystem(),
            "ADR" => value == info.address.adr(),
            "CC" => match hex.len() {
                2 => value == info.class_code() >> 16,
                4 => value == info.class_code() >> 8,
                6 => value == info.class_code(),
                _ => false,
            },
            _ => false,
        }
    }
}

impl DevFeature for PciFunction {
    fn name(&self) -> &'static str {
        "pci-function"
    }

    fn match_cid(&self, cid: &str) -> bool {
        self.match_pci_cid(cid)
    }

    fn suspend(&mut self) -> Result<(), HwError> {
        let mut saved = [0u32; SAVED_DWORDS];
        for (i, slot) in saved.iter_mut().enumerate() {
            *slot = self.cfg.read_u32(self.reg((i as u16) * 4))?;
        }
        debug!("pci: {}: saved config header", self.info.address);
        self.saved = Some(saved);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), HwError> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        // BARs first, then the rest of the header, and the command register
        // last so decoding is re-enabled on fully programmed BARs.
        let order = (4..10).chain(3..4).chain(10..SAVED_DWORDS).chain(1..2);
        for i in order {
            self.cfg.write_u32(self.reg((i as u16) * 4), saved[i])?;
        }
        debug!("pci: {}: restored config header", self.info.address);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::regs;
    use crate::pci::sim::{SimFabric, SimFunction};
    use hwio_driver_api::PciBar;

    fn info() -> PciDeviceInfo {
        PciDeviceInfo {
            address: PciAddress::new(0, 3, 1),
            vendor_id: 0x8086,
            device_id: 0x100E,
            revision: 0x03,
            prog_if: 0x00,
            subclass: 0x00,
            class: 0x02,
            header_type: 0,
            subsystem_vendor_id: 0x1AF4,
            subsystem_device_id: 0x1100,
            interrupt_line: 0,
            interrupt_pin: 1,
            bars: [PciBar::Unused; 6],
        }
    }

    #[test]
    fn compatible_id_tokens() {
        let f = PciFunction::new(info(), Arc::new(SimFabric::new()));
        assert!(f.match_pci_cid("PCI/VEN_8086&DEV_100E"));
        assert!(f.match_pci_cid("PCI/VEN_8086&DEV_100e&CC_02&REV_03"));
        assert!(f.match_pci_cid("PCI/CC_0200"));
        assert!(f.match_pci_cid("PCI/CC_020000"));
        assert!(f.match_pci_cid("PCI/SUBSYS_11001AF4"));
        assert!(f.match_pci_cid("PCI/ADR_30001"));
        assert!(!f.match_pci_cid("PCI/VEN_8086&DEV_1000"));
        assert!(!f.match_pci_cid("PCI/VEN_8086&FOO_1"));
        assert!(!f.match_pci_cid("PCI/"));
        assert!(!f.match_pci_cid("PNP0A03"));
        assert!(f.match_cid("PCI/VEN_8086"));
    }

    #[test]
    fn suspend_resume_restores_header() {
        let fab = Arc::new(SimFabric::new());
        fab.insert(
            0,
            3,
            1,
            SimFunction::endpoint(0x8086, 0x100E, 0x02_0000)
                .with_mem_bar(0, 0xFEBC_0000, 0x1000, false)
                .with_dword(regs::COMMAND, 0x0006),
        );
        let mut f = PciFunction::new(info(), fab.clone());
        f.suspend().unwrap();

        // Power loss clears the programmed state.
        let a = CfgAddr::new(0, 3, 1, 0);
        fab.write_u32(a.at(regs::BAR0), 0).unwrap();
        fab.write_u16(a.at(regs::COMMAND), 0).unwrap();

        f.resume().unwrap();
        assert_eq!(fab.peek(0, 3, 1, regs::BAR0), 0xFEBC_0000);
        assert_eq!(fab.peek(0, 3, 1, regs::COMMAND) & 0xFFFF, 0x0006);
        // A second resume without a suspend is a no-op.
        assert_eq!(f.resume(), Ok(()));
    }
}

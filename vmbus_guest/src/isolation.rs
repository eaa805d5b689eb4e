// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Isolation context inputs and the confidential memory adapter seam.
//!
//! The isolation type, paravisor presence, and shared GPA boundary are
//! detected by platform code well before the bus starts; they are captured
//! here in an immutable config that is constructed once at bus
//! initialization and passed by reference to the components that need it.

use thiserror::Error;
use vmbus_proto::protocol::PAGE_SIZE;

/// The hypervisor isolation architecture the guest is running under.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IsolationType {
    None,
    Vbs,
    Snp,
    Tdx,
}

impl IsolationType {
    /// Returns true if the isolation boundary is enforced by hardware
    /// rather than by the hypervisor.
    pub fn is_hardware_isolated(&self) -> bool {
        matches!(self, Self::Snp | Self::Tdx)
    }
}

/// Immutable isolation inputs for a bus instance.
#[derive(Copy, Clone, Debug)]
pub struct IsolationConfig {
    pub isolation_type: IsolationType,
    /// Set when a paravisor mediates access to host-offered channels.
    pub paravisor_present: bool,
    /// The bit position of the shared GPA boundary, or 0 if no boundary is
    /// active.
    pub shared_gpa_boundary_bit: u8,
    /// High bits that must be set to keep a GPA above the boundary
    /// canonical.
    pub canonicalization_mask: u64,
}

impl IsolationConfig {
    /// The configuration for a guest with no isolation boundary.
    pub fn no_isolation() -> Self {
        Self {
            isolation_type: IsolationType::None,
            paravisor_present: false,
            shared_gpa_boundary_bit: 0,
            canonicalization_mask: 0,
        }
    }

    /// Returns true if offers flagged confidential can be honored:
    /// confidential channels only exist when a paravisor offers them on a
    /// hardware-isolated VM.
    pub fn can_use_confidential_channels(&self) -> bool {
        self.isolation_type.is_hardware_isolated() && self.paravisor_present
    }

    fn shared_gpa_boundary(&self) -> u64 {
        if self.shared_gpa_boundary_bit == 0 {
            0
        } else {
            1 << self.shared_gpa_boundary_bit
        }
    }

    /// Translates a guest page number to the host-visible alias above the
    /// shared GPA boundary. Identity when no boundary is active.
    pub fn host_visible_gpn(&self, gpn: u64) -> u64 {
        let boundary = self.shared_gpa_boundary();
        if !self.isolation_type.is_hardware_isolated() || boundary == 0 {
            return gpn;
        }
        let gpa = gpn * PAGE_SIZE as u64;
        (gpa | boundary | self.canonicalization_mask) / PAGE_SIZE as u64
    }
}

/// An opaque token for a page-visibility grant, returned by the isolation
/// boundary and required to revoke the grant later.
#[derive(Debug, PartialEq, Eq)]
pub struct ProtectionHandle(u64);

impl ProtectionHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The isolation boundary rejected a page visibility update.
#[derive(Debug, Error)]
#[error("failed to update page visibility across the isolation boundary")]
pub struct ProtectionError;

/// Thin boundary call into the isolation capability: marks a page range
/// visible or hidden across the isolation boundary.
pub trait MemoryProtection: Send + Sync {
    /// Makes `page_count` pages starting at `base_pfn` visible to the host,
    /// returning a handle that must be kept for the lifetime of the
    /// mapping.
    fn make_visible(
        &self,
        base_pfn: u64,
        page_count: u32,
    ) -> Result<ProtectionHandle, ProtectionError>;

    /// Hides the pages previously made visible by `make_visible`.
    fn revoke(&self, handle: ProtectionHandle);
}

/// No-op protection for guests without an isolation boundary.
pub struct NoIsolation;

impl MemoryProtection for NoIsolation {
    fn make_visible(
        &self,
        _base_pfn: u64,
        _page_count: u32,
    ) -> Result<ProtectionHandle, ProtectionError> {
        Ok(ProtectionHandle::new(0))
    }

    fn revoke(&self, _handle: ProtectionHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_isolation_is_identity() {
        let config = IsolationConfig::no_isolation();
        assert_eq!(config.host_visible_gpn(0x1234), 0x1234);
        assert!(!config.can_use_confidential_channels());
    }

    #[test]
    fn test_boundary_translation() {
        let config = IsolationConfig {
            isolation_type: IsolationType::Snp,
            paravisor_present: true,
            shared_gpa_boundary_bit: 39,
            canonicalization_mask: 0,
        };

        // The boundary bit lands at bit 39 - 12 in the page number domain.
        assert_eq!(config.host_visible_gpn(0x100), 0x100 | 1 << 27);
        assert!(config.can_use_confidential_channels());
    }

    #[test]
    fn test_canonicalization_mask() {
        let config = IsolationConfig {
            isolation_type: IsolationType::Tdx,
            paravisor_present: true,
            shared_gpa_boundary_bit: 47,
            canonicalization_mask: 0xffff_0000_0000_0000,
        };

        let gpn = config.host_visible_gpn(0x100);
        assert_eq!(gpn, 0x100 | 1 << 35 | 0xffff_0000_0000_0000 >> 12);
    }

    #[test]
    fn test_vbs_uses_no_boundary() {
        let config = IsolationConfig {
            isolation_type: IsolationType::Vbs,
            paravisor_present: false,
            shared_gpa_boundary_bit: 39,
            canonicalization_mask: 0,
        };

        assert_eq!(config.host_visible_gpn(0x100), 0x100);
        assert!(!config.can_use_confidential_channels());
    }
}

//! Hardware manager error types.

use core::fmt;

/// Errors reported by resource arbitration, discovery, and DMA management.
///
/// Every error is attributable to a single device or resource; none of them
/// aborts discovery of unrelated devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwError {
    /// The device, resource, or domain does not exist or did not respond.
    NotFound,
    /// The object is already in use (e.g. a managed DMA space exists).
    Busy,
    /// An argument was out of range or did not match the current owner.
    InvalidArgument,
    /// The operation is not supported by this backend.
    Unsupported,
    /// The requested range overlaps a sibling already bound in the space.
    Conflict,
    /// No free range of the requested size and alignment is left.
    Exhausted,
    /// No interrupt routing entry matched the requested slot and pin.
    NoRoute,
    /// An operation was invoked on a space that does not support it.
    ///
    /// This indicates a defect in the caller, not a hardware condition.
    PolicyViolation,
    /// The platform IOMMU rejected a bind or unbind request.
    Iommu,
}

impl HwError {
    /// Returns `true` for resource conflicts that disable a single resource
    /// and let discovery continue.
    #[must_use]
    pub const fn is_conflict(self) -> bool {
        matches!(self, Self::Conflict | Self::Exhausted | Self::NoRoute)
    }
}

impl fmt::Display for HwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such device"),
            Self::Busy => f.write_str("resource busy"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::Unsupported => f.write_str("operation not supported"),
            Self::Conflict => f.write_str("range overlaps a bound sibling"),
            Self::Exhausted => f.write_str("no free range left"),
            Self::NoRoute => f.write_str("no interrupt route"),
            Self::PolicyViolation => f.write_str("operation not supported by this space"),
            Self::Iommu => f.write_str("IOMMU request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_all_variants() {
        assert_eq!(format!("{}", HwError::NotFound), "no such device");
        assert_eq!(format!("{}", HwError::Busy), "resource busy");
        assert_eq!(format!("{}", HwError::InvalidArgument), "invalid argument");
        assert_eq!(format!("{}", HwError::Unsupported), "operation not supported");
        assert_eq!(
            format!("{}", HwError::Conflict),
            "range overlaps a bound sibling"
        );
        assert_eq!(format!("{}", HwError::Exhausted), "no free range left");
        assert_eq!(format!("{}", HwError::NoRoute), "no interrupt route");
        assert_eq!(
            format!("{}", HwError::PolicyViolation),
            "operation not supported by this space"
        );
        assert_eq!(format!("{}", HwError::Iommu), "IOMMU request failed");
    }

    #[test]
    fn conflict_category() {
        assert!(HwError::Conflict.is_conflict());
        assert!(HwError::Exhausted.is_conflict());
        assert!(HwError::NoRoute.is_conflict());
        assert!(!HwError::PolicyViolation.is_conflict());
        assert!(!HwError::Busy.is_conflict());
    }
}

//! Errors surfaced by index operations.

/// Errors returned by index construction and mutation.
///
/// Lookup misses, failed deletes, and replace-as-insert are ordinary return
/// values, not errors; only the conditions below abort an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// Caller passed a null log address.
    #[error("log address is null")]
    NullPointer,

    /// The log address has bits set above the 47-bit pointer field.
    #[error("log address {0:#x} does not fit in 47 bits")]
    PointerOutOfRange(u64),

    /// The bucket array or an overflow cache line could not be allocated.
    #[error("allocation of {bytes} bytes failed")]
    AllocationFailed {
        /// Size of the failed allocation.
        bytes: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(IndexError::NullPointer.to_string(), "log address is null");
        assert_eq!(
            IndexError::PointerOutOfRange(1 << 47).to_string(),
            "log address 0x800000000000 does not fit in 47 bits"
        );
        assert_eq!(
            IndexError::AllocationFailed { bytes: 64 }.to_string(),
            "allocation of 64 bytes failed"
        );
    }
}

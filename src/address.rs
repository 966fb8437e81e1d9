//! Address type for objects in the external log.
//!
//! This module provides the `LogAddress` type used to identify where the
//! latest version of an object lives. An address is an opaque 47-bit value;
//! the index stores it and hands it back but never dereferences it.

use std::fmt;

use crate::error::IndexError;

/// An opaque reference to an object in the external append-only log.
///
/// Only the low 47 bits are usable: the index packs the address into an entry
/// word together with a 16-bit secondary hash and a chain bit. On platforms
/// with a wider effective address space the caller must map its locations
/// into this range; [`LogAddress::new`] rejects anything else. Zero is the
/// null address and never refers to an object.
///
/// The index does not own the referenced storage. Freeing or moving the
/// underlying object is entirely the caller's business.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LogAddress(u64);

impl LogAddress {
    /// Number of usable address bits
    pub const ADDRESS_BITS: u32 = 47;

    /// Maximum valid address value
    pub const MAX_ADDRESS: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// The null address
    pub const NULL: Self = Self(0);

    /// Create a validated address.
    ///
    /// Returns [`IndexError::NullPointer`] for zero and
    /// [`IndexError::PointerOutOfRange`] when bits above 46 are set.
    #[inline]
    pub fn new(control: u64) -> Result<Self, IndexError> {
        if control == 0 {
            return Err(IndexError::NullPointer);
        }
        if control > Self::MAX_ADDRESS {
            return Err(IndexError::PointerOutOfRange(control));
        }
        Ok(Self(control))
    }

    /// Create an address from a raw control value without validation
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Check if this is the null address
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "LogAddress(NULL)")
        } else {
            write!(f, "LogAddress({:#x})", self.0)
        }
    }
}

impl fmt::Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl TryFrom<u64> for LogAddress {
    type Error = IndexError;

    fn try_from(control: u64) -> Result<Self, IndexError> {
        Self::new(control)
    }
}

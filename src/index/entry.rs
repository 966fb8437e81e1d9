//! Packed entry and cache line types.
//!
//! Every slot in a bucket chain is a single 64-bit word. From MSB to LSB:
//! 16 bits of secondary hash, 1 chain bit, 47 bits of pointer. The pointer
//! field holds either a log address (chain bit clear) or the memory address
//! of the next cache line in the chain (chain bit set); an all-zero pointer
//! field means the slot is unused regardless of the hash bits.
//!
//! The word layout is part of the contract: it is chosen so the entry could
//! later be updated with atomic read-modify-write operations without any
//! semantic change.

use std::mem;
use std::ptr::NonNull;

use crate::address::LogAddress;
use crate::constants::{CACHE_LINE_BYTES, ENTRIES_PER_LINE};

/// A packed entry in a bucket chain.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct LineEntry(u64);

/// Decoded view of a [`LineEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryView {
    /// Slot is available.
    Unused,
    /// Slot holds an object location.
    Occupied {
        /// Secondary hash stored with the address.
        tag: u16,
        /// Location of the object in the external log.
        address: LogAddress,
    },
    /// Slot links to the next cache line of this bucket's chain.
    Chain(NonNull<CacheLine>),
}

impl LineEntry {
    /// The cleared (available) entry
    pub const UNUSED: Self = Self(0);

    /// Width of the pointer field
    pub const POINTER_BITS: u32 = 47;

    /// Mask of the pointer field
    pub const POINTER_MASK: u64 = (1 << Self::POINTER_BITS) - 1;

    /// The chain bit (bit 47)
    pub const CHAIN_BIT: u64 = 1 << Self::POINTER_BITS;

    /// Shift of the secondary hash field
    pub const TAG_SHIFT: u32 = 48;

    /// Pack an occupied entry.
    ///
    /// # Panics
    /// Panics if the address has bits set above the pointer field. Public
    /// mutation paths validate addresses before packing, so tripping this is
    /// an internal bug.
    #[inline]
    pub fn occupied(tag: u16, address: LogAddress) -> Self {
        let control = address.control();
        assert_eq!(
            control & !Self::POINTER_MASK,
            0,
            "log address exceeds the 47-bit pointer field"
        );
        debug_assert_ne!(control, 0, "occupied entry with a null address");
        Self(((tag as u64) << Self::TAG_SHIFT) | control)
    }

    /// Pack a chain link to the next cache line.
    ///
    /// # Panics
    /// Panics if the line's memory address has bits set in the top 17; the
    /// allocator is expected to hand out user-space addresses that fit.
    #[inline]
    pub fn chain(next: NonNull<CacheLine>) -> Self {
        let addr = next.as_ptr() as u64;
        assert_eq!(
            addr & !Self::POINTER_MASK,
            0,
            "cache line address exceeds the 47-bit pointer field"
        );
        Self(Self::CHAIN_BIT | addr)
    }

    /// Classify the entry.
    ///
    /// Never fails. A set chain bit with a zero pointer cannot be produced
    /// by the packing functions and is treated as unused.
    #[inline]
    pub fn view(self) -> EntryView {
        let ptr = self.0 & Self::POINTER_MASK;
        if ptr == 0 {
            debug_assert_eq!(
                self.0 & Self::CHAIN_BIT,
                0,
                "chain link with a null pointer"
            );
            return EntryView::Unused;
        }
        if self.0 & Self::CHAIN_BIT != 0 {
            // SAFETY: ptr was checked non-zero above.
            return EntryView::Chain(unsafe { NonNull::new_unchecked(ptr as *mut CacheLine) });
        }
        EntryView::Occupied {
            tag: (self.0 >> Self::TAG_SHIFT) as u16,
            address: LogAddress::from_control(ptr),
        }
    }

    /// Check if the slot is available
    #[inline]
    pub const fn is_unused(self) -> bool {
        self.0 & Self::POINTER_MASK == 0
    }

    /// Get the raw packed word
    #[inline]
    pub const fn control(self) -> u64 {
        self.0
    }

    /// Rebuild an entry from a raw packed word
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }
}

impl std::fmt::Debug for LineEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LineEntry").field(&self.view()).finish()
    }
}

/// A cache line: one bucket head or one overflow node of a bucket chain.
///
/// The last slot of every non-terminal line in a chain is a chain link; all
/// other slots hold object locations or are unused.
#[repr(C, align(64))]
#[derive(Clone)]
pub struct CacheLine {
    /// The packed entries.
    pub entries: [LineEntry; ENTRIES_PER_LINE],
}

impl CacheLine {
    /// Index of the slot that may hold a chain link
    pub const LAST_SLOT: usize = ENTRIES_PER_LINE - 1;

    /// Create a line with every slot unused
    pub const fn new() -> Self {
        Self {
            entries: [LineEntry::UNUSED; ENTRIES_PER_LINE],
        }
    }

    /// The chain link out of this line, if any.
    #[inline]
    pub fn chain_link(&self) -> Option<NonNull<CacheLine>> {
        match self.entries[Self::LAST_SLOT].view() {
            EntryView::Chain(next) => Some(next),
            _ => None,
        }
    }
}

impl Default for CacheLine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLine")
            .field("entries", &self.entries)
            .finish()
    }
}

// One line must fill exactly one hardware cache line.
const _: () = assert!(mem::size_of::<CacheLine>() == CACHE_LINE_BYTES);
const _: () = assert!(mem::align_of::<CacheLine>() == CACHE_LINE_BYTES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupied_round_trip() {
        for (tag, control) in [
            (0u16, 1u64),
            (0x0001, 0x2),
            (0xffff, LineEntry::POINTER_MASK),
            (0x1234, 0x7b0d_cafe_f00d),
        ] {
            let address = LogAddress::from_control(control);
            let entry = LineEntry::occupied(tag, address);
            assert_eq!(
                entry.view(),
                EntryView::Occupied { tag, address },
                "tag={tag:#x} control={control:#x}"
            );
            assert!(!entry.is_unused());
        }
    }

    #[test]
    fn test_packed_layout_is_contractual() {
        let entry = LineEntry::occupied(0xabcd, LogAddress::from_control(0x1234_5678));
        assert_eq!(entry.control(), (0xabcd_u64 << 48) | 0x1234_5678);

        let line = Box::new(CacheLine::new());
        let ptr = NonNull::from(line.as_ref());
        let chain = LineEntry::chain(ptr);
        assert_eq!(chain.control(), (1 << 47) | ptr.as_ptr() as u64);
    }

    #[test]
    fn test_chain_round_trip() {
        let line = Box::new(CacheLine::new());
        let ptr = NonNull::from(line.as_ref());

        let entry = LineEntry::chain(ptr);
        assert_eq!(entry.view(), EntryView::Chain(ptr));
        assert!(!entry.is_unused());
    }

    #[test]
    fn test_unused_regardless_of_tag_bits() {
        assert_eq!(LineEntry::UNUSED.view(), EntryView::Unused);
        assert!(LineEntry::UNUSED.is_unused());

        // Residual hash bits never resurrect a cleared slot.
        let entry = LineEntry::from_control(0xffff_u64 << 48);
        assert_eq!(entry.view(), EntryView::Unused);
        assert!(entry.is_unused());
    }

    #[test]
    #[should_panic(expected = "47-bit pointer field")]
    fn test_occupied_rejects_wide_address() {
        let _ = LineEntry::occupied(0, LogAddress::from_control(1 << 47));
    }

    #[test]
    fn test_cache_line_layout() {
        assert_eq!(mem::size_of::<CacheLine>(), 64);
        assert_eq!(mem::align_of::<CacheLine>(), 64);
        assert_eq!(mem::size_of::<LineEntry>(), 8);
    }

    #[test]
    fn test_fresh_line_is_all_unused() {
        let line = CacheLine::new();
        assert!(line.entries.iter().all(|e| e.is_unused()));
        assert!(line.chain_link().is_none());
    }
}

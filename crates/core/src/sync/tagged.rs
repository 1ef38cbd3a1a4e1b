//! Tagged offsets
//!
//! Free-list heads, queue pointers and the array-list root are single 64-bit
//! words holding a 48-bit region-relative offset and a 16-bit tag. Every
//! successful CAS installs a new tag, so a word that went A -> B -> A between
//! a load and a CAS still fails the CAS.

const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tagged(u64);

impl Tagged {
    pub const NULL: Tagged = Tagged(0);

    #[inline]
    pub fn new(offset: u64, tag: u16) -> Self {
        debug_assert!(offset <= OFFSET_MASK);
        Self(((tag as u64) << OFFSET_BITS) | (offset & OFFSET_MASK))
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    #[inline]
    pub fn tag(self) -> u16 {
        (self.0 >> OFFSET_BITS) as u16
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.offset() == 0
    }

    /// Same tag space, next tag, new offset
    #[inline]
    pub fn successor(self, offset: u64) -> Self {
        Self::new(offset, self.tag().wrapping_add(1))
    }
}

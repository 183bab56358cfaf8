use crate::address::PhysicalAddr;

bitflags::bitflags! {
    /// Bits of a page-translation entry shared by every table level.
    #[repr(transparent)]
    pub struct PageFlags: u64 {
        /// The table or physical page backing this entry is loaded in memory.
        const PRESENT = 1 << 0;

        /// Read/write access to every physical page mapped through this entry.
        const RW = 1 << 1;

        /// User (CPL 3) access to every physical page mapped through this entry.
        const US = 1 << 2;

        /// Writethrough caching policy for the table or physical page.
        const PWT = 1 << 3;

        /// Caching disabled for the table or physical page.
        const PCD = 1 << 4;

        /// Set by the processor the first time the entry is used for a translation.
        const ACCESSED = 1 << 5;

        /// Set by the processor on the first write through a lowest-level entry.
        const DIRTY = 1 << 6;

        /// In a PDPE or PDE, terminates the translation early: the entry maps a
        /// 1 GiB or 2 MiB physical page instead of pointing to another table.
        const HUGE = 1 << 7;

        /// The TLB entry for this page survives CR3 loads (requires CR4.PGE).
        const GLOBAL = 1 << 8;

        /// No code execution from any physical page mapped through this entry
        /// (requires EFER.NXE).
        const NX = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn new(addr: PhysicalAddr, flags: PageFlags) -> Self {
        debug_assert!(addr.as_u64() & !ADDR_MASK == 0);
        Self(addr.as_u64() | flags.bits())
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddr {
        PhysicalAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    #[must_use]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    #[inline]
    #[must_use]
    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    #[inline]
    #[must_use]
    pub fn is_huge(self) -> bool {
        self.flags().contains(PageFlags::HUGE)
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageEntry")
            .field("addr", &self.address())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let entry = PageEntry::new(
            PhysicalAddr::new(0x2000),
            PageFlags::PRESENT | PageFlags::RW | PageFlags::NX,
        );
        assert_eq!(entry.address().as_u64(), 0x2000);
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert!(entry.flags().contains(PageFlags::NX));
    }
}

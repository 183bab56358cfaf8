use core::arch::asm;
use core::marker::PhantomData;

use crate::{
    address::VirtualAddr,
    descriptors::{CodeSegmentDescriptor, DataSegmentDescriptor, GdtNull, SystemSegmentDescriptor},
    segments::SegmentSelector,
    Privilege,
};

pub enum GdtEntry {
    Null,
    User(u64),
    System(u64, u64),
}

pub trait AsGdtEntry {
    fn to_gdt_entry(&self) -> GdtEntry;
}

impl AsGdtEntry for GdtNull {
    fn to_gdt_entry(&self) -> GdtEntry {
        GdtEntry::Null
    }
}

impl AsGdtEntry for CodeSegmentDescriptor {
    fn to_gdt_entry(&self) -> GdtEntry {
        GdtEntry::User(self.bits())
    }
}

impl AsGdtEntry for DataSegmentDescriptor {
    fn to_gdt_entry(&self) -> GdtEntry {
        GdtEntry::User(self.bits())
    }
}

impl AsGdtEntry for SystemSegmentDescriptor {
    fn to_gdt_entry(&self) -> GdtEntry {
        let (low, high) = self.bits();
        GdtEntry::System(low, high)
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(8))]
pub struct GlobalDescriptorTable {
    entries: [u64; 8],
    at: u16,
}

impl GlobalDescriptorTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [0u64; 8],
            at: 0,
        }
    }

    /// Get a reference to the global descriptor table's entries.
    #[inline]
    pub fn entries(&self) -> &[u64] {
        &self.entries[..usize::from(self.at)]
    }

    #[inline]
    pub fn add_entry<T: AsGdtEntry>(&mut self, entry: T) -> SegmentSelector {
        let idx = match entry.to_gdt_entry() {
            GdtEntry::Null => self.push(0),
            GdtEntry::User(bits) => self.push(bits),
            GdtEntry::System(low, high) => {
                let idx = self.push(low);
                self.push(high);
                idx
            }
        };
        SegmentSelector::new(idx, Privilege::Ring0)
    }

    fn push(&mut self, value: u64) -> u16 {
        let next = self.at;
        self.entries[usize::from(next)] = value;
        self.at += 1;
        next
    }

    pub fn lgdt_ptr(&self) -> GdtPtr<'_> {
        GdtPtr {
            limit: self.at * (core::mem::size_of::<u64>() as u16) - 1,
            addr: VirtualAddr::from_ptr(self.entries.as_ptr()),
            _m: PhantomData,
        }
    }
}

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct GdtPtr<'a> {
    limit: u16,
    addr: VirtualAddr,
    _m: PhantomData<&'a ()>,
}

pub fn lgdt(gdt: &GdtPtr) {
    // SAFETY: we assure the GDT pointer is well defined
    unsafe {
        asm!("lgdt [{}]", in(reg) gdt, options(readonly, nostack, preserves_flags));
    }
}

impl core::fmt::Debug for GlobalDescriptorTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("Gdt")
            .field("entries", &self.entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_layout() {
        let mut gdt = GlobalDescriptorTable::new();

        gdt.add_entry(GdtNull);
        let kernel_code = gdt.add_entry(CodeSegmentDescriptor::kernel_x64());
        let kernel_stack = gdt.add_entry(DataSegmentDescriptor::kernel());
        let user_code = gdt.add_entry(CodeSegmentDescriptor::user_x64());
        let user_stack = gdt.add_entry(DataSegmentDescriptor::user());

        assert_eq!(kernel_code.index(), crate::segments::KERNEL_CODE_INDEX);
        assert_eq!(kernel_stack.index(), crate::segments::KERNEL_STACK_INDEX);
        assert_eq!(user_code.index(), crate::segments::USER_CODE_INDEX);
        assert_eq!(user_stack.index(), crate::segments::USER_STACK_INDEX);
        assert_eq!(gdt.entries().len(), 5);
    }
}

use libx64::{
    address::{PhysicalAddr, VirtualAddr},
    paging::{
        entry::{PageEntry, PageFlags},
        frame::{FrameAllocator, FrameError, PhysOffset, PhysicalFrame},
        Page1Gb, Page2Mb, Page4Kb,
    },
};

/// Per-range mapping attributes. The default is a present, writable,
/// user-accessible, executable mapping; a not-present mapping is used to
/// place guard pages.
#[derive(Debug, Clone, Copy)]
pub struct PageAttributes {
    present: bool,
    writable: bool,
    user_accessible: bool,
    global: bool,
    no_execute: bool,
}

impl Default for PageAttributes {
    fn default() -> Self {
        Self {
            present: true,
            writable: true,
            user_accessible: true,
            global: false,
            no_execute: false,
        }
    }
}

impl PageAttributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set_present(mut self, present: bool) -> Self {
        self.present = present;
        self
    }

    #[must_use]
    pub fn set_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    #[must_use]
    pub fn set_user_accessible(mut self, user_accessible: bool) -> Self {
        self.user_accessible = user_accessible;
        self
    }

    #[must_use]
    pub fn set_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    #[must_use]
    pub fn set_no_execute(mut self, no_execute: bool) -> Self {
        self.no_execute = no_execute;
        self
    }

    #[must_use]
    pub fn present(&self) -> bool {
        self.present
    }

    fn leaf_flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.present {
            flags |= PageFlags::PRESENT;
        }
        if self.writable {
            flags |= PageFlags::RW;
        }
        if self.user_accessible {
            flags |= PageFlags::US;
        }
        if self.global {
            flags |= PageFlags::GLOBAL;
        }
        if self.no_execute {
            flags |= PageFlags::NX;
        }
        flags
    }
}

/// Result of walking the tables for one virtual address.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub addr: PhysicalAddr,
    pub flags: PageFlags,
    /// Size of the leaf that terminated the walk.
    pub leaf_size: u64,
}

/// Owner of one 4-level translation hierarchy, rooted at a PML4 frame.
///
/// This is a boot-time mapper: it installs leaves but never tears mappings
/// down or flushes the TLB; callers switch CR3 afterwards.
pub struct PageTables {
    root: PhysicalFrame<Page4Kb>,
    offset: PhysOffset,
}

impl PageTables {
    /// # Errors
    ///
    /// Errors if no frame is left for the root table.
    pub fn new<A>(offset: PhysOffset, allocator: &mut A) -> Result<Self, FrameError>
    where
        A: FrameAllocator<Page4Kb>,
    {
        let root = allocator.alloc()?;
        // SAFETY: the frame was just allocated, we are its only user.
        unsafe { offset.table_mut(root).clear() };
        Ok(Self { root, offset })
    }

    #[must_use]
    pub fn table_root(&self) -> PhysicalAddr {
        self.root.ptr()
    }

    #[must_use]
    pub fn phys_offset(&self) -> PhysOffset {
        self.offset
    }

    /// Install leaves translating `[virt_start, virt_end)` to
    /// `[phys_start, phys_end)`, electing 1 GiB and 2 MiB leaves wherever
    /// the alignment of both cursors and the remaining length allow.
    ///
    /// Intermediate tables come from `allocator` on demand and are always
    /// `present | writable | user`; permission enforcement happens at the
    /// leaf.
    ///
    /// # Errors
    ///
    /// Errors if an intermediate table cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics on unaligned bounds, or when a present mapping's ranges differ
    /// in length.
    pub fn map<A>(
        &mut self,
        phys_start: PhysicalAddr,
        phys_end: PhysicalAddr,
        virt_start: VirtualAddr,
        virt_end: VirtualAddr,
        attrs: PageAttributes,
        allocator: &mut A,
    ) -> Result<(), FrameError>
    where
        A: FrameAllocator<Page4Kb>,
    {
        assert!(phys_start.is_aligned(Page4Kb));
        assert!(phys_end.is_aligned(Page4Kb));
        assert!(virt_start.is_aligned(Page4Kb));
        assert!(virt_end.is_aligned(Page4Kb));
        if attrs.present() {
            assert_eq!(phys_end - phys_start, virt_end - virt_start);
        }

        trace!(
            "map {:?}..{:?} -> {:?}..{:?} {:?}",
            phys_start,
            phys_end,
            virt_start,
            virt_end,
            attrs
        );

        let mut virt = virt_start;
        while virt < virt_end {
            let phys = phys_start + (virt - virt_start);

            let (stop_level, step) = if virt + Page1Gb <= virt_end
                && phys.is_aligned(Page1Gb)
                && virt.is_aligned(Page1Gb)
            {
                (2, Page1Gb)
            } else if virt + Page2Mb <= virt_end
                && phys.is_aligned(Page2Mb)
                && virt.is_aligned(Page2Mb)
            {
                (1, Page2Mb)
            } else {
                (0, Page4Kb)
            };

            let mut table = self.root;
            for level in (stop_level..=3).rev() {
                let index = virt.table_index(level);
                // SAFETY: every frame reached here is a table owned by this
                // hierarchy; references never outlive the loop body.
                let entries = unsafe { self.offset.table_mut(table) };

                if level == stop_level {
                    let mut flags = attrs.leaf_flags();
                    if stop_level > 0 {
                        flags |= PageFlags::HUGE;
                    }
                    entries[index] = PageEntry::new(phys, flags);
                } else {
                    let entry = entries[index];
                    let next = if entry.is_present() {
                        PhysicalFrame::containing(entry.address())
                    } else {
                        let frame = allocator.alloc()?;
                        // SAFETY: freshly allocated, becomes a table of ours.
                        unsafe { self.offset.table_mut(frame).clear() };
                        frame
                    };
                    entries[index] =
                        PageEntry::new(next.ptr(), PageFlags::PRESENT | PageFlags::RW | PageFlags::US);
                    table = next;
                }
            }

            virt = virt + step;
        }

        Ok(())
    }

    /// Walk the hierarchy for `virt`.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddr) -> Option<Translation> {
        let mut table = self.root;
        for level in (0..=3).rev() {
            // SAFETY: only table frames of this hierarchy are dereferenced.
            let entries = unsafe { self.offset.table_mut(table) };
            let entry = entries[virt.table_index(level)];

            if !entry.is_present() {
                return None;
            }

            if level == 0 || entry.is_huge() {
                let leaf_size = 1u64 << (12 + 9 * level);
                let offset_in_leaf = virt.as_u64() & (leaf_size - 1);
                return Some(Translation {
                    addr: entry.address() + offset_in_leaf,
                    flags: entry.flags(),
                    leaf_size,
                });
            }

            table = PhysicalFrame::containing(entry.address());
        }
        unreachable!()
    }

    /// Return every table frame of the hierarchy, root included, to the
    /// allocator. Leaf target frames are not owned by the tables and stay
    /// allocated.
    pub fn release<A>(&mut self, allocator: &mut A)
    where
        A: FrameAllocator<Page4Kb>,
    {
        free_level(self.root, 3, self.offset, allocator);
    }
}

fn free_level<A>(table: PhysicalFrame<Page4Kb>, level: usize, offset: PhysOffset, allocator: &mut A)
where
    A: FrameAllocator<Page4Kb>,
{
    if level > 0 {
        // SAFETY: table frames of the hierarchy being torn down.
        let entries = unsafe { offset.table_mut(table) };
        for entry in entries.entries() {
            if entry.is_present() && !entry.is_huge() {
                free_level(
                    PhysicalFrame::containing(entry.address()),
                    level - 1,
                    offset,
                    allocator,
                );
            }
        }
    }
    allocator.dealloc(table);
}

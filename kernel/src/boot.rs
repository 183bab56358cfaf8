//! Multiboot passes: the boot information is walked several times, once
//! per concern.

use libx64::address::PhysicalAddr;
use multiboot::{FramebufferInfo, MemoryKind, RgbLayout, TagVisitor};
use page_mapper::RegionAllocator;

/// Logs every tag, mirroring what the loader handed us.
pub struct TagPrinter;

impl TagVisitor for TagPrinter {
    fn start_tag(&mut self, ty: u32) {
        trace!("tag type = {}", ty);
    }

    fn module(&mut self, cmdline: &str, start: u32, end: u32) {
        info!("module {:?}: {:#x} to {:#x}", cmdline, start, end);
    }

    fn start_memory_map(&mut self) {
        trace!("memory map");
    }

    fn memory_map_entry(&mut self, base: u64, length: u64, kind: MemoryKind) {
        trace!("entry @{:#x} size={:#x}, {:?}", base, length, kind);
    }

    fn framebuffer(&mut self, info: &FramebufferInfo) {
        info!(
            "framebuffer @{:#x} {}x{} bpp={} pitch={}",
            info.addr, info.width, info.height, info.bpp, info.pitch
        );
    }

    fn framebuffer_rgb(&mut self, layout: &RgbLayout) {
        trace!(
            "rgb layout: red ({}, {}) green ({}, {}) blue ({}, {})",
            layout.red_position,
            layout.red_mask,
            layout.green_position,
            layout.green_mask,
            layout.blue_position,
            layout.blue_mask
        );
    }
}

/// Accumulates the physical span covering every boot module, so the frame
/// allocator can keep its hands off the images.
pub struct ModuleRange {
    start: u64,
    end: u64,
}

impl ModuleRange {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: u64::MAX,
            end: 0,
        }
    }

    #[must_use]
    pub fn start(&self) -> PhysicalAddr {
        PhysicalAddr::new(if self.start == u64::MAX { 0 } else { self.start })
    }

    #[must_use]
    pub fn end(&self) -> PhysicalAddr {
        PhysicalAddr::new(self.end)
    }
}

impl Default for ModuleRange {
    fn default() -> Self {
        Self::new()
    }
}

impl TagVisitor for ModuleRange {
    fn module(&mut self, _cmdline: &str, start: u32, end: u32) {
        self.start = self.start.min(u64::from(start));
        self.end = self.end.max(u64::from(end));
    }
}

/// Feeds the available-RAM entries of the memory map into the frame
/// allocator.
pub struct RegionCollector<'a> {
    frames: &'a mut RegionAllocator,
}

impl<'a> RegionCollector<'a> {
    pub fn new(frames: &'a mut RegionAllocator) -> Self {
        Self { frames }
    }
}

impl TagVisitor for RegionCollector<'_> {
    fn memory_map_entry(&mut self, base: u64, length: u64, kind: MemoryKind) {
        if kind != MemoryKind::AvailableRam {
            return;
        }
        self.frames
            .add_region(PhysicalAddr::new(base), PhysicalAddr::new(base + length));
    }
}

/// Remembers the framebuffer descriptor for the module handoff record.
#[derive(Default)]
pub struct FramebufferCapture {
    info: FramebufferInfo,
}

impl FramebufferCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn info(&self) -> FramebufferInfo {
        self.info
    }
}

impl TagVisitor for FramebufferCapture {
    fn framebuffer(&mut self, info: &FramebufferInfo) {
        self.info = *info;
    }
}

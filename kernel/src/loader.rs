//! Boot-module launcher: every Multiboot module is an ELF executable that
//! becomes one user task in its own address space.
//!
//! The loader never copies segment bytes; the module image stays where the
//! boot loader put it and gets mapped in place, so loading is idempotent
//! across address spaces. Only BSS tails cost fresh frames.

use kalloc::Slab;
use libx64::{
    address::{PhysicalAddr, VirtualAddr},
    paging::{frame::FrameAllocator, Page4Kb},
};
use multiboot::{BootInfo, FramebufferInfo, TagVisitor};
use page_mapper::{AddressSpace, PageAttributes, RegionAllocator, SpaceRef};
use scheduler::{Scheduler, Thread, ThreadId};
use xmas_elf::{
    header,
    program::{self, ProgramHeader, Type},
    ElfFile,
};

use crate::mem;

/// Everything module loading needs, threaded explicitly so the launcher
/// logic runs under test without the kernel singletons.
pub struct BootCtx<'a> {
    pub frames: &'a mut RegionAllocator,
    pub spaces: &'a mut Slab<AddressSpace>,
    pub threads: &'a mut Slab<Thread>,
    pub sched: &'a mut Scheduler,
    pub framebuffer: FramebufferInfo,
}

/// The record copied to the top of every task's initial stack.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KernelModuleData {
    pub framebuffer: FramebufferHandoff,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FramebufferHandoff {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl KernelModuleData {
    #[must_use]
    pub fn new(framebuffer: &FramebufferInfo) -> Self {
        Self {
            framebuffer: FramebufferHandoff {
                addr: framebuffer.addr,
                pitch: framebuffer.pitch,
                width: framebuffer.width,
                height: framebuffer.height,
                bpp: u32::from(framebuffer.bpp),
            },
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) with no padding between the integer fields.
        unsafe {
            core::slice::from_raw_parts(
                (self as *const Self).cast::<u8>(),
                core::mem::size_of::<Self>(),
            )
        }
    }
}

/// Launch one task per boot module.
pub fn load_modules(boot: &BootInfo, ctx: &mut BootCtx) {
    struct Launcher<'a, 'b> {
        ctx: &'a mut BootCtx<'b>,
    }

    impl TagVisitor for Launcher<'_, '_> {
        fn module(&mut self, cmdline: &str, start: u32, end: u32) {
            load_module(
                cmdline,
                PhysicalAddr::new(u64::from(start)),
                PhysicalAddr::new(u64::from(end)),
                self.ctx,
            );
        }
    }

    boot.read(&mut Launcher { ctx });
}

fn load_module(cmdline: &str, start: PhysicalAddr, end: PhysicalAddr, ctx: &mut BootCtx) {
    info!("loading module {:?}", cmdline);

    let space = mem::create_space(false, ctx.frames, ctx.spaces);

    let offset = ctx.frames.phys_offset();
    // SAFETY: module images are carved out of the frame allocator's
    // regions and sit inside the kernel window.
    let image = unsafe {
        core::slice::from_raw_parts(offset.ptr::<u8>(start).as_ptr(), (end - start) as usize)
    };

    let entry = load_image(start, image, &space, ctx.frames);

    let handoff = KernelModuleData::new(&ctx.framebuffer);
    let thread = Thread::spawn(
        space.clone_ref(),
        entry,
        0,
        handoff.as_bytes(),
        ctx.frames,
        ctx.threads,
    )
    .expect("module thread");

    // SAFETY: the thread exists but has not started; nobody else can
    // reach it yet.
    parse_arguments(
        cmdline,
        &space,
        unsafe { &mut *thread.as_ptr() },
        &ctx.framebuffer,
        ctx.frames,
    );

    // The thread's reference keeps the space alive from here on.
    assert!(space.release().is_none());

    ctx.sched.start_thread(thread);
}

/// Map a 64-bit `ET_EXEC` image for `EM_X86_64` into `space` and return
/// its entry point.
///
/// # Panics
///
/// Panics on anything else; a malformed boot module aborts the boot.
pub fn load_image<A>(
    image_start: PhysicalAddr,
    image: &[u8],
    space: &SpaceRef,
    frames: &mut A,
) -> VirtualAddr
where
    A: FrameAllocator<Page4Kb>,
{
    let elf = ElfFile::new(image).unwrap_or_else(|err| panic!("bad module image: {}", err));

    assert_eq!(elf.header.pt1.class(), header::Class::SixtyFour);
    assert_eq!(elf.header.pt1.data(), header::Data::LittleEndian);
    assert_eq!(elf.header.pt2.type_().as_type(), header::Type::Executable);
    assert_eq!(elf.header.pt2.machine().as_machine(), header::Machine::X86_64);

    for ph in elf.program_iter() {
        program::sanity_check(ph, &elf).unwrap_or_else(|err| panic!("bad program header: {}", err));
    }

    for ph in elf.program_iter() {
        if matches!(ph.get_type(), Ok(Type::Load)) {
            load_segment(&ph, image_start, space, frames);
        }
    }

    VirtualAddr::new(elf.header.pt2.entry_point())
}

fn load_segment<A>(
    ph: &ProgramHeader,
    image_start: PhysicalAddr,
    space: &SpaceRef,
    frames: &mut A,
) where
    A: FrameAllocator<Page4Kb>,
{
    info!(
        "  segment {} at {:#x}, size {:#x}/{:#x}",
        ph.flags(),
        ph.virtual_addr(),
        ph.file_size(),
        ph.mem_size()
    );
    assert!(ph.file_size() <= ph.mem_size());

    let attrs = PageAttributes::new()
        .set_writable(ph.flags().is_write())
        .set_no_execute(!ph.flags().is_execute());

    let phys_start = (image_start + ph.offset()).align_down(Page4Kb);
    let phys_end = (image_start + ph.offset() + ph.file_size()).align_up(Page4Kb);
    let virt_start = VirtualAddr::new(ph.virtual_addr()).align_down(Page4Kb);
    let mut virt_end = VirtualAddr::new(ph.virtual_addr() + ph.file_size()).align_up(Page4Kb);

    // The file-backed part is mapped in place.
    space
        .map(phys_start, phys_end, virt_start, virt_end, attrs, frames)
        .expect("module segment");

    // A longer load size is BSS: cover the tail with fresh zeroed frames.
    // The page rounding above may already have covered part of it.
    let covered = virt_end - VirtualAddr::new(ph.virtual_addr());
    let remainder = ph.mem_size().saturating_sub(covered);
    let offset = space.phys_offset();
    let mut bytes = 0;
    while bytes < remainder {
        let frame = frames.alloc().expect("bss frame");
        // SAFETY: fresh frame, mapped below as the next BSS page.
        unsafe {
            core::ptr::write_bytes(offset.ptr::<u8>(frame.ptr()).as_ptr(), 0, Page4Kb as usize);
        }
        space
            .map(
                frame.ptr(),
                frame.ptr() + Page4Kb,
                virt_end,
                virt_end + Page4Kb,
                attrs,
                frames,
            )
            .expect("bss page");

        virt_end = virt_end + Page4Kb;
        bytes += Page4Kb;
    }
}

/// Apply the module's `key=value` command-line arguments.
///
/// | key        | effect                                              |
/// |------------|-----------------------------------------------------|
/// | `map`      | identity-map a physical `start,end` range (hex)     |
/// | `videomap` | identity-map the framebuffer                        |
/// | `allow_io` | raise the task's IOPL to 3                          |
/// | `tid`      | assign a fixed thread id (decimal)                  |
///
/// # Panics
///
/// Panics on unknown keys or malformed values; bad module configuration
/// aborts the boot.
pub fn parse_arguments<A>(
    args: &str,
    space: &SpaceRef,
    thread: &mut Thread,
    framebuffer: &FramebufferInfo,
    frames: &mut A,
) where
    A: FrameAllocator<Page4Kb>,
{
    for token in args.split(' ').filter(|token| !token.is_empty()) {
        let (key, value) = match token.split_once('=') {
            Some(pair) => pair,
            None => panic!("invalid module argument {:?}", token),
        };

        match key {
            "map" => {
                let (start, end) = match value.split_once(',') {
                    Some(pair) => pair,
                    None => panic!("invalid memory range {:?} for map argument", value),
                };
                let start = parse_num(start, 16);
                let end = parse_num(end, 16);

                info!("mapping to userspace: {:#x} to {:#x}", start, end);
                space
                    .map(
                        PhysicalAddr::new(start),
                        PhysicalAddr::new(end),
                        VirtualAddr::new(start),
                        VirtualAddr::new(end),
                        PageAttributes::default(),
                        frames,
                    )
                    .expect("map argument");
            }
            "videomap" => match value {
                "true" => {
                    let start = PhysicalAddr::new(framebuffer.addr).align_down(Page4Kb);
                    let end = PhysicalAddr::new(
                        framebuffer.addr + u64::from(framebuffer.pitch) * u64::from(framebuffer.height),
                    )
                    .align_up(Page4Kb);

                    info!("mapping framebuffer: {:?} to {:?}", start, end);
                    space
                        .map(
                            start,
                            end,
                            VirtualAddr::new(start.as_u64()),
                            VirtualAddr::new(end.as_u64()),
                            PageAttributes::default(),
                            frames,
                        )
                        .expect("videomap argument");
                }
                "false" => {}
                _ => panic!("unrecognized videomap argument {:?}", value),
            },
            "allow_io" => match value {
                "true" => thread.allow_io(),
                "false" => {}
                _ => panic!("unrecognized allow_io argument {:?}", value),
            },
            "tid" => {
                let id = parse_num(value, 10);
                thread.set_id(ThreadId::new(id as i32));
            }
            _ => panic!("unrecognized module argument {:?}", key),
        }
    }
}

fn parse_num(digits: &str, radix: u32) -> u64 {
    match u64::from_str_radix(digits, radix) {
        Ok(value) => value,
        Err(_) => panic!("invalid number {:?} in module argument", digits),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;
    use libx64::{paging::frame::PhysicalFrame, rflags::RFlags};
    use page_mapper::testing::Arena;
    use std::vec;
    use std::vec::Vec;

    struct Fixture {
        arena: Arena,
        frames: RegionAllocator,
        spaces: Slab<AddressSpace>,
        threads: Slab<Thread>,
    }

    fn fixture() -> Fixture {
        let arena = Arena::new(512);
        Fixture {
            frames: arena.allocator(),
            spaces: Slab::new(arena.phys_offset()),
            threads: Slab::new(arena.phys_offset()),
            arena,
        }
    }

    impl Fixture {
        fn space(&mut self) -> SpaceRef {
            mem::create_space(false, &mut self.frames, &mut self.spaces)
        }

        fn thread(&mut self, space: &SpaceRef) -> NonNull<Thread> {
            Thread::spawn(
                space.clone_ref(),
                VirtualAddr::new(0x40_0000),
                0,
                &[],
                &mut self.frames,
                &mut self.threads,
            )
            .unwrap()
        }
    }

    #[test]
    fn arguments_configure_the_task() {
        let mut fx = fixture();
        let space = fx.space();
        let thread = fx.thread(&space);
        let thread = unsafe { &mut *thread.as_ptr() };

        parse_arguments(
            "tid=2 allow_io=true map=b8000,b9000",
            &space,
            thread,
            &FramebufferInfo::default(),
            &mut fx.frames,
        );

        assert_eq!(thread.id(), ThreadId::new(2));
        assert_eq!(
            thread.state().rflags & RFlags::IOPL_RING3.bits(),
            RFlags::IOPL_RING3.bits()
        );

        let translated = space.translate(VirtualAddr::new(0xb8000)).unwrap();
        assert_eq!(translated.addr.as_u64(), 0xb8000);
        assert!(space.translate(VirtualAddr::new(0xb9000)).is_none());
    }

    #[test]
    #[should_panic(expected = "unrecognized module argument")]
    fn unknown_arguments_abort() {
        let mut fx = fixture();
        let space = fx.space();
        let thread = fx.thread(&space);

        parse_arguments(
            "frobnicate=yes",
            &space,
            unsafe { &mut *thread.as_ptr() },
            &FramebufferInfo::default(),
            &mut fx.frames,
        );
    }

    #[test]
    #[should_panic(expected = "unrecognized allow_io argument")]
    fn bad_allow_io_value_aborts() {
        let mut fx = fixture();
        let space = fx.space();
        let thread = fx.thread(&space);

        parse_arguments(
            "allow_io=maybe",
            &space,
            unsafe { &mut *thread.as_ptr() },
            &FramebufferInfo::default(),
            &mut fx.frames,
        );
    }

    const PAGE: usize = Page4Kb as usize;

    fn put_u16(raw: &mut [u8], at: usize, value: u16) {
        raw[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(raw: &mut [u8], at: usize, value: u32) {
        raw[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(raw: &mut [u8], at: usize, value: u64) {
        raw[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// A minimal executable: one PT_LOAD at file offset 0x1000, a page of
    /// text and two pages of BSS.
    fn minimal_elf(entry: u64, vaddr: u64) -> Vec<u8> {
        // One extra trailing page so the PT_LOAD segment's `offset + filesz`
        // is strictly less than the image length, as xmas-elf's sanity
        // check requires.
        let mut raw = vec![0u8; 3 * PAGE];

        raw[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        raw[4] = 2; // ELFCLASS64
        raw[5] = 1; // ELFDATA2LSB
        raw[6] = 1; // EV_CURRENT

        put_u16(&mut raw, 16, 2); // ET_EXEC
        put_u16(&mut raw, 18, 62); // EM_X86_64
        put_u32(&mut raw, 20, 1);
        put_u64(&mut raw, 24, entry);
        put_u64(&mut raw, 32, 64); // e_phoff
        put_u16(&mut raw, 52, 64); // e_ehsize
        put_u16(&mut raw, 54, 56); // e_phentsize
        put_u16(&mut raw, 56, 1); // e_phnum

        // The program header.
        put_u32(&mut raw, 64, 1); // PT_LOAD
        put_u32(&mut raw, 68, 0x1 | 0x4); // R + X
        put_u64(&mut raw, 72, PAGE as u64); // p_offset
        put_u64(&mut raw, 80, vaddr);
        put_u64(&mut raw, 88, vaddr);
        put_u64(&mut raw, 96, PAGE as u64); // p_filesz
        put_u64(&mut raw, 104, 3 * PAGE as u64); // p_memsz
        put_u64(&mut raw, 112, PAGE as u64); // p_align

        // Recognizable text bytes.
        for (i, byte) in raw[PAGE..].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        raw
    }

    /// Copy `bytes` into consecutive arena frames, as the boot loader
    /// would have placed a module.
    fn place_module(fx: &mut Fixture, bytes: &[u8]) -> PhysicalAddr {
        let mut start = None;
        let mut prev: Option<PhysicalFrame<Page4Kb>> = None;
        for chunk in bytes.chunks(PAGE) {
            let frame = fx.frames.allocate().unwrap();
            if let Some(prev) = prev {
                // Fresh bump allocations are contiguous.
                assert_eq!(prev.ptr() + Page4Kb, frame.ptr());
            }
            start.get_or_insert(frame.ptr());
            prev = Some(frame);

            // SAFETY: freshly allocated arena frame.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    fx.arena.phys_offset().ptr::<u8>(frame.ptr()).as_ptr(),
                    chunk.len(),
                );
            }
        }
        start.unwrap()
    }

    fn image<'a>(fx: &Fixture, start: PhysicalAddr, len: usize) -> &'a [u8] {
        // SAFETY: the arena is leaked, so the image outlives the test.
        unsafe {
            core::slice::from_raw_parts(fx.arena.phys_offset().ptr::<u8>(start).as_ptr(), len)
        }
    }

    #[test]
    fn loading_twice_maps_identical_content() {
        let mut fx = fixture();
        let raw = minimal_elf(0x40_1000, 0x40_0000);
        let start = place_module(&mut fx, &raw);
        let image = image(&fx, start, raw.len());

        let first = fx.space();
        let second = fx.space();

        let entry1 = load_image(start, image, &first, &mut fx.frames);
        let entry2 = load_image(start, image, &second, &mut fx.frames);
        assert_eq!(entry1, entry2);
        assert_eq!(entry1, VirtualAddr::new(0x40_1000));

        // The file-backed page is the module image itself, in both spaces.
        let text1 = first.translate(VirtualAddr::new(0x40_0000)).unwrap();
        let text2 = second.translate(VirtualAddr::new(0x40_0000)).unwrap();
        assert_eq!(text1.addr, start + Page4Kb);
        assert_eq!(text2.addr, start + Page4Kb);

        // Execute-only text: not writable.
        assert!(!text1.flags.contains(libx64::paging::entry::PageFlags::RW));

        // BSS pages are per-space frames with identical (zero) content.
        for page in 1..3u64 {
            let virt = VirtualAddr::new(0x40_0000 + page * Page4Kb);
            let bss1 = first.translate(virt).unwrap();
            let bss2 = second.translate(virt).unwrap();
            assert_ne!(bss1.addr, bss2.addr);

            for translated in [bss1, bss2] {
                let bytes = unsafe {
                    core::slice::from_raw_parts(
                        fx.arena.phys_offset().ptr::<u8>(translated.addr).as_ptr(),
                        PAGE,
                    )
                };
                assert!(bytes.iter().all(|&byte| byte == 0));
            }
        }
    }
}

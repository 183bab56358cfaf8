//! Walker over the Multiboot2 boot-information structure.
//!
//! The loader hands the kernel one physical pointer; behind it sits a
//! `{total_size, reserved}` header followed by 8-byte aligned tags. Each
//! pass over the stream drives a [`TagVisitor`], so boot code can make
//! several passes (print, collect modules, feed the frame allocator)
//! without any allocation.

#![no_std]

#[cfg(test)]
extern crate std;

const TAG_MODULE: u32 = 3;
const TAG_MEMORY_MAP: u32 = 6;
const TAG_FRAMEBUFFER: u32 = 8;

const FRAMEBUFFER_TYPE_RGB: u8 = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemoryKind {
    AvailableRam,
    Reserved,
    AcpiReclaimable,
    Other(u32),
}

impl From<u32> for MemoryKind {
    fn from(raw: u32) -> Self {
        match raw {
            1 => MemoryKind::AvailableRam,
            2 => MemoryKind::Reserved,
            3 => MemoryKind::AcpiReclaimable,
            other => MemoryKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
}

/// Channel layout of an RGB-format framebuffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RgbLayout {
    pub red_position: u8,
    pub red_mask: u8,
    pub green_position: u8,
    pub green_mask: u8,
    pub blue_position: u8,
    pub blue_mask: u8,
}

pub trait TagVisitor {
    fn start_tag(&mut self, _ty: u32) {}
    fn end_tag(&mut self) {}

    fn module(&mut self, _cmdline: &str, _start: u32, _end: u32) {}

    fn start_memory_map(&mut self) {}
    fn memory_map_entry(&mut self, _base: u64, _length: u64, _kind: MemoryKind) {}
    fn end_memory_map(&mut self) {}

    fn framebuffer(&mut self, _info: &FramebufferInfo) {}
    fn framebuffer_rgb(&mut self, _layout: &RgbLayout) {}
}

pub struct BootInfo<'a> {
    data: &'a [u8],
}

impl<'a> BootInfo<'a> {
    /// # Safety
    ///
    /// `ptr` must point at a complete Multiboot2 information structure that
    /// stays mapped and untouched for `'a`.
    #[must_use]
    pub unsafe fn from_ptr(ptr: *const u8) -> Self {
        let total_size = u32::from_le_bytes(*ptr.cast::<[u8; 4]>());
        Self {
            data: core::slice::from_raw_parts(ptr, total_size as usize),
        }
    }

    #[must_use]
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Walk every tag once, in stream order.
    pub fn read(&self, visitor: &mut dyn TagVisitor) {
        // Skip the {total_size, reserved} header.
        let mut at = 8;

        while at + 8 <= self.data.len() {
            let ty = read_u32(self.data, at);
            let size = read_u32(self.data, at + 4) as usize;
            let tag = &self.data[at + 8..at + size];

            visitor.start_tag(ty);
            match ty {
                TAG_MODULE => visit_module(tag, visitor),
                TAG_MEMORY_MAP => visit_memory_map(tag, visitor),
                TAG_FRAMEBUFFER => visit_framebuffer(tag, visitor),
                _ => {}
            }
            visitor.end_tag();

            // The next tag is 8-byte aligned.
            at += (size + 7) & !7;
        }
    }
}

fn visit_module(tag: &[u8], visitor: &mut dyn TagVisitor) {
    let start = read_u32(tag, 0);
    let end = read_u32(tag, 4);

    let label = &tag[8..];
    let label = match label.iter().position(|&b| b == 0) {
        Some(nul) => &label[..nul],
        None => label,
    };
    let cmdline = core::str::from_utf8(label).unwrap_or("");

    visitor.module(cmdline, start, end);
}

fn visit_memory_map(tag: &[u8], visitor: &mut dyn TagVisitor) {
    let entry_size = read_u32(tag, 0) as usize;

    visitor.start_memory_map();
    let mut at = 8;
    while at + entry_size <= tag.len() {
        let base = read_u64(tag, at);
        let length = read_u64(tag, at + 8);
        let kind = MemoryKind::from(read_u32(tag, at + 16));
        visitor.memory_map_entry(base, length, kind);
        at += entry_size;
    }
    visitor.end_memory_map();
}

fn visit_framebuffer(tag: &[u8], visitor: &mut dyn TagVisitor) {
    let info = FramebufferInfo {
        addr: read_u64(tag, 0),
        pitch: read_u32(tag, 8),
        width: read_u32(tag, 12),
        height: read_u32(tag, 16),
        bpp: tag[20],
    };
    visitor.framebuffer(&info);

    if tag[21] == FRAMEBUFFER_TYPE_RGB {
        let layout = RgbLayout {
            red_position: tag[23],
            red_mask: tag[24],
            green_position: tag[25],
            green_mask: tag[26],
            blue_position: tag[27],
            blue_mask: tag[28],
        };
        visitor.framebuffer_rgb(&layout);
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::{String, ToString};
    use std::vec::Vec;

    struct Stream {
        data: Vec<u8>,
    }

    impl Stream {
        fn new() -> Self {
            // Header, patched by `finish`.
            Self {
                data: std::vec![0; 8],
            }
        }

        fn tag(&mut self, ty: u32, payload: &[u8]) -> &mut Self {
            let size = 8 + payload.len() as u32;
            self.data.extend_from_slice(&ty.to_le_bytes());
            self.data.extend_from_slice(&size.to_le_bytes());
            self.data.extend_from_slice(payload);
            while self.data.len() % 8 != 0 {
                self.data.push(0);
            }
            self
        }

        fn finish(&mut self) -> &[u8] {
            let total = self.data.len() as u32;
            self.data[..4].copy_from_slice(&total.to_le_bytes());
            &self.data
        }
    }

    #[derive(Default)]
    struct Recorder {
        tags: Vec<u32>,
        modules: Vec<(String, u32, u32)>,
        memory: Vec<(u64, u64, MemoryKind)>,
        framebuffer: Option<FramebufferInfo>,
        rgb: Option<RgbLayout>,
    }

    impl TagVisitor for Recorder {
        fn start_tag(&mut self, ty: u32) {
            self.tags.push(ty);
        }

        fn module(&mut self, cmdline: &str, start: u32, end: u32) {
            self.modules.push((cmdline.to_string(), start, end));
        }

        fn memory_map_entry(&mut self, base: u64, length: u64, kind: MemoryKind) {
            self.memory.push((base, length, kind));
        }

        fn framebuffer(&mut self, info: &FramebufferInfo) {
            self.framebuffer = Some(*info);
        }

        fn framebuffer_rgb(&mut self, layout: &RgbLayout) {
            self.rgb = Some(*layout);
        }
    }

    #[test]
    fn modules_and_alignment() {
        let mut stream = Stream::new();
        let mut module = Vec::new();
        module.extend_from_slice(&0x10_0000u32.to_le_bytes());
        module.extend_from_slice(&0x10_4000u32.to_le_bytes());
        module.extend_from_slice(b"tid=2 allow_io=true\0");

        // An unknown tag with an unaligned size in front checks the 8-byte
        // stepping.
        stream.tag(21, &[1, 2, 3]).tag(TAG_MODULE, &module);

        let mut recorder = Recorder::default();
        BootInfo::from_slice(stream.finish()).read(&mut recorder);

        assert_eq!(recorder.tags, [21, TAG_MODULE]);
        assert_eq!(
            recorder.modules,
            [("tid=2 allow_io=true".to_string(), 0x10_0000, 0x10_4000)]
        );
    }

    #[test]
    fn memory_map_respects_entry_size() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&32u32.to_le_bytes()); // entry_size, 8 spare bytes
        payload.extend_from_slice(&0u32.to_le_bytes()); // entry_version

        for (base, length, kind) in [(0u64, 0x9f000u64, 1u32), (0x10_0000, 0x3ff0_0000, 1), (0xfffc_0000, 0x4_0000, 2)] {
            payload.extend_from_slice(&base.to_le_bytes());
            payload.extend_from_slice(&length.to_le_bytes());
            payload.extend_from_slice(&kind.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(&[0xcd; 8]); // entry padding
        }

        let mut recorder = Recorder::default();
        BootInfo::from_slice(Stream::new().tag(TAG_MEMORY_MAP, &payload).finish())
            .read(&mut recorder);

        assert_eq!(
            recorder.memory,
            [
                (0, 0x9f000, MemoryKind::AvailableRam),
                (0x10_0000, 0x3ff0_0000, MemoryKind::AvailableRam),
                (0xfffc_0000, 0x4_0000, MemoryKind::Reserved),
            ]
        );
    }

    #[test]
    fn rgb_framebuffer_reports_channels() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0xfd00_0000u64.to_le_bytes());
        payload.extend_from_slice(&4096u32.to_le_bytes());
        payload.extend_from_slice(&1024u32.to_le_bytes());
        payload.extend_from_slice(&768u32.to_le_bytes());
        payload.push(32); // bpp
        payload.push(FRAMEBUFFER_TYPE_RGB);
        payload.push(0); // reserved
        payload.extend_from_slice(&[16, 8, 8, 8, 0, 8]);

        let mut recorder = Recorder::default();
        BootInfo::from_slice(Stream::new().tag(TAG_FRAMEBUFFER, &payload).finish())
            .read(&mut recorder);

        let fb = recorder.framebuffer.unwrap();
        assert_eq!((fb.addr, fb.pitch, fb.width, fb.height, fb.bpp), (0xfd00_0000, 4096, 1024, 768, 32));

        let rgb = recorder.rgb.unwrap();
        assert_eq!((rgb.red_position, rgb.red_mask), (16, 8));
        assert_eq!((rgb.blue_position, rgb.blue_mask), (0, 8));
    }
}

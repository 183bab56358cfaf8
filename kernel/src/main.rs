#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare {
    use core::panic::PanicInfo;

    use log::{error, info};

    use libx64::address::PhysicalAddr;
    use multiboot::BootInfo;
    use page_mapper::RegionAllocator;
    use scheduler::Scheduler;

    use kernel::boot::{FramebufferCapture, ModuleRange, RegionCollector, TagPrinter};
    use kernel::loader::BootCtx;
    use kernel::{init, irq, loader, mem, task, trap};

    extern "C" {
        // Placed by the linker script around the kernel image.
        static kernel_physical_start: u8;
        static kernel_physical_end: u8;
    }

    #[no_mangle]
    pub extern "C" fn kmain(multiboot_info: PhysicalAddr) -> ! {
        qemu_logger::init().expect("unable to initialize logger");
        info!("kernel loaded");

        let offset = mem::kernel_offset();
        // SAFETY: the boot stub passes the physical address of the
        // multiboot structure, which stays untouched throughout boot.
        let boot = unsafe { BootInfo::from_ptr(offset.ptr::<u8>(multiboot_info).as_ptr()) };

        boot.read(&mut TagPrinter);

        let mut modules = ModuleRange::new();
        boot.read(&mut modules);

        // SAFETY: link-time constants.
        let (kernel_start, kernel_end) = unsafe {
            (
                PhysicalAddr::new(core::ptr::addr_of!(kernel_physical_start) as u64),
                PhysicalAddr::new(core::ptr::addr_of!(kernel_physical_end) as u64),
            )
        };
        info!("kernel image {:?}..{:?}", kernel_start, kernel_end);
        info!("modules {:?}..{:?}", modules.start(), modules.end());

        let mut frames = RegionAllocator::new(
            offset,
            kernel_start,
            kernel_end,
            modules.start(),
            modules.end(),
        );
        boot.read(&mut RegionCollector::new(&mut frames));
        mem::init(frames);

        let mut framebuffer = FramebufferCapture::new();
        boot.read(&mut framebuffer);

        let syscall_stack_top = mem::alloc_syscall_stack();
        init::kinit(syscall_stack_top);
        irq::init();
        task::SCHEDULER.emplace(Scheduler::new(syscall_stack_top));

        {
            let mut frames = mem::FRAME_ALLOCATOR.lock();
            let mut spaces = mem::SPACES.lock();
            let mut threads = mem::THREADS.lock();
            let mut sched = task::SCHEDULER.lock();

            let mut ctx = BootCtx {
                frames: &mut *frames,
                spaces: &mut *spaces,
                threads: &mut *threads,
                sched: &mut *sched,
                framebuffer: framebuffer.info(),
            };
            loader::load_modules(&boot, &mut ctx);
            task::spawn_idle(&mut ctx);
        }

        trap::enter_user_mode()
    }

    #[panic_handler]
    fn ph(info: &PanicInfo) -> ! {
        error!("PANIC => {}", info);
        libx64::diverging_hlt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("the kernel only runs on bare metal; build with --target x86_64-unknown-none");
    std::process::exit(1);
}

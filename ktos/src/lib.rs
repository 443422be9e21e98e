//! # KTOS
//!
//! A small preemptive kernel for a single-hart 64-bit RISC-V machine (the
//! QEMU `virt` platform). The kernel runs in supervisor mode and provides:
//!
//! - Sv39 three-level paging with a per-process address space that can be
//!   cloned, reset and discarded ([`mm`]).
//! - A fixed table of kernel threads with FIFO scheduling, condition
//!   variables and recursive locks ([`thread`]).
//! - A unified, reference-counted I/O object covering memory buffers,
//!   seekable wrappers, pipes, devices and files ([`io`]).
//! - A write-back block cache ([`cache`]) feeding the KTFS on-disk
//!   filesystem ([`ktfs`]).
//! - User processes loaded from ELF executables, with eager-copy `fork`
//!   and a 16-entry system-call surface ([`process`], [`elf`], [`syscall`]).
//! - Drivers for the UART, RTC and VirtIO block/entropy devices ([`dev`]).
//!
//! The platform layer (CSRs, spinlocks, interrupt masking, SBI, PLIC, the
//! trap-frame contract) lives in the `bedrock` crate.

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

#[macro_use]
extern crate bedrock;

pub mod cache;
pub mod dev;
pub mod elf;
pub mod io;
pub mod ktfs;
pub mod mm;
pub mod process;
pub mod syscall;
pub mod thread;
pub mod timer;

pub use bedrock::{addressing, interrupt, spinlock, trap};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific failure a kernel operation can
/// report. The system-call layer converts them into small negative integers
/// that user programs see unchanged.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Cannot spawn a thread; all slots are in use. (EAGAIN)
    NoThread,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Broken pipe. (EPIPE)
    BrokenPipe,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the error into the negative integer surfaced to user space.
    pub fn errno(self) -> isize {
        match self {
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoThread => -11,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::Busy => -16,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::BrokenPipe => -32,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

#[cfg(target_arch = "riscv64")]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Give `[start, end)` to the kernel heap. Called once from `mm::init`.
#[cfg(target_arch = "riscv64")]
pub(crate) unsafe fn heap_init(start: usize, end: usize) {
    unsafe {
        KERNEL_HEAP.lock().init(start as *mut u8, end - start);
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub(crate) unsafe fn heap_init(_start: usize, _end: usize) {}

/// The entry of the kernel, called from the boot assembly with interrupts
/// disabled and a stack configured.
#[cfg(target_arch = "riscv64")]
#[unsafe(no_mangle)]
pub fn kernel_main() -> ! {
    use crate::io::IoCtl;

    info!("KTOS starting");
    unsafe {
        mm::init();
    }
    thread::init();
    bedrock::plic::init();
    process::init();

    dev::rtc::attach(dev::RTC_MMIO_BASE);
    for i in 0..dev::NUM_UARTS {
        dev::uart::attach(dev::uart_mmio_base(i), dev::UART0_INTR_SRCNO + i as u32, i);
    }
    for i in 0..8 {
        dev::virtio::attach(
            dev::VIRTIO0_MMIO_BASE + i * dev::VIRTIO_MMIO_STEP,
            dev::VIRTIO0_INTR_SRCNO + i as u32,
        );
    }

    bedrock::riscv::csrs_sie(bedrock::riscv::SIE_STIE | bedrock::riscv::SIE_SEIE);
    unsafe { interrupt::InterruptState::enable() };

    let blkio = dev::open_device("vioblk", 0).expect("failed to open vioblk 0");
    assert_eq!(blkio.cntl(IoCtl::GetBlkSz).unwrap(), 512);

    ktfs::fsmount(blkio).expect("failed to mount filesystem");

    let shell = ktfs::fsopen("shell.elf").expect("failed to open shell.elf");
    match process::exec(shell, &[]) {
        Err(e) => panic!("failed to exec shell.elf: {:?}", e),
        Ok(never) => match never {},
    }
}

/// Rust-side trap dispatch, called by the trap-entry assembly with the
/// saved register frame.
#[unsafe(no_mangle)]
pub extern "C" fn handle_trap(tfr: &mut trap::TrapFrame) {
    use bedrock::riscv;

    let cause = riscv::csrr_scause();
    if cause & riscv::SCAUSE_INTERRUPT != 0 {
        match cause & !riscv::SCAUSE_INTERRUPT {
            riscv::SCAUSE_STI => {
                if timer::on_interrupt() {
                    thread::yield_now();
                }
            }
            riscv::SCAUSE_SEI => {
                let srcno = bedrock::plic::claim();
                if srcno != 0 {
                    dev::dispatch_isr(srcno);
                    bedrock::plic::complete(srcno);
                }
            }
            code => panic!("unexpected interrupt: {}", code),
        }
        return;
    }

    let from_user = tfr.sstatus & riscv::SSTATUS_SPP == 0;
    match cause {
        riscv::SCAUSE_ECALL_UMODE => syscall::handle_syscall(tfr),
        riscv::SCAUSE_LOAD_PAGE_FAULT | riscv::SCAUSE_STORE_PAGE_FAULT if from_user => {
            let vma = riscv::csrr_stval();
            if !mm::page_table::handle_umode_page_fault(vma) {
                warning!(
                    "<{}:{}> fatal page fault at 0x{:x}",
                    thread::current_name(),
                    thread::current_tid(),
                    vma
                );
                process::exit();
            }
        }
        code => panic!(
            "unexpected exception {} at 0x{:x} (stval 0x{:x})",
            code,
            tfr.sepc,
            riscv::csrr_stval()
        ),
    }
}

#[cfg(all(target_arch = "riscv64", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    unsafe { interrupt::InterruptState::disable() };
    unsafe { bedrock::kprint::force_unlock_serial() };
    println!("kernel panic: {}", info);
    bedrock::sbi::halt_failure();
}

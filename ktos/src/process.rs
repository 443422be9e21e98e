//! User processes.
//!
//! A process couples one thread with an address space and a fixed table of
//! open I/O endpoints. Process 0 is the kernel's own: it owns the boot
//! thread and the main address space. `exec` replaces the current address
//! space with a fresh image and jumps to user mode; `fork` clones the
//! address space eagerly and spawns a thread that resumes a copy of the
//! parent's trap frame with `a0 = 0`.

use crate::elf;
use crate::io::Io;
use crate::ktfs;
use crate::mm::page_table::{self, MSpace, PteFlags};
use crate::mm::{Page, UMEM_END_VMA};
use crate::thread::{self, Tid};
use crate::KernelError;
use alloc::boxed::Box;
use bedrock::addressing::{PAGE_SIZE, Va};
use bedrock::interrupt::InterruptGuard;
use bedrock::riscv;
use bedrock::trap::{TrapFrame, trap_frame_jump};

/// Maximum number of processes.
pub const NPROC: usize = 16;
/// Length of the per-process I/O table.
pub const PROCESS_IOMAX: usize = 16;

/// A user process.
pub struct Process {
    /// Index of this process in the process table.
    pub idx: usize,
    /// The thread executing this process.
    pub tid: Tid,
    /// The process's address space.
    pub mtag: MSpace,
    /// Open I/O endpoints, indexed by file descriptor.
    pub iotab: [Option<Io>; PROCESS_IOMAX],
}

static mut PROCTAB: [*mut Process; NPROC] = [core::ptr::null_mut(); NPROC];

// Only touched inside interrupt-disable sections.
unsafe fn proctab() -> &'static mut [*mut Process; NPROC] {
    unsafe { &mut *core::ptr::addr_of_mut!(PROCTAB) }
}

/// Run `f` with the process owning the running thread.
///
/// Panics if the running thread has no process; the syscall layer only
/// runs on process threads.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> R {
    let _guard = InterruptGuard::new();
    let idx = thread::current().proc.expect("thread has no process");
    unsafe {
        let proc = proctab()[idx];
        debug_assert!(!proc.is_null());
        f(&mut *proc)
    }
}

/// Switch to the address space of process `idx`. Called by the scheduler
/// when it resumes one of the process's threads.
pub(crate) fn activate_mspace(idx: usize) {
    let _guard = InterruptGuard::new();
    unsafe {
        let proc = proctab()[idx];
        if !proc.is_null() {
            (*proc).mtag.switch();
        }
    }
}

/// Adopt the boot thread as process 0 and start the preemption timer.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    const NONE: Option<Io> = None;
    let main = Box::into_raw(Box::new(Process {
        idx: 0,
        tid: thread::current_tid(),
        mtag: MSpace::active(),
        iotab: [NONE; PROCESS_IOMAX],
    }));
    let _guard = InterruptGuard::new();
    unsafe {
        proctab()[0] = main;
    }
    thread::current().proc = Some(0);
    crate::timer::init();
}

/// Builds the initial user stack image in `stack`: the argv pointer array
/// followed by the argument strings, 16-byte aligned, as the user process
/// will see it at the top of user memory. Returns the stack size in bytes.
fn build_stack(stack: &mut [u8; PAGE_SIZE], args: &[&str]) -> Result<usize, KernelError> {
    let argc = args.len();
    // argv[] holds argc+1 pointers; the strings follow it.
    if PAGE_SIZE / core::mem::size_of::<usize>() - 1 < argc {
        return Err(KernelError::NoMemory);
    }
    let mut stksz = (argc + 1) * core::mem::size_of::<usize>();
    for arg in args {
        let argsz = arg.len() + 1;
        if PAGE_SIZE - stksz < argsz {
            return Err(KernelError::NoMemory);
        }
        stksz += argsz;
    }
    stksz = stksz.next_multiple_of(16);

    // Pointers are user virtual addresses: the stack page sits at the top
    // of user memory.
    let base = PAGE_SIZE - stksz;
    let mut str_off = base + (argc + 1) * core::mem::size_of::<usize>();
    for (i, arg) in args.iter().enumerate() {
        let uva = (UMEM_END_VMA - PAGE_SIZE) + str_off;
        stack[base + i * 8..base + i * 8 + 8].copy_from_slice(&uva.to_le_bytes());
        stack[str_off..str_off + arg.len()].copy_from_slice(arg.as_bytes());
        stack[str_off + arg.len()] = 0;
        str_off += arg.len() + 1;
    }
    stack[base + argc * 8..base + argc * 8 + 8].fill(0);
    Ok(stksz)
}

/// Replace the current process image with the executable at `exe` and
/// enter user mode. Only returns on failure.
pub fn exec(exe: Io, args: &[&str]) -> Result<core::convert::Infallible, KernelError> {
    let mut stack = Page::new().ok_or(KernelError::NoMemory)?;
    let stksz = build_stack(
        stack.inner_mut().try_into().unwrap(),
        args,
    )?;

    // From here on the old image is gone; failures land in a process with
    // an empty address space, which exit() can still tear down.
    page_table::reset_active_mspace();
    let stack_top = Va::new(UMEM_END_VMA - PAGE_SIZE).unwrap();
    page_table::map_page(
        stack_top,
        stack,
        PteFlags::R | PteFlags::W | PteFlags::U,
    )?;
    riscv::sfence_vma();
    let entry = elf::elf_load(&exe)?;
    drop(exe);

    let mut tfr = Box::new(TrapFrame::zeroed());
    tfr.sepc = entry;
    tfr.a0 = args.len();
    tfr.a1 = UMEM_END_VMA - stksz;
    tfr.sp = UMEM_END_VMA - stksz;
    // Resume in user mode with interrupts enabled.
    tfr.sstatus = (riscv::csrr_sstatus() | riscv::SSTATUS_SPIE) & !riscv::SSTATUS_SPP;
    unsafe {
        trap_frame_jump(Box::into_raw(tfr), thread::current_stack_anchor());
    }
}

/// Fork the current process.
///
/// The child gets a duplicated I/O table, an eager copy of the address
/// space, and a fresh thread that resumes a copy of `tfr` with `a0 = 0`.
/// Returns the child's thread id.
pub fn fork(tfr: &TrapFrame) -> Result<Tid, KernelError> {
    const NONE: Option<Io> = None;
    let mut iotab = [NONE; PROCESS_IOMAX];
    with_current(|proc| {
        for (slot, io) in iotab.iter_mut().zip(proc.iotab.iter()) {
            *slot = io.as_ref().map(Io::dup);
        }
    });

    let mtag = page_table::clone_active_mspace()?;
    let mut child_tfr = Box::new(tfr.clone());
    child_tfr.a0 = 0;

    // Slot reservation, thread creation and the process link happen in one
    // critical section: a tick in between would let the child run before
    // it knows which address space to resume in.
    let guard = InterruptGuard::new();
    let idx = (0..NPROC)
        .find(|&i| unsafe { proctab()[i].is_null() })
        .ok_or(KernelError::InvalidArgument)?;
    let tid = thread::spawn("newthr", move || {
        let tfr = Box::into_raw(child_tfr);
        unsafe { trap_frame_jump(tfr, thread::current_stack_anchor()) };
    })?;
    let child = Box::into_raw(Box::new(Process {
        idx,
        tid,
        mtag,
        iotab,
    }));
    unsafe {
        proctab()[idx] = child;
        (*crate::thread::thread_ptr(tid)).proc = Some(idx);
    }
    drop(guard);
    Ok(tid)
}

/// Terminate the current process: flush the filesystem, tear down the
/// address space, close every open endpoint, release the table slot and
/// exit the thread.
pub fn exit() -> ! {
    let _ = ktfs::fsflush();
    let idx = {
        let _guard = InterruptGuard::new();
        thread::current().proc.expect("thread has no process")
    };
    if idx == 0 {
        panic!("Main process exited.");
    }
    page_table::discard_active_mspace();

    let proc = {
        let _guard = InterruptGuard::new();
        let proc = unsafe { proctab()[idx] };
        unsafe { proctab()[idx] = core::ptr::null_mut() };
        thread::current().proc = None;
        proc
    };
    // Dropping the table closes every endpoint.
    drop(unsafe { Box::from_raw(proc) });
    thread::exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::borrow::ToOwned;

    #[test]
    fn stack_layout_matches_the_user_view() {
        let mut page = alloc::boxed::Box::new([0u8; PAGE_SIZE]);
        let stksz = build_stack(&mut page, &["p", "hello"]).unwrap();
        assert_eq!(stksz % 16, 0);

        let base = PAGE_SIZE - stksz;
        let ptr_at = |i: usize| {
            usize::from_le_bytes(page[base + i * 8..base + i * 8 + 8].try_into().unwrap())
        };

        // argv[0] and argv[1] point into the stack page in user terms;
        // argv[2] is the null terminator.
        let stack_uva = UMEM_END_VMA - PAGE_SIZE;
        let argv0 = ptr_at(0);
        let argv1 = ptr_at(1);
        assert_eq!(ptr_at(2), 0);
        assert!(argv0 >= stack_uva && argv0 < UMEM_END_VMA);
        assert!(argv1 > argv0);

        let str_at = |uva: usize| {
            let off = uva - stack_uva;
            let end = page[off..].iter().position(|&b| b == 0).unwrap() + off;
            core::str::from_utf8(&page[off..end]).unwrap().to_owned()
        };
        assert_eq!(str_at(argv0), "p");
        assert_eq!(str_at(argv1), "hello");
    }

    #[test]
    fn oversized_argument_vectors_are_rejected() {
        let mut page = alloc::boxed::Box::new([0u8; PAGE_SIZE]);
        let big = alloc::string::String::from_utf8(alloc::vec![b'a'; PAGE_SIZE]).unwrap();
        assert_eq!(
            build_stack(&mut page, &[big.as_str()]),
            Err(KernelError::NoMemory)
        );
    }
}

//! System-call dispatch.
//!
//! User code issues `ecall` with the call number in `a7` and arguments in
//! `a0..a5`; the trap layer hands the saved frame here. The dispatcher
//! advances `sepc` past the `ecall`, runs the handler, and stores the
//! result — a nonnegative value or a small negative errno — into `a0`.

use crate::io::{Io, IoCtl};
use crate::process::{self, PROCESS_IOMAX};
use crate::thread::{self, Tid};
use crate::{dev, ktfs, timer, KernelError};
use alloc::string::String;
use alloc::vec::Vec;
use bedrock::trap::TrapFrame;

pub const SYSCALL_EXIT: usize = 0;
pub const SYSCALL_EXEC: usize = 1;
pub const SYSCALL_FORK: usize = 2;
pub const SYSCALL_WAIT: usize = 3;
pub const SYSCALL_USLEEP: usize = 4;
pub const SYSCALL_PRINT: usize = 5;
pub const SYSCALL_DEVOPEN: usize = 6;
pub const SYSCALL_FSOPEN: usize = 7;
pub const SYSCALL_CLOSE: usize = 8;
pub const SYSCALL_READ: usize = 9;
pub const SYSCALL_WRITE: usize = 10;
pub const SYSCALL_IOCTL: usize = 11;
pub const SYSCALL_FSCREATE: usize = 12;
pub const SYSCALL_FSDELETE: usize = 13;
pub const SYSCALL_PIPE: usize = 14;
pub const SYSCALL_IODUP: usize = 15;

/// `ioctl` command numbers shared with user space.
pub const IOCTL_GETBLKSZ: usize = 1;
pub const IOCTL_GETPOS: usize = 2;
pub const IOCTL_SETPOS: usize = 3;
pub const IOCTL_GETEND: usize = 4;
pub const IOCTL_SETEND: usize = 5;

/// Handle an `ecall` from user mode.
pub fn handle_syscall(tfr: &mut TrapFrame) {
    tfr.sepc += 4;
    let result = dispatch(tfr);
    tfr.a0 = match result {
        Ok(v) => v as usize,
        Err(e) => e.errno() as usize,
    };
}

fn dispatch(tfr: &TrapFrame) -> Result<usize, KernelError> {
    match tfr.a7 {
        SYSCALL_EXIT => process::exit(),
        SYSCALL_EXEC => sysexec(tfr.a0 as isize, tfr.a1, tfr.a2),
        SYSCALL_FORK => process::fork(tfr).map(|tid| tid.0),
        SYSCALL_WAIT => syswait(tfr.a0 as isize),
        SYSCALL_USLEEP => {
            timer::sleep_us(tfr.a0 as u64);
            Ok(0)
        }
        SYSCALL_PRINT => sysprint(tfr.a0),
        SYSCALL_DEVOPEN => sysdevopen(tfr.a0 as isize, tfr.a1, tfr.a2),
        SYSCALL_FSOPEN => sysfsopen(tfr.a0 as isize, tfr.a1),
        SYSCALL_CLOSE => sysclose(tfr.a0 as isize),
        SYSCALL_READ => sysread(tfr.a0 as isize, tfr.a1, tfr.a2),
        SYSCALL_WRITE => syswrite(tfr.a0 as isize, tfr.a1, tfr.a2),
        SYSCALL_IOCTL => sysioctl(tfr.a0 as isize, tfr.a1, tfr.a2),
        SYSCALL_FSCREATE => ktfs::fscreate(&user_str(tfr.a0)?).map(|_| 0),
        SYSCALL_FSDELETE => ktfs::fsdelete(&user_str(tfr.a0)?).map(|_| 0),
        SYSCALL_PIPE => syspipe(tfr.a0, tfr.a1),
        SYSCALL_IODUP => sysiodup(tfr.a0 as isize, tfr.a1 as isize),
        _ => Err(KernelError::NotSupportedOperation),
    }
}

// User-memory accessors. Supervisor access to user pages is enabled at
// boot (sstatus.SUM); the trap layer turns a wild pointer into a fault of
// the offending process.

fn user_str(ptr: usize) -> Result<String, KernelError> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut bytes = Vec::new();
    // Syscall strings are names and messages; a page is plenty.
    for i in 0..bedrock::addressing::PAGE_SIZE {
        let b = unsafe { *((ptr + i) as *const u8) };
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
}

fn user_bytes<'a>(ptr: usize, len: usize) -> Result<&'a [u8], KernelError> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len) })
}

fn user_bytes_mut<'a>(ptr: usize, len: usize) -> Result<&'a mut [u8], KernelError> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) })
}

fn read_user<T: Copy>(ptr: usize) -> Result<T, KernelError> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(unsafe { core::ptr::read_unaligned(ptr as *const T) })
}

fn write_user<T: Copy>(ptr: usize, v: T) -> Result<(), KernelError> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    unsafe { core::ptr::write_unaligned(ptr as *mut T, v) };
    Ok(())
}

// File-descriptor helpers.

fn check_fd(fd: isize) -> Result<usize, KernelError> {
    if (0..PROCESS_IOMAX as isize).contains(&fd) {
        Ok(fd as usize)
    } else {
        Err(KernelError::BadFileDescriptor)
    }
}

fn fd_io(fd: isize) -> Result<Io, KernelError> {
    let fd = check_fd(fd)?;
    process::with_current(|proc| proc.iotab[fd].as_ref().map(Io::dup))
        .ok_or(KernelError::BadFileDescriptor)
}

// Installs `io` at `fd`, or at the first empty slot when `fd` is negative.
fn install_io(fd: isize, io: Io) -> Result<usize, KernelError> {
    if fd >= 0 {
        let fd = check_fd(fd)?;
        process::with_current(|proc| {
            if proc.iotab[fd].is_some() {
                Err(KernelError::BadFileDescriptor)
            } else {
                proc.iotab[fd] = Some(io);
                Ok(fd)
            }
        })
    } else {
        process::with_current(|proc| {
            let slot = proc
                .iotab
                .iter()
                .position(|cell| cell.is_none())
                .ok_or(KernelError::TooManyOpenFile)?;
            proc.iotab[slot] = Some(io);
            Ok(slot)
        })
    }
}

fn sysexec(fd: isize, argc: usize, argv: usize) -> Result<usize, KernelError> {
    let fd = check_fd(fd)?;
    let exe = process::with_current(|proc| proc.iotab[fd].take())
        .ok_or(KernelError::BadFileDescriptor)?;

    let mut args = Vec::with_capacity(argc);
    for i in 0..argc {
        let ptr: usize = read_user(argv + i * core::mem::size_of::<usize>())?;
        args.push(user_str(ptr)?);
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    match process::exec(exe, &arg_refs) {
        Ok(never) => match never {},
        // Zero tells the caller the exec itself came back.
        Err(_) => Ok(0),
    }
}

fn syswait(tid: isize) -> Result<usize, KernelError> {
    // A negative tid waits for any child.
    let target = if tid < 0 { Tid(0) } else { Tid(tid as usize) };
    thread::join(target).map(|tid| tid.0)
}

fn sysprint(msg: usize) -> Result<usize, KernelError> {
    let msg = user_str(msg)?;
    println!(
        "<{}:{}> says: {}",
        thread::current_name(),
        thread::current_tid(),
        msg
    );
    Ok(0)
}

fn sysdevopen(fd: isize, name: usize, instno: usize) -> Result<usize, KernelError> {
    let name = user_str(name)?;
    let io = dev::open_device(&name, instno)?;
    install_io(fd, io)
}

fn sysfsopen(fd: isize, name: usize) -> Result<usize, KernelError> {
    let name = user_str(name)?;
    let io = ktfs::fsopen(&name)?;
    install_io(fd, io)
}

fn sysclose(fd: isize) -> Result<usize, KernelError> {
    let fd = check_fd(fd)?;
    process::with_current(|proc| proc.iotab[fd].take())
        .map(|_| 0)
        .ok_or(KernelError::BadFileDescriptor)
}

fn sysread(fd: isize, buf: usize, len: usize) -> Result<usize, KernelError> {
    let io = fd_io(fd)?;
    let buf = user_bytes_mut(buf, len)?;
    let n = io.read(buf)?;
    if n > len {
        // An endpoint returning more than asked is a kernel bug.
        return Err(KernelError::InvalidArgument);
    }
    Ok(n)
}

fn syswrite(fd: isize, buf: usize, len: usize) -> Result<usize, KernelError> {
    let io = fd_io(fd)?;
    let buf = user_bytes(buf, len)?;
    let n = io.write(buf)?;
    if n > len {
        return Err(KernelError::InvalidArgument);
    }
    Ok(n)
}

fn sysioctl(fd: isize, cmd: usize, arg: usize) -> Result<usize, KernelError> {
    let io = fd_io(fd)?;
    match cmd {
        IOCTL_GETBLKSZ => io.cntl(IoCtl::GetBlkSz).map(|v| v as usize),
        IOCTL_GETPOS => {
            let v = io.cntl(IoCtl::GetPos)?;
            write_user(arg, v).map(|_| 0)
        }
        IOCTL_SETPOS => {
            let v: u64 = read_user(arg)?;
            io.cntl(IoCtl::SetPos(v)).map(|_| 0)
        }
        IOCTL_GETEND => {
            let v = io.cntl(IoCtl::GetEnd)?;
            write_user(arg, v).map(|_| 0)
        }
        IOCTL_SETEND => {
            let v: u64 = read_user(arg)?;
            io.cntl(IoCtl::SetEnd(v)).map(|_| 0)
        }
        _ => Err(KernelError::NotSupportedOperation),
    }
}

fn syspipe(wfdptr: usize, rfdptr: usize) -> Result<usize, KernelError> {
    let wfd: i32 = read_user(wfdptr)?;
    let rfd: i32 = read_user(rfdptr)?;
    let (wio, rio) = crate::io::pipe::create_pipe()?;

    if wfd >= 0 && rfd >= 0 {
        // Caller-chosen descriptors must be distinct and empty.
        if wfd == rfd {
            return Err(KernelError::BadFileDescriptor);
        }
        let (wfd, rfd) = (check_fd(wfd as isize)?, check_fd(rfd as isize)?);
        process::with_current(|proc| {
            if proc.iotab[wfd].is_some() || proc.iotab[rfd].is_some() {
                Err(KernelError::BadFileDescriptor)
            } else {
                proc.iotab[wfd] = Some(wio);
                proc.iotab[rfd] = Some(rio);
                Ok(0)
            }
        })
    } else {
        let (wslot, rslot) = process::with_current(|proc| {
            let mut free = proc
                .iotab
                .iter()
                .enumerate()
                .filter(|(_, cell)| cell.is_none())
                .map(|(i, _)| i);
            let (w, r) = (
                free.next().ok_or(KernelError::TooManyOpenFile)?,
                free.next().ok_or(KernelError::TooManyOpenFile)?,
            );
            proc.iotab[w] = Some(wio);
            proc.iotab[r] = Some(rio);
            Ok::<_, KernelError>((w, r))
        })?;
        write_user(wfdptr, wslot as i32)?;
        write_user(rfdptr, rslot as i32)?;
        Ok(0)
    }
}

fn sysiodup(oldfd: isize, newfd: isize) -> Result<usize, KernelError> {
    let io = fd_io(oldfd)?;
    if newfd >= 0 {
        let newfd = check_fd(newfd)?;
        // Duplicating onto an occupied descriptor closes it first.
        let old =
            process::with_current(|proc| core::mem::replace(&mut proc.iotab[newfd], Some(io)));
        drop(old);
        Ok(newfd)
    } else {
        install_io(-1, io)
    }
}

//! System call dispatch.
//!
//! User programs trap in with the call number in `a7` and arguments in
//! `a0..a6`; the result lands in `a0` as a non-negative value or a negative
//! error code. `sepc` is advanced past the ECALL before dispatch so a
//! resumed process does not re-enter the call.
//!
//! Every user pointer is checked against the active page tables before the
//! kernel touches it.

use alloc::vec::Vec;

use riscv::mmu::EntryFlags;

use crate::arch::riscv::trap::TrapFrame;
use crate::config::PROCESS_IOMAX;
use crate::drivers::open_device;
use crate::fs::{fs_create, fs_delete, fs_open};
use crate::io::pipe::create_pipe;
use crate::io::IoRef;
use crate::mm::{validate_vptr, validate_vstr};
use crate::proc::{process_exec, process_exit, process_fork, with_current, Process};
use crate::sched::timer::sleep_us;
use crate::sched::{running_thread, thread_join, thread_name};
use crate::{Error, Result};

// System call numbers.
const SYSCALL_EXIT: u64 = 0;
const SYSCALL_EXEC: u64 = 1;
const SYSCALL_FORK: u64 = 2;
const SYSCALL_WAIT: u64 = 3;
const SYSCALL_PRINT: u64 = 4;
const SYSCALL_USLEEP: u64 = 5;
const SYSCALL_DEVOPEN: u64 = 6;
const SYSCALL_FSOPEN: u64 = 7;
const SYSCALL_FSCREATE: u64 = 8;
const SYSCALL_FSDELETE: u64 = 9;
const SYSCALL_CLOSE: u64 = 10;
const SYSCALL_READ: u64 = 11;
const SYSCALL_WRITE: u64 = 12;
const SYSCALL_IOCTL: u64 = 13;
const SYSCALL_PIPE: u64 = 14;
const SYSCALL_IODUP: u64 = 15;

// ioctl commands.
const IOCTL_GETBLKSZ: u64 = 1;
const IOCTL_GETPOS: u64 = 2;
const IOCTL_SETPOS: u64 = 3;
const IOCTL_GETEND: u64 = 4;
const IOCTL_SETEND: u64 = 5;

const UR: EntryFlags = EntryFlags::USER.union(EntryFlags::READ);
const UW: EntryFlags = EntryFlags::USER.union(EntryFlags::WRITE);

/// Entry point from the trap dispatcher for an ECALL from user mode.
pub fn handle_syscall(tfr: &mut TrapFrame) {
    // Each instruction is 4 bytes; skip the ECALL itself.
    tfr.sepc += 4;

    let ret = match syscall(tfr) {
        Ok(v) => v,
        Err(e) => e.code(),
    };
    tfr.a0 = ret as u64;
}

fn syscall(tfr: &mut TrapFrame) -> Result<i64> {
    match tfr.a7 {
        SYSCALL_EXIT => sysexit(),
        SYSCALL_EXEC => sysexec(tfr.a0 as i64, tfr.a1 as i64, tfr.a2),
        SYSCALL_FORK => process_fork(tfr).map(|tid| tid as i64),
        SYSCALL_WAIT => syswait(tfr.a0 as i64),
        SYSCALL_PRINT => sysprint(tfr.a0),
        SYSCALL_USLEEP => sysusleep(tfr.a0),
        SYSCALL_DEVOPEN => sysdevopen(tfr.a0 as i64, tfr.a1, tfr.a2 as i64),
        SYSCALL_FSOPEN => sysfsopen(tfr.a0 as i64, tfr.a1),
        SYSCALL_FSCREATE => sysfscreate(tfr.a0),
        SYSCALL_FSDELETE => sysfsdelete(tfr.a0),
        SYSCALL_CLOSE => sysclose(tfr.a0 as i64),
        SYSCALL_READ => sysread(tfr.a0 as i64, tfr.a1, tfr.a2),
        SYSCALL_WRITE => syswrite(tfr.a0 as i64, tfr.a1, tfr.a2),
        SYSCALL_IOCTL => sysioctl(tfr.a0 as i64, tfr.a1, tfr.a2),
        SYSCALL_PIPE => syspipe(tfr.a0, tfr.a1),
        SYSCALL_IODUP => sysiodup(tfr.a0 as i64, tfr.a1 as i64),
        _ => Err(Error::NotSupported),
    }
}

// User memory access. Supervisor access to user pages is enabled (SUM), so
// validated user ranges can be dereferenced directly.

/// Borrows a user string after validating it.
fn user_str(ptr: u64) -> Result<&'static str> {
    validate_vstr(ptr as usize, UR)?;
    let mut len = 0;
    // SAFETY: validate_vstr found a NUL within its bound.
    unsafe {
        while *((ptr as usize + len) as *const u8) != 0 {
            len += 1;
        }
        core::str::from_utf8(core::slice::from_raw_parts(ptr as *const u8, len))
            .map_err(|_| Error::Invalid)
    }
}

/// Borrows a readable user buffer after validating it.
fn user_buf(ptr: u64, len: u64) -> Result<&'static [u8]> {
    validate_vptr(ptr as usize, len as usize, UR)?;
    // SAFETY: the range was just validated as mapped and readable.
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

/// Borrows a writable user buffer after validating it.
fn user_buf_mut(ptr: u64, len: u64) -> Result<&'static mut [u8]> {
    validate_vptr(ptr as usize, len as usize, UW)?;
    // SAFETY: the range was just validated as mapped and writable.
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Reads a value from validated user memory.
fn user_read<T: Copy>(ptr: u64) -> Result<T> {
    validate_vptr(ptr as usize, core::mem::size_of::<T>(), UR)?;
    // SAFETY: validated above; T is plain data.
    Ok(unsafe { core::ptr::read_unaligned(ptr as *const T) })
}

/// Writes a value into validated user memory.
fn user_write<T: Copy>(ptr: u64, val: T) -> Result<()> {
    validate_vptr(ptr as usize, core::mem::size_of::<T>(), UW)?;
    // SAFETY: validated above; T is plain data.
    unsafe { core::ptr::write_unaligned(ptr as *mut T, val) };
    Ok(())
}

// File descriptor plumbing.

fn check_fd(fd: i64) -> Result<usize> {
    if (0..PROCESS_IOMAX as i64).contains(&fd) {
        Ok(fd as usize)
    } else {
        Err(Error::BadFd)
    }
}

fn fd_io(fd: i64) -> Result<IoRef> {
    let fd = check_fd(fd)?;
    with_current(|p| p.iotab[fd].clone()).ok_or(Error::BadFd)
}

/// Resolves a descriptor request: a negative `want` picks the lowest free
/// slot, anything else must name an empty in-range slot. `skip` excludes a
/// slot already claimed by the same call.
fn resolve_fd(p: &Process, want: i64, skip: Option<usize>) -> Result<usize> {
    if want < 0 {
        (0..PROCESS_IOMAX)
            .find(|&i| Some(i) != skip && p.iotab[i].is_none())
            .ok_or(Error::TooManyFiles)
    } else {
        let fd = check_fd(want)?;
        if Some(fd) == skip || p.iotab[fd].is_some() {
            return Err(Error::BadFd);
        }
        Ok(fd)
    }
}

// Handlers.

fn sysexit() -> Result<i64> {
    process_exit();
}

fn sysexec(fd: i64, argc: i64, argv: u64) -> Result<i64> {
    if argc < 0 {
        return Err(Error::Invalid);
    }
    let io = fd_io(fd)?;

    let argc = argc as usize;
    validate_vptr(argv as usize, (argc + 1) * 8, UR)?;
    let mut args: Vec<&str> = Vec::with_capacity(argc);
    for i in 0..argc {
        let ptr: u64 = user_read(argv + i as u64 * 8)?;
        args.push(user_str(ptr)?);
    }

    process_exec(io, &args)
}

fn syswait(tid: i64) -> Result<i64> {
    if tid < 0 {
        return Err(Error::Invalid);
    }
    thread_join(tid as usize).map(|t| t as i64)
}

fn sysprint(msg: u64) -> Result<i64> {
    let msg = user_str(msg)?;
    let tid = running_thread();
    kprintln!("Thread <{}:{}> says: {}", thread_name(tid), tid, msg);
    Ok(0)
}

fn sysusleep(us: u64) -> Result<i64> {
    sleep_us(us);
    Ok(0)
}

fn sysdevopen(fd: i64, name: u64, instno: i64) -> Result<i64> {
    if instno < 0 {
        return Err(Error::Invalid);
    }
    let name = user_str(name)?;
    let io = open_device(name, instno as usize)?;

    let installed = with_current(|p| {
        let target = resolve_fd(p, fd, None)?;
        p.iotab[target] = Some(io.clone());
        Ok(target as i64)
    });
    // On failure the endpoint handle drops here, closing it.
    installed
}

fn sysfsopen(fd: i64, name: u64) -> Result<i64> {
    let name = user_str(name)?;
    let io = fs_open(name)?;

    with_current(|p| {
        let target = resolve_fd(p, fd, None)?;
        p.iotab[target] = Some(io.clone());
        Ok(target as i64)
    })
}

fn sysfscreate(name: u64) -> Result<i64> {
    let name = user_str(name)?;
    fs_create(name)?;
    Ok(0)
}

fn sysfsdelete(name: u64) -> Result<i64> {
    let name = user_str(name)?;
    fs_delete(name)?;
    Ok(0)
}

fn sysclose(fd: i64) -> Result<i64> {
    let fd = check_fd(fd)?;
    let io = with_current(|p| p.iotab[fd].take()).ok_or(Error::BadFd)?;
    // The endpoint may block while tearing down; drop it outside any table
    // lock.
    drop(io);
    Ok(0)
}

fn sysread(fd: i64, buf: u64, len: u64) -> Result<i64> {
    let io = fd_io(fd)?;
    if len == 0 {
        return Ok(0);
    }
    let buf = user_buf_mut(buf, len)?;
    io.read(buf).map(|n| n as i64)
}

fn syswrite(fd: i64, buf: u64, len: u64) -> Result<i64> {
    let io = fd_io(fd)?;
    if len == 0 {
        return Ok(0);
    }
    let buf = user_buf(buf, len)?;
    io.write(buf).map(|n| n as i64)
}

fn sysioctl(fd: i64, cmd: u64, arg: u64) -> Result<i64> {
    let io = fd_io(fd)?;
    match cmd {
        IOCTL_GETBLKSZ => Ok(io.block_size() as i64),
        IOCTL_GETPOS => {
            user_write(arg, io.pos()?)?;
            Ok(0)
        }
        IOCTL_SETPOS => {
            io.seek(user_read(arg)?)?;
            Ok(0)
        }
        IOCTL_GETEND => {
            user_write(arg, io.end()?)?;
            Ok(0)
        }
        IOCTL_SETEND => {
            io.set_end(user_read(arg)?)?;
            Ok(0)
        }
        _ => Err(Error::NotSupported),
    }
}

fn syspipe(wfdptr: u64, rfdptr: u64) -> Result<i64> {
    let want_w: i32 = user_read(wfdptr)?;
    let want_r: i32 = user_read(rfdptr)?;

    if want_w >= 0 && want_w == want_r {
        return Err(Error::BadFd);
    }

    let (wio, rio) = create_pipe()?;

    let (wfd, rfd) = with_current(|p| {
        let wfd = resolve_fd(p, want_w as i64, None)?;
        let rfd = resolve_fd(p, want_r as i64, Some(wfd))?;
        p.iotab[wfd] = Some(wio.clone());
        p.iotab[rfd] = Some(rio.clone());
        Ok::<(usize, usize), Error>((wfd, rfd))
    })?;

    user_write(wfdptr, wfd as i32)?;
    user_write(rfdptr, rfd as i32)?;
    Ok(0)
}

fn sysiodup(oldfd: i64, newfd: i64) -> Result<i64> {
    let old = fd_io(oldfd)?;
    if newfd == oldfd {
        return Ok(oldfd);
    }

    let (target, closed) = with_current(|p| {
        let target = if newfd < 0 {
            resolve_fd(p, -1, None)?
        } else {
            check_fd(newfd)?
        };
        // An occupied slot is closed first.
        let closed = p.iotab[target].take();
        p.iotab[target] = Some(old.clone());
        Ok::<(usize, Option<IoRef>), Error>((target, closed))
    })?;
    drop(closed);

    Ok(target as i64)
}

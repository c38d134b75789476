//! RISC-V trap handling.

use riscv::addr::{round_down, PAGE_SIZE};
use riscv::registers::{Stvec, SstatusFlags};

use crate::mm::handle_umode_page_fault;
use crate::proc::process_exit;
use crate::sched::timer;
use crate::syscall::handle_syscall;

// scause interrupt flag.
const CAUSE_IRQ_FLAG: u64 = 1 << 63;

/// Possible interrupt causes on a RISC-V CPU.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IrqCause {
    STimer = 5,
}

/// Possible exception causes on a RISC-V CPU.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionCause {
    InstrAddrMisaligned,
    InstrAccessFault,
    IllegalInstr,
    Breakpoint,
    LoadAddrMisaligned,
    LoadAccessFault,
    StoreAddrMisaligned,
    StoreAccessFault,
    EnvCallFromU,
    EnvCallFromS,
    InstrPageFault,
    LoadPageFault,
    StorePageFault,
}

impl From<u64> for ExceptionCause {
    fn from(n: u64) -> Self {
        use ExceptionCause::*;

        match n {
            0 => InstrAddrMisaligned,
            1 => InstrAccessFault,
            2 => IllegalInstr,
            3 => Breakpoint,
            4 => LoadAddrMisaligned,
            5 => LoadAccessFault,
            6 => StoreAddrMisaligned,
            7 => StoreAccessFault,
            8 => EnvCallFromU,
            9 => EnvCallFromS,
            12 => InstrPageFault,
            13 => LoadPageFault,
            15 => StorePageFault,
            _ => panic!("invalid exception cause: {}", n),
        }
    }
}

/// Register state captured on trap entry.
///
/// Note: the field order **must** match the store sequence in trap.S and
/// the restore sequence of `_trap_frame_jump`.
#[repr(C)]
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct TrapFrame {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
    pub sepc: u64,
    pub sstatus: u64,
}

impl TrapFrame {
    /// An all-zero frame.
    pub fn zeroed() -> Self {
        // SAFETY: TrapFrame is plain integers.
        unsafe { core::mem::zeroed() }
    }

    /// The sstatus image for first entry to user mode: previous privilege
    /// U, previous interrupt enable off.
    pub fn user_sstatus() -> u64 {
        use riscv::registers::Sstatus;
        Sstatus::read_raw() & !(SstatusFlags::SPP | SstatusFlags::SPIE).bits()
    }

    /// Returns whether this trap was taken from user mode.
    pub fn from_user(&self) -> bool {
        self.sstatus & SstatusFlags::SPP.bits() == 0
    }

    /// Prints the frame to the console.
    #[rustfmt::skip]
    fn dump(&self) {
        let s = self;
        kprintln!(" PC was at {:016x}", s.sepc);
        kprintln!(" RA was at {:016x}", s.ra);
        kprintln!(" sp : {:016x}  gp : {:016x}  tp : {:016x}", s.sp, s.gp, s.tp);
        kprintln!(" t0 : {:016x}  t1 : {:016x}  t2 : {:016x}", s.t0, s.t1, s.t2);
        kprintln!(" s0 : {:016x}  s1 : {:016x}  a0 : {:016x}", s.s0, s.s1, s.a0);
        kprintln!(" a1 : {:016x}  a2 : {:016x}  a3 : {:016x}", s.a1, s.a2, s.a3);
        kprintln!(" a4 : {:016x}  a5 : {:016x}  a6 : {:016x}", s.a4, s.a5, s.a6);
        kprintln!(" a7 : {:016x}  s2 : {:016x}  s3 : {:016x}", s.a7, s.s2, s.s3);
        kprintln!(" s4 : {:016x}  s5 : {:016x}  s6 : {:016x}", s.s4, s.s5, s.s6);
        kprintln!(" s7 : {:016x}  s8 : {:016x}  s9 : {:016x}", s.s7, s.s8, s.s9);
        kprintln!(" s10: {:016x}  s11: {:016x}  t3 : {:016x}", s.s10, s.s11, s.t3);
        kprintln!(" t4 : {:016x}  t5 : {:016x}  t6 : {:016x}", s.t4, s.t5, s.t6);
    }
}

extern "C" {
    // Defined in trap.S
    fn trap_entry();
    fn _trap_frame_jump(tfr: *const TrapFrame, anchor: usize) -> !;
}

/// Restores `tfr` and enters the privilege mode it encodes, arming the trap
/// stack with `anchor` first.
///
/// # Safety
///
/// The frame must describe a valid user context in the active address
/// space, and `anchor` must be the running thread's stack anchor.
pub unsafe fn trap_frame_jump(tfr: &TrapFrame, anchor: usize) -> ! {
    // SAFETY: forwarded to the caller.
    unsafe { _trap_frame_jump(tfr, anchor) }
}

/// Configures the trap vector used to handle traps in S-mode.
pub fn trap_init() {
    Stvec::write(trap_entry as usize as u64);
}

/// Central trap dispatcher, called from trap.S with interrupts disabled.
#[no_mangle]
extern "C" fn handle_trap(tfr: &mut TrapFrame, cause: u64, tval: u64) {
    if cause & CAUSE_IRQ_FLAG != 0 {
        let irq = cause & !CAUSE_IRQ_FLAG;
        if irq == IrqCause::STimer as u64 {
            timer::handle_timer_interrupt();
            // A tick that lands in user code also yields, handing the CPU
            // to whatever the tick made ready (the interrupter above all);
            // this is what preempts a compute-bound process. Kernel code is
            // never preempted mid-flight: it reaches its own suspension
            // points.
            if tfr.from_user() {
                crate::sched::thread_yield();
            }
        } else {
            panic!("unexpected interrupt: {}", irq);
        }
        return;
    }

    use ExceptionCause::*;
    match ExceptionCause::from(cause) {
        EnvCallFromU => handle_syscall(tfr),
        InstrPageFault | LoadPageFault | StorePageFault if tfr.from_user() => {
            let vma = round_down(tval as usize, PAGE_SIZE);
            if !handle_umode_page_fault(vma) {
                kprintln!("segfault at {:016x}", tval);
                tfr.dump();
                process_exit();
            }
        }
        ex => {
            kprintln!("unhandled exception: {:?}, tval {:016x}", ex, tval);
            tfr.dump();
            panic!("fatal trap");
        }
    }
}

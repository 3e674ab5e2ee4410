//! Remote syscall executor (spec §4.3) and the signal-rewind protocol
//! (spec §4.3, design note "Signal-delivery loop as a state machine").

use crate::error::{Error, Result};
use crate::ptrace::{self, StopKind, ARCH_SI_TRAP};
use crate::registers::Registers;
use libc::pid_t;
use log::{debug, warn};

/// Drive a single remote syscall in `target_tid`, which shares a control
/// block with `syscall_ip`. `original_regs` is the register snapshot that
/// signal-rewind treats as "the context to deliver a redirected signal
/// against"; it is updated in place if a rewind occurs, since the
/// post-frame-build registers become the new baseline for any subsequent
/// injection in the same session (spec §4.3 step 4, design note).
pub fn execute(
    caller_pid: pid_t,
    target_tid: pid_t,
    syscall_ip: u64,
    original_regs: &mut Registers,
    signals_blocked: bool,
    nr: i64,
    args: [u64; 6],
) -> Result<i64> {
    let saved_caller_regs = if caller_pid != target_tid {
        Some(ptrace::getregs(target_tid)?)
    } else {
        None
    };

    let mut regs = *original_regs;
    regs.set_ip(syscall_ip);
    regs.set_syscallno(nr);
    regs.set_syscall_args(args);
    ptrace::setregs(target_tid, &regs)?;

    let result = drive_to_completion(target_tid, original_regs, signals_blocked);

    if let Some(saved) = saved_caller_regs {
        ptrace::setregs(target_tid, &saved)?;
    }

    result
}

/// Resume `tid` from whatever registers are already set and run it until
/// the parasite's terminating `int3` or a genuine syscall trap, applying
/// signal-rewind to anything else in between. Shared by `execute` (which
/// sets up syscall-entry registers first) and the parasite control
/// channel's `dispatch`, which only needs `ip` pointed at the parasite
/// entry point before calling this.
pub(crate) fn drive_to_completion(
    tid: pid_t,
    original_regs: &mut Registers,
    signals_blocked: bool,
) -> Result<i64> {
    loop {
        ptrace::cont(tid, None)?;
        match ptrace::wait_for_stop(tid)? {
            StopKind::Trap { si_code } if si_code == ARCH_SI_TRAP => {
                let regs = ptrace::getregs(tid)?;
                return Ok(regs.syscall_result());
            }
            StopKind::Trap { si_code } => {
                if signals_blocked {
                    return Err(Error::UnexpectedStop(StopKind::Trap { si_code }));
                }
                warn!("unexpected trap (si_code={}) during remote syscall, rewinding", si_code);
                signal_rewind(tid, original_regs, libc::SIGTRAP)?;
            }
            StopKind::Signal(sig) => {
                if signals_blocked {
                    return Err(Error::UnexpectedStop(StopKind::Signal(sig)));
                }
                debug!("signal {} delivered during remote syscall, rewinding", sig);
                signal_rewind(tid, original_regs, sig)?;
            }
            StopKind::Event(_) | StopKind::GroupStop => {
                if signals_blocked {
                    return Err(Error::UnexpectedStop(ptrace::StopKind::GroupStop));
                }
                // A stray event with nothing pending; just keep going.
                continue;
            }
            StopKind::Exited(_) => return Err(Error::VictimGone(tid)),
        }
    }
}

/// Redirect a non-trap signal that arrived during parasite execution into
/// the victim's *original* register context, let the kernel build a
/// correct signal frame, and re-read the resulting registers as the new
/// baseline (spec §4.3 "Signal-rewind").
fn signal_rewind(tid: pid_t, original_regs: &mut Registers, mut pending_sig: i32) -> Result<()> {
    loop {
        ptrace::setregs(tid, original_regs)?;
        ptrace::interrupt(tid)?;
        ptrace::cont(tid, Some(pending_sig))?;
        match ptrace::wait_for_stop(tid)? {
            StopKind::GroupStop => {
                *original_regs = ptrace::getregs(tid)?;
                return Ok(());
            }
            StopKind::Signal(next_sig) => {
                // Another signal arrived before the group-stop; redeliver it
                // and keep waiting (spec: "any other stop cause is
                // re-delivered by repeating the process").
                pending_sig = next_sig;
                continue;
            }
            StopKind::Trap { .. } | StopKind::Event(_) => continue,
            StopKind::Exited(_) => return Err(Error::VictimGone(tid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_requires_no_special_setup_to_compile() {
        // Exercised end-to-end only under a real tracee; see the parasite
        // transport tests for the FSM's pure-function counterparts.
        let _ = execute as fn(_, _, _, _, _, _, _) -> _;
    }
}

//! Register access for the victim task.
//!
//! The parasite is native code (spec §1 Non-goals: "No emulation or
//! translation of architectures"), so unlike the teacher's `Registers` type
//! (a union of x86/x64 layouts, built to support rr's mixed-bitness replay)
//! we only ever deal with the tracer's own native `libc::user_regs_struct`.
//! We keep the teacher's idea of a small wrapper type with named accessors
//! instead of passing the raw struct around, since that's what every caller
//! in the remote-syscall executor and the parasite control channel wants
//! (syscall number, six arguments, return value, ip).
use libc::user_regs_struct;

#[derive(Copy, Clone, Debug, Default)]
pub struct Registers(pub user_regs_struct);

impl Registers {
    pub fn from_ptrace(regs: user_regs_struct) -> Registers {
        Registers(regs)
    }

    pub fn raw(&self) -> &user_regs_struct {
        &self.0
    }

    pub fn raw_mut(&mut self) -> &mut user_regs_struct {
        &mut self.0
    }

    pub fn ip(&self) -> u64 {
        self.0.rip
    }

    pub fn set_ip(&mut self, ip: u64) {
        self.0.rip = ip;
    }

    pub fn sp(&self) -> u64 {
        self.0.rsp
    }

    pub fn syscallno(&self) -> i64 {
        self.0.orig_rax as i64
    }

    pub fn set_syscallno(&mut self, syscallno: i64) {
        self.0.orig_rax = syscallno as u64;
        self.0.rax = syscallno as u64;
    }

    pub fn syscall_result(&self) -> i64 {
        self.0.rax as i64
    }

    pub fn set_syscall_result(&mut self, v: u64) {
        self.0.rax = v;
    }

    /// Set the architecture-defined argument registers for a remote
    /// syscall (spec §4.3 step 2): rdi, rsi, rdx, r10, r8, r9.
    pub fn set_syscall_args(&mut self, args: [u64; 6]) {
        self.0.rdi = args[0];
        self.0.rsi = args[1];
        self.0.rdx = args[2];
        self.0.r10 = args[3];
        self.0.r8 = args[4];
        self.0.r9 = args[5];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscallno_roundtrip() {
        let mut r = Registers::default();
        r.set_syscallno(57); // fork
        assert_eq!(r.syscallno(), 57);
        assert_eq!(r.0.rax, 57);
    }

    #[test]
    fn args_land_in_arch_registers() {
        let mut r = Registers::default();
        r.set_syscall_args([1, 2, 3, 4, 5, 6]);
        assert_eq!(r.0.rdi, 1);
        assert_eq!(r.0.rsi, 2);
        assert_eq!(r.0.rdx, 3);
        assert_eq!(r.0.r10, 4);
        assert_eq!(r.0.r8, 5);
        assert_eq!(r.0.r9, 6);
    }
}

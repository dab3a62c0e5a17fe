#[cfg(not(target_arch = "x86_64"))]
compile_error!("reattach only supports x86_64 Linux targets");

pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Bytes below `rsp` that a leaf function may still be using (System V ABI).
pub const RED_ZONE: usize = 128;

pub const STACK_ALIGN: usize = 16;

const EFLAGS_DF: u64 = 1 << 10;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl UserRegs {
    pub fn program_counter(&self) -> usize {
        self.rip as usize
    }

    pub fn set_program_counter(&mut self, program_counter: usize) {
        self.rip = program_counter as u64
    }

    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    pub fn set_stack_pointer(&mut self, stack_pointer: usize) {
        self.rsp = stack_pointer as u64
    }

    // orig_rax = -1 keeps the kernel from rewinding `entry` as a syscall restart.
    pub fn redirected(&self, entry: usize, stack_pointer: usize) -> Self {
        let mut regs = *self;
        regs.set_program_counter(entry);
        regs.set_stack_pointer(stack_pointer);
        regs.rax = 0;
        regs.orig_rax = u64::MAX;
        regs.eflags &= !EFLAGS_DF;
        regs
    }
}

pub fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub fn words_for(len: usize) -> usize {
    align_up(len, WORD_SIZE) / WORD_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_block_matches_kernel_layout() {
        assert_eq!(
            std::mem::size_of::<UserRegs>(),
            std::mem::size_of::<libc::user_regs_struct>()
        );
    }

    #[test]
    fn redirect_neutralises_syscall_restart() {
        let regs = UserRegs {
            rip: 0x1000,
            rsp: 0x7ff0,
            rax: (-4i64) as u64,
            orig_rax: 230,
            eflags: 0x246 | EFLAGS_DF,
            ..unsafe { std::mem::zeroed() }
        };

        let injected = regs.redirected(0x2008, 0x7f00);
        assert_eq!(injected.program_counter(), 0x2008);
        assert_eq!(injected.stack_pointer(), 0x7f00);
        assert_eq!(injected.orig_rax, u64::MAX);
        assert_eq!(injected.rax, 0);
        assert_eq!(injected.eflags, 0x246);
        assert_eq!(regs.rip, 0x1000);
    }

    #[test]
    fn word_rounding() {
        assert_eq!(words_for(0), 0);
        assert_eq!(words_for(1), 1);
        assert_eq!(words_for(8), 1);
        assert_eq!(words_for(11), 2);
        assert_eq!(align_down(0x7fff_1237, 16), 0x7fff_1230);
        assert_eq!(align_up(13, 8), 16);
    }
}

//! Position-independent x86_64 programs injected into the tracee.
//!
//! A [`Template`] is an immutable byte sequence plus the list of sites that
//! must be filled in before it can run. Runtime routines are reached through
//! an import table appended to the code: every call is `call [rip+disp32]`,
//! with a self-relative displacement fixed at assembly time, so only the table
//! slots and the resume immediate depend on the tracee.
//!
//! Both programs expect `rsp` to point at their argument words, with the
//! pre-injection instruction pointer stored in the return slot above the
//! reserved region. They finish by raising `SIGWINCH` on themselves.

use crate::arch::WORD_SIZE;
use crate::resolver::ResolvedRoutines;
use crate::{ReattachError, ReattachResult};

pub const ENTRY_SKIP: usize = 8;

/// Words the attach program leaves directly below its argument word: the
/// copies of stdin, stdout and stderr (highest first), then the descriptor
/// it opened for the new terminal.
pub const ATTACH_OUTPUT_WORDS: usize = 4;

pub const RENDEZVOUS_SIGNAL: i32 = libc::SIGWINCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Routine {
    Fcntl,
    Dup2,
    Open,
    Close,
    Getpid,
    Kill,
}

impl Routine {
    pub fn symbol(self) -> &'static str {
        match self {
            Routine::Fcntl => "fcntl",
            Routine::Dup2 => "dup2",
            Routine::Open => "open",
            Routine::Close => "close",
            Routine::Getpid => "getpid",
            Routine::Kill => "kill",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Eight-byte absolute address of a runtime routine.
    Routine(Routine),
    /// 32-bit distance from the argument words to the return slot.
    ResumeSkip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub offset: usize,
    pub kind: PatchKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    code: Vec<u8>,
    patches: Vec<Patch>,
}

impl Template {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Routines the template imports, in table order.
    pub fn routines(&self) -> Vec<Routine> {
        self.patches
            .iter()
            .filter_map(|patch| match patch.kind {
                PatchKind::Routine(routine) => Some(routine),
                PatchKind::ResumeSkip => None,
            })
            .collect()
    }

    /// Fill every patch site, producing the bytes to inject.
    pub fn patch(&self, routines: &ResolvedRoutines, resume_skip: u32) -> ReattachResult<Vec<u8>> {
        let mut code = self.code.clone();
        for patch in &self.patches {
            let at = patch.offset;
            match patch.kind {
                PatchKind::Routine(routine) => {
                    let address = routines.get(routine).ok_or_else(|| {
                        ReattachError::InjectionFailure(format!("no address for `{}`", routine.symbol()))
                    })?;
                    code[at..at + 8].copy_from_slice(&address.to_le_bytes());
                }
                PatchKind::ResumeSkip => {
                    code[at..at + 4].copy_from_slice(&resume_skip.to_le_bytes());
                }
            }
        }
        Ok(code)
    }
}

#[derive(Debug, Clone, Copy)]
enum Saved {
    R12 = 4,
    R13 = 5,
    R14 = 6,
    R15 = 7,
}

struct Label(usize);

struct Assembler {
    code: Vec<u8>,
    calls: Vec<(usize, Routine)>,
    resume: Option<usize>,
}

impl Assembler {
    fn new() -> Self {
        Self { code: vec![0x90; ENTRY_SKIP], calls: Vec::new(), resume: None }
    }

    fn emit(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    /// mov rbp, rsp; [sub rsp, scratch;] and rsp, -16
    fn prologue(&mut self, scratch: u8) -> &mut Self {
        self.emit(&[0x48, 0x89, 0xe5]);
        if scratch > 0 {
            self.emit(&[0x48, 0x83, 0xec, scratch]);
        }
        self.emit(&[0x48, 0x83, 0xe4, 0xf0])
    }

    /// call [rip+slot]
    fn call(&mut self, routine: Routine) -> &mut Self {
        self.emit(&[0xff, 0x15]);
        self.calls.push((self.code.len(), routine));
        self.emit(&[0; 4])
    }

    fn mov_edi(&mut self, value: u32) -> &mut Self {
        match value {
            0 => self.emit(&[0x31, 0xff]),
            _ => self.emit(&[0xbf]).emit(&value.to_le_bytes()),
        }
    }

    fn mov_esi(&mut self, value: u32) -> &mut Self {
        match value {
            0 => self.emit(&[0x31, 0xf6]),
            _ => self.emit(&[0xbe]).emit(&value.to_le_bytes()),
        }
    }

    fn mov_edx(&mut self, value: u32) -> &mut Self {
        match value {
            0 => self.emit(&[0x31, 0xd2]),
            _ => self.emit(&[0xba]).emit(&value.to_le_bytes()),
        }
    }

    /// xor eax, eax (no vector registers used by a variadic call)
    fn clear_eax(&mut self) -> &mut Self {
        self.emit(&[0x31, 0xc0])
    }

    /// mov edi, eax
    fn edi_from_eax(&mut self) -> &mut Self {
        self.emit(&[0x89, 0xc7])
    }

    /// mov r1Xd, eax
    fn save_eax(&mut self, reg: Saved) -> &mut Self {
        self.emit(&[0x41, 0x89, 0xc0 | reg as u8])
    }

    /// mov edi, r1Xd
    fn edi_from(&mut self, reg: Saved) -> &mut Self {
        self.emit(&[0x44, 0x89, 0xc7 | (reg as u8) << 3])
    }

    /// mov edi, dword [rbp + 8 * slot]
    fn edi_from_arg(&mut self, slot: u8) -> &mut Self {
        self.emit(&[0x8b, 0x7d, slot * WORD_SIZE as u8])
    }

    /// mov rdi, [rbp + 8 * slot]
    fn rdi_from_arg(&mut self, slot: u8) -> &mut Self {
        self.emit(&[0x48, 0x8b, 0x7d, slot * WORD_SIZE as u8])
    }

    /// mov [rbp - 8 * (slot + 1)], r1X
    fn store_output(&mut self, reg: Saved, slot: u8) -> &mut Self {
        let disp = (-(WORD_SIZE as i8) * (slot as i8 + 1)) as u8;
        self.emit(&[0x4c, 0x89, 0x45 | (reg as u8) << 3, disp])
    }

    /// test edi, edi
    fn test_edi(&mut self) -> &mut Self {
        self.emit(&[0x85, 0xff])
    }

    /// test r15d, r15d
    fn test_r15d(&mut self) -> &mut Self {
        self.emit(&[0x45, 0x85, 0xff])
    }

    /// cmp r15d, imm8
    fn compare_r15d(&mut self, value: i8) -> &mut Self {
        self.emit(&[0x41, 0x83, 0xff, value as u8])
    }

    /// jle rel8
    fn jump_if_at_most(&mut self) -> Label {
        self.emit(&[0x7e, 0]);
        Label(self.code.len() - 1)
    }

    /// js rel8
    fn jump_if_negative(&mut self) -> Label {
        self.emit(&[0x78, 0]);
        Label(self.code.len() - 1)
    }

    /// jmp rel8
    fn jump(&mut self) -> Label {
        self.emit(&[0xeb, 0]);
        Label(self.code.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        let distance = self.code.len() - (label.0 + 1);
        debug_assert!(distance <= i8::MAX as usize);
        self.code[label.0] = distance as u8;
    }

    /// kill(getpid(), RENDEZVOUS_SIGNAL)
    fn raise_rendezvous(&mut self) -> &mut Self {
        self.call(Routine::Getpid)
            .edi_from_eax()
            .mov_esi(RENDEZVOUS_SIGNAL as u32)
            .call(Routine::Kill)
    }

    /// mov rsp, rbp; add rsp, <resume skip>; ret
    fn epilogue(&mut self) -> &mut Self {
        self.emit(&[0x48, 0x89, 0xec, 0x48, 0x81, 0xc4]);
        self.resume = Some(self.code.len());
        self.emit(&[0; 4]).emit(&[0xc3, 0xcc])
    }

    fn finish(mut self) -> Template {
        while self.code.len() % WORD_SIZE != 0 {
            self.code.push(0xcc);
        }

        let mut patches = Vec::new();
        let mut slots: Vec<(Routine, usize)> = Vec::new();
        for (_, routine) in &self.calls {
            if !slots.iter().any(|(known, _)| known == routine) {
                let offset = self.code.len();
                self.code.extend_from_slice(&[0; WORD_SIZE]);
                slots.push((*routine, offset));
                patches.push(Patch { offset, kind: PatchKind::Routine(*routine) });
            }
        }

        for (site, routine) in &self.calls {
            let slot = slots
                .iter()
                .find(|(known, _)| known == routine)
                .map(|(_, offset)| *offset)
                .unwrap_or_default();
            let displacement = slot as i32 - (*site as i32 + 4);
            self.code[*site..*site + 4].copy_from_slice(&displacement.to_le_bytes());
        }

        if let Some(offset) = self.resume {
            patches.push(Patch { offset, kind: PatchKind::ResumeSkip });
        }

        Template { code: self.code, patches }
    }
}

/// Program that moves stdin, stdout and stderr onto the terminal whose path
/// is addressed by its single argument word.
pub fn attach_template() -> Template {
    let mut asm = Assembler::new();
    asm.prologue((ATTACH_OUTPUT_WORDS * WORD_SIZE) as u8);

    // Copies go to descriptor 3 or above so that a closed stream cannot
    // hand its number to another stream's copy.
    for (fd, reg) in [(0, Saved::R12), (1, Saved::R13), (2, Saved::R14)] {
        asm.mov_edi(fd)
            .mov_esi(libc::F_DUPFD as u32)
            .mov_edx(3)
            .clear_eax()
            .call(Routine::Fcntl)
            .save_eax(reg);
    }

    asm.rdi_from_arg(0)
        .mov_esi(libc::O_RDWR as u32)
        .clear_eax()
        .call(Routine::Open)
        .save_eax(Saved::R15);

    for (slot, reg) in [Saved::R12, Saved::R13, Saved::R14, Saved::R15].into_iter().enumerate() {
        asm.store_output(reg, slot as u8);
    }

    asm.test_r15d();
    let failed = asm.jump_if_negative();
    for fd in 0..3 {
        asm.edi_from(Saved::R15).mov_esi(fd).call(Routine::Dup2);
    }
    // With a standard stream closed, open() may return 0, 1 or 2 itself.
    asm.compare_r15d(2);
    let standard = asm.jump_if_at_most();
    asm.edi_from(Saved::R15).call(Routine::Close);
    asm.bind(standard);
    asm.bind(failed);

    asm.raise_rendezvous().epilogue();
    asm.finish()
}

/// Program that moves the descriptors in its three argument words (stdin,
/// stdout, stderr from low to high address) back onto 0, 1 and 2 and closes
/// them. A negative saved descriptor means the stream was closed before
/// attaching, so it is closed again.
pub fn detach_template() -> Template {
    let mut asm = Assembler::new();
    asm.prologue(0);

    for fd in 0..3u8 {
        asm.edi_from_arg(fd).test_edi();
        let closed = asm.jump_if_negative();
        asm.mov_esi(fd as u32).call(Routine::Dup2);
        asm.edi_from_arg(fd).call(Routine::Close);
        let done = asm.jump();
        asm.bind(closed);
        asm.mov_edi(fd as u32).call(Routine::Close);
        asm.bind(done);
    }

    asm.raise_rendezvous().epilogue();
    asm.finish()
}

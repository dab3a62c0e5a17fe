//! Running a [`Template`] inside a stopped tracee.
//!
//! The engine reserves space below the tracee's red zone, writes the payload,
//! the patched code and the resume address there, points the instruction
//! pointer at the code, and lets the tracee run until the code raises
//! [`RENDEZVOUS_SIGNAL`]. Registers, and any executable memory it borrowed,
//! are restored before the tracee is released.

use crate::arch::{align_down, align_up, words_for, UserRegs, RED_ZONE, STACK_ALIGN, WORD_SIZE};
use crate::blob::{Template, ENTRY_SKIP, RENDEZVOUS_SIGNAL};
use crate::maps::{self, MapRecord};
use crate::memory::{bytes_to_words, MemoryAccessor};
use crate::resolver::ResolvedRoutines;
use crate::{ProcessFrame, ProcessIdentifier, ReattachError, ReattachResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum InjectionSite {
    /// `stack` if the tracee's stack is executable, `text` otherwise.
    #[default]
    Auto,
    /// Below the stack pointer; nothing live is overwritten.
    Stack,
    /// Over the start of the main executable's code, restored afterwards.
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Stack,
    Text { start: usize, end: usize },
}

impl InjectionSite {
    /// Decide where to put the code, given the tracee's mapping list and the
    /// path of its main executable.
    pub fn place(self, records: &[MapRecord], executable: Option<&str>) -> ReattachResult<Placement> {
        let stack_executable = records
            .iter()
            .any(|record| record.name.as_deref() == Some("[stack]") && record.is_executable());

        let site = match self {
            InjectionSite::Auto if stack_executable => InjectionSite::Stack,
            InjectionSite::Auto => InjectionSite::Text,
            other => other,
        };

        match site {
            InjectionSite::Text => {
                let record = main_text(records, executable).ok_or_else(|| {
                    ReattachError::InjectionFailure("no executable mapping of the main program".into())
                })?;
                Ok(Placement::Text { start: record.start, end: record.end })
            }
            _ => {
                if !stack_executable {
                    tracing::warn!("Injecting on a non-executable stack; the target will likely fault");
                }
                Ok(Placement::Stack)
            }
        }
    }
}

fn main_text<'a>(records: &'a [MapRecord], executable: Option<&str>) -> Option<&'a MapRecord> {
    let name = executable.or_else(|| {
        records
            .iter()
            .find_map(|record| record.name.as_deref().filter(|name| !name.starts_with('[')))
    })?;
    records
        .iter()
        .find(|record| record.name.as_deref() == Some(name) && record.is_executable())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argument {
    Word(u64),
    /// Address at which the payload was written.
    PayloadAddress,
}

#[derive(Debug, Clone)]
pub struct InjectionSpec {
    pub template: Template,
    /// Bytes written above the argument words.
    pub payload: Vec<u8>,
    /// Words at the stack pointer the code starts with, lowest address first.
    pub arguments: Vec<Argument>,
    /// Words the code leaves directly below its arguments.
    pub outputs: usize,
}

/// Addresses chosen for one injection.
///
/// From high to low: the return slot holding the interrupted instruction
/// pointer, the code (for [`Placement::Stack`]), the payload, the arguments,
/// and the output words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub placement: Placement,
    pub return_slot: usize,
    pub code_addr: usize,
    pub code_len: usize,
    pub payload_addr: usize,
    pub arg_addr: usize,
    pub output_addr: usize,
}

impl Layout {
    pub fn plan(
        spec: &InjectionSpec,
        placement: Placement,
        stack_pointer: usize,
        program_counter: usize,
    ) -> ReattachResult<Self> {
        let too_low = || ReattachError::InjectionFailure(format!("stack pointer {stack_pointer:#x} too low"));

        let top = align_down(stack_pointer.checked_sub(RED_ZONE).ok_or_else(too_low)?, STACK_ALIGN);
        let return_slot = top.checked_sub(WORD_SIZE).ok_or_else(too_low)?;
        let code_len = align_up(spec.template.len(), WORD_SIZE);

        let (code_addr, below_code) = match placement {
            Placement::Stack => {
                let code_addr = return_slot.checked_sub(code_len).ok_or_else(too_low)?;
                (code_addr, code_addr)
            }
            Placement::Text { start, end } => {
                let mut code_addr = start;
                if (code_addr..code_addr + code_len).contains(&program_counter) {
                    code_addr = align_up(program_counter + 1, WORD_SIZE);
                }
                if code_addr + code_len > end {
                    return Err(ReattachError::InjectionFailure(format!(
                        "{code_len} bytes of code do not fit in {start:#x}-{end:#x}"
                    )));
                }
                (code_addr, return_slot)
            }
        };

        let payload_addr = below_code
            .checked_sub(align_up(spec.payload.len(), WORD_SIZE))
            .ok_or_else(too_low)?;
        let arg_addr = payload_addr
            .checked_sub(spec.arguments.len() * WORD_SIZE)
            .ok_or_else(too_low)?;
        let output_addr = arg_addr.checked_sub(spec.outputs * WORD_SIZE).ok_or_else(too_low)?;

        Ok(Layout { placement, return_slot, code_addr, code_len, payload_addr, arg_addr, output_addr })
    }

    /// Where execution starts.
    pub fn entry(&self) -> usize {
        self.code_addr + ENTRY_SKIP
    }

    /// Distance the code adds to the argument pointer to reach the return slot.
    pub fn resume_skip(&self) -> u32 {
        (self.return_slot - self.arg_addr) as u32
    }

    pub fn argument_words(&self, spec: &InjectionSpec) -> Vec<u64> {
        spec.arguments
            .iter()
            .map(|argument| match argument {
                Argument::Word(word) => *word,
                Argument::PayloadAddress => self.payload_addr as u64,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub addr: usize,
    pub words: Vec<u64>,
}

impl Backup {
    pub fn take(memory: &mut impl MemoryAccessor, addr: usize, len: usize) -> ReattachResult<Self> {
        let words = memory.read_words(addr, words_for(len))?;
        tracing::debug!("Backed up {} words at {addr:#x}", words.len());
        Ok(Self { addr, words })
    }

    pub fn restore(&self, memory: &mut impl MemoryAccessor) -> ReattachResult<()> {
        memory.write_words(self.addr, &self.words)
    }
}

/// Write the payload, the code, the resume address and the arguments.
///
/// Returns the backup of overwritten code for [`Placement::Text`]. If any write
/// after the backup fails, the backup is put back before the error is returned.
pub fn stage(
    memory: &mut impl MemoryAccessor,
    spec: &InjectionSpec,
    layout: &Layout,
    code: &[u8],
    resume_at: usize,
) -> ReattachResult<Option<Backup>> {
    if !spec.payload.is_empty() {
        memory.write_words(layout.payload_addr, &bytes_to_words(&spec.payload))?;
    }

    let backup = match layout.placement {
        Placement::Text { .. } => Some(Backup::take(memory, layout.code_addr, code.len())?),
        Placement::Stack => None,
    };

    let written = memory
        .write_words(layout.code_addr, &bytes_to_words(code))
        .and_then(|()| memory.write_words(layout.return_slot, &[resume_at as u64]))
        .and_then(|()| memory.write_words(layout.arg_addr, &layout.argument_words(spec)));
    if let Err(err) = written {
        if let Some(backup) = &backup {
            if let Err(restore) = backup.restore(memory) {
                tracing::error!("Could not restore code at {:#x}: {restore}", backup.addr);
            }
        }
        return Err(err);
    }
    tracing::trace!(
        "Staged code at {:#x}, payload at {:#x}, arguments at {:#x}",
        layout.code_addr,
        layout.payload_addr,
        layout.arg_addr
    );
    Ok(backup)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Keep the tracee stopped and traced.
    StayAttached,
    /// Detach, delivering [`RENDEZVOUS_SIGNAL`] so the tracee re-reads its
    /// window size.
    Release,
}

pub struct Injected<T>
where
    T: ProcessIdentifier,
{
    /// Output words, lowest address first.
    pub outputs: Vec<u64>,
    /// The still-stopped tracee, for [`Continuation::StayAttached`].
    pub frame: Option<ProcessFrame<T>>,
}

pub struct InjectionEngine {
    routines: ResolvedRoutines,
    site: InjectionSite,
}

impl InjectionEngine {
    pub fn new(routines: ResolvedRoutines, site: InjectionSite) -> Self {
        Self { routines, site }
    }

    pub fn inject<T>(
        &self,
        mut frame: ProcessFrame<T>,
        spec: &InjectionSpec,
        continuation: Continuation,
    ) -> ReattachResult<Injected<T>>
    where
        T: ProcessIdentifier,
    {
        let pid = frame.pid();
        let saved = frame.query_registers()?;

        let records = maps::read_records(pid)?;
        let executable = std::fs::read_link(format!("/proc/{pid}/exe")).ok();
        let executable = executable.as_ref().and_then(|path| path.to_str());
        let placement = self.site.place(&records, executable)?;

        let layout = Layout::plan(spec, placement, saved.stack_pointer(), saved.program_counter())?;
        let code = spec.template.patch(&self.routines, layout.resume_skip())?;
        tracing::debug!("Injecting {} bytes into pid {pid}: {layout:x?}", code.len());

        let backup = stage(&mut frame, spec, &layout, &code, saved.program_counter())
            .map_err(|err| ReattachError::InjectionFailure(err.to_string()))?;

        let (run, restored) = execute(&mut frame, &saved, &layout, spec.outputs, backup.as_ref());
        if let Err(err) = restored {
            tracing::error!("Could not undo injection in pid {pid}, leaving it stopped: {err}");
            frame.abandon();
            return Err(run.err().unwrap_or(err));
        }
        let outputs = run?;
        tracing::debug!("Injected code finished in pid {pid}");

        let frame = match continuation {
            Continuation::StayAttached => Some(frame),
            Continuation::Release => {
                frame.detach(RENDEZVOUS_SIGNAL)?;
                None
            }
        };
        Ok(Injected { outputs, frame })
    }
}

pub trait Tracee: MemoryAccessor {
    fn set_registers(&mut self, registers: &UserRegs) -> ReattachResult<()>;

    /// Resume until the injected code signals completion.
    fn await_rendezvous(&mut self) -> ReattachResult<()>;
}

impl<T> Tracee for ProcessFrame<T>
where
    T: ProcessIdentifier,
{
    fn set_registers(&mut self, registers: &UserRegs) -> ReattachResult<()> {
        ProcessFrame::set_registers(self, registers)
    }

    fn await_rendezvous(&mut self) -> ReattachResult<()> {
        rendezvous(self)
    }
}

/// Run staged code and read its outputs, then put `saved` and `backup` back
/// whether or not the run succeeded.
///
/// Returns the outcome of the run and of the restore separately.
pub fn execute<S>(
    tracee: &mut S,
    saved: &UserRegs,
    layout: &Layout,
    outputs: usize,
    backup: Option<&Backup>,
) -> (ReattachResult<Vec<u64>>, ReattachResult<()>)
where
    S: Tracee,
{
    let run = tracee
        .set_registers(&saved.redirected(layout.entry(), layout.arg_addr))
        .and_then(|()| tracee.await_rendezvous())
        .and_then(|()| tracee.read_words(layout.output_addr, outputs));
    if let Err(err) = &run {
        tracing::warn!("Injected code did not complete: {err}");
    }
    let restored = restore(tracee, saved, backup);
    (run, restored)
}

/// Resume the tracee until the injected code signals completion. The first
/// resume delivers `SIGSTOP` so that a blocking call is interrupted.
fn rendezvous<T>(frame: &mut ProcessFrame<T>) -> ReattachResult<()>
where
    T: ProcessIdentifier,
{
    let mut signal = libc::SIGSTOP;
    loop {
        let stop = frame.cont_and_wait(signal)?;
        signal = 0;
        if stop == RENDEZVOUS_SIGNAL {
            return Ok(());
        }
        tracing::warn!("Ignoring stop with signal {stop} while waiting for injected code");
    }
}

fn restore<S>(tracee: &mut S, saved: &UserRegs, backup: Option<&Backup>) -> ReattachResult<()>
where
    S: Tracee,
{
    let registers = tracee.set_registers(saved);
    if let Some(backup) = backup {
        backup.restore(tracee)?;
        tracing::debug!("Restored {} words at {:#x}", backup.words.len(), backup.addr);
    }
    registers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::attach_template;
    use crate::memory::fake::FakeMemory;
    use crate::memory::words_to_bytes;

    const SAMPLE: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 fd:01 1835  /usr/bin/sleep
55d0c0a02000-55d0c0a06000 r-xp 00002000 fd:01 1835  /usr/bin/sleep
7f1e3c028000-7f1e3c1bd000 r-xp 00028000 fd:01 2490  /usr/lib/x86_64-linux-gnu/libc.so.6
7ffd6d7b1000-7ffd6d7d2000 rw-p 00000000 00:00 0     [stack]
";

    #[derive(Default)]
    struct FakeTracee {
        memory: FakeMemory,
        registers: Vec<UserRegs>,
        dies: bool,
    }

    impl MemoryAccessor for FakeTracee {
        fn read_words(&mut self, addr: usize, count: usize) -> ReattachResult<Vec<u64>> {
            self.memory.read_words(addr, count)
        }

        fn write_words(&mut self, addr: usize, words: &[u64]) -> ReattachResult<()> {
            self.memory.write_words(addr, words)
        }
    }

    impl Tracee for FakeTracee {
        fn set_registers(&mut self, registers: &UserRegs) -> ReattachResult<()> {
            self.registers.push(*registers);
            Ok(())
        }

        fn await_rendezvous(&mut self) -> ReattachResult<()> {
            match self.dies {
                true => Err(ReattachError::Rendezvous("tracee vanished".into())),
                false => Ok(()),
            }
        }
    }

    fn stopped_at(pc: u64, sp: u64) -> UserRegs {
        UserRegs { rip: pc, rsp: sp, ..unsafe { std::mem::zeroed() } }
    }

    fn text_words(memory: &mut FakeMemory, len: usize) {
        for i in 0..words_for(len) {
            memory.words.insert(0x1000 + i * WORD_SIZE, 0xdead_0000 + i as u64);
        }
    }

    fn spec() -> InjectionSpec {
        InjectionSpec {
            template: attach_template(),
            payload: b"/dev/pts/7\0".to_vec(),
            arguments: vec![Argument::PayloadAddress],
            outputs: 4,
        }
    }

    #[test]
    fn auto_prefers_an_executable_stack() {
        let records = maps::parse_records(SAMPLE).unwrap();
        assert_eq!(
            InjectionSite::Auto.place(&records, None).unwrap(),
            Placement::Text { start: 0x55d0c0a02000, end: 0x55d0c0a06000 }
        );

        let executable = SAMPLE.replace("rw-p 00000000 00:00 0     [stack]", "rwxp 00000000 00:00 0     [stack]");
        let records = maps::parse_records(&executable).unwrap();
        assert_eq!(InjectionSite::Auto.place(&records, None).unwrap(), Placement::Stack);
    }

    #[test]
    fn text_site_uses_the_named_executable() {
        let records = maps::parse_records(SAMPLE).unwrap();
        let placement = InjectionSite::Text
            .place(&records, Some("/usr/lib/x86_64-linux-gnu/libc.so.6"))
            .unwrap();
        assert_eq!(placement, Placement::Text { start: 0x7f1e3c028000, end: 0x7f1e3c1bd000 });

        let err = InjectionSite::Text.place(&records, Some("/bin/other")).unwrap_err();
        assert!(matches!(err, ReattachError::InjectionFailure(_)));
    }

    #[test]
    fn stack_layout_stays_out_of_the_red_zone() {
        let spec = spec();
        let rsp = 0x7ffd_6d7d_0f38;
        let layout = Layout::plan(&spec, Placement::Stack, rsp, 0x55d0_c0a0_3000).unwrap();

        assert_eq!(layout.return_slot, 0x7ffd_6d7d_0eb0 - 8);
        assert!(layout.return_slot + WORD_SIZE <= rsp - RED_ZONE);
        assert_eq!(layout.code_addr + spec.template.len(), layout.return_slot);
        assert_eq!(layout.payload_addr + 16, layout.code_addr);
        assert_eq!(layout.arg_addr + 8, layout.payload_addr);
        assert_eq!(layout.output_addr + 32, layout.arg_addr);
        assert_eq!(layout.entry(), layout.code_addr + ENTRY_SKIP);
        assert_eq!(layout.arg_addr + layout.resume_skip() as usize, layout.return_slot);
        assert_eq!(layout.argument_words(&spec), vec![layout.payload_addr as u64]);
    }

    #[test]
    fn text_layout_moves_past_the_instruction_pointer() {
        let spec = spec();
        let placement = Placement::Text { start: 0x1000, end: 0x2000 };

        let clear = Layout::plan(&spec, placement, 0x8000, 0x1800).unwrap();
        assert_eq!(clear.code_addr, 0x1000);
        assert_eq!(clear.payload_addr + 16, clear.return_slot);

        let overlapping = Layout::plan(&spec, placement, 0x8000, 0x1013).unwrap();
        assert_eq!(overlapping.code_addr, 0x1018);

        let cramped = Placement::Text { start: 0x1000, end: 0x1010 };
        assert!(Layout::plan(&spec, cramped, 0x8000, 0x1800).is_err());
    }

    #[test]
    fn tiny_stack_pointer_is_rejected() {
        let err = Layout::plan(&spec(), Placement::Stack, 0x40, 0).unwrap_err();
        assert!(matches!(err, ReattachError::InjectionFailure(_)));
    }

    #[test]
    fn stage_on_stack_writes_everything_below_the_return_slot() {
        let spec = spec();
        let layout = Layout::plan(&spec, Placement::Stack, 0x7fff_0000, 0x4010).unwrap();
        let code = vec![0x90; spec.template.len()];
        let mut memory = FakeMemory::default();

        let backup = stage(&mut memory, &spec, &layout, &code, 0x4010).unwrap();

        assert!(backup.is_none());
        assert_eq!(memory.words[&layout.return_slot], 0x4010);
        assert_eq!(memory.words[&layout.arg_addr], layout.payload_addr as u64);
        let payload = memory.read_words(layout.payload_addr, 2).unwrap();
        assert_eq!(&words_to_bytes(&payload)[..11], b"/dev/pts/7\0");
        assert_eq!(memory.words[&layout.code_addr], u64::from_le_bytes([0x90; 8]));
        assert!(memory.words.keys().all(|addr| *addr < 0x7fff_0000 - RED_ZONE));
    }

    #[test]
    fn stage_on_text_backs_up_and_restores() {
        let spec = spec();
        let layout = Layout::plan(&spec, Placement::Text { start: 0x1000, end: 0x2000 }, 0x8000, 0x1800).unwrap();
        let mut memory = FakeMemory::default();
        for i in 0..words_for(spec.template.len()) {
            memory.words.insert(0x1000 + i * WORD_SIZE, 0xdead_0000 + i as u64);
        }
        let original = memory.words.clone();

        let code = vec![0xcc; spec.template.len()];
        let backup = stage(&mut memory, &spec, &layout, &code, 0x1800).unwrap().unwrap();
        assert_eq!(backup.addr, 0x1000);
        assert_eq!(memory.words[&0x1000], u64::from_le_bytes([0xcc; 8]));

        backup.restore(&mut memory).unwrap();
        for (addr, word) in original {
            assert_eq!(memory.words[&addr], word);
        }
    }

    #[test]
    fn failed_code_write_puts_text_back() {
        let spec = spec();
        let layout = Layout::plan(&spec, Placement::Text { start: 0x1000, end: 0x2000 }, 0x8000, 0x1800).unwrap();
        let mut memory = FakeMemory { fail_at: Some(0x1010), ..Default::default() };
        memory.words.insert(0x1000, 7);
        memory.words.insert(0x1008, 8);

        let code = vec![0xcc; spec.template.len()];
        let err = stage(&mut memory, &spec, &layout, &code, 0x1800).unwrap_err();

        assert!(matches!(err, ReattachError::MemoryAccess { addr: 0x1010, .. }));
        assert_eq!(memory.words[&0x1000], 7);
        assert_eq!(memory.words[&0x1008], 8);
    }

    #[test]
    fn failed_argument_write_puts_text_back() {
        let spec = spec();
        let layout = Layout::plan(&spec, Placement::Text { start: 0x1000, end: 0x2000 }, 0x8000, 0x1800).unwrap();
        let mut memory = FakeMemory { fail_at: Some(layout.arg_addr), ..Default::default() };
        text_words(&mut memory, spec.template.len());
        let original: Vec<(usize, u64)> = memory.words.iter().map(|(a, w)| (*a, *w)).collect();

        let code = vec![0xcc; spec.template.len()];
        let err = stage(&mut memory, &spec, &layout, &code, 0x1800).unwrap_err();

        assert!(matches!(err, ReattachError::MemoryAccess { addr, .. } if addr == layout.arg_addr));
        for (addr, word) in original {
            assert_eq!(memory.words[&addr], word);
        }
    }

    #[test]
    fn completed_run_reads_outputs_and_restores_registers() {
        let spec = spec();
        let saved = stopped_at(0x1800, 0x8000);
        let layout = Layout::plan(&spec, Placement::Stack, 0x8000, 0x1800).unwrap();
        let mut tracee = FakeTracee::default();
        for (i, word) in [5u64, 4, 3, 2].into_iter().enumerate() {
            tracee.memory.words.insert(layout.output_addr + i * WORD_SIZE, word);
        }

        let (run, restored) = execute(&mut tracee, &saved, &layout, spec.outputs, None);

        assert_eq!(run.unwrap(), vec![5, 4, 3, 2]);
        restored.unwrap();
        assert_eq!(tracee.registers, vec![saved.redirected(layout.entry(), layout.arg_addr), saved]);
    }

    #[test]
    fn failed_run_still_restores_registers_and_text() {
        let spec = spec();
        let saved = stopped_at(0x1800, 0x8000);
        let layout = Layout::plan(&spec, Placement::Text { start: 0x1000, end: 0x2000 }, 0x8000, 0x1800).unwrap();
        let mut tracee = FakeTracee { dies: true, ..Default::default() };
        text_words(&mut tracee.memory, spec.template.len());
        let original: Vec<(usize, u64)> = tracee.memory.words.iter().map(|(a, w)| (*a, *w)).collect();

        let code = vec![0xcc; spec.template.len()];
        let backup = stage(&mut tracee.memory, &spec, &layout, &code, 0x1800).unwrap();
        assert_eq!(tracee.memory.words[&0x1000], u64::from_le_bytes([0xcc; 8]));

        let (run, restored) = execute(&mut tracee, &saved, &layout, spec.outputs, backup.as_ref());

        assert!(matches!(run, Err(ReattachError::Rendezvous(_))));
        restored.unwrap();
        assert_eq!(tracee.registers.last(), Some(&saved));
        for (addr, word) in original {
            assert_eq!(tracee.memory.words[&addr], word);
        }
    }
}

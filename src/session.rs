//! The lifecycle of one reattachment: swap the target's standard streams onto
//! a new terminal, and later swap them back exactly once.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::pid_t;

use crate::blob::{self, ATTACH_OUTPUT_WORDS, RENDEZVOUS_SIGNAL};
use crate::inject::{Argument, Continuation, InjectionEngine, InjectionSite, InjectionSpec};
use crate::resolver::{ModulePredicate, SymbolResolver};
use crate::{RawProcess, ReattachError, ReattachResult, TracedProcess};

/// The target's standard streams as they were before attaching, as
/// descriptor numbers in the target. Negative means the stream was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedDescriptors {
    pub stdin: i32,
    pub stdout: i32,
    pub stderr: i32,
}

impl SavedDescriptors {
    /// Decode the attach program's output words (lowest address first):
    /// the opened terminal descriptor, then the stderr, stdout and stdin copies.
    pub fn from_outputs(words: &[u64]) -> ReattachResult<(i32, Self)> {
        match words {
            [opened, stderr, stdout, stdin] => Ok((
                *opened as u32 as i32,
                SavedDescriptors {
                    stdin: *stdin as u32 as i32,
                    stdout: *stdout as u32 as i32,
                    stderr: *stderr as u32 as i32,
                },
            )),
            _ => Err(ReattachError::InjectionFailure(format!(
                "expected {ATTACH_OUTPUT_WORDS} output words, got {}",
                words.len()
            ))),
        }
    }
}

pub fn attach_spec(slave: &Path) -> ReattachResult<InjectionSpec> {
    let path = CString::new(slave.as_os_str().as_bytes())
        .map_err(|_| ReattachError::InjectionFailure(format!("{} contains a NUL byte", slave.display())))?;
    Ok(InjectionSpec {
        template: blob::attach_template(),
        payload: path.into_bytes_with_nul(),
        arguments: vec![Argument::PayloadAddress],
        outputs: ATTACH_OUTPUT_WORDS,
    })
}

pub fn detach_spec(saved: SavedDescriptors) -> InjectionSpec {
    InjectionSpec {
        template: blob::detach_template(),
        payload: Vec::new(),
        arguments: [saved.stdin, saved.stdout, saved.stderr]
            .into_iter()
            .map(|fd| Argument::Word(fd as i64 as u64))
            .collect(),
        outputs: 0,
    }
}

/// Performs the two descriptor swaps inside a target.
pub trait FdSwapper {
    /// Move the target's standard streams onto the terminal at `slave`,
    /// returning what they were.
    fn swap_in(&mut self, pid: pid_t, slave: &Path) -> ReattachResult<SavedDescriptors>;

    /// Put back the streams captured by [`FdSwapper::swap_in`].
    fn swap_out(&mut self, pid: pid_t, saved: SavedDescriptors) -> ReattachResult<()>;
}

pub struct InjectingSwapper {
    engine: InjectionEngine,
}

impl InjectingSwapper {
    /// Resolve every routine either program needs inside `pid`.
    pub fn new<P>(pid: pid_t, resolver: &SymbolResolver<P>, site: InjectionSite) -> ReattachResult<Self>
    where
        P: ModulePredicate,
    {
        let mut routines = blob::attach_template().routines();
        for routine in blob::detach_template().routines() {
            if !routines.contains(&routine) {
                routines.push(routine);
            }
        }
        let routines = resolver.resolve(pid, &routines)?;
        Ok(Self { engine: InjectionEngine::new(routines, site) })
    }
}

impl FdSwapper for InjectingSwapper {
    fn swap_in(&mut self, pid: pid_t, slave: &Path) -> ReattachResult<SavedDescriptors> {
        let spec = attach_spec(slave)?;
        let frame = TracedProcess::attach(RawProcess::new(pid))?.next_frame()?;

        let injected = self.engine.inject(frame, &spec, Continuation::StayAttached)?;
        let frame = injected
            .frame
            .ok_or(ReattachError::InvalidState("tracee released after attach injection"))?;
        let (opened, saved) = SavedDescriptors::from_outputs(&injected.outputs)?;
        tracing::debug!("Pid {pid} opened {} as fd {opened}, saved {saved:?}", slave.display());

        if opened < 0 {
            // Nothing was redirected; only the copies need closing.
            self.engine.inject(frame, &detach_spec(saved), Continuation::Release)?;
            return Err(ReattachError::InjectionFailure(format!(
                "target could not open {}",
                slave.display()
            )));
        }

        frame.detach(RENDEZVOUS_SIGNAL)?;
        Ok(saved)
    }

    fn swap_out(&mut self, pid: pid_t, saved: SavedDescriptors) -> ReattachResult<()> {
        let frame = TracedProcess::attach(RawProcess::new(pid))?.next_frame()?;
        self.engine.inject(frame, &detach_spec(saved), Continuation::Release)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    /// A swap-in is in progress.
    Attached,
    /// The target runs on the new terminal.
    Running(SavedDescriptors),
    /// The original streams are back; the session is over.
    Released,
}

/// One target, one terminal, at most one outstanding detach.
pub struct Session<S>
where
    S: FdSwapper,
{
    pid: pid_t,
    swapper: S,
    state: SessionState,
    attaches: u64,
    detaches: u64,
}

impl<S> Session<S>
where
    S: FdSwapper,
{
    pub fn new(pid: pid_t, swapper: S) -> Self {
        Self { pid, swapper, state: SessionState::Detached, attaches: 0, detaches: 0 }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attach(&mut self, slave: &Path) -> ReattachResult<SavedDescriptors> {
        if self.state != SessionState::Detached {
            return Err(ReattachError::InvalidState("session already attached"));
        }

        self.state = SessionState::Attached;
        match self.swapper.swap_in(self.pid, slave) {
            Ok(saved) => {
                self.attaches += 1;
                self.state = SessionState::Running(saved);
                tracing::info!("Pid {} now uses {}", self.pid, slave.display());
                Ok(saved)
            }
            Err(err) => {
                self.state = SessionState::Detached;
                Err(err)
            }
        }
    }

    /// Put the target's streams back. Returns `false` when there is nothing
    /// to undo, including every call after the first.
    pub fn detach(&mut self) -> ReattachResult<bool> {
        let saved = match self.state {
            SessionState::Running(saved) if self.detaches < self.attaches => saved,
            _ => {
                tracing::debug!("Detach requested with nothing to undo");
                return Ok(false);
            }
        };

        self.detaches += 1;
        self.state = SessionState::Released;
        self.swapper.swap_out(self.pid, saved)?;
        tracing::info!("Pid {} is back on its original streams", self.pid);
        Ok(true)
    }
}

pub mod arch;
pub mod blob;
pub mod config;
pub mod elf;
pub mod escape;
pub mod forward;
pub mod inject;
pub mod maps;
pub mod memory;
pub mod pty;
pub mod resolver;
pub mod session;

use arch::UserRegs;

use libc::{pid_t, ptrace, PTRACE_ATTACH, PTRACE_CONT, PTRACE_DETACH};
use std::{mem, process::Child};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReattachError {
    #[error("cannot attach to pid {pid}: {source}")]
    Attach { pid: pid_t, source: std::io::Error },

    #[error("Ptrace error: `{0}`")]
    Ptrace(std::io::Error),

    #[error("cannot access target memory at {addr:#x}: {source}")]
    MemoryAccess { addr: usize, source: std::io::Error },

    #[error("cannot parse memory map: {0}")]
    MapParse(String),

    #[error("no mapped module matches {0}")]
    ModuleNotFound(String),

    #[error("symbol `{0}` is not defined by the runtime module")]
    SymbolNotFound(String),

    #[error("malformed ELF image: {0}")]
    MalformedImage(String),

    #[error("injection failed: {0}")]
    InjectionFailure(String),

    #[error("target did not complete the injected code: {0}")]
    Rendezvous(String),

    #[error("local terminal I/O failed: {0}")]
    LocalIo(#[source] std::io::Error),

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("IO Error: `{0}`")]
    Io(#[from] std::io::Error),
}

impl ReattachError {
    /// Whether the error must abort the program instead of falling through to
    /// the detach path.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReattachError::LocalIo(_))
    }
}

pub type ReattachResult<T> = Result<T, ReattachError>;

fn last_ptrace_error() -> ReattachError {
    ReattachError::Ptrace(std::io::Error::last_os_error())
}

pub trait ProcessIdentifier {
    fn pid(&self) -> pid_t;
}

pub struct RawProcess {
    pid: pid_t,
}

impl ProcessIdentifier for RawProcess {
    fn pid(&self) -> pid_t {
        self.pid
    }
}

impl RawProcess {
    pub fn new(pid: pid_t) -> Self {
        Self { pid }
    }
}

pub struct OwnedProcess {
    child: Child,
}

impl From<Child> for OwnedProcess {
    fn from(value: Child) -> Self {
        Self { child: value }
    }
}

impl Drop for OwnedProcess {
    fn drop(&mut self) {
        match self.child.kill() {
            Ok(()) => {
                let _ = self.child.wait();
                tracing::debug!("Reaped owned pid {}", self.child.id());
            }
            Err(e) => tracing::error!("Could not kill owned pid {}: {e}", self.child.id()),
        }
    }
}

impl ProcessIdentifier for OwnedProcess {
    fn pid(&self) -> pid_t {
        self.child.id() as pid_t
    }
}

impl<T> ProcessIdentifier for &T
where
    T: ProcessIdentifier,
{
    fn pid(&self) -> pid_t {
        (**self).pid()
    }
}

struct WaitStatus(i32);

impl WaitStatus {
    fn is_stop(&self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    fn is_signaled(&self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    fn is_exited(&self) -> bool {
        libc::WIFEXITED(self.0)
    }

    fn stop_signal(&self) -> i32 {
        libc::WSTOPSIG(self.0)
    }
}

impl std::fmt::Debug for WaitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitStatus")
            .field("is_stopped", &self.is_stop())
            .field("is_signaled", &self.is_signaled())
            .field("is_exited", &self.is_exited())
            .field("stop_signal", &self.stop_signal())
            .finish()
    }
}

/// Return the pid of the process currently tracing `pid`, if any.
pub fn tracer_of(pid: pid_t) -> ReattachResult<Option<pid_t>> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status"))?;
    let tracer = status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse::<pid_t>().ok())
        .filter(|tracer| *tracer != 0);
    Ok(tracer)
}

fn scheduler_state(pid: pid_t) -> ReattachResult<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    // The command name may contain spaces and parentheses; the state follows the last ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .ok_or(ReattachError::InvalidState("unreadable process state"))
}

/// A process we hold a ptrace attachment on. It may be running or stopped;
/// [`TracedProcess::next_frame`] waits until it is stopped.
pub struct TracedProcess<T>
where
    T: ProcessIdentifier,
{
    process: T,
    attached: bool,
    resumed_by_us: bool,
}

impl<T> ProcessIdentifier for TracedProcess<T>
where
    T: ProcessIdentifier,
{
    fn pid(&self) -> pid_t {
        self.process.pid()
    }
}

impl<T> Drop for TracedProcess<T>
where
    T: ProcessIdentifier,
{
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        let pid = self.pid();
        match self.detach(0) {
            Ok(()) => tracing::debug!("Released pid {pid} on drop"),
            Err(e) => tracing::error!("Could not release pid {pid}: {e}"),
        }
    }
}

impl<T> TracedProcess<T>
where
    T: ProcessIdentifier,
{
    /// A tracee this thread already traces is adopted, not re-attached.
    pub fn attach(process: T) -> ReattachResult<Self> {
        let pid = process.pid();
        // The tracer is a thread, and TracerPid names that thread.
        let me = unsafe { libc::gettid() };

        if tracer_of(pid).ok().flatten() == Some(me) {
            tracing::debug!("Pid {pid} is already traced by us, adopting it");
            return Ok(Self { process, attached: true, resumed_by_us: false });
        }

        let result = unsafe { ptrace(PTRACE_ATTACH, pid, 0, 0) };
        match result == -1 {
            true => Err(ReattachError::Attach { pid, source: std::io::Error::last_os_error() }),
            false => {
                tracing::info!("Attached to Pid: {pid}");
                Ok(Self { process, attached: true, resumed_by_us: true })
            }
        }
    }

    pub fn pid(&self) -> pid_t {
        self.process.pid()
    }

    fn detach(&mut self, signal: i32) -> ReattachResult<()> {
        let result = unsafe { ptrace(PTRACE_DETACH, self.pid(), 0, signal as libc::c_long) };
        self.attached = false;
        match result == -1 {
            true => Err(last_ptrace_error()),
            false => Ok(()),
        }
    }

    fn cont(&mut self, signal: i32) -> ReattachResult<()> {
        let result = unsafe { ptrace(PTRACE_CONT, self.pid(), 0, signal as libc::c_long) };
        match result == -1 {
            true => Err(last_ptrace_error()),
            false => Ok(()),
        }
    }

    fn wait(&mut self, options: i32) -> ReattachResult<Option<WaitStatus>> {
        let mut raw_status = 0;
        let result = loop {
            let result = unsafe { libc::waitpid(self.pid(), &mut raw_status, options | libc::__WALL) };
            if result == -1 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            break result;
        };

        match result {
            -1 => Err(last_ptrace_error()),
            0 => Ok(None),
            _ => {
                let status = WaitStatus(raw_status);
                tracing::trace!("{status:?}");
                Ok(Some(status))
            }
        }
    }

    fn stopped(mut self, status: WaitStatus) -> ReattachResult<ProcessFrame<T>> {
        if status.is_exited() || status.is_signaled() {
            self.attached = false;
            return Err(ReattachError::Rendezvous(format!(
                "pid {} terminated while traced",
                self.pid()
            )));
        }
        let signal = status.stop_signal();
        Ok(ProcessFrame { process: self, signal })
    }

    pub fn next_frame(mut self) -> ReattachResult<ProcessFrame<T>> {
        if !self.resumed_by_us {
            // Adopted tracee: it may already sit in a stop we consumed earlier.
            if let Some(status) = self.wait(libc::WNOHANG)? {
                return self.stopped(status);
            }
            if scheduler_state(self.pid())? == 't' {
                return Ok(ProcessFrame { process: self, signal: 0 });
            }
            if unsafe { libc::kill(self.pid(), libc::SIGSTOP) } == -1 {
                return Err(last_ptrace_error());
            }
        }

        match self.wait(0)? {
            Some(status) => self.stopped(status),
            None => Err(ReattachError::InvalidState("blocking wait returned no status")),
        }
    }
}

pub struct ProcessFrame<T>
where
    T: ProcessIdentifier,
{
    process: TracedProcess<T>,
    signal: i32,
}

impl<T> std::fmt::Debug for ProcessFrame<T>
where
    T: ProcessIdentifier,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProcessFrame ( pid: {}, signal: {} )", self.process.pid(), self.signal)
    }
}

impl<T> ProcessIdentifier for ProcessFrame<T>
where
    T: ProcessIdentifier,
{
    fn pid(&self) -> pid_t {
        self.process.pid()
    }
}

impl<T> ProcessFrame<T>
where
    T: ProcessIdentifier,
{
    pub fn stop_signal(&self) -> i32 {
        self.signal
    }

    pub fn query_registers(&self) -> ReattachResult<UserRegs> {
        let mut registers: UserRegs = unsafe { mem::zeroed() };
        let result = unsafe { ptrace(libc::PTRACE_GETREGS, self.pid(), 0, &mut registers) };

        match result == -1 {
            true => Err(last_ptrace_error()),
            false => Ok(registers),
        }
    }

    pub fn set_registers(&mut self, registers: &UserRegs) -> ReattachResult<()> {
        let result = unsafe { ptrace(libc::PTRACE_SETREGS, self.pid(), 0, registers as *const UserRegs) };

        match result == -1 {
            true => Err(last_ptrace_error()),
            false => Ok(()),
        }
    }

    /// Resume the tracee, delivering `signal` (0 for none), and wait for the
    /// next stop. Termination of the tracee is an error.
    pub fn cont_and_wait(&mut self, signal: i32) -> ReattachResult<i32> {
        self.process.cont(signal)?;
        self.process.resumed_by_us = true;

        let status = match self.process.wait(0)? {
            Some(status) => status,
            None => return Err(ReattachError::InvalidState("blocking wait returned no status")),
        };

        if status.is_exited() || status.is_signaled() {
            self.process.attached = false;
            return Err(ReattachError::Rendezvous(format!(
                "pid {} terminated while running injected code",
                self.pid()
            )));
        }

        self.signal = status.stop_signal();
        Ok(self.signal)
    }

    /// Let go of the tracee without detaching, so it stays in its ptrace-stop
    /// instead of resuming in a state we could not repair.
    pub fn abandon(mut self) {
        self.process.attached = false;
        tracing::warn!("Leaving pid {} stopped", self.pid());
    }

    /// Stop tracing, delivering `signal` (0 for none) as the tracee resumes.
    pub fn detach(mut self, signal: i32) -> ReattachResult<()> {
        self.process.detach(signal)?;
        tracing::info!("Detached from Pid: {} with signal {signal}", self.pid());
        Ok(())
    }
}

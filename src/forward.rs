//! Shuttling bytes between the local terminal and the pseudoterminal master.
//!
//! Signals are blocked and read from a `signalfd`, so window changes,
//! interrupts and termination requests arrive as ordinary readiness events.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::escape::{help_text, EscapeParser};
use crate::pty::{LocalTerminal, Pseudoterminal};
use crate::{ReattachError, ReattachResult};

pub const HANDLED_SIGNALS: [libc::c_int; 6] =
    [libc::SIGWINCH, libc::SIGINT, libc::SIGTERM, libc::SIGQUIT, libc::SIGPIPE, libc::SIGHUP];

const BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The pseudoterminal has no users left.
    TargetExited,
    /// Local input reached end of file.
    LocalEof,
    /// The user typed the detach escape.
    DetachRequested,
    /// A termination signal arrived.
    Terminated(libc::c_int),
}

fn retryable(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

fn read_fd(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let result = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    match result < 0 {
        true => Err(io::Error::last_os_error()),
        false => Ok(result as usize),
    }
}

fn write_all_fd(fd: BorrowedFd<'_>, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let result = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if retryable(&err) {
                continue;
            }
            return Err(err);
        }
        bytes = &bytes[result as usize..];
    }
    Ok(())
}

/// Blocks a set of signals for the calling thread and exposes them as a
/// readable descriptor. The previous mask is restored on drop.
pub struct SignalEvents {
    fd: OwnedFd,
    previous: libc::sigset_t,
}

impl SignalEvents {
    pub fn install(signals: &[libc::c_int]) -> ReattachResult<Self> {
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut previous: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            for signal in signals {
                libc::sigaddset(&mut set, *signal);
            }
        }

        let result = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous) };
        if result != 0 {
            return Err(io::Error::from_raw_os_error(result).into());
        }

        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut()) };
            return Err(err.into());
        }

        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) }, previous })
    }

    /// Next pending signal, if any.
    pub fn next(&self) -> ReattachResult<Option<libc::c_int>> {
        let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        let size = std::mem::size_of::<libc::signalfd_siginfo>();
        loop {
            let result = unsafe { libc::read(self.fd.as_raw_fd(), (&mut info as *mut libc::signalfd_siginfo).cast(), size) };
            if result == size as isize {
                return Ok(Some(info.ssi_signo as libc::c_int));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(ReattachError::LocalIo(err)),
            }
        }
    }
}

impl AsFd for SignalEvents {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for SignalEvents {
    fn drop(&mut self) {
        // Consume what is queued so unblocking does not deliver it.
        while let Ok(Some(signal)) = self.next() {
            tracing::debug!("Discarding signal {signal}");
        }
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut()) };
    }
}

pub struct ForwardingLoop<'a> {
    pty: &'a Pseudoterminal,
    input: BorrowedFd<'a>,
    output: BorrowedFd<'a>,
    local: &'a LocalTerminal<'a>,
    signals: &'a SignalEvents,
    parser: EscapeParser,
}

impl<'a> ForwardingLoop<'a> {
    pub fn new(
        pty: &'a Pseudoterminal,
        input: BorrowedFd<'a>,
        output: BorrowedFd<'a>,
        local: &'a LocalTerminal<'a>,
        signals: &'a SignalEvents,
        parser: EscapeParser,
    ) -> Self {
        Self { pty, input, output, local, signals, parser }
    }

    /// Forward until the target goes away, input ends, the user detaches or
    /// a termination signal arrives. Failing local I/O is reported as
    /// [`ReattachError::LocalIo`].
    pub fn run(&mut self) -> ReattachResult<LoopExit> {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            let mut fds = [self.pty.master(), self.input, self.signals.as_fd()].map(|fd| libc::pollfd {
                fd: fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ready == -1 {
                let err = io::Error::last_os_error();
                if retryable(&err) {
                    continue;
                }
                return Err(ReattachError::LocalIo(err));
            }
            let [master, input, signals] = fds.map(|fd| fd.revents);

            if signals != 0 {
                if let Some(exit) = self.handle_signals()? {
                    return Ok(exit);
                }
            }

            self.local.mirror(&self.pty.mode()?)?;

            if master != 0 {
                match read_fd(self.pty.master(), &mut buf) {
                    Ok(0) => return Ok(LoopExit::TargetExited),
                    Ok(len) => write_all_fd(self.output, &buf[..len]).map_err(ReattachError::LocalIo)?,
                    Err(err) if retryable(&err) => {}
                    // The slave side has been closed by everyone.
                    Err(err) if err.raw_os_error() == Some(libc::EIO) => return Ok(LoopExit::TargetExited),
                    Err(err) => return Err(ReattachError::LocalIo(err)),
                }
            }

            if input != 0 {
                let len = match read_fd(self.input, &mut buf) {
                    Ok(0) => return Ok(LoopExit::LocalEof),
                    Ok(len) => len,
                    Err(err) if retryable(&err) => continue,
                    Err(err) => return Err(ReattachError::LocalIo(err)),
                };
                if self.forward_input(&buf[..len])? {
                    return Ok(LoopExit::DetachRequested);
                }
            }
        }
    }

    fn handle_signals(&mut self) -> ReattachResult<Option<LoopExit>> {
        while let Some(signal) = self.signals.next()? {
            match signal {
                libc::SIGWINCH => {
                    if let Err(err) = self.pty.copy_window_size(self.output) {
                        tracing::debug!("Window size not propagated: {err}");
                    }
                }
                libc::SIGINT => {
                    let interrupt = self.pty.interrupt_char()?;
                    write_all_fd(self.pty.master(), &[interrupt]).map_err(ReattachError::LocalIo)?;
                }
                other => {
                    tracing::info!("Received signal {other}, leaving");
                    return Ok(Some(LoopExit::Terminated(other)));
                }
            }
        }
        Ok(None)
    }

    /// Send typed bytes to the target. Returns whether a detach was requested.
    fn forward_input(&mut self, typed: &[u8]) -> ReattachResult<bool> {
        let mut chunk = typed.to_vec();
        let outcome = self.parser.scan(&mut chunk);

        if outcome.help {
            write_all_fd(self.output, help_text(self.parser.escape()).as_bytes()).map_err(ReattachError::LocalIo)?;
        }

        let (forward, detach) = match outcome.split {
            Some(split) => (&chunk[..split], true),
            None => (&chunk[..], false),
        };
        write_all_fd(self.pty.master(), forward).map_err(ReattachError::LocalIo)?;
        Ok(detach)
    }
}

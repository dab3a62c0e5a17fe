use std::ffi::{CStr, OsStr};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::{ReattachError, ReattachResult};

/// Local modes left to the pseudoterminal's line discipline.
const LINE_DISCIPLINE: libc::tcflag_t = libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ECHONL | libc::ICANON;

fn check(result: libc::c_int) -> io::Result<()> {
    match result == -1 {
        true => Err(io::Error::last_os_error()),
        false => Ok(()),
    }
}

fn termios_of(fd: BorrowedFd<'_>) -> io::Result<libc::termios> {
    let mut mode: libc::termios = unsafe { std::mem::zeroed() };
    check(unsafe { libc::tcgetattr(fd.as_raw_fd(), &mut mode) })?;
    Ok(mode)
}

pub struct Pseudoterminal {
    master: OwnedFd,
    slave: PathBuf,
}

impl Pseudoterminal {
    /// Allocate a pseudoterminal and discard anything queued on it.
    pub fn open() -> ReattachResult<Self> {
        let fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
        check(fd)?;
        let master = unsafe { OwnedFd::from_raw_fd(fd) };

        check(unsafe { libc::grantpt(fd) })?;
        check(unsafe { libc::unlockpt(fd) })?;

        let mut name = [0 as libc::c_char; 128];
        let result = unsafe { libc::ptsname_r(fd, name.as_mut_ptr(), name.len()) };
        if result != 0 {
            return Err(io::Error::from_raw_os_error(result).into());
        }
        let name = unsafe { CStr::from_ptr(name.as_ptr()) };
        let slave = PathBuf::from(OsStr::from_bytes(name.to_bytes()));

        check(unsafe { libc::tcflush(fd, libc::TCIOFLUSH) })?;
        tracing::debug!("Allocated pseudoterminal {}", slave.display());
        Ok(Self { master, slave })
    }

    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn slave_path(&self) -> &Path {
        &self.slave
    }

    /// Current mode of the pseudoterminal.
    pub fn mode(&self) -> ReattachResult<libc::termios> {
        termios_of(self.master()).map_err(ReattachError::LocalIo)
    }

    /// The character the pseudoterminal turns into `SIGINT`.
    pub fn interrupt_char(&self) -> ReattachResult<u8> {
        Ok(self.mode()?.c_cc[libc::VINTR])
    }

    /// Give the pseudoterminal the window size of the terminal behind `from`.
    pub fn copy_window_size(&self, from: BorrowedFd<'_>) -> ReattachResult<()> {
        let mut size: libc::winsize = unsafe { std::mem::zeroed() };
        check(unsafe { libc::ioctl(from.as_raw_fd(), libc::TIOCGWINSZ, &mut size) })
            .and_then(|()| check(unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size) }))
            .map_err(ReattachError::LocalIo)?;
        tracing::trace!("Window size {}x{}", size.ws_col, size.ws_row);
        Ok(())
    }
}

pub fn local_mode(mut mode: libc::termios) -> libc::termios {
    mode.c_lflag &= !LINE_DISCIPLINE;
    mode
}

/// The terminal the user types into. Its original mode is put back on drop.
pub struct LocalTerminal<'a> {
    fd: BorrowedFd<'a>,
    original: Option<libc::termios>,
}

impl<'a> LocalTerminal<'a> {
    /// Remember the mode of `fd`. A descriptor that is not a terminal is
    /// left alone for the lifetime of the guard.
    pub fn capture(fd: BorrowedFd<'a>) -> Self {
        let original = match termios_of(fd) {
            Ok(mode) => Some(mode),
            Err(err) => {
                tracing::debug!("Input is not a terminal: {err}");
                None
            }
        };
        Self { fd, original }
    }

    pub fn is_terminal(&self) -> bool {
        self.original.is_some()
    }

    /// Take on `mode` minus the line discipline flags.
    pub fn mirror(&self, mode: &libc::termios) -> ReattachResult<()> {
        if !self.is_terminal() {
            return Ok(());
        }
        let local = local_mode(*mode);
        check(unsafe { libc::tcsetattr(self.fd.as_raw_fd(), libc::TCSANOW, &local) })
            .map_err(ReattachError::LocalIo)
    }
}

impl Drop for LocalTerminal<'_> {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            if let Err(e) = check(unsafe { libc::tcsetattr(self.fd.as_raw_fd(), libc::TCSANOW, original) }) {
                tracing::error!("Unable to restore terminal mode {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::net::UnixStream;

    fn open_pty() -> Option<Pseudoterminal> {
        match Pseudoterminal::open() {
            Ok(pty) => Some(pty),
            Err(e) => {
                eprintln!("skipping: no pseudoterminals available ({e})");
                None
            }
        }
    }

    fn open_slave(pty: &Pseudoterminal) -> std::fs::File {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(pty.slave_path())
            .unwrap()
    }

    #[test]
    fn local_mode_drops_line_discipline() {
        let mut mode: libc::termios = unsafe { std::mem::zeroed() };
        mode.c_lflag = libc::ECHO | libc::ICANON | libc::ISIG | libc::ECHOE;
        let local = local_mode(mode);
        assert_eq!(local.c_lflag, libc::ISIG);
    }

    #[test]
    fn allocates_a_usable_slave() {
        let Some(pty) = open_pty() else { return };
        assert!(pty.slave_path().starts_with("/dev/pts"));
        let _slave = open_slave(&pty);
        assert_eq!(pty.interrupt_char().unwrap(), 0x03);
    }

    #[test]
    fn copies_window_size_between_terminals() {
        let (Some(source), Some(target)) = (open_pty(), open_pty()) else { return };
        let size = libc::winsize { ws_row: 42, ws_col: 133, ws_xpixel: 0, ws_ypixel: 0 };
        check(unsafe { libc::ioctl(source.master().as_raw_fd(), libc::TIOCSWINSZ, &size) }).unwrap();

        target.copy_window_size(source.master()).unwrap();

        let mut copied: libc::winsize = unsafe { std::mem::zeroed() };
        check(unsafe { libc::ioctl(target.master().as_raw_fd(), libc::TIOCGWINSZ, &mut copied) }).unwrap();
        assert_eq!((copied.ws_row, copied.ws_col), (42, 133));
    }

    #[test]
    fn window_size_from_a_socket_is_a_local_error() {
        let Some(pty) = open_pty() else { return };
        let (socket, _peer) = UnixStream::pair().unwrap();
        let err = pty.copy_window_size(socket.as_fd()).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn guard_restores_the_original_mode() {
        let Some(pty) = open_pty() else { return };
        let slave = open_slave(&pty);
        let before = termios_of(slave.as_fd()).unwrap();
        assert_ne!(before.c_lflag & libc::ECHO, 0);

        {
            let local = LocalTerminal::capture(slave.as_fd());
            assert!(local.is_terminal());
            local.mirror(&pty.mode().unwrap()).unwrap();
            assert_eq!(termios_of(slave.as_fd()).unwrap().c_lflag & LINE_DISCIPLINE, 0);
        }

        assert_eq!(termios_of(slave.as_fd()).unwrap().c_lflag, before.c_lflag);
    }

    #[test]
    fn non_terminal_input_is_left_alone() {
        let (socket, _peer) = UnixStream::pair().unwrap();
        let local = LocalTerminal::capture(socket.as_fd());
        assert!(!local.is_terminal());
        let mode: libc::termios = unsafe { std::mem::zeroed() };
        local.mirror(&mode).unwrap();
    }
}

use clap::Parser;
use libc::pid_t;

use crate::inject::InjectionSite;
use crate::resolver::{CRuntime, ModulePredicate, NamedModule};

#[derive(Debug, Parser)]
#[command(
    name = "reattach",
    version,
    about = "Move a running process onto this terminal",
    after_help = "\
ESCAPES (only at the start of a line):
    `.  `d    give the process its original terminal back and exit
    `?        list the escapes
    ``        send a literal escape character"
)]
pub struct Config {
    /// Process to reattach (decimal, 0x hex or 0 octal)
    #[arg(value_name = "PID", value_parser = parse_pid)]
    pub pid: pid_t,

    /// Target descriptor used as stdin (not implemented, ignored)
    #[arg(short = '0', value_name = "FD")]
    pub stdin_fd: Option<i32>,

    /// Target descriptor used as stdout (not implemented, ignored)
    #[arg(short = '1', value_name = "FD")]
    pub stdout_fd: Option<i32>,

    /// Target descriptor used as stderr (not implemented, ignored)
    #[arg(short = '2', value_name = "FD")]
    pub stderr_fd: Option<i32>,

    /// Escape character
    #[arg(short, long, value_name = "CHAR", default_value = "`", value_parser = parse_escape)]
    pub escape: u8,

    /// Where injected code is written
    #[arg(long, value_enum, default_value_t = InjectionSite::Auto)]
    pub site: InjectionSite,

    /// Resolve routines in the mapped file whose name contains NAME instead of the C runtime
    #[arg(long, value_name = "NAME")]
    pub libc: Option<String>,

    /// Log debug output to stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Report descriptor overrides, which are accepted for compatibility only.
    pub fn warn_ignored(&self) {
        for (flag, fd) in [("-0", self.stdin_fd), ("-1", self.stdout_fd), ("-2", self.stderr_fd)] {
            if let Some(fd) = fd {
                tracing::warn!("{flag} {fd} is not implemented; using the standard descriptor");
            }
        }
    }

    /// The module predicate selected by `--libc`.
    pub fn runtime_predicate(&self) -> Box<dyn ModulePredicate> {
        match &self.libc {
            Some(name) => Box::new(NamedModule(name.clone())),
            None => Box::new(CRuntime),
        }
    }
}

impl ModulePredicate for Box<dyn ModulePredicate> {
    fn matches(&self, path: &str) -> bool {
        (**self).matches(path)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Parse a pid the way `strtol(s, _, 0)` would.
pub fn parse_pid(text: &str) -> Result<pid_t, String> {
    let (digits, radix) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };

    match pid_t::from_str_radix(digits, radix) {
        Ok(pid) if pid > 0 => Ok(pid),
        Ok(_) => Err(format!("`{text}` is not a process id")),
        Err(e) => Err(format!("`{text}`: {e}")),
    }
}

fn parse_escape(text: &str) -> Result<u8, String> {
    match text.as_bytes() {
        [byte] if byte.is_ascii() && !byte.is_ascii_control() => Ok(*byte),
        _ => Err(format!("`{text}` is not a single printable character")),
    }
}

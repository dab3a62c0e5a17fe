use std::io;
use std::os::fd::AsFd;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use reattach::config::Config;
use reattach::escape::EscapeParser;
use reattach::forward::{ForwardingLoop, LoopExit, SignalEvents, HANDLED_SIGNALS};
use reattach::pty::{LocalTerminal, Pseudoterminal};
use reattach::resolver::SymbolResolver;
use reattach::session::{InjectingSwapper, Session};
use reattach::ReattachResult;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Forward between our stdio and `pty`, with the local terminal mode restored
/// on return.
fn forward(pty: &Pseudoterminal, signals: &SignalEvents, escape: u8) -> ReattachResult<LoopExit> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let local = LocalTerminal::capture(stdin.as_fd());
    let mut forwarding =
        ForwardingLoop::new(pty, stdin.as_fd(), stdout.as_fd(), &local, signals, EscapeParser::new(escape));
    forwarding.run()
}

fn run(config: &Config) -> ReattachResult<LoopExit> {
    let pty = Pseudoterminal::open()?;
    if let Err(err) = pty.copy_window_size(io::stdout().as_fd()) {
        tracing::debug!("Keeping default window size: {err}");
    }
    let signals = SignalEvents::install(&HANDLED_SIGNALS)?;

    let resolver = SymbolResolver::new(config.runtime_predicate());
    let swapper = InjectingSwapper::new(config.pid, &resolver, config.site)?;
    let mut session = Session::new(config.pid, swapper);
    session.attach(pty.slave_path())?;

    let exit = match forward(&pty, &signals, config.escape) {
        Ok(exit) => exit,
        Err(err) if !err.is_fatal() => {
            tracing::warn!("{err}, giving the terminal back");
            LoopExit::LocalEof
        }
        Err(err) => {
            if let Err(detach) = session.detach() {
                tracing::error!("Could not restore pid {}: {detach}", session.pid());
            }
            return Err(err);
        }
    };
    tracing::info!("Forwarding ended: {exit:?}");

    match session.detach() {
        Ok(_) => Ok(exit),
        Err(err) if exit == LoopExit::TargetExited => {
            tracing::warn!("Pid {} is gone, nothing to restore: {err}", session.pid());
            Ok(exit)
        }
        Err(err) => Err(err),
    }
}

fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(config.verbose);
    config.warn_ignored();

    match run(&config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

use std::collections::BTreeMap;
use std::path::Path;

use libc::pid_t;

use crate::blob::Routine;
use crate::elf::ElfImage;
use crate::maps::{Module, ModuleMap};
use crate::{ReattachError, ReattachResult};

pub trait ModulePredicate {
    fn matches(&self, path: &str) -> bool;

    fn describe(&self) -> String;
}

/// Default heuristic: `libc.so`, `libc.so.N` or `libc-X.Y.so`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CRuntime;

impl ModulePredicate for CRuntime {
    fn matches(&self, path: &str) -> bool {
        let file = path.rsplit('/').next().unwrap_or(path);
        if file == "libc.so" {
            return true;
        }
        if let Some(version) = file.strip_prefix("libc.so.") {
            return !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.');
        }
        if let Some(version) = file.strip_prefix("libc-").and_then(|rest| rest.strip_suffix(".so")) {
            return !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.');
        }
        false
    }

    fn describe(&self) -> String {
        "the C runtime (libc.so*)".to_string()
    }
}

/// Explicit override: file name contains the given text.
#[derive(Debug, Clone)]
pub struct NamedModule(pub String);

impl ModulePredicate for NamedModule {
    fn matches(&self, path: &str) -> bool {
        path.rsplit('/').next().unwrap_or(path).contains(self.0.as_str())
    }

    fn describe(&self) -> String {
        format!("`{}`", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRoutines {
    addresses: BTreeMap<Routine, u64>,
}

impl ResolvedRoutines {
    pub fn insert(&mut self, routine: Routine, address: u64) {
        self.addresses.insert(routine, address);
    }

    pub fn get(&self, routine: Routine) -> Option<u64> {
        self.addresses.get(&routine).copied()
    }
}

pub struct SymbolResolver<P = CRuntime> {
    predicate: P,
}

impl Default for SymbolResolver<CRuntime> {
    fn default() -> Self {
        Self { predicate: CRuntime }
    }
}

impl<P> SymbolResolver<P>
where
    P: ModulePredicate,
{
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }

    /// Pick the runtime module out of `map`.
    pub fn runtime_module<'a>(&self, map: &'a ModuleMap) -> ReattachResult<&'a Module> {
        map.find(|path| self.predicate.matches(path))
            .ok_or_else(|| ReattachError::ModuleNotFound(self.predicate.describe()))
    }

    /// Resolve every routine in `routines` inside `pid`.
    pub fn resolve(&self, pid: pid_t, routines: &[Routine]) -> ReattachResult<ResolvedRoutines> {
        let map = ModuleMap::read(pid)?;
        let module = self.runtime_module(&map)?;
        // The path is guaranteed by `runtime_module`, which only matches file-backed modules.
        let path = module.path().unwrap_or_default();
        tracing::debug!("Runtime module for pid {pid}: {path} loaded at {:#x}", module.base);

        let image = ElfImage::open(backing_file(pid, path))?;
        resolve_in(&image, module.base as u64, routines)
    }
}

/// Prefer the tracee's view of its file system, which differs from ours
/// across mount namespaces and chroots.
fn backing_file(pid: pid_t, path: &str) -> std::path::PathBuf {
    let rooted = Path::new("/proc").join(pid.to_string()).join("root").join(path.trim_start_matches('/'));
    if rooted.exists() {
        rooted
    } else {
        Path::new(path).to_path_buf()
    }
}

pub fn resolve_in(image: &ElfImage, base: u64, routines: &[Routine]) -> ReattachResult<ResolvedRoutines> {
    let mut resolved = ResolvedRoutines::default();
    for routine in routines {
        let symbol = image
            .lookup(routine.symbol())
            .ok_or_else(|| ReattachError::SymbolNotFound(routine.symbol().to_string()))?;
        let address = base + symbol.value;
        tracing::trace!("{} -> {address:#x}", routine.symbol());
        resolved.insert(*routine, address);
    }
    Ok(resolved)
}

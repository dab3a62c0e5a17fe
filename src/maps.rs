use crate::{ReattachError, ReattachResult};
use libc::pid_t;

pub const MAX_MAP_RECORDS: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRecord {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    pub offset: usize,
    /// Backing path or pseudo-name such as `[stack]`; `None` for anonymous memory.
    pub name: Option<String>,
}

impl MapRecord {
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(6, |c: char| c.is_ascii_whitespace());
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?;
        let offset = fields.next()?;
        let _device = fields.next()?;
        let _inode = fields.next()?;
        let name = fields.next().map(str::trim).filter(|name| !name.is_empty());

        if perms.len() != 4 {
            return None;
        }

        Some(MapRecord {
            start: usize::from_str_radix(start, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            perms: perms.to_string(),
            offset: usize::from_str_radix(offset, 16).ok()?,
            name: name.map(str::to_string),
        })
    }
}

pub fn parse_records(text: &str) -> ReattachResult<Vec<MapRecord>> {
    let mut records = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if records.len() == MAX_MAP_RECORDS {
            return Err(ReattachError::MapParse(format!(
                "more than {MAX_MAP_RECORDS} mapping records"
            )));
        }
        let record = MapRecord::parse(line)
            .ok_or_else(|| ReattachError::MapParse(format!("line {}: `{line}`", number + 1)))?;
        records.push(record);
    }
    Ok(records)
}

pub fn read_records(pid: pid_t) -> ReattachResult<Vec<MapRecord>> {
    let path = format!("/proc/{pid}/maps");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| ReattachError::MapParse(format!("cannot read {path}: {e}")))?;
    parse_records(&text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    Anonymous,
    /// Kernel pseudo-region such as `[stack]` or `[vdso]`.
    Pseudo(String),
    File(String),
}

impl Backing {
    fn of(name: &Option<String>) -> Self {
        match name {
            None => Backing::Anonymous,
            Some(name) if name.starts_with('[') => Backing::Pseudo(name.clone()),
            Some(name) => Backing::File(name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub backing: Backing,
    pub start: usize,
    pub end: usize,
    /// Load address: the last file offset 0 record before the first
    /// executable one.
    pub base: usize,
    pub executable: bool,
}

impl Module {
    /// Path of the backing file, if this module is file-backed.
    pub fn path(&self) -> Option<&str> {
        match &self.backing {
            Backing::File(path) => Some(path),
            _ => None,
        }
    }
}

/// The address space as an ordered list of modules. Consecutive records with
/// the same backing file are folded into one module spanning all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleMap {
    modules: Vec<Module>,
}

impl ModuleMap {
    pub fn from_records(records: &[MapRecord]) -> Self {
        let mut modules: Vec<Module> = Vec::new();
        for record in records {
            let backing = Backing::of(&record.name);
            if let Some(last) = modules.last_mut() {
                if last.backing == backing && backing != Backing::Anonymous {
                    last.start = last.start.min(record.start);
                    last.end = last.end.max(record.end);
                    if !last.executable && record.offset == 0 {
                        last.base = record.start;
                    }
                    last.executable |= record.is_executable();
                    continue;
                }
            }
            modules.push(Module {
                backing,
                start: record.start,
                end: record.end,
                base: record.start,
                executable: record.is_executable(),
            });
        }
        Self { modules }
    }

    pub fn parse(text: &str) -> ReattachResult<Self> {
        Ok(Self::from_records(&parse_records(text)?))
    }

    pub fn read(pid: pid_t) -> ReattachResult<Self> {
        Ok(Self::from_records(&read_records(pid)?))
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// First file-backed module with code whose path satisfies `matches`.
    /// Data-only mappings of the same file are skipped.
    pub fn find(&self, mut matches: impl FnMut(&str) -> bool) -> Option<&Module> {
        self.modules
            .iter()
            .find(|module| module.executable && module.path().map_or(false, &mut matches))
    }
}

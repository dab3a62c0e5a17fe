use object::elf::{FileHeader64, SectionHeader64, ELFDATA2LSB, SHT_DYNSYM, SHT_SYMTAB};
use object::read::elf::{FileHeader, SectionHeader, Sym};
use object::{Endianness, SectionIndex};

use crate::{ReattachError, ReattachResult};
use std::path::Path;

type Header = FileHeader64<Endianness>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    /// `STT_*` symbol type.
    pub kind: u8,
    pub defined: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self { symbols }
    }

    /// First defined symbol called `name`.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|symbol| symbol.defined && symbol.name == name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// The static and dynamic symbol tables of one image. A running image does not
/// need its static table, so lookups prefer the dynamic one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfImage {
    pub static_symbols: Option<SymbolTable>,
    pub dynamic_symbols: Option<SymbolTable>,
}

fn malformed(err: impl std::fmt::Display) -> ReattachError {
    ReattachError::MalformedImage(err.to_string())
}

impl ElfImage {
    pub fn open(path: impl AsRef<Path>) -> ReattachResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        tracing::debug!("Parsing {} ({} bytes)", path.display(), data.len());
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> ReattachResult<Self> {
        if data.get(..object::elf::ELFMAG.len()) != Some(&object::elf::ELFMAG[..]) {
            return Err(malformed("bad ELF magic"));
        }

        let header = Header::parse(data).map_err(malformed)?;
        if header.e_ident().data != ELFDATA2LSB {
            return Err(malformed("not a little-endian image"));
        }
        let endian = header.endian().map_err(malformed)?;

        let entry_size = usize::from(header.e_shentsize(endian));
        if entry_size != std::mem::size_of::<SectionHeader64<Endianness>>() {
            return Err(malformed(format!("section header entry size {entry_size}")));
        }

        let sections = header.sections(endian, data).map_err(malformed)?;

        let mut image = ElfImage::default();
        for (index, section) in sections.iter().enumerate() {
            let slot = match section.sh_type(endian) {
                SHT_SYMTAB => &mut image.static_symbols,
                SHT_DYNSYM => &mut image.dynamic_symbols,
                _ => continue,
            };

            let name = sections.section_name(endian, section).map_err(malformed)?;
            let name = String::from_utf8_lossy(name);
            if slot.is_some() {
                return Err(malformed(format!("duplicate symbol table {name}")));
            }

            let table = object::read::elf::SymbolTable::parse(
                endian,
                data,
                &sections,
                SectionIndex(index),
                section,
            )
            .map_err(malformed)?;

            let strings = table.strings();
            let mut symbols = Vec::with_capacity(table.symbols().len());
            for symbol in table.symbols() {
                let symbol_name = symbol.name(endian, strings).map_err(malformed)?;
                symbols.push(Symbol {
                    name: String::from_utf8_lossy(symbol_name).into_owned(),
                    value: symbol.st_value(endian),
                    kind: symbol.st_type(),
                    defined: !symbol.is_undefined(endian),
                });
            }
            tracing::trace!("Loaded {} symbols from {name}", symbols.len());
            *slot = Some(SymbolTable::new(symbols));
        }

        if image.static_symbols.is_none() && image.dynamic_symbols.is_none() {
            return Err(malformed("no symbol tables"));
        }
        Ok(image)
    }

    /// Value of `name`, from the dynamic table first, then the static one.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.dynamic_symbols
            .as_ref()
            .and_then(|table| table.lookup(name))
            .or_else(|| self.static_symbols.as_ref().and_then(|table| table.lookup(name)))
    }
}


#[cfg(test)]
mod tests {
    use super::synthetic::{image, TableSpec};
    use super::*;

    #[test]
    fn loads_both_tables() {
        let data = image(&[
            TableSpec { sh_type: SHT_SYMTAB, symbols: &[("X", 0x200), ("local_only", 0x300)] },
            TableSpec { sh_type: SHT_DYNSYM, symbols: &[("X", 0x100)] },
        ]);

        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.static_symbols.as_ref().unwrap().len(), 3);
        assert_eq!(image.dynamic_symbols.as_ref().unwrap().len(), 2);

        assert_eq!(image.lookup("X").unwrap().value, 0x100);
        assert_eq!(image.lookup("local_only").unwrap().value, 0x300);
        assert!(image.lookup("missing").is_none());
    }

    #[test]
    fn odd_length_string_tables_do_not_misalign_symbols() {
        let data = image(&[
            TableSpec { sh_type: SHT_SYMTAB, symbols: &[("abc", 0x10)] },
            TableSpec { sh_type: SHT_DYNSYM, symbols: &[("de", 0x20), ("fghij", 0x30)] },
        ]);

        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.lookup("abc").unwrap().value, 0x10);
        assert_eq!(image.lookup("fghij").unwrap().value, 0x30);
    }

    #[test]
    fn null_symbol_is_undefined() {
        let data = image(&[TableSpec { sh_type: SHT_DYNSYM, symbols: &[("X", 0x100)] }]);
        let image = ElfImage::parse(&data).unwrap();
        assert!(image.lookup("").is_none());
    }

    #[test]
    fn rejects_duplicate_tables() {
        let data = image(&[
            TableSpec { sh_type: SHT_DYNSYM, symbols: &[("X", 0x100)] },
            TableSpec { sh_type: SHT_DYNSYM, symbols: &[("Y", 0x200)] },
        ]);
        assert!(matches!(ElfImage::parse(&data), Err(ReattachError::MalformedImage(_))));
    }

    #[test]
    fn rejects_missing_tables() {
        let data = image(&[]);
        assert!(matches!(ElfImage::parse(&data), Err(ReattachError::MalformedImage(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = image(&[TableSpec { sh_type: SHT_DYNSYM, symbols: &[("X", 0x100)] }]);
        data[1] = b'Q';
        assert!(matches!(ElfImage::parse(&data), Err(ReattachError::MalformedImage(_))));
        assert!(matches!(ElfImage::parse(b"\x7fEL"), Err(ReattachError::MalformedImage(_))));
    }

    #[test]
    fn rejects_wrong_section_entry_size() {
        let mut data = image(&[TableSpec { sh_type: SHT_DYNSYM, symbols: &[("X", 0x100)] }]);
        // e_shentsize lives at offset 58.
        data[58] = 40;
        assert!(matches!(ElfImage::parse(&data), Err(ReattachError::MalformedImage(_))));
    }

    #[test]
    fn parses_the_running_test_binary() {
        let exe = std::env::current_exe().unwrap();
        let image = ElfImage::open(exe).unwrap();
        assert!(image.dynamic_symbols.is_some() || image.static_symbols.is_some());
    }
}

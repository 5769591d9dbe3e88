use crate::error::{Error, Result};
use gimli::{EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol};
use std::fs::File;
use std::path::Path;

/// Symbols and line tables parsed from an ELF file
pub struct DebugInfo {
    /// Address ranges mapped to source locations, sorted by start
    pub ranges: Vec<AddressRange>,
    /// Text symbols, sorted by address
    pub functions: Vec<FunctionSymbol>,
}

/// An address range mapped to a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
    pub file: String,
    pub line: u32,
}

/// A demangled function symbol from the ELF symbol table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub address: u64,
    /// 0 when the symbol table does not record a size
    pub size: u64,
    pub name: String,
}

impl DebugInfo {
    /// Parse symbols and, when present, DWARF line info.
    ///
    /// A binary without `.debug_info` still yields function names; one
    /// without a symbol table is reported as missing debug info.
    pub fn parse(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;

        let object = object::File::parse(&*mmap)
            .map_err(|e| Error::SymbolResolution(format!("Failed to parse ELF: {}", e)))?;

        let functions = Self::parse_functions(&object);
        if functions.is_empty() {
            return Err(Error::MissingDebugInfo {
                path: path.display().to_string(),
            });
        }

        let ranges = if object.section_by_name(".debug_info").is_some() {
            Self::parse_line_info(&object)?
        } else {
            tracing::warn!(path = %path.display(), "no DWARF line info, resolving names only");
            Vec::new()
        };

        Ok(DebugInfo { ranges, functions })
    }

    fn parse_line_info(object: &object::File<'_>) -> Result<Vec<AddressRange>> {
        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> std::result::Result<_, gimli::Error> {
            let data = object
                .section_by_name(id.name())
                .and_then(|s| s.data().ok())
                .unwrap_or(&[]);
            Ok(EndianSlice::new(data, endian))
        };

        let dwarf = gimli::Dwarf::load(load_section)
            .map_err(|e| Error::SymbolResolution(format!("Failed to load DWARF: {}", e)))?;

        let mut ranges = Vec::new();
        let mut units = dwarf.units();

        while let Ok(Some(header)) = units.next() {
            let unit = dwarf
                .unit(header)
                .map_err(|e| Error::SymbolResolution(format!("Failed to parse unit: {}", e)))?;

            let Some(program) = unit.line_program.clone() else {
                continue;
            };

            let mut rows = program.rows();
            let mut prev_row: Option<(u64, String, u32)> = None;

            while let Ok(Some((header, row))) = rows.next_row() {
                let addr = row.address();
                let file = row
                    .file(header)
                    .map(|f| {
                        let mut path = String::new();

                        if let Some(dir) = f.directory(header)
                            && let Ok(dir) = dwarf.attr_string(&unit, dir)
                        {
                            path.push_str(&dir.to_string_lossy());
                            if !path.is_empty() && !path.ends_with('/') {
                                path.push('/');
                            }
                        }
                        if let Ok(name) = dwarf.attr_string(&unit, f.path_name()) {
                            path.push_str(&name.to_string_lossy());
                        }

                        path
                    })
                    .unwrap_or_default();
                let line = row.line().map(|l| l.get() as u32).unwrap_or(0);

                // Each row closes the range opened by the previous one
                if let Some((prev_addr, prev_file, prev_line)) = prev_row.take()
                    && addr > prev_addr
                    && !prev_file.is_empty()
                {
                    ranges.push(AddressRange {
                        start: prev_addr,
                        end: addr,
                        file: prev_file,
                        line: prev_line,
                    });
                }

                if !row.end_sequence() {
                    prev_row = Some((addr, file, line));
                }
            }
        }

        ranges.sort_by_key(|r| r.start);
        Ok(ranges)
    }

    fn parse_functions(object: &object::File<'_>) -> Vec<FunctionSymbol> {
        // Stripped binaries may still carry dynamic symbols
        let mut functions: Vec<FunctionSymbol> = object
            .symbols()
            .chain(object.dynamic_symbols())
            .filter(|symbol| symbol.kind() == object::SymbolKind::Text && symbol.address() != 0)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                Some(FunctionSymbol {
                    address: symbol.address(),
                    size: symbol.size(),
                    name: format!("{:#}", rustc_demangle::demangle(name)),
                })
            })
            .collect();

        functions.sort_by_key(|f| f.address);
        functions.dedup_by_key(|f| f.address);
        functions
    }
}

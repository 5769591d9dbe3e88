use super::dwarf::{AddressRange, DebugInfo, FunctionSymbol};
use crate::error::Result;
use crate::process::{MemoryMaps, SELF_EXE};
use std::path::PathBuf;

/// A resolved code address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    /// Distance from the start of `function`
    pub offset: u64,
    /// Source file, empty without line info
    pub file: String,
    pub line: u32,
}

impl Location {
    /// Format as file:line with the path shortened for display
    pub fn as_file_line(&self) -> String {
        if self.file.is_empty() {
            return "?".to_string();
        }
        let file = simplify_path(&self.file);
        if self.line > 0 {
            format!("{}:{}", file, self.line)
        } else {
            file
        }
    }
}

/// Maps runtime addresses of this process to functions and source lines
pub struct SymbolResolver {
    ranges: Vec<AddressRange>,
    functions: Vec<FunctionSymbol>,
    /// Load bias subtracted from runtime addresses
    aslr_offset: u64,
}

impl SymbolResolver {
    /// Build a resolver for the running executable
    pub fn for_current_process() -> Result<Self> {
        let exe_path = std::fs::read_link(SELF_EXE).unwrap_or_else(|_| PathBuf::from(SELF_EXE));

        // Read through /proc/self/exe, which still works if the file was replaced
        let info = DebugInfo::parse(std::path::Path::new(SELF_EXE))?;
        let maps = MemoryMaps::current()?;
        let aslr_offset = maps.aslr_offset(&exe_path);

        tracing::debug!(
            functions = info.functions.len(),
            ranges = info.ranges.len(),
            aslr_offset = format_args!("{:#x}", aslr_offset),
            "loaded symbols"
        );

        Ok(Self::from_parts(info.ranges, info.functions, aslr_offset))
    }

    /// Build a resolver from already parsed tables (sorted by address)
    pub fn from_parts(
        ranges: Vec<AddressRange>,
        functions: Vec<FunctionSymbol>,
        aslr_offset: u64,
    ) -> Self {
        SymbolResolver {
            ranges,
            functions,
            aslr_offset,
        }
    }

    /// Number of address ranges loaded
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Number of function symbols loaded
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn aslr_offset(&self) -> u64 {
        self.aslr_offset
    }

    /// Resolve a runtime address. `None` when no function covers it.
    pub fn resolve(&self, addr: u64) -> Option<Location> {
        let link_addr = addr.checked_sub(self.aslr_offset)?;
        let function = self.find_function(link_addr)?;

        let (file, line) = match self.find_range(link_addr) {
            Some(range) => (range.file.clone(), range.line),
            None => (String::new(), 0),
        };

        Some(Location {
            function: function.name.clone(),
            offset: link_addr - function.address,
            file,
            line,
        })
    }

    fn find_function(&self, link_addr: u64) -> Option<&FunctionSymbol> {
        // Last symbol starting at or below the address
        let idx = self.functions.partition_point(|f| f.address <= link_addr);
        let function = self.functions.get(idx.checked_sub(1)?)?;

        if function.size > 0 && link_addr >= function.address + function.size {
            return None;
        }
        Some(function)
    }

    fn find_range(&self, link_addr: u64) -> Option<&AddressRange> {
        let idx = self.ranges.partition_point(|r| r.start <= link_addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (link_addr < range.end).then_some(range)
    }
}

/// Simplify a file path for display
pub fn simplify_path(path: &str) -> String {
    let prefixes_to_strip = ["/rustc/", "/.cargo/registry/src/", "/.cargo/git/checkouts/"];

    let mut result = path.to_string();

    for prefix in &prefixes_to_strip {
        if let Some(idx) = result.find(prefix) {
            // Drop the hash / registry directory after the prefix
            let after_prefix = &result[idx + prefix.len()..];
            if let Some(slash_idx) = after_prefix.find('/') {
                result = after_prefix[slash_idx + 1..].to_string();
            }
        }
    }

    // "/home/user/project/src/main.rs" -> "src/main.rs"
    if let Some(idx) = result.find("/src/") {
        result = result[idx + 1..].to_string();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::from_parts(
            vec![
                AddressRange {
                    start: 0x1000,
                    end: 0x1010,
                    file: "/home/me/hotloop/src/workload.rs".to_string(),
                    line: 33,
                },
                AddressRange {
                    start: 0x1010,
                    end: 0x1040,
                    file: "/home/me/hotloop/src/workload.rs".to_string(),
                    line: 42,
                },
            ],
            vec![
                FunctionSymbol {
                    address: 0x1000,
                    size: 0x40,
                    name: "hotloop::workload::SampleBuffer::fill".to_string(),
                },
                FunctionSymbol {
                    address: 0x2000,
                    size: 0,
                    name: "hotloop::workload::SampleBuffer::sum".to_string(),
                },
            ],
            0x5500_0000_0000,
        )
    }

    #[test]
    fn test_resolve_applies_aslr_offset() {
        let loc = resolver().resolve(0x5500_0000_1014).unwrap();
        assert_eq!(loc.function, "hotloop::workload::SampleBuffer::fill");
        assert_eq!(loc.offset, 0x14);
        assert_eq!(loc.line, 42);
        assert_eq!(loc.as_file_line(), "src/workload.rs:42");
    }

    #[test]
    fn test_resolve_outside_sized_symbol() {
        // Past the end of `fill`, before `sum`
        assert!(resolver().resolve(0x5500_0000_1800).is_none());
        // Below the load base
        assert!(resolver().resolve(0x10).is_none());
    }

    #[test]
    fn test_resolve_unsized_symbol_without_lines() {
        let loc = resolver().resolve(0x5500_0000_2100).unwrap();
        assert_eq!(loc.function, "hotloop::workload::SampleBuffer::sum");
        assert_eq!(loc.offset, 0x100);
        assert_eq!(loc.as_file_line(), "?");
    }

    #[test]
    fn test_simplify_registry_path() {
        assert_eq!(
            simplify_path("/home/me/.cargo/registry/src/index.crates.io-6f17d22bba15001f/tokio-1.40.0/src/runtime/mod.rs"),
            "src/runtime/mod.rs"
        );
    }
}

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

const SELF_MAPS: &str = "/proc/self/maps";

/// A parsed memory mapping from /proc/self/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

/// Memory mappings of the running process
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMaps {
    /// Parse /proc/self/maps
    pub fn current() -> Result<Self> {
        let content = fs::read_to_string(SELF_MAPS).map_err(|e| Error::proc(SELF_MAPS, e))?;
        Ok(Self::parse(&content))
    }

    /// Parse the text of a maps file, skipping lines that do not parse.
    pub fn parse(content: &str) -> Self {
        MemoryMaps {
            mappings: content.lines().filter_map(Self::parse_line).collect(),
        }
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        // "start-end"
        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let perms = parts[1].to_string();
        let offset = u64::from_str_radix(parts[2], 16).ok()?;

        // Pathname may contain spaces
        let pathname = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    /// Load bias of the executable at `exe_path`.
    ///
    /// The first mapping of the binary has file offset 0 for PIE
    /// executables, so `start - offset` is the load base. Returns 0 when the
    /// binary is not found (non-PIE executables are mapped at their link
    /// address).
    pub fn aslr_offset(&self, exe_path: &Path) -> u64 {
        let exe_str = exe_path.to_string_lossy();
        let exe_name = exe_path.file_name().map(|n| n.to_string_lossy());

        self.mappings
            .iter()
            .find(|mapping| match mapping.pathname.as_deref() {
                Some(pathname) => {
                    pathname == exe_str
                        || exe_name
                            .as_deref()
                            .is_some_and(|name| pathname.ends_with(&format!("/{name}")))
                }
                None => false,
            })
            .and_then(|mapping| mapping.start.checked_sub(mapping.offset))
            .unwrap_or(0)
    }

    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

//! Address to function/line resolution for the running executable

mod dwarf;
mod resolver;

pub use dwarf::{AddressRange, DebugInfo, FunctionSymbol};
pub use resolver::{Location, SymbolResolver, simplify_path};

//! Kernel symbol resolution for driver images.
//!
//! Each API version owns an independent name -> address table. For a given
//! version the set of resolvable names and their signatures is stable;
//! asking for a name under a version that was never registered is a hard
//! error, not a fallback to another version.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use lazy_static::lazy_static;
use spin::Mutex;

/// Symbol resolution errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolError {
    /// No table exists for the requested API version.
    UnknownApiVersion,
    /// The version exists but does not export this name.
    UnknownSymbol,
}

lazy_static! {
    /// api_version -> (name -> address).
    static ref SYMBOL_TABLES: Mutex<BTreeMap<u32, BTreeMap<String, usize>>> =
        Mutex::new(BTreeMap::new());
}

/// Export `name` at `address` under `api_version`.
pub fn register_symbol(api_version: u32, name: &str, address: usize) {
    SYMBOL_TABLES
        .lock()
        .entry(api_version)
        .or_default()
        .insert(name.to_string(), address);
}

/// Resolve `name` under `api_version`.
pub fn get_symbol_by_name(name: &str, api_version: u32) -> Result<usize, SymbolError> {
    let tables = SYMBOL_TABLES.lock();
    let table = tables
        .get(&api_version)
        .ok_or(SymbolError::UnknownApiVersion)?;
    table.get(name).copied().ok_or(SymbolError::UnknownSymbol)
}

/// Number of symbols exported under `api_version`.
pub fn symbol_count(api_version: u32) -> usize {
    SYMBOL_TABLES
        .lock()
        .get(&api_version)
        .map(|t| t.len())
        .unwrap_or(0)
}

/// Drop every table. Shutdown only.
pub fn teardown() {
    SYMBOL_TABLES.lock().clear();
}

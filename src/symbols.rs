//! Symbol resolution boundary.
//!
//! A symbol map links device-local indexes of types, fields and methods with CLR
//! metadata tokens and carries per-method IL offset maps. Maps are produced by an
//! external tool and stored as JSON, a missing map is a legal "no symbols" state.

use crate::error::Error;
use crate::weak_error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub clr: u32,
    pub device: u32,
}

/// One point of IL offset translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IlMapEntry {
    pub clr: u32,
    pub device: u32,
}

fn default_user_code() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSymbols {
    pub clr: u32,
    pub device: u32,
    #[serde(default)]
    pub name: String,
    /// Sorted by offsets, entries also delimit sequence points used for stepping.
    #[serde(default)]
    pub il_map: Vec<IlMapEntry>,
    /// Non-user methods are stepped through.
    #[serde(default = "default_user_code")]
    pub user_code: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMap {
    pub assembly: String,
    #[serde(default)]
    pub types: Vec<TokenPair>,
    #[serde(default)]
    pub fields: Vec<TokenPair>,
    #[serde(default)]
    pub methods: Vec<MethodSymbols>,
}

impl SymbolMap {
    pub fn from_json(data: &str) -> Result<Self, Error> {
        let mut map: SymbolMap = serde_json::from_str(data)?;
        for method in &mut map.methods {
            method.il_map.sort_by_key(|e| e.device);
        }
        Ok(map)
    }
}

/// Source of symbol maps, keyed by assembly name.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, assembly: &str) -> Option<SymbolMap>;
}

/// Resolver without any symbols, every assembly uses structural token mapping.
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _: &str) -> Option<SymbolMap> {
        None
    }
}

/// In-memory set of symbol maps.
#[derive(Default)]
pub struct StaticSymbols {
    maps: HashMap<String, SymbolMap>,
}

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, map: SymbolMap) -> Self {
        self.maps.insert(map.assembly.clone(), map);
        self
    }
}

impl SymbolResolver for StaticSymbols {
    fn resolve(&self, assembly: &str) -> Option<SymbolMap> {
        self.maps.get(assembly).cloned()
    }
}

/// Symbol maps stored as `<dir>/<assembly>.sym.json`.
pub struct DirectorySymbols {
    dir: PathBuf,
}

impl DirectorySymbols {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SymbolResolver for DirectorySymbols {
    fn resolve(&self, assembly: &str) -> Option<SymbolMap> {
        let path = self.dir.join(format!("{assembly}.sym.json"));
        let data = fs::read_to_string(path).ok()?;
        weak_error!(SymbolMap::from_json(&data), "symbol map:")
    }
}

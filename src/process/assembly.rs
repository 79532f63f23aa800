use crate::error::Error;
use crate::symbols::{MethodSymbols, SymbolMap};
use crate::version::Version;
use crate::wire::PayloadReader;
use std::collections::HashMap;
use strum_macros::Display;

/// Row part of a CLR metadata token.
const ROW_MASK: u32 = 0x00FF_FFFF;

/// Metadata table of a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum TokenKind {
    TypeDef,
    FieldDef,
    MethodDef,
}

impl TokenKind {
    pub const fn table(self) -> u32 {
        match self {
            TokenKind::TypeDef => 0x02,
            TokenKind::FieldDef => 0x04,
            TokenKind::MethodDef => 0x06,
        }
    }

    pub fn of_clr_token(token: u32) -> Option<Self> {
        match token >> 24 {
            0x02 => Some(TokenKind::TypeDef),
            0x04 => Some(TokenKind::FieldDef),
            0x06 => Some(TokenKind::MethodDef),
            _ => None,
        }
    }
}

/// Pack assembly index and assembly-local index into a device-wide index.
#[inline(always)]
pub fn pack_index(assembly: u32, index: u32) -> u32 {
    (assembly << 16) | (index & 0xFFFF)
}

/// Split device-wide index into assembly index and assembly-local index.
#[inline(always)]
pub fn unpack_index(packed: u32) -> (u32, u32) {
    (packed >> 16, packed & 0xFFFF)
}

/// Token translation tables, built once from a symbol map.
#[derive(Debug, Default)]
struct TokenTables {
    device_to_clr: HashMap<(TokenKind, u32), u32>,
    clr_to_device: HashMap<u32, u32>,
    methods: HashMap<u32, MethodSymbols>,
}

impl TokenTables {
    fn new(map: SymbolMap) -> Self {
        let mut tables = TokenTables::default();
        let pairs = [
            (TokenKind::TypeDef, &map.types),
            (TokenKind::FieldDef, &map.fields),
        ];
        for (kind, list) in pairs {
            for pair in list {
                tables.device_to_clr.insert((kind, pair.device), pair.clr);
                tables.clr_to_device.insert(pair.clr, pair.device);
            }
        }
        for method in map.methods {
            tables
                .device_to_clr
                .insert((TokenKind::MethodDef, method.device), method.clr);
            tables.clr_to_device.insert(method.clr, method.device);
            tables.methods.insert(method.clr, method);
        }
        tables
    }
}

/// Assembly loaded on device, keyed by device-assigned index.
#[derive(Debug)]
pub struct Assembly {
    pub idx: u32,
    pub name: String,
    pub version: Version,
    pub flags: u32,
    symbols: Option<TokenTables>,
}

impl Assembly {
    pub fn new(idx: u32, name: String, version: Version, flags: u32, symbols: Option<SymbolMap>) -> Self {
        Self {
            idx,
            name,
            version,
            flags,
            symbols: symbols.map(TokenTables::new),
        }
    }

    /// Parse `RESOLVE_ASSEMBLY` reply.
    pub(crate) fn read(reader: &mut PayloadReader) -> Result<(String, Version, u32), Error> {
        let flags = reader.u32()?;
        let name = reader.string()?;
        let version = Version::read(reader)?;
        Ok((name, version, flags))
    }

    pub fn has_symbols(&self) -> bool {
        self.symbols.is_some()
    }

    /// Translate assembly-local device index into CLR token.
    pub fn to_clr(&self, kind: TokenKind, device: u32) -> Result<u32, Error> {
        match &self.symbols {
            Some(tables) => tables
                .device_to_clr
                .get(&(kind, device))
                .copied()
                .ok_or(Error::TokenNotFound(device)),
            // rows are one-based and take the low 24 bits, device indexes are zero-based
            None if device < ROW_MASK => Ok((kind.table() << 24) | (device + 1)),
            None => Err(Error::TokenNotFound(device)),
        }
    }

    /// Translate CLR token into assembly-local device index.
    pub fn to_device(&self, clr: u32) -> Result<(TokenKind, u32), Error> {
        let kind = TokenKind::of_clr_token(clr).ok_or(Error::TokenNotFound(clr))?;
        match &self.symbols {
            Some(tables) => tables
                .clr_to_device
                .get(&clr)
                .map(|device| (kind, *device))
                .ok_or(Error::TokenNotFound(clr)),
            None => {
                let row = clr & ROW_MASK;
                if row == 0 {
                    return Err(Error::TokenNotFound(clr));
                }
                Ok((kind, row - 1))
            }
        }
    }

    pub fn method_symbols(&self, method_clr: u32) -> Option<&MethodSymbols> {
        self.symbols.as_ref()?.methods.get(&method_clr)
    }

    /// False only for methods explicitly marked as non-user code.
    pub fn is_user_code(&self, method_clr: u32) -> bool {
        self.method_symbols(method_clr)
            .map(|m| m.user_code)
            .unwrap_or(true)
    }

    /// Translate device IL offset into CLR IL offset: nearest preceding map entry plus distance.
    pub fn il_to_clr(&self, method_clr: u32, device_il: u32) -> u32 {
        let Some(method) = self.method_symbols(method_clr) else {
            return device_il;
        };
        match method.il_map.iter().rev().find(|e| e.device <= device_il) {
            Some(entry) => entry.clr + (device_il - entry.device),
            None => device_il,
        }
    }

    pub fn il_to_device(&self, method_clr: u32, clr_il: u32) -> u32 {
        let Some(method) = self.method_symbols(method_clr) else {
            return clr_il;
        };
        let entry = method
            .il_map
            .iter()
            .filter(|e| e.clr <= clr_il)
            .max_by_key(|e| e.clr);
        match entry {
            Some(entry) => entry.device + (clr_il - entry.clr),
            None => clr_il,
        }
    }

    /// Device IL range `[start, end)` of the sequence point that contains `device_il`.
    /// `None` when method has no IL map.
    pub fn sequence_point(&self, method_clr: u32, device_il: u32) -> Option<(u32, u32)> {
        let map = &self.method_symbols(method_clr)?.il_map;
        let pos = map.iter().rposition(|e| e.device <= device_il)?;
        let end = map.get(pos + 1).map(|e| e.device).unwrap_or(u32::MAX);
        Some((map[pos].device, end))
    }
}

use super::BranchKind;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    /// Referenced but not defined in this module
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub kind: SymbolKind,
    pub exported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// A branch field that refers to a symbol rather than a fixed offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub symbol: SymbolId,
    pub kind: BranchKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    index: FxHashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.index.insert(symbol.name.clone(), id);
        self.symbols.push(symbol);
        id
    }

    /// Define a function at `offset`. A placeholder left by [`reference`](Self::reference)
    /// is upgraded in place; defining the same name twice returns `None`.
    pub fn define(&mut self, name: &str, offset: usize, exported: bool) -> Option<SymbolId> {
        if let Some(&id) = self.index.get(name) {
            let symbol = &mut self.symbols[id.0 as usize];
            if symbol.kind == SymbolKind::Function {
                return None;
            }
            symbol.kind = SymbolKind::Function;
            symbol.offset = offset;
            symbol.exported = exported;
            return Some(id);
        }
        Some(self.insert(Symbol {
            name: name.to_string(),
            offset,
            size: 0,
            kind: SymbolKind::Function,
            exported,
        }))
    }

    /// Look up `name`, creating an external placeholder if it is unknown.
    pub fn reference(&mut self, name: &str) -> SymbolId {
        match self.index.get(name) {
            Some(&id) => id,
            None => self.insert(Symbol {
                name: name.to_string(),
                offset: 0,
                size: 0,
                kind: SymbolKind::External,
                exported: false,
            }),
        }
    }

    pub fn set_size(&mut self, id: SymbolId, size: usize) {
        if let Some(symbol) = self.symbols.get_mut(id.0 as usize) {
            symbol.size = size;
        }
    }

    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0 as usize)
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).and_then(|&id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Symbol> {
        self.symbols.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

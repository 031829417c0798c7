//! COFF string table holding section names longer than 8 bytes.
//!
//! The table sits directly after the COFF symbol table, at
//! `PointerToSymbolTable + NumberOfSymbols * 18`. It starts with a 4-byte little-endian size
//! that *includes* the size field itself, followed by NUL-terminated strings. Section headers
//! refer to entries as `/<decimal offset>`, with offsets relative to the start of the table.

use crate::{file::parser::Parser, Result};

/// Size of one COFF symbol record.
pub const COFF_SYMBOL_SIZE: u64 = 18;

/// A loaded COFF string table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoffStringTable {
    data: Vec<u8>,
}

impl CoffStringTable {
    /// File offset of the string table described by a file header.
    ///
    /// Returns `None` when the image carries no symbol table.
    #[must_use]
    pub fn locate(pointer_to_symbol_table: u32, number_of_symbols: u32) -> Option<u64> {
        if pointer_to_symbol_table == 0 {
            return None;
        }
        Some(
            u64::from(pointer_to_symbol_table)
                + u64::from(number_of_symbols) * COFF_SYMBOL_SIZE,
        )
    }

    /// Read the table at the start of `data`.
    ///
    /// A declared size smaller than the size field itself yields an empty table.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the size field or the declared table length
    /// exceed `data`.
    pub fn read(data: &[u8]) -> Result<CoffStringTable> {
        let mut parser = Parser::new(data);
        let size = parser.peek_le::<u32>()? as usize;
        if size < 4 {
            return Ok(CoffStringTable::default());
        }

        let table = parser.read_bytes(size)?;
        Ok(CoffStringTable {
            data: table.to_vec(),
        })
    }

    /// The string starting at `offset`, up to its terminator or the end of the table.
    ///
    /// Offsets inside the size field, past the end, or pointing at invalid UTF-8 yield `None`.
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<&str> {
        if offset < 4 || offset >= self.data.len() {
            return None;
        }

        let tail = &self.data[offset..];
        let end = tail.iter().position(|&byte| byte == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Total size in bytes including the size field; zero if nothing was loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no table was loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw table bytes, size field included.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

//! Cursor-based parser over a byte slice.
//!
//! [`crate::file::parser::Parser`] decodes the fixed-layout PE structures (DOS header, file
//! header, optional header, section headers) out of the raw input. It keeps a position within a
//! borrowed slice and offers bounds-checked little-endian reads.
//!
//! The parser works in *file offset* space only. Reads in virtual (RVA) space go through
//! [`crate::VirtualStream`] instead, which resolves addresses through the section table.
//!
//! # Usage Examples
//!
//! ```rust
//! use peimage::Parser;
//!
//! let data = [0x4D, 0x5A, 0x90, 0x00];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_le::<u16>()?, 0x5A4D);
//! assert_eq!(parser.pos(), 2);
//! assert!(parser.try_read_le::<u32>().is_none());
//! # Ok::<(), peimage::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, PeIO},
    Result,
};

/// A binary data parser for reading little-endian PE structures.
///
/// The parser maintains an internal position cursor and provides bounds checking
/// to prevent buffer overruns when reading malformed or truncated data. Besides the
/// hard reads returning [`crate::Result`], it offers soft `try_` reads that return `None`
/// on truncation, for fields the loader can tolerate missing.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    ///
    /// # Arguments
    /// * `data` - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Returns the number of bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the current position to the specified index.
    ///
    /// Seeking to exactly the end of the data is allowed; any read from there fails.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if position is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by the specified number of bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing by step would exceed the data length.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        match self.position.checked_add(step) {
            Some(end) if end <= self.data.len() => {
                self.position = end;
                Ok(())
            }
            _ => Err(out_of_bounds_error!()),
        }
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Get access to the underlying data buffer.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Peek at a value of type `T` without advancing the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading `T` would exceed the data length.
    pub fn peek_le<T: PeIO>(&self) -> Result<T> {
        let mut temp_position = self.position;
        read_le_at::<T>(self.data, &mut temp_position)
    }

    /// Read a value of type `T` in little-endian format and advance past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading `T` would exceed the data length.
    pub fn read_le<T: PeIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Soft variant of [`Parser::read_le`].
    ///
    /// Returns `None` when fewer than `size_of::<T>()` bytes remain. The position is only
    /// advanced on success.
    pub fn try_read_le<T: PeIO>(&mut self) -> Option<T> {
        read_le_at::<T>(self.data, &mut self.position).ok()
    }

    /// Read `len` raw bytes and advance past them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.position;
        self.advance_by(len)?;
        Ok(&self.data[start..self.position])
    }

    /// Read a fixed-size byte array and advance past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `N` bytes remain.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.read_le::<u32>().unwrap(), 0x0403_0201);
        assert_eq!(parser.remaining(), 4);
        assert_eq!(parser.peek_le::<u16>().unwrap(), 0x0605);
        assert_eq!(parser.pos(), 4);
        assert_eq!(parser.read_bytes(2).unwrap(), &[0x05, 0x06]);
        assert_eq!(parser.read_array::<2>().unwrap(), [0x07, 0x08]);
        assert!(!parser.has_more_data());
    }

    #[test]
    fn soft_reads_do_not_advance_on_failure() {
        let data = [0xAA, 0xBB, 0xCC];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.try_read_le::<u16>(), Some(0xBBAA));
        assert_eq!(parser.try_read_le::<u16>(), None);
        assert_eq!(parser.pos(), 2);
        assert_eq!(parser.try_read_le::<u8>(), Some(0xCC));
    }

    #[test]
    fn seek_and_advance_bounds() {
        let data = [0u8; 4];
        let mut parser = Parser::new(&data);

        assert!(parser.seek(4).is_ok());
        assert!(parser.read_le::<u8>().is_err());
        assert!(parser.seek(5).is_err());

        parser.seek(0).unwrap();
        assert!(parser.advance_by(usize::MAX).is_err());
        assert!(parser.advance_by(4).is_ok());
        assert!(parser.read_bytes(1).is_err());
    }

    #[test]
    fn empty_parser() {
        let parser = Parser::new(&[]);
        assert!(parser.is_empty());
        assert_eq!(parser.len(), 0);
        assert!(parser.peek_le::<u8>().is_err());
    }
}

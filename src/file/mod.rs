//! Input sources and low-level byte access.
//!
//! This module abstracts over where the bytes of a PE image come from and how long the
//! underlying resource lives. The loader and the overlay operations never touch files or
//! buffers directly; they route every acquisition through [`crate::file::Source`].
//!
//! # Key Components
//!
//! - [`crate::file::Backend`] - Read-only, bounds-checked view over a contiguous byte source
//! - [`crate::file::Storage`] - Mutable raw-file operations needed by overlay management
//! - [`crate::file::Source`] - The dual-mode source: scoped disk access vs. persistent mapping
//! - [`crate::file::SourceKind`] - `Disk` (raw file layout) or `MappedMemory` (virtual layout)
//! - [`crate::file::parser::Parser`] - Cursor over a byte slice for fixed header decoding
//! - [`crate::file::io`] - Little-endian scalar helpers
//!
//! # Resource lifetimes
//!
//! | Variant              | Kind           | Lifetime of the resource                     |
//! |----------------------|----------------|----------------------------------------------|
//! | [`Source::File`]     | `Disk`         | opened per operation, closed on every exit   |
//! | [`Source::Buffer`]   | `Disk`         | owned buffer, lives with the image           |
//! | [`Source::Mapped`]   | `MappedMemory` | persistent backend, freed at image teardown  |
//!
//! Disk sources describe the raw on-disk layout (file offsets). Mapped sources describe an image
//! that has already been laid out in memory, where an RVA *is* the offset into the backend.

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::{
    fs::{self, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{Error::MappedImage, Result};
pub use memory::Memory;
pub use physical::Physical;

/// Backend for a contiguous, read-only byte source.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Get a slice of the data, bounds-checked.
    ///
    /// # Arguments
    /// * `offset` - The offset of the slice start
    /// * `len` - The length of the slice
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset + len` exceeds the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the complete data of this backend
    fn data(&self) -> &[u8];

    /// Returns the total length of the data
    fn len(&self) -> usize;
}

/// Mutable raw-file operations used when the overlay is trimmed or replaced.
pub trait Storage {
    /// Current size of the storage in bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the size cannot be queried.
    fn size(&self) -> Result<u64>;

    /// Shrink the storage to `size` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] on I/O failure.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Append `data` at the current end of the storage.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] on I/O failure.
    fn append(&mut self, data: &[u8]) -> Result<()>;
}

impl Storage for fs::File {
    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.set_len(size)?;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.seek(SeekFrom::End(0))?;
        self.write_all(data)?;
        self.flush()?;
        Ok(())
    }
}

/// Layout of the bytes a [`Source`] provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Raw file layout; sections are found at their raw file offsets.
    #[default]
    Disk,
    /// Loaded image layout; sections are found at their RVAs.
    MappedMemory,
}

/// Where an [`crate::Image`] reads its bytes from.
///
/// Core code never assumes a resource lifetime: reads go through [`Source::with_backend`] and
/// raw-file mutations through [`Source::with_storage`], which open and release per call for
/// [`Source::File`] and reuse the held resource otherwise.
#[derive(Debug)]
pub enum Source {
    /// A PE file on disk. Every operation opens a fresh handle and closes it before returning.
    File(PathBuf),
    /// A raw PE file already held in memory (disk layout).
    Buffer(Memory),
    /// A memory-mapped image (virtual layout), held for the lifetime of the image.
    Mapped(Box<dyn Backend>),
}

impl Source {
    /// Disk source for the file at `path`.
    pub fn file(path: impl AsRef<Path>) -> Source {
        Source::File(path.as_ref().to_path_buf())
    }

    /// Disk-layout source over an in-memory copy of a PE file.
    pub fn buffer(data: Vec<u8>) -> Source {
        Source::Buffer(Memory::new(data))
    }

    /// Mapped-layout source over an in-memory image dump.
    pub fn mapped(data: Vec<u8>) -> Source {
        Source::Mapped(Box::new(Memory::new(data)))
    }

    /// Mapped-layout source over an image dump on disk; the mapping stays open until the
    /// source is dropped.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the dump cannot be opened or mapped.
    pub fn mapped_file(path: impl AsRef<Path>) -> Result<Source> {
        Ok(Source::Mapped(Box::new(Physical::new(path)?)))
    }

    /// The layout of the bytes this source provides.
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::File(_) | Source::Buffer(_) => SourceKind::Disk,
            Source::Mapped(_) => SourceKind::MappedMemory,
        }
    }

    /// Run `f` against a read-only view of the source.
    ///
    /// For [`Source::File`] the file is mapped for the duration of the call only.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, or whatever `f` returns.
    pub fn with_backend<T>(&self, f: impl FnOnce(&dyn Backend) -> Result<T>) -> Result<T> {
        match self {
            Source::File(path) => {
                let physical = Physical::new(path)?;
                f(&physical)
            }
            Source::Buffer(memory) => f(memory),
            Source::Mapped(backend) => f(backend.as_ref()),
        }
    }

    /// Run `f` against the mutable raw storage of the source.
    ///
    /// # Errors
    /// Returns [`crate::Error::MappedImage`] for mapped sources, which have no raw file to
    /// edit, an I/O error if the file cannot be opened for writing, or whatever `f` returns.
    pub fn with_storage<T>(&mut self, f: impl FnOnce(&mut dyn Storage) -> Result<T>) -> Result<T> {
        match self {
            Source::File(path) => {
                let mut file = OpenOptions::new().read(true).write(true).open(path)?;
                f(&mut file)
            }
            Source::Buffer(memory) => f(memory),
            Source::Mapped(_) => Err(MappedImage),
        }
    }

    /// Current length of the source in bytes.
    ///
    /// # Errors
    /// Returns an I/O error if the file size cannot be queried.
    pub fn len(&self) -> Result<u64> {
        match self {
            Source::File(path) => Ok(fs::metadata(path)?.len()),
            Source::Buffer(memory) => Ok(memory.len() as u64),
            Source::Mapped(backend) => Ok(backend.len() as u64),
        }
    }

    /// Path of the underlying file, for [`Source::File`] only.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Source::File(path) => Some(path),
            _ => None,
        }
    }
}

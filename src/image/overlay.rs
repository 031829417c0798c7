//! Overlay handling.
//!
//! The overlay is everything in the raw file past the end of the last section that carries
//! raw data (nonzero `PointerToRawData` *and* `SizeOfRawData`). Installers, self-extracting
//! archives and Authenticode signatures live here. Mapped images have no overlay.
//!
//! Mutating operations go through [`crate::Source::with_storage`], so a disk file is opened for
//! the duration of one call and an in-memory buffer is edited in place. Preconditions are
//! checked before the storage is touched; a rejected call leaves the file unchanged.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use crate::{
    diagnostics::DiagnosticCategory,
    file::{Source, SourceKind},
    Error::{Empty, MappedImage},
    Image, Result,
};

/// Location of the overlay in the raw file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlay {
    /// File offset of the first overlay byte
    pub offset: u64,
    /// Number of overlay bytes
    pub size: u64,
}

impl Image {
    /// The overlay of a disk-sourced image, if there is one.
    #[must_use]
    pub fn overlay(&self) -> Option<Overlay> {
        if self.kind == SourceKind::MappedMemory {
            return None;
        }

        let offset = self.sections.last_with_raw_data()?.raw_end();
        if offset >= self.file_size {
            return None;
        }

        Some(Overlay {
            offset,
            size: self.file_size - offset,
        })
    }

    /// Read the overlay bytes; empty if there is no overlay.
    ///
    /// # Errors
    /// Returns an error if the source cannot be read.
    pub fn overlay_data(&self) -> Result<Vec<u8>> {
        let Some(overlay) = self.overlay() else {
            return Ok(Vec::new());
        };

        let source = self.source.as_ref().ok_or(Empty)?;
        source.with_backend(|backend| {
            let offset = usize::try_from(overlay.offset).map_err(|_| out_of_bounds_error!())?;
            let size = usize::try_from(overlay.size).map_err(|_| out_of_bounds_error!())?;
            Ok(backend.data_slice(offset, size)?.to_vec())
        })
    }

    /// Truncate the file to drop the overlay.
    ///
    /// Succeeds without touching the file when there is no overlay.
    ///
    /// # Errors
    /// Returns [`crate::Error::MappedImage`] for mapped images, or an I/O error.
    pub fn remove_overlay(&mut self) -> Result<()> {
        if self.kind == SourceKind::MappedMemory {
            return Err(MappedImage);
        }

        let Some(overlay) = self.overlay() else {
            return Ok(());
        };

        let source = self.source.as_mut().ok_or(Empty)?;
        self.file_size = source.with_storage(|storage| {
            storage.truncate(overlay.offset)?;
            storage.size()
        })?;
        self.diagnostics.info(
            DiagnosticCategory::Overlay,
            format!("Removed 0x{:X} overlay bytes at 0x{:X}", overlay.size, overlay.offset),
        );
        Ok(())
    }

    /// Replace the overlay with `size` bytes at `offset` of the file at `path`.
    ///
    /// `offset == 0 && size == 0` takes the whole file.
    ///
    /// # Errors
    /// Returns [`crate::Error::MappedImage`] for mapped images,
    /// [`crate::Error::OutOfBounds`] if the range exceeds the file at `path` (before anything
    /// is modified), or an I/O error.
    pub fn load_overlay_from_file(&mut self, path: impl AsRef<Path>, offset: u64, size: u64) -> Result<()> {
        if self.kind == SourceKind::MappedMemory {
            return Err(MappedImage);
        }

        let data = Source::file(path).with_backend(|backend| {
            if offset == 0 && size == 0 {
                return Ok(backend.data().to_vec());
            }

            let offset = usize::try_from(offset).map_err(|_| out_of_bounds_error!())?;
            let size = usize::try_from(size).map_err(|_| out_of_bounds_error!())?;
            Ok(backend.data_slice(offset, size)?.to_vec())
        })?;

        self.remove_overlay()?;

        let source = self.source.as_mut().ok_or(Empty)?;
        self.file_size = source.with_storage(|storage| {
            storage.append(&data)?;
            storage.size()
        })?;
        Ok(())
    }

    /// Write the overlay bytes to `path`, appending to an existing file or replacing it.
    ///
    /// Does nothing when there is no overlay.
    ///
    /// # Errors
    /// Returns an I/O error if the source cannot be read or `path` cannot be written.
    pub fn save_overlay_to_file(&self, path: impl AsRef<Path>, append: bool) -> Result<()> {
        let data = self.overlay_data()?;
        if data.is_empty() {
            return Ok(());
        }

        let mut file = if append {
            OpenOptions::new().create(true).append(true).open(path)?
        } else {
            fs::File::create(path)?
        };
        file.write_all(&data)?;
        file.flush()?;
        Ok(())
    }
}

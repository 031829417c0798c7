//! Cursor-based access to the virtual address space of an image.
//!
//! A [`VirtualStream`] borrows an [`Image`] mutably and carries one RVA cursor. Every read and
//! write resolves the cursor through the section table into the backing buffer of the section
//! that covers it, so callers address data by RVA and never by file offset.
//!
//! # Failure modes
//!
//! - [`VirtualStream::read`] and [`VirtualStream::write`] are soft: at an unmapped cursor they
//!   transfer nothing and return 0.
//! - `read_le`, `read_native` and `write_le` are hard and return
//!   [`crate::Error::OutOfBounds`] when fewer bytes than requested are available.
//! - `try_read_le` and `try_read_native` are the soft counterparts returning `None`.
//!
//! # Cursor advance near a section tail
//!
//! A bulk read or write at a mapped cursor advances the cursor by the *requested* count, even
//! when the backing buffer ends earlier and fewer bytes were transferred. Callers that read
//! fixed-size structures are expected to only request sizes they have validated; code that
//! needs the exact transfer size must use the returned count. The bytes of the destination
//! buffer past the transferred count are zeroed.
//!
//! # Examples
//!
//! ```rust,no_run
//! use peimage::Image;
//!
//! let mut image = Image::from_file("sample.exe")?;
//! let mut stream = image.stream();
//!
//! if stream.seek_va(0x40_2000) {
//!     let pointer = stream.read_native()?;
//!     let name = stream.read_ansi_string();
//!     println!("0x{pointer:X} {}", String::from_utf8_lossy(&name));
//! }
//! # Ok::<(), peimage::Error>(())
//! ```

use widestring::U16String;

use crate::{
    file::io::{read_le, write_le, PeIO},
    image::{headers::ImageBits, translate::MemoryLocation},
    Error::NotSupported,
    Image, Result,
};

/// An RVA cursor over an image's section buffers.
#[derive(Debug)]
pub struct VirtualStream<'a> {
    image: &'a mut Image,
    rva: u32,
}

impl<'a> VirtualStream<'a> {
    /// Create a stream over `image` with the cursor at RVA 0.
    pub fn new(image: &'a mut Image) -> Self {
        VirtualStream { image, rva: 0 }
    }

    /// The current cursor.
    #[must_use]
    pub fn rva(&self) -> u32 {
        self.rva
    }

    /// The current cursor as a virtual address.
    #[must_use]
    pub fn va(&self) -> u64 {
        self.image.rva_to_va(self.rva)
    }

    /// The image this stream reads from.
    #[must_use]
    pub fn image(&self) -> &Image {
        self.image
    }

    /// Whether the cursor points into a loaded section buffer.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.image.rva_to_memory(self.rva).is_some()
    }

    /// Move the cursor to `rva` if a section covers it.
    ///
    /// Returns `false` and leaves the cursor unchanged otherwise.
    pub fn seek_rva(&mut self, rva: u32) -> bool {
        if self.image.rva_to_section(rva).is_none() {
            return false;
        }

        self.rva = rva;
        true
    }

    /// Move the cursor to the RVA of `va`; see [`VirtualStream::seek_rva`].
    pub fn seek_va(&mut self, va: u64) -> bool {
        let rva = self.image.va_to_rva(va);
        self.seek_rva(rva)
    }

    /// Move the cursor by a signed delta without any I/O.
    #[allow(clippy::cast_possible_truncation)]
    pub fn skip(&mut self, delta: i64) {
        self.rva = i64::from(self.rva).wrapping_add(delta) as u32;
    }

    fn advance(&mut self, count: usize) {
        #[allow(clippy::cast_possible_truncation)]
        let count = count as u32;
        self.rva = self.rva.wrapping_add(count);
    }

    fn locate(&self) -> Option<MemoryLocation> {
        self.image.rva_to_memory(self.rva)
    }

    /// Copy up to `buffer.len()` bytes from the cursor into `buffer`.
    ///
    /// Returns the number of bytes copied; the rest of `buffer` is zeroed. At a mapped cursor
    /// the cursor advances by `buffer.len()`, at an unmapped one nothing happens and 0 is
    /// returned.
    pub fn read(&mut self, buffer: &mut [u8]) -> usize {
        let Some(location) = self.locate() else {
            return 0;
        };

        let copied = self
            .image
            .sections()
            .get(location.section)
            .and_then(|section| section.data())
            .map_or(0, |data| {
                let available = &data[location.offset..];
                let copied = available.len().min(buffer.len());
                buffer[..copied].copy_from_slice(&available[..copied]);
                copied
            });

        buffer[copied..].fill(0);
        self.advance(buffer.len());
        copied
    }

    /// Read exactly `buffer.len()` bytes; `false` if fewer were available.
    pub fn read_exact(&mut self, buffer: &mut [u8]) -> bool {
        self.read(buffer) == buffer.len()
    }

    /// Read `len` bytes into a new vector, truncated to what was available.
    pub fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; len];
        let copied = self.read(&mut buffer);
        buffer.truncate(copied);
        buffer
    }

    /// Copy `buffer` into the section buffer at the cursor.
    ///
    /// Returns the number of bytes written, which is short when the section buffer ends early.
    /// Cursor movement follows [`VirtualStream::read`].
    pub fn write(&mut self, buffer: &[u8]) -> usize {
        let Some(location) = self.locate() else {
            return 0;
        };

        let written = self
            .image
            .sections_mut()
            .get_mut(location.section)
            .and_then(|section| section.data_mut())
            .map_or(0, |data| {
                let available = &mut data[location.offset..];
                let written = available.len().min(buffer.len());
                available[..written].copy_from_slice(&buffer[..written]);
                written
            });

        self.advance(buffer.len());
        written
    }

    /// Read a little-endian scalar.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes were
    /// available at the cursor.
    pub fn read_le<T: PeIO>(&mut self) -> Result<T> {
        let mut buffer = [0u8; 8];
        let size = std::mem::size_of::<T>();
        if !self.read_exact(&mut buffer[..size]) {
            return Err(out_of_bounds_error!());
        }

        read_le::<T>(&buffer[..size])
    }

    /// Soft variant of [`VirtualStream::read_le`].
    pub fn try_read_le<T: PeIO>(&mut self) -> Option<T> {
        self.read_le::<T>().ok()
    }

    /// Read a pointer-sized value: 4 bytes for PE32, 8 for PE32+, widened to `u64`.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] when the image width is unknown, and
    /// [`crate::Error::OutOfBounds`] on a short read.
    pub fn read_native(&mut self) -> Result<u64> {
        match self.image.bits() {
            ImageBits::Bits32 => self.read_le::<u32>().map(u64::from),
            ImageBits::Bits64 => self.read_le::<u64>(),
            ImageBits::Unknown => Err(NotSupported),
        }
    }

    /// Soft variant of [`VirtualStream::read_native`].
    pub fn try_read_native(&mut self) -> Option<u64> {
        self.read_native().ok()
    }

    /// Write a little-endian scalar.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value did not fit completely.
    pub fn write_le<T: PeIO>(&mut self, value: T) -> Result<()> {
        let mut buffer = [0u8; 8];
        let size = std::mem::size_of::<T>();
        write_le(&mut buffer[..size], value)?;

        if self.write(&buffer[..size]) != size {
            return Err(out_of_bounds_error!());
        }
        Ok(())
    }

    /// Read bytes up to a NUL terminator or the end of the mapped space.
    ///
    /// The terminator is consumed but not returned.
    pub fn read_ansi_string(&mut self) -> Vec<u8> {
        let mut string = Vec::new();
        while let Ok(byte) = self.read_le::<u8>() {
            if byte == 0 {
                break;
            }
            string.push(byte);
        }
        string
    }

    /// Read a UTF-16 string prefixed with its length in code units.
    ///
    /// Units past the end of the mapped space read as zero.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the length prefix cannot be read.
    pub fn read_unicode_string(&mut self) -> Result<U16String> {
        let length = usize::from(self.read_le::<u16>()?);

        let mut buffer = vec![0u8; length * 2];
        self.read(&mut buffer);

        let units: Vec<u16> = buffer
            .chunks_exact(2)
            .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
            .collect();
        Ok(U16String::from_vec(units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::PeBuilder;

    fn image(bits: u16) -> Image {
        let mut data = vec![0u8; 0x40];
        data[0..4].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        data[4..8].copy_from_slice(&0x0BAD_F00D_u32.to_le_bytes());
        data[0x10..0x16].copy_from_slice(b"hello\0");
        data[0x20..0x22].copy_from_slice(&3u16.to_le_bytes());
        data[0x22..0x28].copy_from_slice(&[b'a', 0, b'b', 0, b'c', 0]);

        let builder = match bits {
            64 => PeBuilder::pe64(),
            32 => PeBuilder::pe32(),
            _ => PeBuilder::pe32().magic(0x0107),
        };
        Image::from_mem(builder.section_with_data(".data", 0x1000, 0x80, &data).build()).unwrap()
    }

    #[test]
    fn seek() {
        let mut image = image(32);
        let mut stream = image.stream();

        assert!(stream.seek_rva(0x1000));
        assert_eq!(stream.rva(), 0x1000);
        assert_eq!(stream.va(), 0x40_1000);

        assert!(!stream.seek_rva(0x5000));
        assert_eq!(stream.rva(), 0x1000);

        assert!(stream.seek_va(0x40_1010));
        assert_eq!(stream.rva(), 0x1010);
        assert!(!stream.seek_va(0x1000));

        stream.skip(-0x10);
        assert_eq!(stream.rva(), 0x1000);
        stream.skip(4);
        assert_eq!(stream.rva(), 0x1004);
    }

    #[test]
    fn scalars() {
        let mut image = image(32);
        let mut stream = image.stream();
        assert!(stream.seek_rva(0x1000));

        assert_eq!(stream.read_le::<u32>().unwrap(), 0xDEAD_BEEF);
        assert_eq!(stream.read_le::<u16>().unwrap(), 0xF00D);
        assert_eq!(stream.try_read_le::<u16>(), Some(0x0BAD));
        assert_eq!(stream.rva(), 0x1008);
    }

    #[test]
    fn native_width() {
        let mut image32 = image(32);
        let mut stream = image32.stream();
        assert!(stream.seek_rva(0x1000));
        assert_eq!(stream.read_native().unwrap(), 0xDEAD_BEEF);
        assert_eq!(stream.rva(), 0x1004);

        let mut image64 = image(64);
        let mut stream = image64.stream();
        assert!(stream.seek_rva(0x1000));
        assert_eq!(stream.read_native().unwrap(), 0x0BAD_F00D_DEAD_BEEF);
        assert_eq!(stream.rva(), 0x1008);

        let mut unknown = image(0);
        let mut stream = unknown.stream();
        assert!(stream.seek_rva(0x1000));
        assert!(matches!(stream.read_native(), Err(crate::Error::NotSupported)));
        assert_eq!(stream.try_read_native(), None);
        assert_eq!(stream.rva(), 0x1000);
    }

    #[test]
    fn strings() {
        let mut image = image(32);
        let mut stream = image.stream();

        assert!(stream.seek_rva(0x1010));
        assert_eq!(stream.read_ansi_string(), b"hello");
        assert_eq!(stream.rva(), 0x1016);

        assert!(stream.seek_rva(0x1020));
        assert_eq!(stream.read_unicode_string().unwrap().to_string_lossy(), "abc");
        assert_eq!(stream.rva(), 0x1028);

        // Zero-filled tail past the raw data
        assert!(stream.seek_rva(0x1050));
        assert_eq!(stream.read_ansi_string(), Vec::<u8>::new());
        assert_eq!(stream.rva(), 0x1051);

        // Unterminated at the end of the section
        assert!(stream.seek_rva(0x107D));
        assert_eq!(stream.write(b"xyz"), 3);
        assert!(stream.seek_rva(0x107D));
        assert_eq!(stream.read_ansi_string(), b"xyz");
        assert_eq!(stream.rva(), 0x1080);
    }

    #[test]
    fn tail_reads_advance_by_request() {
        let mut image = image(32);
        let mut stream = image.stream();

        assert!(stream.seek_rva(0x107C));
        let mut buffer = [0xFFu8; 8];
        assert_eq!(stream.read(&mut buffer), 4);
        assert_eq!(&buffer[4..], &[0, 0, 0, 0]);
        assert_eq!(stream.rva(), 0x1084);

        assert!(stream.seek_rva(0x107C));
        assert!(stream.read_le::<u64>().is_err());
        assert!(stream.seek_rva(0x107E));
        assert!(stream.write_le(0x1122_3344_u32).is_err());

        // The raw data ends at 0x1040, the zero-filled tail keeps going
        assert!(stream.seek_rva(0x103C));
        assert_eq!(stream.read_le::<u64>().unwrap(), 0);
    }

    #[test]
    fn unmapped_cursor() {
        let mut image = image(32);
        let mut stream = image.stream();

        assert!(!stream.is_mapped());
        let mut buffer = [0u8; 4];
        assert_eq!(stream.read(&mut buffer), 0);
        assert_eq!(stream.write(&[1, 2, 3, 4]), 0);
        assert!(!stream.read_exact(&mut buffer));
        assert_eq!(stream.rva(), 0);
        assert!(stream.read_le::<u32>().is_err());
    }

    #[test]
    fn write_round_trip() {
        let mut image = image(32);
        let mut stream = image.stream();

        assert!(stream.seek_rva(0x1030));
        stream.write_le(0xCAFE_u16).unwrap();
        assert_eq!(stream.write(&[0xAA, 0xBB]), 2);
        assert_eq!(stream.rva(), 0x1034);

        assert!(stream.seek_rva(0x1030));
        assert_eq!(stream.read_bytes(4), vec![0xFE, 0xCA, 0xAA, 0xBB]);
        assert_eq!(image.read_bytes_at(0x1030, 2), vec![0xFE, 0xCA]);
    }
}

//! Fixed-layout PE headers.
//!
//! Plain decoders for the structures that precede the section data: the DOS header, the COFF
//! file header, the (32- or 64-bit) optional header and the data-directory table. They operate
//! on byte slices in file-offset space through [`crate::Parser`]; all orchestration (where to
//! read, what to do on failure) lives in [`crate::image::loader`].
//!
//! The file header and the data-directory entries reuse goblin's plain structs
//! ([`goblin::pe::header::CoffHeader`], [`goblin::pe::data_directories::DataDirectory`]); the
//! DOS and optional headers are modelled locally because the image needs the raw DOS bytes for
//! round-tripping and a single widened optional-header type for both bit-widths.

use goblin::pe::{
    data_directories::DataDirectory,
    header::{CoffHeader, DOS_MAGIC},
    optional_header::{MAGIC_32, MAGIC_64},
};

use crate::{file::parser::Parser, Error::InvalidDosSignature, Result};

/// Size of the DOS header (`IMAGE_DOS_HEADER`).
pub const DOS_HEADER_SIZE: usize = 64;
/// Offset of `e_lfanew` within the DOS header.
pub const DOS_LFANEW_OFFSET: usize = 0x3C;
/// Size of the `PE\0\0` signature.
pub const PE_SIGNATURE_SIZE: usize = 4;
/// Size of the COFF file header.
pub const FILE_HEADER_SIZE: usize = 20;
/// Size of a single data-directory entry.
pub const DATA_DIRECTORY_SIZE: usize = 8;
/// Size of the PE32 optional header, without data directories.
pub const OPTIONAL_HEADER32_SIZE: usize = 96;
/// Size of the PE32+ optional header, without data directories.
pub const OPTIONAL_HEADER64_SIZE: usize = 112;

/// Bit-width of an image, selected by the optional-header magic.
///
/// The width decides the size of every pointer-sized field: image base, stack and heap
/// reserve/commit sizes, and the native-width reads of [`crate::VirtualStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageBits {
    /// PE32 (`0x10B`)
    Bits32,
    /// PE32+ (`0x20B`)
    Bits64,
    /// Any other magic, or no optional header decoded yet.
    #[default]
    Unknown,
}

impl ImageBits {
    /// Map an optional-header magic to a bit-width.
    #[must_use]
    pub fn from_magic(magic: u16) -> ImageBits {
        match magic {
            MAGIC_32 => ImageBits::Bits32,
            MAGIC_64 => ImageBits::Bits64,
            _ => ImageBits::Unknown,
        }
    }

    /// Byte size of a pointer-sized field, `None` when the width is unknown.
    #[must_use]
    pub fn native_size(self) -> Option<usize> {
        match self {
            ImageBits::Bits32 => Some(4),
            ImageBits::Bits64 => Some(8),
            ImageBits::Unknown => None,
        }
    }

    /// Size of the fixed optional-header body for this width.
    #[must_use]
    pub fn optional_header_size(self) -> Option<usize> {
        match self {
            ImageBits::Bits32 => Some(OPTIONAL_HEADER32_SIZE),
            ImageBits::Bits64 => Some(OPTIONAL_HEADER64_SIZE),
            ImageBits::Unknown => None,
        }
    }
}

/// The MS-DOS header at the very start of the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DosHeader {
    /// `e_magic`, `MZ` for valid images
    pub magic: u16,
    /// `e_lfanew`, file offset of the PE signature
    pub lfanew: u32,
    /// The complete 64 header bytes, kept verbatim for re-serialisation
    pub raw: Vec<u8>,
}

impl DosHeader {
    /// Decode the DOS header from the start of `data` and verify its magic.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 64 bytes are available and
    /// [`crate::Error::InvalidDosSignature`] if the magic is not `MZ`.
    pub fn read(data: &[u8]) -> Result<DosHeader> {
        let mut parser = Parser::new(data);
        let raw = parser.read_bytes(DOS_HEADER_SIZE)?;

        let magic = Parser::new(raw).read_le::<u16>()?;
        if magic != DOS_MAGIC {
            return Err(InvalidDosSignature(magic));
        }

        let mut parser = Parser::new(raw);
        parser.seek(DOS_LFANEW_OFFSET)?;
        let lfanew = parser.read_le::<u32>()?;

        Ok(DosHeader {
            magic,
            lfanew,
            raw: raw.to_vec(),
        })
    }
}

/// Decode the 20-byte COFF file header at the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the header is truncated.
pub fn read_file_header(data: &[u8]) -> Result<CoffHeader> {
    let mut parser = Parser::new(data);

    Ok(CoffHeader {
        machine: parser.read_le::<u16>()?,
        number_of_sections: parser.read_le::<u16>()?,
        time_date_stamp: parser.read_le::<u32>()?,
        pointer_to_symbol_table: parser.read_le::<u32>()?,
        number_of_symbol_table: parser.read_le::<u32>()?,
        size_of_optional_header: parser.read_le::<u16>()?,
        characteristics: parser.read_le::<u16>()?,
    })
}

/// The optional header, with pointer-sized fields widened to `u64`.
///
/// `base_of_data` only exists in PE32 images and stays zero for PE32+.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OptionalHeader {
    /// Magic selecting the layout (`0x10B`, `0x20B`)
    pub magic: u16,
    /// Bit-width derived from `magic`
    pub bits: ImageBits,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

impl OptionalHeader {
    /// Read only the magic at the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not even two bytes are available.
    pub fn peek_magic(data: &[u8]) -> Result<u16> {
        Parser::new(data).peek_le::<u16>()
    }

    /// Decode the optional header at the start of `data`.
    ///
    /// The magic is mandatory. The body is read softly: decoding stops at the first field that
    /// does not fit, leaving that and all later fields zero. The returned flag tells whether
    /// the complete body was present. For an unknown magic only `magic` and `bits` are set.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the magic cannot be read.
    pub fn read(data: &[u8]) -> Result<(OptionalHeader, bool)> {
        let mut parser = Parser::new(data);
        let magic = parser.read_le::<u16>()?;

        let mut header = OptionalHeader {
            magic,
            bits: ImageBits::from_magic(magic),
            ..OptionalHeader::default()
        };

        if header.bits == ImageBits::Unknown {
            return Ok((header, false));
        }

        let complete = header.read_body(&mut parser).is_some();
        Ok((header, complete))
    }

    fn read_body(&mut self, parser: &mut Parser) -> Option<()> {
        self.major_linker_version = parser.try_read_le()?;
        self.minor_linker_version = parser.try_read_le()?;
        self.size_of_code = parser.try_read_le()?;
        self.size_of_initialized_data = parser.try_read_le()?;
        self.size_of_uninitialized_data = parser.try_read_le()?;
        self.address_of_entry_point = parser.try_read_le()?;
        self.base_of_code = parser.try_read_le()?;
        if self.bits == ImageBits::Bits32 {
            self.base_of_data = parser.try_read_le()?;
        }
        self.image_base = self.read_native(parser)?;
        self.section_alignment = parser.try_read_le()?;
        self.file_alignment = parser.try_read_le()?;
        self.major_operating_system_version = parser.try_read_le()?;
        self.minor_operating_system_version = parser.try_read_le()?;
        self.major_image_version = parser.try_read_le()?;
        self.minor_image_version = parser.try_read_le()?;
        self.major_subsystem_version = parser.try_read_le()?;
        self.minor_subsystem_version = parser.try_read_le()?;
        self.win32_version_value = parser.try_read_le()?;
        self.size_of_image = parser.try_read_le()?;
        self.size_of_headers = parser.try_read_le()?;
        self.check_sum = parser.try_read_le()?;
        self.subsystem = parser.try_read_le()?;
        self.dll_characteristics = parser.try_read_le()?;
        self.size_of_stack_reserve = self.read_native(parser)?;
        self.size_of_stack_commit = self.read_native(parser)?;
        self.size_of_heap_reserve = self.read_native(parser)?;
        self.size_of_heap_commit = self.read_native(parser)?;
        self.loader_flags = parser.try_read_le()?;
        self.number_of_rva_and_sizes = parser.try_read_le()?;
        Some(())
    }

    fn read_native(&self, parser: &mut Parser) -> Option<u64> {
        match self.bits {
            ImageBits::Bits32 => parser.try_read_le::<u32>().map(u64::from),
            ImageBits::Bits64 => parser.try_read_le::<u64>(),
            ImageBits::Unknown => None,
        }
    }
}

/// Decode up to `count` data-directory entries from the start of `data`.
///
/// Stops early if `data` runs out; the caller clamps `count` beforehand.
#[must_use]
pub fn read_data_directories(data: &[u8], count: usize) -> Vec<DataDirectory> {
    let mut parser = Parser::new(data);
    let mut directories = Vec::with_capacity(count.min(parser.remaining() / DATA_DIRECTORY_SIZE));

    for _ in 0..count {
        let (Some(virtual_address), Some(size)) =
            (parser.try_read_le::<u32>(), parser.try_read_le::<u32>())
        else {
            break;
        };

        directories.push(DataDirectory {
            virtual_address,
            size,
        });
    }

    directories
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dos_header(lfanew: u32) -> Vec<u8> {
        let mut data = vec![0u8; DOS_HEADER_SIZE];
        data[0..2].copy_from_slice(b"MZ");
        data[DOS_LFANEW_OFFSET..DOS_LFANEW_OFFSET + 4].copy_from_slice(&lfanew.to_le_bytes());
        data
    }

    #[test]
    fn dos_header_valid() {
        let header = DosHeader::read(&dos_header(0x80)).unwrap();
        assert_eq!(header.magic, 0x5A4D);
        assert_eq!(header.lfanew, 0x80);
        assert_eq!(header.raw.len(), DOS_HEADER_SIZE);
    }

    #[test]
    fn dos_header_invalid() {
        let mut data = dos_header(0x80);
        data[0] = b'X';
        assert!(matches!(
            DosHeader::read(&data),
            Err(crate::Error::InvalidDosSignature(0x5A58))
        ));

        assert!(matches!(
            DosHeader::read(&data[..32]),
            Err(crate::Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn file_header() {
        #[rustfmt::skip]
        let data = [
            0x4C, 0x01,             // machine = i386
            0x03, 0x00,             // number_of_sections = 3
            0x78, 0x56, 0x34, 0x12, // time_date_stamp
            0x00, 0x10, 0x00, 0x00, // pointer_to_symbol_table
            0x02, 0x00, 0x00, 0x00, // number_of_symbol_table
            0xE0, 0x00,             // size_of_optional_header
            0x02, 0x21,             // characteristics
        ];

        let header = read_file_header(&data).unwrap();
        assert_eq!(header.machine, 0x014C);
        assert_eq!(header.number_of_sections, 3);
        assert_eq!(header.time_date_stamp, 0x1234_5678);
        assert_eq!(header.pointer_to_symbol_table, 0x1000);
        assert_eq!(header.number_of_symbol_table, 2);
        assert_eq!(header.size_of_optional_header, 0xE0);
        assert_eq!(header.characteristics, 0x2102);

        assert!(read_file_header(&data[..19]).is_err());
    }

    #[test]
    fn optional_header_pe32() {
        let mut data = vec![0u8; OPTIONAL_HEADER32_SIZE];
        data[0..2].copy_from_slice(&0x10B_u16.to_le_bytes());
        data[16..20].copy_from_slice(&0x1234_u32.to_le_bytes()); // entry point
        data[28..32].copy_from_slice(&0x0040_0000_u32.to_le_bytes()); // image base
        data[36..40].copy_from_slice(&0x200_u32.to_le_bytes()); // file alignment
        data[72..76].copy_from_slice(&0x0010_0000_u32.to_le_bytes()); // stack reserve
        data[92..96].copy_from_slice(&16_u32.to_le_bytes()); // number_of_rva_and_sizes

        let (header, complete) = OptionalHeader::read(&data).unwrap();
        assert!(complete);
        assert_eq!(header.bits, ImageBits::Bits32);
        assert_eq!(header.address_of_entry_point, 0x1234);
        assert_eq!(header.image_base, 0x40_0000);
        assert_eq!(header.file_alignment, 0x200);
        assert_eq!(header.size_of_stack_reserve, 0x10_0000);
        assert_eq!(header.number_of_rva_and_sizes, 16);
    }

    #[test]
    fn optional_header_pe32_plus() {
        let mut data = vec![0u8; OPTIONAL_HEADER64_SIZE];
        data[0..2].copy_from_slice(&0x20B_u16.to_le_bytes());
        data[24..32].copy_from_slice(&0x1_8000_0000_u64.to_le_bytes()); // image base
        data[72..80].copy_from_slice(&0x0020_0000_u64.to_le_bytes()); // stack reserve
        data[108..112].copy_from_slice(&6_u32.to_le_bytes());

        let (header, complete) = OptionalHeader::read(&data).unwrap();
        assert!(complete);
        assert_eq!(header.bits, ImageBits::Bits64);
        assert_eq!(header.base_of_data, 0);
        assert_eq!(header.image_base, 0x1_8000_0000);
        assert_eq!(header.size_of_stack_reserve, 0x20_0000);
        assert_eq!(header.number_of_rva_and_sizes, 6);
    }

    #[test]
    fn optional_header_truncated_and_unknown() {
        let mut data = vec![0u8; 40];
        data[0..2].copy_from_slice(&0x10B_u16.to_le_bytes());
        data[28..32].copy_from_slice(&0x0040_0000_u32.to_le_bytes());

        let (header, complete) = OptionalHeader::read(&data).unwrap();
        assert!(!complete);
        assert_eq!(header.image_base, 0x40_0000);
        assert_eq!(header.number_of_rva_and_sizes, 0);

        let (header, complete) = OptionalHeader::read(&[0x07, 0x01, 0xFF]).unwrap();
        assert!(!complete);
        assert_eq!(header.bits, ImageBits::Unknown);

        assert!(OptionalHeader::read(&[0x0B]).is_err());
        assert!(OptionalHeader::peek_magic(&[0x0B]).is_err());
    }

    #[test]
    fn data_directories() {
        let mut data = Vec::new();
        for index in 0..3_u32 {
            data.extend_from_slice(&(0x1000 * (index + 1)).to_le_bytes());
            data.extend_from_slice(&(0x10 * index).to_le_bytes());
        }

        let directories = read_data_directories(&data, 16);
        assert_eq!(directories.len(), 3);
        assert_eq!(directories[2].virtual_address, 0x3000);
        assert_eq!(directories[2].size, 0x20);

        assert_eq!(read_data_directories(&data, 2).len(), 2);
    }

    #[test]
    fn bits() {
        assert_eq!(ImageBits::from_magic(0x10B).native_size(), Some(4));
        assert_eq!(ImageBits::from_magic(0x20B).native_size(), Some(8));
        assert_eq!(ImageBits::from_magic(0x107).native_size(), None);
        assert_eq!(ImageBits::Bits64.optional_header_size(), Some(112));
    }
}

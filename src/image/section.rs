//! Sections and the section table.
//!
//! A [`Section`] couples a decoded 40-byte section header with the section's backing buffer
//! once the loader has read it. The [`SectionTable`] keeps sections in table order and answers
//! the lookups every other component builds on: which section covers an RVA, which one covers
//! a file offset, and which one is the last to carry raw data.
//!
//! # Addressing
//!
//! Buffers are plain owned `Vec<u8>`s; everything else refers to them by
//! `(section index, offset)`. The virtual range of a section is
//! `[virtual_address, virtual_address + virtual_extent())`, where the extent falls back to the
//! raw size when the header declares a virtual size of zero.
//!
//! # Overlapping sections
//!
//! Nothing prevents malformed input from declaring overlapping virtual ranges. Lookups return
//! the *first* match in table order; this is carried over as-is and not hardened further.

use std::fmt::Write;

use bitflags::bitflags;
use goblin::pe::section_table::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_CNT_UNINITIALIZED_DATA,
    IMAGE_SCN_MEM_DISCARDABLE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_SHARED,
    IMAGE_SCN_MEM_WRITE,
};

use crate::{file::parser::Parser, Result};

/// Size of a single section header.
pub const SECTION_HEADER_SIZE: usize = 40;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Section characteristics relevant to image consumers
    pub struct SectionCharacteristics: u32 {
        /// Section contains executable code
        const CNT_CODE = IMAGE_SCN_CNT_CODE;
        /// Section contains initialized data
        const CNT_INITIALIZED_DATA = IMAGE_SCN_CNT_INITIALIZED_DATA;
        /// Section contains uninitialized data
        const CNT_UNINITIALIZED_DATA = IMAGE_SCN_CNT_UNINITIALIZED_DATA;
        /// Section can be discarded as needed
        const MEM_DISCARDABLE = IMAGE_SCN_MEM_DISCARDABLE;
        /// Section can be shared in memory
        const MEM_SHARED = IMAGE_SCN_MEM_SHARED;
        /// Section can be executed as code
        const MEM_EXECUTE = IMAGE_SCN_MEM_EXECUTE;
        /// Section can be read
        const MEM_READ = IMAGE_SCN_MEM_READ;
        /// Section can be written to
        const MEM_WRITE = IMAGE_SCN_MEM_WRITE;

        const _ = !0;
    }
}

/// A section header plus, once loaded, the section's bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    /// The 8 name bytes exactly as stored in the header
    pub raw_name: [u8; 8],
    /// Display name: the short name, a synthetic replacement for an unsafe name, or the long
    /// name resolved from the COFF string table
    pub name: String,
    /// `VirtualSize`
    pub virtual_size: u32,
    /// `VirtualAddress`, the section RVA
    pub virtual_address: u32,
    /// `SizeOfRawData`
    pub size_of_raw_data: u32,
    /// `PointerToRawData`, the file offset of the raw data
    pub pointer_to_raw_data: u32,
    /// `PointerToRelocations`
    pub pointer_to_relocations: u32,
    /// `PointerToLinenumbers`
    pub pointer_to_linenumbers: u32,
    /// `NumberOfRelocations`
    pub number_of_relocations: u16,
    /// `NumberOfLinenumbers`
    pub number_of_linenumbers: u16,
    /// `Characteristics`
    pub characteristics: u32,
    data: Option<Vec<u8>>,
}

impl Section {
    /// Decode a 40-byte section header from the start of `data`.
    ///
    /// The display name is initialised to the short name; renaming (unsafe names, `/offset`
    /// references) is the loader's job.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 40 bytes are available.
    pub fn read(data: &[u8]) -> Result<Section> {
        let mut parser = Parser::new(data);

        let raw_name = parser.read_array::<8>()?;
        let mut section = Section {
            raw_name,
            name: String::new(),
            virtual_size: parser.read_le::<u32>()?,
            virtual_address: parser.read_le::<u32>()?,
            size_of_raw_data: parser.read_le::<u32>()?,
            pointer_to_raw_data: parser.read_le::<u32>()?,
            pointer_to_relocations: parser.read_le::<u32>()?,
            pointer_to_linenumbers: parser.read_le::<u32>()?,
            number_of_relocations: parser.read_le::<u16>()?,
            number_of_linenumbers: parser.read_le::<u16>()?,
            characteristics: parser.read_le::<u32>()?,
            data: None,
        };
        section.name = section.short_name();

        Ok(section)
    }

    /// Create a section from its geometry, mainly for building tables by hand.
    #[must_use]
    pub fn new(name: &str, virtual_address: u32, virtual_size: u32, raw_offset: u32, raw_size: u32) -> Section {
        let mut raw_name = [0u8; 8];
        for (dst, src) in raw_name.iter_mut().zip(name.bytes()) {
            *dst = src;
        }

        Section {
            raw_name,
            name: name.to_string(),
            virtual_size,
            virtual_address,
            size_of_raw_data: raw_size,
            pointer_to_raw_data: raw_offset,
            ..Section::default()
        }
    }

    /// The short name from the raw header bytes, up to the first NUL.
    #[must_use]
    pub fn short_name(&self) -> String {
        let end = self
            .raw_name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(self.raw_name.len());
        String::from_utf8_lossy(&self.raw_name[..end]).into_owned()
    }

    /// Whether the raw name only holds printable ASCII before its NUL padding.
    #[must_use]
    pub fn has_safe_name(&self) -> bool {
        self.raw_name
            .iter()
            .take_while(|&&byte| byte != 0)
            .all(|&byte| (0x20..=0x7E).contains(&byte))
    }

    /// Synthetic name used in place of an unsafe one: the table index as 8 hex digits.
    #[must_use]
    pub fn synthetic_name(index: usize) -> String {
        let mut name = String::with_capacity(8);
        let _ = write!(name, "{index:08X}");
        name
    }

    /// The string-table offset of a `/<decimal>` long-name reference, if the name is one.
    #[must_use]
    pub fn name_reference(&self) -> Option<usize> {
        let short = self.short_name();
        let digits = short.strip_prefix('/')?;
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Size of the virtual range; the raw size stands in when `VirtualSize` is zero.
    #[must_use]
    pub fn virtual_extent(&self) -> u32 {
        if self.virtual_size != 0 {
            self.virtual_size
        } else {
            self.size_of_raw_data
        }
    }

    /// Exclusive end of the virtual range, widened so malformed headers cannot overflow.
    #[must_use]
    pub fn virtual_end(&self) -> u64 {
        u64::from(self.virtual_address) + u64::from(self.virtual_extent())
    }

    /// Whether `rva` falls inside `[virtual_address, virtual_end())`.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && u64::from(rva) < self.virtual_end()
    }

    /// Exclusive end of the raw data window in the file.
    #[must_use]
    pub fn raw_end(&self) -> u64 {
        u64::from(self.pointer_to_raw_data) + u64::from(self.size_of_raw_data)
    }

    /// Whether `offset` falls inside the raw data window.
    #[must_use]
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= u64::from(self.pointer_to_raw_data) && offset < self.raw_end()
    }

    /// A section has valid raw data when both its raw offset and raw size are nonzero.
    #[must_use]
    pub fn has_raw_data(&self) -> bool {
        self.pointer_to_raw_data != 0 && self.size_of_raw_data != 0
    }

    /// Typed view of [`Section::characteristics`].
    #[must_use]
    pub fn flags(&self) -> SectionCharacteristics {
        SectionCharacteristics::from_bits_retain(self.characteristics)
    }

    /// Whether the backing buffer has been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    /// The loaded section bytes.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Mutable access to the loaded section bytes.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    /// Install the backing buffer.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = Some(data);
    }
}

/// Ordered collection of sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionTable {
    sections: Vec<Section>,
}

impl SectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a section at the end of the table.
    pub fn push(&mut self, section: Section) {
        self.sections.push(section);
    }

    /// Number of sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Whether the table holds no sections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Remove all sections.
    pub fn clear(&mut self) {
        self.sections.clear();
    }

    /// Section at `index` in table order.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    /// Mutable section at `index` in table order.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Section> {
        self.sections.get_mut(index)
    }

    /// Iterate in table order.
    pub fn iter(&self) -> std::slice::Iter<'_, Section> {
        self.sections.iter()
    }

    /// Iterate mutably in table order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Section> {
        self.sections.iter_mut()
    }

    /// Index of the first section whose virtual range contains `rva`.
    #[must_use]
    pub fn index_of_rva(&self, rva: u32) -> Option<usize> {
        self.sections
            .iter()
            .position(|section| section.contains_rva(rva))
    }

    /// Index of the first section whose raw window contains `offset`.
    #[must_use]
    pub fn index_of_offset(&self, offset: u64) -> Option<usize> {
        self.sections
            .iter()
            .position(|section| section.contains_offset(offset))
    }

    /// First section with the given display name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    /// The last section in table order with valid raw data.
    #[must_use]
    pub fn last_with_raw_data(&self) -> Option<&Section> {
        self.sections
            .iter()
            .rev()
            .find(|section| section.has_raw_data())
    }

    /// The smallest nonzero raw data offset over all sections.
    #[must_use]
    pub fn first_raw_offset(&self) -> Option<u32> {
        self.sections
            .iter()
            .filter(|section| section.has_raw_data())
            .map(|section| section.pointer_to_raw_data)
            .min()
    }
}

impl<'a> IntoIterator for &'a SectionTable {
    type Item = &'a Section;
    type IntoIter = std::slice::Iter<'a, Section>;

    fn into_iter(self) -> Self::IntoIter {
        self.sections.iter()
    }
}

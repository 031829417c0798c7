//! Translation between the three coordinate spaces of an image.
//!
//! - **RVA**: offset from the load base once the image is mapped
//! - **VA**: `RVA + ImageBase`
//! - **File offset**: position inside the raw on-disk representation
//!
//! [`AddressTranslator`] is a borrowed, stateless view over a section table plus the image base
//! and bit-width; [`crate::Image`] hands one out on demand and forwards its own translation
//! methods to it.
//!
//! VA to RVA conversion wraps on underflow. The resulting RVA is meaningless for addresses
//! below the image base and has to be re-validated with
//! [`AddressTranslator::rva_to_section`].

use crate::image::{
    headers::ImageBits,
    section::{Section, SectionTable},
};

/// A location inside a loaded section buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLocation {
    /// Index of the section in table order
    pub section: usize,
    /// Offset into the section's buffer
    pub offset: usize,
}

/// Address translation over a section table.
#[derive(Debug, Clone, Copy)]
pub struct AddressTranslator<'a> {
    sections: &'a SectionTable,
    image_base: u64,
    bits: ImageBits,
}

impl<'a> AddressTranslator<'a> {
    /// Create a translator for the given layout.
    #[must_use]
    pub fn new(sections: &'a SectionTable, image_base: u64, bits: ImageBits) -> Self {
        AddressTranslator {
            sections,
            image_base,
            bits,
        }
    }

    /// The image base used for VA conversion.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// Size of a pointer-sized field: 4 for PE32, 8 for PE32+, `None` if the width is unknown.
    #[must_use]
    pub fn native_size(&self) -> Option<usize> {
        self.bits.native_size()
    }

    /// First section in table order whose virtual range contains `rva`.
    #[must_use]
    pub fn rva_to_section(&self, rva: u32) -> Option<&'a Section> {
        self.rva_to_section_index(rva).and_then(|index| self.sections.get(index))
    }

    /// Index of the first section whose virtual range contains `rva`.
    #[must_use]
    pub fn rva_to_section_index(&self, rva: u32) -> Option<usize> {
        self.sections.index_of_rva(rva)
    }

    /// File offset backing `rva`.
    ///
    /// Only RVAs inside the raw-backed part of their section translate; the virtual-only tail
    /// past `SizeOfRawData` has no file offset.
    #[must_use]
    pub fn rva_to_offset(&self, rva: u32) -> Option<u64> {
        let section = self.rva_to_section(rva)?;
        let delta = rva - section.virtual_address;
        if delta >= section.size_of_raw_data {
            return None;
        }

        Some(u64::from(section.pointer_to_raw_data) + u64::from(delta))
    }

    /// RVA of the byte at file `offset`, if a section's raw window covers it.
    #[must_use]
    pub fn offset_to_rva(&self, offset: u64) -> Option<u32> {
        let index = self.sections.index_of_offset(offset)?;
        let section = self.sections.get(index)?;
        let delta = offset - u64::from(section.pointer_to_raw_data);

        u32::try_from(u64::from(section.virtual_address) + delta).ok()
    }

    /// `rva + image_base`.
    #[must_use]
    pub fn rva_to_va(&self, rva: u32) -> u64 {
        self.image_base.wrapping_add(u64::from(rva))
    }

    /// `va - image_base`, wrapping when `va` lies below the image base.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn va_to_rva(&self, va: u64) -> u32 {
        va.wrapping_sub(self.image_base) as u32
    }

    /// File offset backing `va`.
    #[must_use]
    pub fn va_to_offset(&self, va: u64) -> Option<u64> {
        self.rva_to_offset(self.va_to_rva(va))
    }

    /// Section containing `va`.
    #[must_use]
    pub fn va_to_section(&self, va: u64) -> Option<&'a Section> {
        self.rva_to_section(self.va_to_rva(va))
    }

    /// Location of `rva` inside a loaded section buffer.
    ///
    /// Fails when no section covers `rva`, when that section's buffer is not loaded, or when
    /// `rva` falls past the end of the buffer (the zero-filled virtual tail is not backed).
    #[must_use]
    pub fn rva_to_memory(&self, rva: u32) -> Option<MemoryLocation> {
        let index = self.rva_to_section_index(rva)?;
        let section = self.sections.get(index)?;
        let offset = (rva - section.virtual_address) as usize;

        if offset >= section.data()?.len() {
            return None;
        }

        Some(MemoryLocation {
            section: index,
            offset,
        })
    }
}

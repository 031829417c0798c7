//! The staged load pipeline.
//!
//! [`Loader`] turns the bytes of a [`crate::Source`] into headers, a section table and section
//! buffers. Stages run strictly in [`LoadStage`] order. The mandatory ones (DOS header, header
//! offset, PE signature, file header, optional-header magic) abort the load with an error; every
//! other stage records what went wrong in the image's diagnostics and carries on with what it
//! could read.
//!
//! The final [`LoadStage::DirectoryDispatch`] stage is run by [`crate::Image::load`] itself,
//! after the source has been handed back to the image, so directory parsers see a complete
//! image.

use std::fmt;

use goblin::pe::header::PE_MAGIC;
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity},
    file::{parser::Parser, SourceKind},
    image::{
        config::LoadConfig,
        headers::{
            read_data_directories, read_file_header, DosHeader, ImageBits, OptionalHeader,
            DATA_DIRECTORY_SIZE, DOS_HEADER_SIZE, FILE_HEADER_SIZE, PE_SIGNATURE_SIZE,
        },
        section::{Section, SECTION_HEADER_SIZE},
        strings::CoffStringTable,
    },
    Error::{Empty, InvalidPeSignature, MisalignedHeaderOffset},
    Image, Result,
};

/// Largest virtual extent a disk-sourced section is zero-filled to.
pub const MAX_ZERO_FILL: usize = 0x1000_0000;

/// The stages of an image load, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCount)]
pub enum LoadStage {
    /// Read the DOS header and check `MZ`
    DosStub,
    /// `e_lfanew` must be a multiple of 8
    HeaderOffsetCheck,
    /// Capture the bytes between the DOS header and the PE signature
    DosBlockCapture,
    /// Check `PE\0\0` at the header offset
    SignatureCheck,
    /// Decode the COFF file header
    FileHeader,
    /// Load the COFF string table
    CoffStrings,
    /// Decode the section headers
    SectionHeaders,
    /// Resolve `/<offset>` section names
    SectionNameResolution,
    /// Capture the bytes between the section table and the first section
    SectionHeaderGapCapture,
    /// Decode the optional header and the data-directory table
    OptionalHeaderAndDirectories,
    /// Read every section's bytes
    SectionDataLoad,
    /// Run the registered directory parsers
    DirectoryDispatch,
}

impl LoadStage {
    /// Whether a failure in this stage aborts the load.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            LoadStage::DosStub
                | LoadStage::HeaderOffsetCheck
                | LoadStage::SignatureCheck
                | LoadStage::FileHeader
                | LoadStage::OptionalHeaderAndDirectories
        )
    }
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStage::DosStub => "dos-stub",
            LoadStage::HeaderOffsetCheck => "header-offset-check",
            LoadStage::DosBlockCapture => "dos-block-capture",
            LoadStage::SignatureCheck => "signature-check",
            LoadStage::FileHeader => "file-header",
            LoadStage::CoffStrings => "coff-strings",
            LoadStage::SectionHeaders => "section-headers",
            LoadStage::SectionNameResolution => "section-name-resolution",
            LoadStage::SectionHeaderGapCapture => "section-header-gap-capture",
            LoadStage::OptionalHeaderAndDirectories => "optional-header-and-directories",
            LoadStage::SectionDataLoad => "section-data-load",
            LoadStage::DirectoryDispatch => "directory-dispatch",
        };
        write!(f, "{name}")
    }
}

/// Runs the structural stages against the bytes of one source.
pub(crate) struct Loader<'a> {
    image: &'a mut Image,
    config: &'a LoadConfig,
    data: &'a [u8],
    section_table_offset: usize,
}

impl<'a> Loader<'a> {
    pub(crate) fn new(image: &'a mut Image, config: &'a LoadConfig, data: &'a [u8]) -> Self {
        Loader {
            image,
            config,
            data,
            section_table_offset: 0,
        }
    }

    /// Run every stage up to and including [`LoadStage::SectionDataLoad`].
    pub(crate) fn run(mut self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Empty);
        }
        self.image.file_size = self.data.len() as u64;

        for stage in LoadStage::iter().take_while(|stage| *stage != LoadStage::DirectoryDispatch) {
            log::debug!("load stage {stage}");

            match stage {
                LoadStage::DosStub => self.dos_stub()?,
                LoadStage::HeaderOffsetCheck => self.header_offset_check()?,
                LoadStage::DosBlockCapture => self.dos_block_capture(),
                LoadStage::SignatureCheck => self.signature_check()?,
                LoadStage::FileHeader => self.file_header()?,
                LoadStage::CoffStrings => self.coff_strings(),
                LoadStage::SectionHeaders => self.section_headers(),
                LoadStage::SectionNameResolution => self.section_name_resolution(),
                LoadStage::SectionHeaderGapCapture => self.section_header_gap_capture(),
                LoadStage::OptionalHeaderAndDirectories => self.optional_header_and_directories()?,
                LoadStage::SectionDataLoad => self.section_data_load(),
                LoadStage::DirectoryDispatch => {}
            }
        }

        Ok(())
    }

    fn diagnose(&self, severity: DiagnosticSeverity, category: DiagnosticCategory, message: String, offset: usize) {
        self.image
            .diagnostics
            .push(Diagnostic::new(severity, category, message).with_offset(offset as u64));
    }

    fn tail(&self, offset: usize) -> &'a [u8] {
        self.data.get(offset..).unwrap_or_default()
    }

    fn dos_stub(&mut self) -> Result<()> {
        self.image.dos_header = DosHeader::read(self.data)?;
        Ok(())
    }

    fn header_offset_check(&mut self) -> Result<()> {
        let lfanew = self.image.dos_header.lfanew;
        if lfanew % 8 != 0 {
            return Err(MisalignedHeaderOffset(lfanew));
        }

        self.image.header_offset = lfanew;
        Ok(())
    }

    fn dos_block_capture(&mut self) {
        if !self.config.capture_gaps {
            return;
        }

        let end = self.image.header_offset as usize;
        if end <= DOS_HEADER_SIZE {
            return;
        }

        match self.data.get(DOS_HEADER_SIZE..end) {
            Some(block) => self.image.dos_stub = block.to_vec(),
            None => self.diagnose(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Header,
                format!("DOS block up to 0x{end:X} extends past the end of the input"),
                DOS_HEADER_SIZE,
            ),
        }
    }

    fn signature_check(&mut self) -> Result<()> {
        let offset = self.image.header_offset as usize;

        let mut parser = Parser::new(self.data);
        let signature = parser
            .seek(offset)
            .and_then(|()| parser.read_le::<u32>())
            .map_err(|_| malformed_error!("PE signature at 0x{:X} lies past the end of the input", offset))?;

        if signature != PE_MAGIC {
            return Err(InvalidPeSignature(signature));
        }
        Ok(())
    }

    fn file_header(&mut self) -> Result<()> {
        let offset = self.image.header_offset as usize + PE_SIGNATURE_SIZE;
        let header = read_file_header(self.tail(offset))
            .map_err(|_| malformed_error!("Truncated file header at 0x{:X}", offset))?;

        self.section_table_offset =
            offset + FILE_HEADER_SIZE + usize::from(header.size_of_optional_header);
        self.image.file_header = header;
        Ok(())
    }

    fn coff_strings(&mut self) {
        if !self.config.load_coff_strings || self.image.kind != SourceKind::Disk {
            return;
        }

        let header = &self.image.file_header;
        let Some(offset) =
            CoffStringTable::locate(header.pointer_to_symbol_table, header.number_of_symbol_table)
        else {
            return;
        };

        let table = usize::try_from(offset)
            .ok()
            .and_then(|offset| self.data.get(offset..))
            .map(CoffStringTable::read);

        match table {
            Some(Ok(table)) => self.image.strings = table,
            _ => self.image.diagnostics.push(
                Diagnostic::new(
                    DiagnosticSeverity::Warning,
                    DiagnosticCategory::StringTable,
                    "COFF string table could not be read",
                )
                .with_offset(offset),
            ),
        }
    }

    fn section_headers(&mut self) {
        let declared = usize::from(self.image.file_header.number_of_sections);

        for index in 0..declared {
            let offset = self.section_table_offset + index * SECTION_HEADER_SIZE;
            let Ok(mut section) = Section::read(self.tail(offset)) else {
                break;
            };

            if !section.has_safe_name() {
                section.name = Section::synthetic_name(index);
                self.image.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticSeverity::Warning,
                        DiagnosticCategory::Section,
                        format!("Unsafe section name replaced with {}", section.name),
                    )
                    .with_offset(offset as u64)
                    .with_section(index),
                );
            }

            self.image.sections.push(section);
        }

        let parsed = self.image.sections.len();
        if parsed < declared {
            self.diagnose(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Section,
                format!("Section table truncated: {parsed} of {declared} headers readable"),
                self.section_table_offset,
            );
        }
    }

    fn section_name_resolution(&mut self) {
        if !self.config.resolve_section_names || self.image.strings.is_empty() {
            return;
        }

        let image = &mut *self.image;
        for (index, section) in image.sections.iter_mut().enumerate() {
            let Some(offset) = section.name_reference() else {
                continue;
            };

            match image.strings.get(offset) {
                Some(name) if !name.is_empty() => section.name = name.to_string(),
                _ => image.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticSeverity::Info,
                        DiagnosticCategory::StringTable,
                        format!("Unresolved section name {}", section.name),
                    )
                    .with_section(index),
                ),
            }
        }
    }

    fn section_header_gap_capture(&mut self) {
        if !self.config.capture_gaps {
            return;
        }

        let start = self.section_table_offset + self.image.sections.len() * SECTION_HEADER_SIZE;
        let Some(end) = self.image.sections.first_raw_offset() else {
            return;
        };

        let end = end as usize;
        if end <= start {
            return;
        }

        let available = end.min(self.data.len());
        if start < available {
            self.image.section_gap = self.data[start..available].to_vec();
        }
        if available < end {
            self.diagnose(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Header,
                format!("Section header gap up to 0x{end:X} extends past the end of the input"),
                start,
            );
        }
    }

    fn optional_header_and_directories(&mut self) -> Result<()> {
        let offset = self.image.header_offset as usize + PE_SIGNATURE_SIZE + FILE_HEADER_SIZE;
        let data = self.tail(offset);

        OptionalHeader::peek_magic(data)
            .map_err(|_| malformed_error!("Optional header magic at 0x{:X} is unreadable", offset))?;
        let (header, complete) = OptionalHeader::read(data)?;

        let Some(header_size) = header.bits.optional_header_size() else {
            self.diagnose(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Header,
                format!("Unknown optional header magic 0x{:04X}", header.magic),
                offset,
            );
            self.image.optional_header = header;
            return Ok(());
        };

        if !complete {
            self.diagnose(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Header,
                "Optional header truncated".to_string(),
                offset,
            );
        }

        let directory_offset = offset + header_size;
        let declared = header.number_of_rva_and_sizes as usize;
        let available = self.section_table_offset.saturating_sub(directory_offset) / DATA_DIRECTORY_SIZE;
        let count = declared.min(available);
        if count < declared {
            self.diagnose(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Header,
                format!("{declared} data directories overrun the section table, clamped to {count}"),
                directory_offset,
            );
        }

        let directories = read_data_directories(self.tail(directory_offset), count);
        if directories.len() < count {
            self.diagnose(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Header,
                format!("Data directory table truncated: {} of {count} entries readable", directories.len()),
                directory_offset,
            );
        }

        if header.bits == ImageBits::Bits64 {
            log::debug!("PE32+ image, base 0x{:X}", header.image_base);
        } else {
            log::debug!("PE32 image, base 0x{:X}", header.image_base);
        }

        self.image.optional_header = header;
        self.image.data_directories = directories;
        Ok(())
    }

    fn section_data_load(&mut self) {
        let mapped = self.image.kind == SourceKind::MappedMemory;
        let data = self.data;
        let image = &mut *self.image;
        let mut failures = 0;

        for (index, section) in image.sections.iter_mut().enumerate() {
            let (start, len) = if mapped {
                (section.virtual_address, section.virtual_extent())
            } else if section.has_raw_data() {
                (section.pointer_to_raw_data, section.size_of_raw_data)
            } else {
                (0, 0)
            };

            // Disk buffers are zero-filled to the virtual extent so they match the mapped layout
            let mut extent = 0;
            if !mapped {
                extent = section.virtual_extent() as usize;
                if extent > MAX_ZERO_FILL {
                    image.diagnostics.push(
                        Diagnostic::new(
                            DiagnosticSeverity::Warning,
                            DiagnosticCategory::Section,
                            format!("Section {} virtual size 0x{extent:X} clamped to 0x{MAX_ZERO_FILL:X}", section.name),
                        )
                        .with_section(index),
                    );
                    extent = MAX_ZERO_FILL;
                }
            }

            let (start, len) = (start as usize, len as usize);
            if len == 0 {
                section.set_data(vec![0u8; extent]);
                continue;
            }

            let available = data.len().saturating_sub(start).min(len);
            if available < len {
                failures += 1;
                image.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticSeverity::Error,
                        DiagnosticCategory::Section,
                        format!(
                            "Section {} data truncated: {available} of {len} bytes readable",
                            section.name
                        ),
                    )
                    .with_offset(start as u64)
                    .with_section(index),
                );
            }

            if available == len {
                let mut buffer = data[start..start + len].to_vec();
                if buffer.len() < extent {
                    buffer.resize(extent, 0);
                }
                section.set_data(buffer);
            } else if available > 0 {
                section.set_data(data[start..start + available].to_vec());
            }
        }

        image.section_load_failures = failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::PeBuilder, Error, Source};

    fn load(data: Vec<u8>, config: &LoadConfig) -> (Image, Result<()>) {
        let mut image = Image::new();
        let source = Source::buffer(data);
        let result = source.with_backend(|backend| Loader::new(&mut image, config, backend.data()).run());
        (image, result)
    }

    #[test]
    fn stage_order() {
        let stages: Vec<_> = LoadStage::iter().collect();
        assert_eq!(stages.len(), LoadStage::COUNT);
        assert_eq!(stages.first(), Some(&LoadStage::DosStub));
        assert_eq!(stages.last(), Some(&LoadStage::DirectoryDispatch));
        assert!(LoadStage::SignatureCheck.is_fatal());
        assert!(!LoadStage::CoffStrings.is_fatal());
        assert_eq!(LoadStage::SectionDataLoad.to_string(), "section-data-load");
    }

    #[test]
    fn fatal_stages() {
        let config = LoadConfig::default();

        let (_, result) = load(Vec::new(), &config);
        assert!(matches!(result, Err(Error::Empty)));

        let mut bad_dos = PeBuilder::pe32().build();
        bad_dos[0] = b'X';
        let (_, result) = load(bad_dos, &config);
        assert!(matches!(result, Err(Error::InvalidDosSignature(_))));

        let (_, result) = load(PeBuilder::pe32().header_offset(0x84).build(), &config);
        assert!(matches!(result, Err(Error::MisalignedHeaderOffset(0x84))));

        let mut bad_pe = PeBuilder::pe32().build();
        bad_pe[0x80] = b'N';
        let (_, result) = load(bad_pe, &config);
        assert!(matches!(result, Err(Error::InvalidPeSignature(_))));

        let mut truncated = PeBuilder::pe32().build();
        truncated.truncate(0x80 + 10);
        let (_, result) = load(truncated, &config);
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }

    #[test]
    fn unsafe_names_are_replaced() {
        let data = PeBuilder::pe32()
            .section(".text", 0x1000, 0x200, 0x200)
            .raw_section_name(*b"bad\x07name", 0x2000, 0x200, 0x200)
            .build();

        let (image, result) = load(data, &LoadConfig::default());
        assert!(result.is_ok());
        assert_eq!(image.sections().get(0).map(|s| s.name.as_str()), Some(".text"));
        assert_eq!(image.sections().get(1).map(|s| s.name.as_str()), Some("00000001"));
        assert_eq!(image.sections().get(1).map(|s| s.raw_name), Some(*b"bad\x07name"));
        assert_eq!(image.diagnostics().by_category(DiagnosticCategory::Section).len(), 1);
    }

    #[test]
    fn directory_count_is_clamped() {
        let data = PeBuilder::pe32()
            .declared_directories(64)
            .section(".text", 0x1000, 0x200, 0x200)
            .build();

        let (image, result) = load(data, &LoadConfig::default());
        assert!(result.is_ok());
        assert_eq!(image.data_directories().len(), 16);
        assert!(image
            .diagnostics()
            .iter()
            .any(|d| d.message.contains("clamped to 16")));
    }

    #[test]
    fn truncated_section_data_is_counted() {
        let mut data = PeBuilder::pe32()
            .section(".text", 0x1000, 0x200, 0x200)
            .section(".data", 0x2000, 0x200, 0x200)
            .build();
        data.truncate(data.len() - 0x100);

        let (image, result) = load(data, &LoadConfig::default());
        assert!(result.is_ok());
        assert_eq!(image.section_load_failures(), 1);
        assert_eq!(image.sections().get(1).and_then(|s| s.data()).map(<[u8]>::len), Some(0x100));
        assert!(image.diagnostics().has_errors());
    }

    #[test]
    fn raw_padding_past_virtual_size_is_kept() {
        let builder = PeBuilder::pe32().section(".text", 0x1000, 0x10, 0x200);
        let data = builder.build();

        let (image, result) = load(data.clone(), &LoadConfig::default());
        assert!(result.is_ok());
        let text = image.sections().get(0).unwrap();
        assert_eq!(text.size_of_raw_data, 0x200);
        assert_eq!(text.data().map(<[u8]>::len), Some(0x200));
        assert_eq!(text.data(), Some(&data[0x200..0x400]));
    }

    #[test]
    fn virtual_tail_matches_mapped_layout() {
        let builder = PeBuilder::pe32()
            .section(".data", 0x1000, 0x300, 0x200)
            .virtual_section(".bss", 0x2000, 0x80);

        let disk = Image::from_mem(builder.build()).unwrap();
        let mapped = Image::from_mapped_mem(builder.build_mapped()).unwrap();

        for (disk_section, mapped_section) in disk.sections().iter().zip(mapped.sections()) {
            assert_eq!(disk_section.data(), mapped_section.data());
        }
        assert_eq!(disk.sections().get(1).and_then(|s| s.data()), Some(&[0u8; 0x80][..]));
        assert_eq!(disk.read_bytes_at(0x1250, 4), mapped.read_bytes_at(0x1250, 4));
        assert_eq!(disk.read_bytes_at(0x1250, 4), vec![0; 4]);

        // The tail is addressable but has no file offset
        assert_eq!(disk.rva_to_offset(0x1250), None);
        assert_eq!(disk.section_load_failures(), 0);
    }

    #[test]
    fn gaps_are_captured() {
        let data = PeBuilder::pe32().section(".text", 0x1000, 0x200, 0x200).build();
        let (image, _) = load(data.clone(), &LoadConfig::default());
        assert_eq!(image.dos_stub().len(), 0x80 - DOS_HEADER_SIZE);

        // Section table ends at 0x80 + 4 + 20 + 0xE0 + 40
        let table_end = 0x80 + 4 + 20 + 0xE0 + 40;
        assert_eq!(image.section_gap().len(), 0x200 - table_end);
        assert_eq!(image.section_gap(), &data[table_end..0x200]);

        let (minimal, _) = load(data, &LoadConfig::minimal());
        assert!(minimal.dos_stub().is_empty());
        assert!(minimal.section_gap().is_empty());
    }
}

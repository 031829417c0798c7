//! The PE image aggregate.
//!
//! [`Image`] owns everything decoded from a PE file: the DOS header and stub, the header
//! offset, the COFF file header, the optional header and its data-directory table, the section
//! table with the section buffers, the COFF string table, the captured gap bytes and the
//! diagnostics log. It also keeps the [`crate::Source`] it was loaded from, which the overlay
//! operations use for raw-file access.
//!
//! # Key Components
//!
//! - [`Image`] - The aggregate and its public surface
//! - [`crate::image::loader`] - The staged load pipeline
//! - [`crate::image::translate`] - RVA / VA / file offset translation
//! - [`crate::image::cursor`] - The [`VirtualStream`] cursor over the virtual address space
//! - [`crate::image::overlay`] - Trailing data past the last section
//! - [`crate::image::directories`] - Post-load directory parser dispatch
//!
//! # Source layouts
//!
//! A disk-sourced image (file or in-memory raw file) reads section data from the raw file
//! windows and zero-fills each buffer up to the section's virtual extent, so both layouts
//! expose the same bytes at every RVA. A mapped image (a memory dump of a loaded module) reads it from the virtual ranges,
//! has no overlay, and rejects structural edits.
//!
//! # Examples
//!
//! ```rust,no_run
//! use peimage::Image;
//!
//! let mut image = Image::from_file("sample.exe")?;
//! let entry = image.entry_point();
//!
//! let mut stream = image.stream();
//! if stream.seek_rva(entry) {
//!     let first = stream.read_le::<u8>()?;
//!     println!("first opcode byte: 0x{first:02X}");
//! }
//! # Ok::<(), peimage::Error>(())
//! ```

pub mod config;
pub mod cursor;
pub mod directories;
pub mod headers;
pub mod loader;
pub mod overlay;
pub mod section;
pub mod strings;
pub mod translate;

use std::{path::Path, sync::Arc};

use goblin::pe::{
    characteristic::IMAGE_FILE_DLL,
    data_directories::{DataDirectory, DataDirectoryType},
    header::CoffHeader,
};

use crate::{
    diagnostics::{DiagnosticCategory, Diagnostics},
    file::{Source, SourceKind},
    image::{
        config::LoadConfig,
        cursor::VirtualStream,
        directories::{DirectoryParsers, ParseOutcome},
        headers::{DosHeader, ImageBits, OptionalHeader},
        loader::{LoadStage, Loader},
        section::{Section, SectionTable},
        strings::CoffStringTable,
        translate::{AddressTranslator, MemoryLocation},
    },
    Error::MappedImage,
    Result,
};

/// A loaded PE image.
///
/// Created empty by [`Image::new`] and populated in one pass by [`Image::load`], or directly
/// through one of the `from_*` constructors which load with the default [`LoadConfig`] and no
/// directory parsers.
///
/// # Examples
///
/// ```rust,no_run
/// use peimage::{DirectoryParsers, Image, LoadConfig, Source};
///
/// let mut image = Image::new();
/// image.load(Source::file("sample.dll"), &LoadConfig::minimal(), &DirectoryParsers::new())?;
///
/// for section in image.sections() {
///     println!("{:8} rva 0x{:08X} size 0x{:X}", section.name, section.virtual_address, section.virtual_size);
/// }
/// println!("{}", image.diagnostics());
/// # Ok::<(), peimage::Error>(())
/// ```
#[derive(Debug)]
pub struct Image {
    source: Option<Source>,
    kind: SourceKind,
    file_size: u64,
    dos_header: DosHeader,
    dos_stub: Vec<u8>,
    header_offset: u32,
    file_header: CoffHeader,
    optional_header: OptionalHeader,
    data_directories: Vec<DataDirectory>,
    sections: SectionTable,
    section_gap: Vec<u8>,
    strings: CoffStringTable,
    section_load_failures: usize,
    diagnostics: Arc<Diagnostics>,
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

impl Image {
    /// Create an empty image with no source.
    #[must_use]
    pub fn new() -> Image {
        Image {
            source: None,
            kind: SourceKind::Disk,
            file_size: 0,
            dos_header: DosHeader::default(),
            dos_stub: Vec::new(),
            header_offset: 0,
            file_header: CoffHeader::default(),
            optional_header: OptionalHeader::default(),
            data_directories: Vec::new(),
            sections: SectionTable::new(),
            section_gap: Vec::new(),
            strings: CoffStringTable::default(),
            section_load_failures: 0,
            diagnostics: Arc::new(Diagnostics::new()),
        }
    }

    /// Load a PE file from disk.
    ///
    /// The file is opened for the duration of the load only; later overlay operations reopen
    /// it as needed.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be read, or the fatal load error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Image> {
        Self::from_source(Source::file(path))
    }

    /// Load a PE file held in memory (raw file layout).
    ///
    /// # Errors
    /// Returns the fatal load error, see [`Image::load`].
    pub fn from_mem(data: Vec<u8>) -> Result<Image> {
        Self::from_source(Source::buffer(data))
    }

    /// Load a memory dump of a mapped module (virtual layout).
    ///
    /// # Errors
    /// Returns the fatal load error, see [`Image::load`].
    pub fn from_mapped_mem(data: Vec<u8>) -> Result<Image> {
        Self::from_source(Source::mapped(data))
    }

    /// Load a memory dump from disk; the dump stays mapped for the lifetime of the image.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the dump cannot be mapped, or the fatal load
    /// error.
    pub fn from_mapped_file(path: impl AsRef<Path>) -> Result<Image> {
        Self::from_source(Source::mapped_file(path)?)
    }

    fn from_source(source: Source) -> Result<Image> {
        let mut image = Image::new();
        image.load(source, &LoadConfig::default(), &DirectoryParsers::new())?;
        Ok(image)
    }

    /// Load `source` into this image, replacing any previous content.
    ///
    /// Runs the structural stages of [`crate::image::loader::LoadStage`] against the source
    /// bytes, then dispatches every stage in `config.stages` that has a parser in `parsers`.
    /// Recoverable anomalies end up in [`Image::diagnostics`]; parser outcomes never fail the
    /// load.
    ///
    /// # Errors
    /// Fails on an empty input, a bad DOS or PE signature, a misaligned header offset, a
    /// truncated file header or an unreadable optional-header magic. On failure the image keeps
    /// at most the DOS header, with no sections or directories.
    pub fn load(
        &mut self,
        source: Source,
        config: &LoadConfig,
        parsers: &DirectoryParsers,
    ) -> Result<()> {
        self.reset();
        self.kind = source.kind();
        self.diagnostics = Arc::new(Diagnostics::new());

        let loaded =
            source.with_backend(|backend| Loader::new(self, config, backend.data()).run());
        self.source = Some(source);

        if let Err(error) = loaded {
            let dos_header = std::mem::take(&mut self.dos_header);
            self.reset();
            self.dos_header = dos_header;
            return Err(error);
        }

        self.dispatch(config, parsers);
        Ok(())
    }

    fn dispatch(&mut self, config: &LoadConfig, parsers: &DirectoryParsers) {
        log::debug!("load stage {}", LoadStage::DirectoryDispatch);

        for &stage in &config.stages {
            let Some(parser) = parsers.get(stage) else {
                continue;
            };

            match parser.parse(self) {
                ParseOutcome::Ok => {}
                ParseOutcome::Suspicious => self.diagnostics.warning(
                    DiagnosticCategory::Directory,
                    format!("The {stage} directory looks suspicious"),
                ),
                ParseOutcome::Error => self.diagnostics.error(
                    DiagnosticCategory::Directory,
                    format!("The {stage} directory could not be parsed"),
                ),
            }
        }
    }

    fn reset(&mut self) {
        self.file_size = 0;
        self.dos_header = DosHeader::default();
        self.dos_stub.clear();
        self.header_offset = 0;
        self.file_header = CoffHeader::default();
        self.data_directories.clear();
        self.sections.clear();
        self.section_gap.clear();
        self.strings = CoffStringTable::default();
        self.section_load_failures = 0;
        self.optional_header = OptionalHeader::default();
    }

    /// Drop all decoded content and start a fresh diagnostics log, keeping the source, its kind
    /// and the optional-header magic.
    ///
    /// # Errors
    /// Returns [`crate::Error::MappedImage`] for mapped images.
    pub fn clear(&mut self) -> Result<()> {
        if self.kind == SourceKind::MappedMemory {
            return Err(MappedImage);
        }

        let magic = self.optional_header.magic;
        let bits = self.optional_header.bits;
        let file_size = self.file_size;

        self.reset();
        self.diagnostics = Arc::new(Diagnostics::new());
        self.optional_header.magic = magic;
        self.optional_header.bits = bits;
        self.file_size = file_size;
        Ok(())
    }

    /// A [`VirtualStream`] positioned at RVA 0.
    pub fn stream(&mut self) -> VirtualStream<'_> {
        VirtualStream::new(self)
    }

    /// Address translation over this image's layout.
    #[must_use]
    pub fn translator(&self) -> AddressTranslator<'_> {
        AddressTranslator::new(&self.sections, self.optional_header.image_base, self.optional_header.bits)
    }

    /// File offset backing `rva`; `None` for unmapped RVAs and virtual-only section tails.
    #[must_use]
    pub fn rva_to_offset(&self, rva: u32) -> Option<u64> {
        self.translator().rva_to_offset(rva)
    }

    /// RVA of file `offset`, if a section's raw data covers it.
    #[must_use]
    pub fn offset_to_rva(&self, offset: u64) -> Option<u32> {
        self.translator().offset_to_rva(offset)
    }

    /// `rva + ImageBase`.
    #[must_use]
    pub fn rva_to_va(&self, rva: u32) -> u64 {
        self.translator().rva_to_va(rva)
    }

    /// `va - ImageBase`, wrapping below the image base. Validate the result with
    /// [`Image::rva_to_section`] before use.
    #[must_use]
    pub fn va_to_rva(&self, va: u64) -> u32 {
        self.translator().va_to_rva(va)
    }

    /// File offset backing `va`.
    #[must_use]
    pub fn va_to_offset(&self, va: u64) -> Option<u64> {
        self.translator().va_to_offset(va)
    }

    /// First section whose virtual range contains `rva`.
    #[must_use]
    pub fn rva_to_section(&self, rva: u32) -> Option<&Section> {
        self.translator().rva_to_section(rva)
    }

    /// First section whose virtual range contains `va`.
    #[must_use]
    pub fn va_to_section(&self, va: u64) -> Option<&Section> {
        self.translator().va_to_section(va)
    }

    /// Index of the first section whose virtual range contains `rva`.
    #[must_use]
    pub fn section_index(&self, rva: u32) -> Option<usize> {
        self.translator().rva_to_section_index(rva)
    }

    /// First section with the given display name.
    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.by_name(name)
    }

    /// Location of `rva` in a loaded section buffer.
    #[must_use]
    pub fn rva_to_memory(&self, rva: u32) -> Option<MemoryLocation> {
        self.translator().rva_to_memory(rva)
    }

    /// Copy up to `len` bytes starting at `rva`, stopping at the end of the backing section
    /// buffer.
    #[must_use]
    pub fn read_bytes_at(&self, rva: u32, len: usize) -> Vec<u8> {
        let Some(location) = self.rva_to_memory(rva) else {
            return Vec::new();
        };

        self.sections
            .get(location.section)
            .and_then(Section::data)
            .map(|data| {
                let end = data.len().min(location.offset.saturating_add(len));
                data[location.offset..end].to_vec()
            })
            .unwrap_or_default()
    }

    /// The `(rva, size)` of a data directory, if present with nonzero address and size.
    #[must_use]
    pub fn data_directory(&self, kind: DataDirectoryType) -> Option<(u32, u32)> {
        self.data_directories
            .get(kind as usize)
            .filter(|directory| directory.virtual_address != 0 && directory.size != 0)
            .map(|directory| (directory.virtual_address, directory.size))
    }

    /// The data-directory table, as far as it was readable.
    #[must_use]
    pub fn data_directories(&self) -> &[DataDirectory] {
        &self.data_directories
    }

    /// The DOS header.
    #[must_use]
    pub fn dos_header(&self) -> &DosHeader {
        &self.dos_header
    }

    /// Bytes between the DOS header and the PE signature.
    #[must_use]
    pub fn dos_stub(&self) -> &[u8] {
        &self.dos_stub
    }

    /// File offset of the PE signature (`e_lfanew`).
    #[must_use]
    pub fn header_offset(&self) -> u32 {
        self.header_offset
    }

    /// The COFF file header.
    #[must_use]
    pub fn file_header(&self) -> &CoffHeader {
        &self.file_header
    }

    /// The optional header.
    #[must_use]
    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional_header
    }

    /// The section table in header order.
    #[must_use]
    pub fn sections(&self) -> &SectionTable {
        &self.sections
    }

    /// Mutable access to the section table.
    pub fn sections_mut(&mut self) -> &mut SectionTable {
        &mut self.sections
    }

    /// Bytes between the end of the section table and the first section's raw data.
    #[must_use]
    pub fn section_gap(&self) -> &[u8] {
        &self.section_gap
    }

    /// The COFF string table; empty if none was loaded.
    #[must_use]
    pub fn coff_strings(&self) -> &CoffStringTable {
        &self.strings
    }

    /// Number of sections whose data could not be loaded completely.
    #[must_use]
    pub fn section_load_failures(&self) -> usize {
        self.section_load_failures
    }

    /// The diagnostics collected while loading and parsing directories.
    #[must_use]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Layout of the source this image was loaded from.
    #[must_use]
    pub fn source_kind(&self) -> SourceKind {
        self.kind
    }

    /// The source this image was loaded from.
    #[must_use]
    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    /// Size of the underlying file as tracked by the image.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Optional-header width.
    #[must_use]
    pub fn bits(&self) -> ImageBits {
        self.optional_header.bits
    }

    /// Preferred load address.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.optional_header.image_base
    }

    /// RVA of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> u32 {
        self.optional_header.address_of_entry_point
    }

    /// VA of the entry point.
    #[must_use]
    pub fn entry_point_va(&self) -> u64 {
        self.rva_to_va(self.entry_point())
    }

    /// Whether the file header marks the image as a DLL.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.file_header.characteristics & IMAGE_FILE_DLL != 0
    }

    /// `FileAlignment` from the optional header.
    #[must_use]
    pub fn file_alignment(&self) -> u32 {
        self.optional_header.file_alignment
    }

    /// `SectionAlignment` from the optional header.
    #[must_use]
    pub fn section_alignment(&self) -> u32 {
        self.optional_header.section_alignment
    }

    /// Round `offset` up to the file alignment; unchanged if the alignment is zero.
    #[must_use]
    pub fn align_to_file_alignment(&self, offset: u64) -> u64 {
        let alignment = u64::from(self.file_alignment());
        if alignment == 0 {
            return offset;
        }
        offset.div_ceil(alignment) * alignment
    }
}

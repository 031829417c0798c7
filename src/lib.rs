// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # peimage
//!
//! A section-backed virtual image model for Windows PE/COFF binaries.
//!
//! `peimage` loads the structural headers of a PE file, keeps every section's bytes in an owned
//! buffer, and exposes the image through three coordinate spaces: file offsets, relative
//! virtual addresses (RVA) and virtual addresses (VA). On top of that sits a cursor stream for
//! typed reads and writes at any RVA, and overlay management for data appended past the last
//! section.
//!
//! ## Features
//!
//! - **Tolerant loading** - Truncated section tables, unsafe section names and overlong
//!   data-directory tables are reported as diagnostics instead of failing the load
//! - **Dual source layouts** - Raw files from disk or memory, and memory dumps of mapped modules
//! - **Address translation** - RVA, VA and file offset conversions for PE32 and PE32+
//! - **Cursor stream** - Seek by RVA or VA, read scalars, pointer-sized values and strings
//! - **Overlay editing** - Detect, extract, remove and replace trailing data
//! - **Pluggable directory parsers** - Exports, imports, relocations, TLS and resources are
//!   dispatched to caller-provided parsers once the image is loaded
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peimage::Image;
//!
//! let mut image = Image::from_file("tests/samples/sample.exe")?;
//! println!("{:?} image based at 0x{:X}", image.bits(), image.image_base());
//!
//! for section in image.sections() {
//!     println!("{:8} 0x{:08X}", section.name, section.virtual_address);
//! }
//!
//! let entry = image.entry_point();
//! let mut stream = image.stream();
//! if stream.seek_rva(entry) {
//!     let bytes = stream.read_bytes(16);
//!     println!("entry: {bytes:02X?}");
//! }
//! # Ok::<(), peimage::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`Image`] - The aggregate: headers, sections, string table, gaps, diagnostics
//! - [`image::loader`] - The staged load pipeline
//! - [`image::translate`] - [`AddressTranslator`] between RVA, VA and file offset
//! - [`image::cursor`] - [`VirtualStream`], the RVA cursor
//! - [`image::overlay`] - Overlay detection and editing
//! - [`image::directories`] - [`DirectoryParser`] registry and dispatch
//! - [`file`] - [`Source`] abstraction over disk files, buffers and mapped dumps
//! - [`Diagnostics`] - Non-fatal findings collected during load
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Error Handling
//!
//! ```rust,no_run
//! use peimage::{Error, Image};
//!
//! match Image::from_file("tests/samples/sample.exe") {
//!     Ok(image) if image.diagnostics().has_any() => println!("{}", image.diagnostics()),
//!     Ok(_) => println!("clean"),
//!     Err(Error::InvalidPeSignature(signature)) => println!("not a PE: 0x{signature:08X}"),
//!     Err(e) => println!("Other error: {e}"),
//! }
//! ```
//!
//! ## Development and Testing
//!
//! ```bash
//! cargo test
//! cargo bench
//! cargo +nightly fuzz run image --release
//! ```

#[macro_use]
pub(crate) mod error;

/// Non-fatal findings collected while loading an image.
pub mod diagnostics;

/// Input sources and low-level byte access.
pub mod file;

/// The PE image aggregate, its loader, translation, cursor and overlay operations.
pub mod image;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// `peimage` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `peimage` Error type
///
/// The main error type for all operations in this crate. See [`Error`] for the variants.
pub use error::Error;

pub use diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics};
pub use file::{parser::Parser, Backend, Source, SourceKind};
pub use image::{
    config::LoadConfig,
    cursor::VirtualStream,
    directories::{DirectoryParser, DirectoryParsers, ParseOutcome, ParseStage},
    headers::{DosHeader, ImageBits, OptionalHeader},
    loader::LoadStage,
    overlay::Overlay,
    section::{Section, SectionCharacteristics, SectionTable},
    strings::CoffStringTable,
    translate::{AddressTranslator, MemoryLocation},
    Image,
};

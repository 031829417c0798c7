//! Post-load directory parser dispatch.
//!
//! Once headers, sections and section data are in place, the loader hands the image to one
//! pluggable parser per [`ParseStage`]. The parsers themselves (exports, imports, base
//! relocations, TLS, resources) live outside this crate; this module only defines the
//! contract they implement and the registry that maps stages to implementations.
//!
//! A stage without a registered parser is skipped silently. A parser cannot abort the load:
//! its [`ParseOutcome`] is turned into a diagnostic at most.
//!
//! # Examples
//!
//! ```rust
//! use peimage::{DirectoryParser, DirectoryParsers, Image, ParseOutcome, ParseStage};
//!
//! struct ExportCounter;
//!
//! impl DirectoryParser for ExportCounter {
//!     fn parse(&self, image: &mut Image) -> ParseOutcome {
//!         match image.data_directory(ParseStage::Exports.directory()) {
//!             Some(_) => ParseOutcome::Ok,
//!             None => ParseOutcome::Suspicious,
//!         }
//!     }
//! }
//!
//! let mut parsers = DirectoryParsers::new();
//! parsers.register(ParseStage::Exports, ExportCounter);
//! assert!(parsers.get(ParseStage::Exports).is_some());
//! assert!(parsers.get(ParseStage::Imports).is_none());
//! ```

use std::fmt;

use goblin::pe::data_directories::DataDirectoryType;
use strum::{EnumCount, EnumIter};

use crate::Image;

/// The post-load parsing passes, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum ParseStage {
    /// Export directory
    Exports,
    /// Import directory
    Imports,
    /// Base relocation table
    Relocations,
    /// Thread-local storage directory
    Tls,
    /// Resource tree
    Resources,
}

impl ParseStage {
    /// The data directory this stage consumes.
    #[must_use]
    pub fn directory(self) -> DataDirectoryType {
        match self {
            ParseStage::Exports => DataDirectoryType::ExportTable,
            ParseStage::Imports => DataDirectoryType::ImportTable,
            ParseStage::Relocations => DataDirectoryType::BaseRelocationTable,
            ParseStage::Tls => DataDirectoryType::TlsTable,
            ParseStage::Resources => DataDirectoryType::ResourceTable,
        }
    }
}

impl fmt::Display for ParseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseStage::Exports => write!(f, "exports"),
            ParseStage::Imports => write!(f, "imports"),
            ParseStage::Relocations => write!(f, "relocations"),
            ParseStage::Tls => write!(f, "tls"),
            ParseStage::Resources => write!(f, "resources"),
        }
    }
}

/// Result classification reported by a [`DirectoryParser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The directory was parsed without complaints
    Ok,
    /// The directory was parsed, but something about it looks off
    Suspicious,
    /// The directory could not be parsed
    Error,
}

/// A parser for one data directory, run against a fully loaded image.
///
/// Implementations may populate their own structures, read and write through
/// [`Image::stream`], and append to [`Image::diagnostics`].
pub trait DirectoryParser {
    /// Parse the directory this parser is registered for.
    fn parse(&self, image: &mut Image) -> ParseOutcome;
}

impl<F> DirectoryParser for F
where
    F: Fn(&mut Image) -> ParseOutcome,
{
    fn parse(&self, image: &mut Image) -> ParseOutcome {
        self(image)
    }
}

/// Registry mapping each [`ParseStage`] to at most one parser.
#[derive(Default)]
pub struct DirectoryParsers {
    parsers: [Option<Box<dyn DirectoryParser>>; ParseStage::COUNT],
}

impl DirectoryParsers {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `parser` for `stage`, replacing any previous registration.
    pub fn register(&mut self, stage: ParseStage, parser: impl DirectoryParser + 'static) {
        self.parsers[stage as usize] = Some(Box::new(parser));
    }

    /// Remove the parser registered for `stage`.
    pub fn unregister(&mut self, stage: ParseStage) {
        self.parsers[stage as usize] = None;
    }

    /// The parser registered for `stage`.
    #[must_use]
    pub fn get(&self, stage: ParseStage) -> Option<&dyn DirectoryParser> {
        self.parsers[stage as usize].as_deref()
    }

    /// Number of registered parsers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parsers.iter().filter(|parser| parser.is_some()).count()
    }

    /// Whether no parser is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DirectoryParsers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<_> = self
            .parsers
            .iter()
            .zip(<ParseStage as strum::IntoEnumIterator>::iter())
            .filter(|(parser, _)| parser.is_some())
            .map(|(_, stage)| stage)
            .collect();

        f.debug_struct("DirectoryParsers")
            .field("registered", &registered)
            .finish()
    }
}

//! Diagnostics collection for image loading.
//!
//! The loader is deliberately tolerant: truncated section tables, unsafe section names, clamped
//! data-directory counts, short section data and misbehaving directory parsers do not abort a
//! load. Each of these is reported here instead, so callers get a definite load result *plus*
//! an accumulated log of everything that looked wrong.
//!
//! # Key Components
//!
//! - [`Diagnostics`] - Append-only container for diagnostic entries
//! - [`Diagnostic`] - Individual entry with severity, category and optional file offset
//! - [`DiagnosticSeverity`] - Severity level (Info, Warning, Error)
//! - [`DiagnosticCategory`] - Which part of the image the entry concerns
//!
//! Every entry pushed into a container is also forwarded to the [`log`] facade at the matching
//! level, so applications that only install a logger still see the loader's complaints.
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use peimage::{DiagnosticCategory, Image};
//!
//! let image = Image::from_file("sample.exe")?;
//! for entry in image.diagnostics().by_category(DiagnosticCategory::Section) {
//!     println!("{entry}");
//! }
//! # Ok::<(), peimage::Error>(())
//! ```

use std::fmt::{self, Write};

/// Severity level of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticSeverity {
    /// Informational message, not indicating a problem.
    Info,

    /// Warning about a recoverable structural anomaly.
    ///
    /// The image is still usable, but some data may be missing or replaced
    /// (e.g. a synthetic section name).
    Warning,

    /// A component failed; the affected data is unavailable.
    Error,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Info => write!(f, "INFO"),
            DiagnosticSeverity::Warning => write!(f, "WARN"),
            DiagnosticSeverity::Error => write!(f, "ERROR"),
        }
    }
}

/// Category indicating the source of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCategory {
    /// DOS header, file header, optional header and data-directory table.
    Header,

    /// Section headers, section names and section data.
    Section,

    /// The COFF string table.
    StringTable,

    /// Directory parsers run after the image is loaded.
    Directory,

    /// Overlay handling.
    Overlay,

    /// Anything else.
    General,
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticCategory::Header => write!(f, "Header"),
            DiagnosticCategory::Section => write!(f, "Section"),
            DiagnosticCategory::StringTable => write!(f, "StringTable"),
            DiagnosticCategory::Directory => write!(f, "Directory"),
            DiagnosticCategory::Overlay => write!(f, "Overlay"),
            DiagnosticCategory::General => write!(f, "General"),
        }
    }
}

/// A single diagnostic entry with context information.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity level of this diagnostic.
    pub severity: DiagnosticSeverity,

    /// Category indicating the source of this diagnostic.
    pub category: DiagnosticCategory,

    /// Human-readable description of the issue.
    pub message: String,

    /// Optional file offset where the issue was found.
    pub offset: Option<u64>,

    /// Optional index into the section table.
    pub section: Option<usize>,
}

impl Diagnostic {
    /// Creates a new diagnostic entry.
    ///
    /// # Arguments
    ///
    /// * `severity` - Severity level of the diagnostic
    /// * `category` - Category of the diagnostic source
    /// * `message` - Human-readable description
    pub fn new(
        severity: DiagnosticSeverity,
        category: DiagnosticCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            offset: None,
            section: None,
        }
    }

    /// Adds file offset information to the diagnostic.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Adds the index of the section the diagnostic refers to.
    #[must_use]
    pub fn with_section(mut self, index: usize) -> Self {
        self.section = Some(index);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.message)?;

        if let Some(offset) = self.offset {
            write!(f, " (offset: 0x{:08x})", offset)?;
        }

        if let Some(section) = self.section {
            write!(f, " (section: {})", section)?;
        }

        Ok(())
    }
}

/// Append-only container for diagnostic entries.
///
/// Uses `boxcar::Vec` internally, so entries can be appended through a shared reference. The
/// image holds its container behind an [`std::sync::Arc`], which lets directory parsers and
/// the caller append to the same log.
#[derive(Debug)]
pub struct Diagnostics {
    entries: boxcar::Vec<Diagnostic>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Creates a new empty diagnostics container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: boxcar::Vec::new(),
        }
    }

    /// Adds an informational diagnostic.
    pub fn info(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticSeverity::Info, category, message));
    }

    /// Adds a warning diagnostic.
    pub fn warning(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Warning,
            category,
            message,
        ));
    }

    /// Adds an error diagnostic.
    pub fn error(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Error,
            category,
            message,
        ));
    }

    /// Adds a diagnostic entry directly and forwards it to the `log` facade.
    ///
    /// Use this for diagnostics that need additional context like a file offset
    /// or a section index.
    pub fn push(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            DiagnosticSeverity::Info => log::info!("{diagnostic}"),
            DiagnosticSeverity::Warning => log::warn!("{diagnostic}"),
            DiagnosticSeverity::Error => log::error!("{diagnostic}"),
        }
        self.entries.push(diagnostic);
    }

    /// Returns true if any diagnostics have been collected.
    pub fn has_any(&self) -> bool {
        self.entries.count() > 0
    }

    /// Returns true if any error-level diagnostics have been collected.
    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, d)| d.severity == DiagnosticSeverity::Error)
    }

    /// Returns true if any warning-level diagnostics have been collected.
    pub fn has_warnings(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, d)| d.severity == DiagnosticSeverity::Warning)
    }

    /// Returns the total number of diagnostics.
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    /// Returns the number of diagnostics with the given severity.
    pub fn count_of(&self, severity: DiagnosticSeverity) -> usize {
        self.entries
            .iter()
            .filter(|(_, d)| d.severity == severity)
            .count()
    }

    /// Returns an iterator over all diagnostics, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|(_, d)| d)
    }

    /// Returns diagnostics filtered by category.
    pub fn by_category(&self, category: DiagnosticCategory) -> Vec<&Diagnostic> {
        self.iter().filter(|d| d.category == category).collect()
    }

    /// Formats a summary of all diagnostics for display.
    pub fn summary(&self) -> String {
        let mut output = String::new();

        let _ = writeln!(
            output,
            "Diagnostics: {} error(s), {} warning(s), {} info(s)",
            self.count_of(DiagnosticSeverity::Error),
            self.count_of(DiagnosticSeverity::Warning),
            self.count_of(DiagnosticSeverity::Info)
        );

        for diag in self.iter() {
            let _ = writeln!(output, "  {diag}");
        }

        output
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

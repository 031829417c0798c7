//! Load configuration.
//!
//! [`LoadConfig`] decides which best-effort parts of the pipeline run and which directory
//! parse stages are dispatched after the sections are loaded. The mandatory structural stages
//! (DOS header, header offset, signature, file header, section headers, optional header and
//! section data) always run.

use strum::IntoEnumIterator;

use crate::image::directories::ParseStage;

/// Options controlling an image load.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct LoadConfig {
    /// Load the COFF string table of disk-sourced images
    pub load_coff_strings: bool,

    /// Replace `/<offset>` section names with their long names from the COFF string table.
    /// Has no effect without `load_coff_strings`.
    pub resolve_section_names: bool,

    /// Keep the DOS block and the section-header gap bytes for re-serialisation
    pub capture_gaps: bool,

    /// Directory parse stages to dispatch, in order
    pub stages: Vec<ParseStage>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            load_coff_strings: true,
            resolve_section_names: true,
            capture_gaps: true,
            stages: ParseStage::iter().collect(),
        }
    }
}

impl LoadConfig {
    /// Headers, sections and section data only.
    ///
    /// Skips the COFF string table, the gap captures and every directory parse stage.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            load_coff_strings: false,
            resolve_section_names: false,
            capture_gaps: false,
            stages: Vec::new(),
        }
    }

    /// Everything enabled; identical to [`LoadConfig::default`].
    #[must_use]
    pub fn comprehensive() -> Self {
        Self::default()
    }

    /// Restrict the dispatched directory stages.
    #[must_use]
    pub fn with_stages(mut self, stages: &[ParseStage]) -> Self {
        self.stages = stages.to_vec();
        self
    }

    /// Whether `stage` is dispatched under this configuration.
    #[must_use]
    pub fn runs(&self, stage: ParseStage) -> bool {
        self.stages.contains(&stage)
    }
}

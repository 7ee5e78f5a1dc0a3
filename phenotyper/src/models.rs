use std::fmt;

use polars::prelude::*;

pub const LOCATION_X: &str = "Location_Center_X";
pub const LOCATION_Y: &str = "Location_Center_Y";
pub const CELL_ID: &str = "Cell_ID";

pub const METADATA_PLATE: &str = "Metadata_Plate";
pub const METADATA_WELL: &str = "Metadata_Well";
pub const METADATA_SITE: &str = "Metadata_Site";
pub const METADATA_REAGENT: &str = "Metadata_Reagent";

/// Marker shared by every source-prefixed feature column (`CP__`, `DP__`).
pub const FEATURE_MARKER: &str = "P__";

/// Wraps any foreign error so it can travel through `PolarsResult`.
pub fn polars_err(e: Box<dyn std::error::Error>) -> PolarsError {
    PolarsError::ComputeError(format!("{}", e).into())
}

/// A table the pipeline can load from disk.
pub trait Dataset {
    fn load(&self) -> PolarsResult<DataFrame>;
}

/// Where a single-cell feature column came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSource {
    CellProfiler,
    DeepProfiler,
}

impl FeatureSource {
    pub fn prefix(&self) -> &'static str {
        match self {
            FeatureSource::CellProfiler => "CP__",
            FeatureSource::DeepProfiler => "DP__",
        }
    }
}

/// One field of view: (plate, well, site).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey {
    pub plate: String,
    pub well: String,
    pub site: u32,
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/site {}", self.plate, self.well, self.site)
    }
}

pub fn is_feature_column(name: &str) -> bool {
    name.contains(FEATURE_MARKER)
}

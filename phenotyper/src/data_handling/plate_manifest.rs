use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::info;

use crate::helper_functions::str_values;
use crate::models::Dataset;

/// Server-side prefix that has to go before a plate folder can be fetched.
pub const IDR_FILESET_PREFIX: &str = "/uod/idr/filesets/idr0080-way-perturbation/";

#[derive(Debug, Clone, PartialEq)]
pub struct PlateEntry {
    pub plate: String,
    pub manifest_path: String,
    pub download_path: String,
}

/// Headerless IDR plates TSV: plate, manifest path.
pub struct PlateManifest {
    pub path: PathBuf,
}

impl Dataset for PlateManifest {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading plate manifest {}", self.path.display());
        let mut df = CsvReadOptions::default()
            .with_has_header(false)
            .with_parse_options(CsvParseOptions::default().with_separator(b'\t'))
            .try_into_reader_with_file_path(Some(self.path.clone()))?
            .finish()?;
        df.set_column_names(["plate", "manifest_path"])?;
        Ok(df)
    }
}

pub fn strip_fileset_prefix(manifest_path: &str) -> String {
    manifest_path.replace(IDR_FILESET_PREFIX, "")
}

impl PlateManifest {
    pub fn entries(&self) -> PolarsResult<Vec<PlateEntry>> {
        let df = self.load()?;
        let plates = str_values(&df, "plate")?;
        let paths = str_values(&df, "manifest_path")?;
        Ok(plates
            .into_iter()
            .zip(paths)
            .map(|(plate, manifest_path)| PlateEntry {
                plate,
                download_path: strip_fileset_prefix(&manifest_path),
                manifest_path,
            })
            .collect())
    }

    pub fn load_entries(path: &Path) -> PolarsResult<Vec<PlateEntry>> {
        PlateManifest { path: path.to_path_buf() }.entries()
    }
}

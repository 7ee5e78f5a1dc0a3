use std::collections::HashMap;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{error, info};

use crate::helper_functions::{has_column, read_csv, str_values};
use crate::models::Dataset;

pub const PLATE_COLUMN: &str = "Plate";
pub const WELL_COLUMN: &str = "Well";
pub const REAGENT_COLUMN: &str = "Reagent Identifier";
pub const CONTROL_TYPE_COLUMN: &str = "Control Type";
pub const CELL_LINE_COLUMN: &str = "Characteristics [Cell Line]";

pub const NO_REAGENT: &str = "no reagent";
pub const NEGATIVE_CONTROL: &str = "negative";

/// IDR screen annotation CSV (one row per plate and well).
pub struct AnnotationsFile {
    pub path: PathBuf,
}

impl Dataset for AnnotationsFile {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading annotations from {}", self.path.display());
        match read_csv(&self.path) {
            Ok(df) => Ok(df),
            Err(e) => {
                error!("Failed to read annotation CSV: {}", e);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub plate: String,
    pub well: String,
    pub reagent: Option<String>,
    pub control_type: Option<String>,
    pub cell_line: Option<String>,
}

/// Annotation rows indexed by (plate, well).
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    by_well: HashMap<(String, String), Vec<Annotation>>,
}

fn optional_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<String>>> {
    if !has_column(df, name) {
        return Ok(vec![None; df.height()]);
    }
    Ok(str_values(df, name)?
        .into_iter()
        .map(|v| if v.trim().is_empty() { None } else { Some(v) })
        .collect())
}

impl Annotations {
    pub fn load(path: &Path) -> PolarsResult<Self> {
        let df = AnnotationsFile { path: path.to_path_buf() }.load()?;
        Self::from_dataframe(&df)
    }

    pub fn from_dataframe(df: &DataFrame) -> PolarsResult<Self> {
        let plates = str_values(df, PLATE_COLUMN)?;
        let wells = str_values(df, WELL_COLUMN)?;
        let reagents = optional_values(df, REAGENT_COLUMN)?;
        let control_types = optional_values(df, CONTROL_TYPE_COLUMN)?;
        let cell_lines = optional_values(df, CELL_LINE_COLUMN)?;

        let mut by_well: HashMap<(String, String), Vec<Annotation>> = HashMap::new();
        for i in 0..df.height() {
            let annotation = Annotation {
                plate: plates[i].clone(),
                well: wells[i].clone(),
                reagent: reagents[i].clone(),
                control_type: control_types[i].clone(),
                cell_line: cell_lines[i].clone(),
            };
            by_well
                .entry((annotation.plate.clone(), annotation.well.clone()))
                .or_default()
                .push(annotation);
        }
        info!("Indexed {} annotation rows over {} wells", df.height(), by_well.len());
        Ok(Annotations { by_well })
    }

    /// The single annotation row of (plate, well); none or several is an error.
    pub fn lookup(&self, plate: &str, well: &str) -> PolarsResult<&Annotation> {
        let rows = self
            .by_well
            .get(&(plate.to_string(), well.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        match rows {
            [single] => Ok(single),
            _ => Err(PolarsError::ComputeError(
                format!(
                    "expected one annotation row for plate {} well {}, found {}",
                    plate,
                    well,
                    rows.len()
                )
                .into(),
            )),
        }
    }

    pub fn control_type(&self, plate: &str, well: &str) -> PolarsResult<Option<&str>> {
        Ok(self.lookup(plate, well)?.control_type.as_deref())
    }

    pub fn is_negative_control(&self, plate: &str, well: &str) -> PolarsResult<bool> {
        Ok(self.control_type(plate, well)? == Some(NEGATIVE_CONTROL))
    }

    /// Reagent identifier, `"no reagent"` when the well has none.
    pub fn reagent_or_default(&self, plate: &str, well: &str) -> PolarsResult<String> {
        Ok(self
            .lookup(plate, well)?
            .reagent
            .clone()
            .unwrap_or_else(|| NO_REAGENT.to_string()))
    }

    pub fn cell_line(&self, plate: &str, well: &str) -> PolarsResult<Option<&str>> {
        Ok(self.lookup(plate, well)?.cell_line.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn annotations() -> Annotations {
        let df = df![
            "Plate" => &["SQ1", "SQ1", "SQ1", "SQ1"],
            "Well" => &["A1", "A2", "B1", "B1"],
            "Reagent Identifier" => &[Some("EMPTY"), None, Some("KRAS-1"), Some("KRAS-2")],
            "Control Type" => &[Some("negative"), Some("no reagent"), None, None],
            "Characteristics [Cell Line]" => &["A549", "A549", "A549", "A549"]
        ]
        .unwrap();
        Annotations::from_dataframe(&df).unwrap()
    }

    #[test]
    fn lookup_finds_single_rows() {
        let a = annotations();
        assert!(a.is_negative_control("SQ1", "A1").unwrap());
        assert!(!a.is_negative_control("SQ1", "A2").unwrap());
        assert_eq!(a.reagent_or_default("SQ1", "A2").unwrap(), "no reagent");
        assert_eq!(a.cell_line("SQ1", "A1").unwrap(), Some("A549"));
    }

    #[test]
    fn missing_and_ambiguous_wells_are_errors() {
        let a = annotations();
        let missing = a.lookup("SQ1", "H12").unwrap_err().to_string();
        assert!(missing.contains("found 0"));
        let ambiguous = a.lookup("SQ1", "B1").unwrap_err().to_string();
        assert!(ambiguous.contains("found 2"));
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{info, warn};

use crate::classification::classify::{classifications_file, MULTI_CLASS_MODELS, SINGLE_CLASS_MODELS};
use crate::config::PipelineConfig;
use crate::data_handling::annotations::NO_REAGENT;
use crate::helper_functions::{read_csv_gz, str_values, sub_directories, write_tsv};
use crate::models::{LOCATION_X, LOCATION_Y, METADATA_REAGENT};

pub const PERT_NAME: &str = "Metadata_pert_name";
pub const CELL_LINE: &str = "Metadata_cell_line";

/// Probability columns: everything that is neither metadata nor location.
pub fn phenotype_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .filter(|c| !c.contains("Metadata") && c.as_str() != LOCATION_X && c.as_str() != LOCATION_Y)
        .map(|c| c.to_string())
        .collect()
}

fn cell_line_profile(
    classifications_dir: &Path,
    cell_line: &str,
    plates: &[String],
) -> PolarsResult<Option<DataFrame>> {
    let mut cells: Option<DataFrame> = None;
    for plate in plates {
        let path = classifications_file(classifications_dir, plate);
        if !path.is_file() {
            warn!("No classifications for plate {} in {}", plate, classifications_dir.display());
            continue;
        }
        let df = read_csv_gz(&path)?;
        let phenotypes = phenotype_columns(&df);

        let mut columns = vec![df.column(METADATA_REAGENT)?.cast(&DataType::String)?];
        for p in &phenotypes {
            columns.push(df.column(p)?.cast(&DataType::Float64)?);
        }
        let mut plate_cells = DataFrame::new(columns)?;
        plate_cells.rename(METADATA_REAGENT, PERT_NAME.into())?;
        match cells.as_mut() {
            Some(all) => {
                all.vstack_mut(&plate_cells)?;
            }
            None => cells = Some(plate_cells),
        }
    }

    let Some(mut cells) = cells else {
        return Ok(None);
    };
    let height = cells.height();
    cells.with_column(Column::new(CELL_LINE.into(), vec![cell_line.to_string(); height]))?;

    let means: Vec<Expr> = phenotype_columns(&cells)
        .iter()
        .map(|p| col(p.as_str()).mean())
        .collect();
    let profile = cells
        .lazy()
        .group_by([col(PERT_NAME), col(CELL_LINE)])
        .agg(means)
        .sort([PERT_NAME, CELL_LINE], SortMultipleOptions::default())
        .collect()?;
    Ok(Some(profile))
}

/// Mean class probability per (perturbation, cell line), with `no reagent`
/// wells reported as `EMPTY`.
pub fn create_classification_profiles(
    classifications_dir: &Path,
    cell_line_plates: &BTreeMap<String, Vec<String>>,
) -> PolarsResult<DataFrame> {
    let mut profiles: Option<DataFrame> = None;
    for (cell_line, plates) in cell_line_plates {
        let Some(profile) = cell_line_profile(classifications_dir, cell_line, plates)? else {
            continue;
        };
        match profiles.as_mut() {
            Some(all) => {
                all.vstack_mut(&profile)?;
            }
            None => profiles = Some(profile),
        }
    }
    let Some(mut profiles) = profiles else {
        return Ok(DataFrame::default());
    };

    let perts: Vec<String> = str_values(&profiles, PERT_NAME)?
        .into_iter()
        .map(|p| if p == NO_REAGENT { "EMPTY".to_string() } else { p })
        .collect();
    profiles.with_column(Series::new(PERT_NAME.into(), perts))?;
    Ok(profiles)
}

pub fn profile_path(config: &PipelineConfig, classifications_subdir: &Path) -> PathBuf {
    let name = classifications_subdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    config.profiles_dir().join(format!("{}__classification_profiles.tsv", name))
}

/// Every `<model>__<feature>` output folder below the classifications dir.
fn model_output_dirs(classifications_dir: &Path) -> PolarsResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let multi = classifications_dir.join(MULTI_CLASS_MODELS);
    if multi.is_dir() {
        dirs.extend(sub_directories(&multi)?);
    }
    let single = classifications_dir.join(SINGLE_CLASS_MODELS);
    if single.is_dir() {
        for class_dir in sub_directories(&single)? {
            dirs.extend(sub_directories(&class_dir)?);
        }
    }
    Ok(dirs)
}

/// Writes one profile TSV per model output folder.
pub fn derive_profiles(config: &PipelineConfig) -> PolarsResult<usize> {
    let mut written = 0;
    for dir in model_output_dirs(&config.classifications_dir())? {
        let output = profile_path(config, &dir);
        if output.is_file() {
            info!("Profiles already derived at {}", output.display());
            continue;
        }
        let mut profiles = create_classification_profiles(&dir, &config.cell_line_plates)?;
        if profiles.height() == 0 {
            warn!("No classifications to profile in {}", dir.display());
            continue;
        }
        write_tsv(&mut profiles, &output)?;
        info!("Saved {} profiles to {}", profiles.height(), output.display());
        written += 1;
    }
    Ok(written)
}

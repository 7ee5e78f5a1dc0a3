//! CP/DP single-cell merge: within every image, each DP cell is matched to
//! the nearest CP cell by its (x, y) location and the two feature sets are
//! joined side by side.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::data_handling::manifest::{format_cp_site, format_cp_well, normalize_site};
use crate::feature_extraction::cellprofiler::{plate_output_dir, NUCLEI_TABLE};
use crate::feature_extraction::deepprofiler::single_cell_path;
use crate::helper_functions::{
    cast_to_string, f64_values, has_column, read_csv, read_csv_gz, str_values, write_csv_gz,
};
use crate::models::{
    is_feature_column, Dataset, FeatureSource, LOCATION_X, LOCATION_Y, METADATA_PLATE,
    METADATA_REAGENT, METADATA_SITE, METADATA_WELL,
};
use crate::segmentation::geometry::{nearest, Point};

/// CP feature modules carried into the merge.
pub const CP_FEATURE_MODULES: [&str; 6] = [
    "AreaShape_",
    "Granularity_",
    "Intensity_",
    "Neighbors_",
    "RadialDistribution_",
    "Texture_",
];

/// DP columns that keep their metadata name after prefixing.
const DP_METADATA_RENAMES: [(&str, &str); 2] = [
    ("DP__Metadata_Reagent", METADATA_REAGENT),
    ("DP__Metadata_Plate_Map_Name", "Metadata_Plate_Map_Name"),
];

const DP_DROPPED_COLUMNS: [&str; 3] = [
    "DP__Metadata_DNA",
    "DP__Metadata_Reagent_Replicate",
    "DP__Metadata_Model",
];

/// CellProfiler nuclei table of one plate.
pub struct CellProfilerNuclei {
    pub plate_dir: PathBuf,
    pub plate: String,
}

impl Dataset for CellProfilerNuclei {
    fn load(&self) -> PolarsResult<DataFrame> {
        load_cp_feature_data(&self.plate_dir, &self.plate)
    }
}

/// DeepProfiler single-cell export of one plate.
pub struct DeepProfilerSingleCells {
    pub path: PathBuf,
}

impl Dataset for DeepProfilerSingleCells {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Loading DP features from {}", self.path.display());
        let mut df = read_csv_gz(&self.path)?;
        normalize_image_keys(&mut df)?;
        Ok(df)
    }
}

/// Plate/well/site as text, site without leading zeros.
pub fn normalize_image_keys(df: &mut DataFrame) -> PolarsResult<()> {
    for key in [METADATA_PLATE, METADATA_WELL, METADATA_SITE] {
        cast_to_string(df, key)?;
    }
    if has_column(df, METADATA_SITE) {
        let sites: Vec<String> = str_values(df, METADATA_SITE)?
            .iter()
            .map(|s| normalize_site(s))
            .collect();
        df.with_column(Series::new(METADATA_SITE.into(), sites))?;
    }
    Ok(())
}

fn convert_column(
    df: &mut DataFrame,
    name: &str,
    convert: fn(&str) -> Option<String>,
) -> PolarsResult<()> {
    let converted = str_values(df, name)?
        .iter()
        .map(|v| {
            convert(v).ok_or_else(|| {
                PolarsError::ComputeError(format!("unexpected {} value {:?}", name, v).into())
            })
        })
        .collect::<PolarsResult<Vec<String>>>()?;
    df.with_column(Series::new(name.into(), converted))?;
    Ok(())
}

/// Loads `Nuclei.csv` of one plate, keeping location, well/field and the
/// feature-module columns, with well and site in DP notation.
pub fn load_cp_feature_data(cp_plate_dir: &Path, plate: &str) -> PolarsResult<DataFrame> {
    let path = cp_plate_dir.join(NUCLEI_TABLE);
    info!("Loading CP features from {}", path.display());
    let raw = read_csv(&path)?;

    let mut keep: Vec<String> = vec![
        "Metadata_Field".to_string(),
        METADATA_WELL.to_string(),
        LOCATION_X.to_string(),
        LOCATION_Y.to_string(),
    ];
    keep.extend(
        raw.get_column_names()
            .iter()
            .filter(|c| CP_FEATURE_MODULES.iter().any(|m| c.starts_with(m)))
            .map(|c| c.to_string()),
    );
    let mut cp = raw.select(keep)?;

    cast_to_string(&mut cp, METADATA_WELL)?;
    cast_to_string(&mut cp, "Metadata_Field")?;
    convert_column(&mut cp, METADATA_WELL, format_cp_well)?;
    convert_column(&mut cp, "Metadata_Field", format_cp_site)?;
    cp.rename("Metadata_Field", METADATA_SITE.into())?;
    let height = cp.height();
    cp.with_column(Column::new(METADATA_PLATE.into(), vec![plate.to_string(); height]))?;

    debug!("CP plate {}: {} cells, {} columns", plate, cp.height(), cp.width());
    Ok(cp)
}

fn locations(df: &DataFrame) -> PolarsResult<Vec<Point>> {
    let xs = f64_values(df, LOCATION_X)?;
    let ys = f64_values(df, LOCATION_Y)?;
    Ok(xs.into_iter().zip(ys).map(|(x, y)| Point::new(x, y)).collect())
}

fn prefix_columns(df: &mut DataFrame, unique: &HashSet<String>, source: FeatureSource) -> PolarsResult<()> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|c| {
            if unique.contains(c.as_str()) {
                format!("{}{}", source.prefix(), c)
            } else {
                c.to_string()
            }
        })
        .collect();
    df.set_column_names(names)
}

/// Keeps rows without nulls whose feature values are all finite.
fn drop_incomplete_rows(df: &DataFrame) -> PolarsResult<DataFrame> {
    let mut keep = vec![true; df.height()];
    for column in df.get_columns() {
        let name = column.name().as_str();
        if is_feature_column(name) {
            for (k, v) in keep.iter_mut().zip(f64_values(df, name)?) {
                *k &= v.is_finite();
            }
        } else {
            let nulls = column.is_null();
            for (k, null) in keep.iter_mut().zip(&nulls) {
                *k &= !null.unwrap_or(true);
            }
        }
    }
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped > 0 {
        debug!("Dropping {} cells with missing or infinite values", dropped);
    }
    df.filter(&BooleanChunked::from_slice("keep".into(), &keep))
}

/// Location columns, then metadata, then CP, then DP features.
fn order_columns(df: &DataFrame) -> PolarsResult<DataFrame> {
    let names: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
    let mut ordered: Vec<String> = Vec::with_capacity(names.len());
    for group in ["Location_", "Metadata_", "CP_", "DP_"] {
        for name in names.iter().filter(|n| n.contains(group)) {
            if !ordered.contains(name) {
                ordered.push(name.clone());
            }
        }
    }
    df.select(ordered)
}

/// Merges CP and DP single cells of one image. Both tables must hold the
/// same number of cells.
pub fn merge_cp_dp_image_data(cp: &DataFrame, dp: &DataFrame) -> PolarsResult<DataFrame> {
    if cp.height() != dp.height() {
        return Err(PolarsError::ShapeMismatch(
            format!(
                "CP and DP data have different numbers of cells ({} vs {})",
                cp.height(),
                dp.height()
            )
            .into(),
        ));
    }

    let cp_points = locations(cp)?;
    let dp_points = locations(dp)?;

    let cp_names: Vec<String> = cp.get_column_names().iter().map(|c| c.to_string()).collect();
    let dp_names: HashSet<String> = dp.get_column_names().iter().map(|c| c.to_string()).collect();
    let shared: Vec<String> = cp_names.iter().filter(|c| dp_names.contains(*c)).cloned().collect();
    let cp_unique: HashSet<String> = cp_names.iter().filter(|c| !shared.contains(*c)).cloned().collect();
    let dp_unique: HashSet<String> = dp_names.iter().filter(|c| !shared.contains(*c)).cloned().collect();

    // (cp row, dp row), CP order first, then DP order
    let mut pairs: Vec<(IdxSize, IdxSize)> = Vec::with_capacity(dp_points.len());
    for (dp_row, p) in dp_points.iter().enumerate() {
        if let Some(cp_row) = nearest(p, &cp_points) {
            pairs.push((cp_row as IdxSize, dp_row as IdxSize));
        }
    }
    pairs.sort();

    let mut cp_part = cp.clone();
    prefix_columns(&mut cp_part, &cp_unique, FeatureSource::CellProfiler)?;
    let mut dp_part = dp.drop_many(shared.iter().map(String::as_str));
    prefix_columns(&mut dp_part, &dp_unique, FeatureSource::DeepProfiler)?;

    let cp_idx = IdxCa::from_vec("cp".into(), pairs.iter().map(|p| p.0).collect());
    let dp_idx = IdxCa::from_vec("dp".into(), pairs.iter().map(|p| p.1).collect());
    let cp_part = cp_part.take(&cp_idx)?;
    let dp_part = dp_part.take(&dp_idx)?;
    let mut merged = cp_part.hstack(dp_part.get_columns())?;

    for (from, to) in DP_METADATA_RENAMES {
        if has_column(&merged, from) {
            merged.rename(from, to.into())?;
        }
    }
    for name in DP_DROPPED_COLUMNS {
        if has_column(&merged, name) {
            merged.drop_in_place(name)?;
        }
    }

    let merged = drop_incomplete_rows(&merged)?;
    order_columns(&merged)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeSummary {
    pub merged_images: usize,
    pub failed_images: Vec<(String, String)>,
}

/// Row indices of every (well, site) image, in first-seen order.
fn image_rows(df: &DataFrame) -> PolarsResult<(Vec<(String, String)>, HashMap<(String, String), Vec<IdxSize>>)> {
    let wells = str_values(df, METADATA_WELL)?;
    let sites = str_values(df, METADATA_SITE)?;
    let mut order = Vec::new();
    let mut rows: HashMap<(String, String), Vec<IdxSize>> = HashMap::new();
    for (i, key) in wells.into_iter().zip(sites).enumerate() {
        let entry = rows.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        entry.push(i as IdxSize);
    }
    Ok((order, rows))
}

/// Merges all images of one plate, DP images first, then CP-only ones.
/// Images whose cell counts differ are logged and left out.
pub fn merge_plate(cp_plate: &DataFrame, dp_plate: &DataFrame) -> PolarsResult<(DataFrame, MergeSummary)> {
    let mut cp_plate = cp_plate.clone();
    let mut dp_plate = dp_plate.clone();
    normalize_image_keys(&mut cp_plate)?;
    normalize_image_keys(&mut dp_plate)?;

    let (mut images, dp_rows) = image_rows(&dp_plate)?;
    let (cp_images, cp_rows) = image_rows(&cp_plate)?;
    // images with CP cells but no DP rows still count as mismatches
    images.extend(cp_images.into_iter().filter(|key| !dp_rows.contains_key(key)));

    let mut summary = MergeSummary::default();
    let mut merged: Option<DataFrame> = None;
    for key in images {
        let cp_idx = cp_rows.get(&key).cloned().unwrap_or_default();
        let dp_idx = dp_rows.get(&key).cloned().unwrap_or_default();
        let cp_image = cp_plate.take(&IdxCa::from_vec("idx".into(), cp_idx))?;
        let dp_image = dp_plate.take(&IdxCa::from_vec("idx".into(), dp_idx))?;

        match merge_cp_dp_image_data(&cp_image, &dp_image) {
            Ok(image) => {
                summary.merged_images += 1;
                match merged.as_mut() {
                    Some(all) => {
                        all.vstack_mut(&image)?;
                    }
                    None => merged = Some(image),
                }
            }
            Err(PolarsError::ShapeMismatch(msg)) => {
                error!("Skipping well {} site {}: {}", key.0, key.1, msg);
                summary.failed_images.push(key);
            }
            Err(e) => return Err(e),
        }
    }
    Ok((merged.unwrap_or_default(), summary))
}

pub fn merged_path(config: &PipelineConfig, plate: &str) -> PathBuf {
    config.merged_dir().join(format!("{}-merged-single-cell.csv.gz", plate))
}

/// Merges every plate that has both CP and DP outputs.
pub fn merge_plates(config: &PipelineConfig, plates: &[String]) -> PolarsResult<Vec<MergeSummary>> {
    let mut summaries = Vec::new();
    for plate in plates {
        let output = merged_path(config, plate);
        if output.is_file() {
            info!("Merged features for {} already exist", plate);
            continue;
        }
        let cp_dir = plate_output_dir(config, plate);
        let dp_file = single_cell_path(config, plate);
        if !cp_dir.join(NUCLEI_TABLE).is_file() || !dp_file.is_file() {
            warn!("Missing CP or DP features for plate {}, skipping", plate);
            continue;
        }

        info!("Merging plate {} ...", plate);
        let cp = CellProfilerNuclei { plate_dir: cp_dir, plate: plate.clone() }.load()?;
        let dp = DeepProfilerSingleCells { path: dp_file }.load()?;
        let (mut merged, summary) = merge_plate(&cp, &dp)?;

        info!(
            "Saving {} merged cells from {} images ({} images failed)",
            merged.height(),
            summary.merged_images,
            summary.failed_images.len()
        );
        write_csv_gz(&mut merged, &output)?;
        summaries.push(summary);
    }
    Ok(summaries)
}

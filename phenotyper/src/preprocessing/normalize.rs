//! Per-plate z-scoring of merged features, fit on negative-control cells.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::data_handling::annotations::Annotations;
use crate::helper_functions::{f64_values, read_csv_gz, str_values, write_csv_gz};
use crate::models::{is_feature_column, polars_err, METADATA_PLATE, METADATA_WELL};
use crate::preprocessing::merge::{merged_path, normalize_image_keys};

/// Feature-wise standardization, `(x - mean) / scale`, with the population
/// standard deviation as scale (1 for constant features).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
    pub var: Vec<f64>,
    pub n_samples_seen: usize,
}

pub fn feature_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .filter(|c| is_feature_column(c))
        .map(|c| c.to_string())
        .collect()
}

impl StandardScaler {
    /// Fits on the rows of `df` where `rows` is true.
    pub fn fit(df: &DataFrame, feature_names: &[String], rows: &[bool]) -> PolarsResult<Self> {
        let n_samples_seen = rows.iter().filter(|r| **r).count();
        if n_samples_seen == 0 {
            return Err(PolarsError::ComputeError(
                "no cells to fit the normalization scaler on".into(),
            ));
        }

        let mut mean = Vec::with_capacity(feature_names.len());
        let mut var = Vec::with_capacity(feature_names.len());
        let mut scale = Vec::with_capacity(feature_names.len());
        for name in feature_names {
            let values: Vec<f64> = f64_values(df, name)?
                .into_iter()
                .zip(rows)
                .filter_map(|(v, keep)| keep.then_some(v))
                .collect();
            let m = values.iter().mean();
            let v = values.iter().population_variance();
            let s = v.sqrt();
            mean.push(m);
            var.push(v);
            scale.push(if s == 0.0 || !s.is_finite() { 1.0 } else { s });
        }

        Ok(StandardScaler {
            feature_names: feature_names.to_vec(),
            mean,
            scale,
            var,
            n_samples_seen,
        })
    }

    /// Standardizes the scaler's features; metadata columns come first.
    pub fn transform(&self, df: &DataFrame) -> PolarsResult<DataFrame> {
        let mut out = df.clone();
        for (i, name) in self.feature_names.iter().enumerate() {
            let scaled: Vec<f64> = f64_values(df, name)?
                .into_iter()
                .map(|v| (v - self.mean[i]) / self.scale[i])
                .collect();
            out.with_column(Series::new(name.as_str().into(), scaled))?;
        }

        let mut order: Vec<String> = out
            .get_column_names()
            .iter()
            .filter(|c| !is_feature_column(c))
            .map(|c| c.to_string())
            .collect();
        order.extend(feature_columns(&out));
        out.select(order)
    }

    pub fn save(&self, path: &Path) -> PolarsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| polars_err(Box::new(e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> PolarsResult<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| polars_err(Box::new(e)))
    }
}

/// True for cells whose (plate, well) is annotated as a negative control.
pub fn negative_control_mask(df: &DataFrame, annotations: &Annotations) -> PolarsResult<Vec<bool>> {
    let plates = str_values(df, METADATA_PLATE)?;
    let wells = str_values(df, METADATA_WELL)?;
    let mut cache: HashMap<(&str, &str), bool> = HashMap::new();
    let mut mask = Vec::with_capacity(df.height());
    for (plate, well) in plates.iter().zip(&wells) {
        let key = (plate.as_str(), well.as_str());
        let negative = match cache.get(&key) {
            Some(n) => *n,
            None => {
                let n = annotations.is_negative_control(plate, well)?;
                cache.insert(key, n);
                n
            }
        };
        mask.push(negative);
    }
    Ok(mask)
}

pub fn normalize_plate(
    merged: &DataFrame,
    annotations: &Annotations,
) -> PolarsResult<(DataFrame, StandardScaler)> {
    let negatives = negative_control_mask(merged, annotations)?;
    info!(
        "Deriving normalization scaler from {} negative-control cells",
        negatives.iter().filter(|n| **n).count()
    );
    let scaler = StandardScaler::fit(merged, &feature_columns(merged), &negatives)?;
    let normalized = scaler.transform(merged)?;
    Ok((normalized, scaler))
}

pub fn normalized_path(config: &PipelineConfig, plate: &str) -> PathBuf {
    config
        .normalized_dir()
        .join(format!("{}-normalized-merged-single-cell.csv.gz", plate))
}

pub fn scaler_path(config: &PipelineConfig, plate: &str) -> PathBuf {
    config
        .scaler_dir()
        .join(format!("{}-merged-normalization-scaler.json", plate))
}

pub fn normalize_plates(
    config: &PipelineConfig,
    annotations: &Annotations,
    plates: &[String],
) -> PolarsResult<()> {
    for plate in plates {
        let output = normalized_path(config, plate);
        if output.is_file() {
            info!("Normalized features for {} already exist", plate);
            continue;
        }
        let input = merged_path(config, plate);
        if !input.is_file() {
            warn!("No merged features for plate {}, skipping", plate);
            continue;
        }

        info!("Normalizing plate {}...", plate);
        let mut merged = read_csv_gz(&input)?;
        normalize_image_keys(&mut merged)?;
        let scaler_file = scaler_path(config, plate);
        let mut normalized = if scaler_file.is_file() {
            info!("Reusing scaler {}", scaler_file.display());
            StandardScaler::load(&scaler_file)?.transform(&merged)?
        } else {
            let (normalized, scaler) = normalize_plate(&merged, annotations)?;
            scaler.save(&scaler_file)?;
            normalized
        };
        info!("Saving normalized features to {}", output.display());
        write_csv_gz(&mut normalized, &output)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn annotations() -> Annotations {
        Annotations::from_dataframe(
            &df![
                "Plate" => &["SQ1", "SQ1"],
                "Well" => &["A1", "B1"],
                "Control Type" => &[Some("negative"), None]
            ]
            .unwrap(),
        )
        .unwrap()
    }

    fn merged() -> DataFrame {
        df![
            "Metadata_Plate" => &["SQ1", "SQ1", "SQ1", "SQ1", "SQ1"],
            "Metadata_Well" => &["A1", "A1", "A1", "B1", "B1"],
            "CP__AreaShape_Area" => &[1.0, 2.0, 6.0, 100.0, 50.0],
            "DP__efficientnet_0" => &[3.0, 3.0, 3.0, 7.0, 8.0]
        ]
        .unwrap()
    }

    #[test]
    fn negative_controls_come_out_standardized() {
        let (normalized, scaler) = normalize_plate(&merged(), &annotations()).unwrap();
        assert_eq!(scaler.n_samples_seen, 3);
        assert_eq!(scaler.mean[0], 3.0);

        let area = f64_values(&normalized, "CP__AreaShape_Area").unwrap();
        let controls = &area[..3];
        let mean = controls.iter().mean();
        let std = controls.iter().population_std_dev();
        assert!(mean.abs() < 1e-12);
        assert!((std - 1.0).abs() < 1e-12);

        // constant feature keeps unit scale
        assert_eq!(scaler.scale[1], 1.0);
        assert_eq!(f64_values(&normalized, "DP__efficientnet_0").unwrap()[3], 4.0);
    }

    #[test]
    fn plate_without_negative_controls_fails() {
        let df = merged().slice(3, 2);
        assert!(normalize_plate(&df, &annotations()).is_err());
    }

    #[test]
    fn unannotated_well_fails() {
        let mut df = merged();
        df.with_column(Series::new("Metadata_Well".into(), &["A1", "A1", "A1", "B1", "Z9"]))
            .unwrap();
        assert!(negative_control_mask(&df, &annotations()).is_err());
    }

    #[test]
    fn scaler_is_persisted_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalers/SQ1-merged-normalization-scaler.json");
        let (_, scaler) = normalize_plate(&merged(), &annotations()).unwrap();
        scaler.save(&path).unwrap();
        assert_eq!(StandardScaler::load(&path).unwrap(), scaler);
    }

    #[test]
    fn saved_scaler_is_reused_for_the_plate() {
        let root = tempfile::tempdir().unwrap();
        let config = PipelineConfig { output_root: root.path().to_path_buf(), ..PipelineConfig::default() };
        let mut input = merged();
        write_csv_gz(&mut input, &merged_path(&config, "SQ1")).unwrap();

        let (_, mut scaler) = normalize_plate(&merged(), &annotations()).unwrap();
        scaler.mean[0] = 0.0;
        scaler.scale[0] = 1.0;
        scaler.save(&scaler_path(&config, "SQ1")).unwrap();

        normalize_plates(&config, &annotations(), &["SQ1".to_string()]).unwrap();
        let normalized = read_csv_gz(&normalized_path(&config, "SQ1")).unwrap();
        assert_eq!(
            f64_values(&normalized, "CP__AreaShape_Area").unwrap(),
            vec![1.0, 2.0, 6.0, 100.0, 50.0]
        );
    }
}

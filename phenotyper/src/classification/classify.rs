use std::path::{Path, PathBuf};

use ndarray::Array2;
use polars::prelude::*;
use tracing::{info, warn};

use crate::classification::model::{FeatureType, ModelName, PhenotypeClassifier};
use crate::config::PipelineConfig;
use crate::helper_functions::{f64_values, files_with_suffix, read_csv_gz, sub_directories, write_csv_gz};
use crate::models::is_feature_column;
use crate::preprocessing::merge::normalize_image_keys;
use crate::preprocessing::normalize::normalized_path;

pub const MULTI_CLASS_MODELS: &str = "multi_class_models";
pub const SINGLE_CLASS_MODELS: &str = "single_class_models";

/// A classifier file and where its outputs go, relative to the
/// classifications directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierEntry {
    pub path: PathBuf,
    pub name: ModelName,
    pub output_dir: PathBuf,
}

pub fn classifications_file(dir: &Path, plate: &str) -> PathBuf {
    dir.join(format!("{}__cell_classifications.csv.gz", plate))
}

fn entries_in(dir: &Path, output_parent: &Path) -> PolarsResult<Vec<ClassifierEntry>> {
    let mut entries = Vec::new();
    for path in files_with_suffix(dir, ".json")? {
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        match ModelName::parse(&file_name) {
            Some(name) => entries.push(ClassifierEntry {
                output_dir: output_parent.join(name.dir_name()),
                path,
                name,
            }),
            None => warn!("Ignoring unrecognised model file {}", path.display()),
        }
    }
    Ok(entries)
}

/// Multi-class models first, then every `<class>_models/` folder of
/// single-class models.
pub fn discover_models(models_dir: &Path) -> PolarsResult<Vec<ClassifierEntry>> {
    let mut entries = Vec::new();
    let multi = models_dir.join(MULTI_CLASS_MODELS);
    if multi.is_dir() {
        entries.extend(entries_in(&multi, Path::new(MULTI_CLASS_MODELS))?);
    }
    let single = models_dir.join(SINGLE_CLASS_MODELS);
    if single.is_dir() {
        for class_dir in sub_directories(&single)? {
            let dir_name = class_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let class = dir_name.split('_').next().unwrap_or_default();
            let output_parent = Path::new(SINGLE_CLASS_MODELS).join(format!("{}_models", class));
            entries.extend(entries_in(&class_dir, &output_parent)?);
        }
    }
    Ok(entries)
}

/// Per-cell class probabilities, one column per class.
pub fn probas_dataframe(
    plate_features: &DataFrame,
    model: &PhenotypeClassifier,
    feature_type: FeatureType,
) -> PolarsResult<DataFrame> {
    let columns = match &model.feature_names {
        Some(names) => names.clone(),
        None => feature_type.feature_columns(plate_features),
    };
    if columns.len() != model.n_features() {
        return Err(PolarsError::ShapeMismatch(
            format!(
                "{} {} features in table, model expects {}",
                columns.len(),
                feature_type,
                model.n_features()
            )
            .into(),
        ));
    }

    let mut x = Array2::<f64>::zeros((plate_features.height(), columns.len()));
    for (j, name) in columns.iter().enumerate() {
        for (i, v) in f64_values(plate_features, name)?.into_iter().enumerate() {
            x[[i, j]] = v;
        }
    }

    let probas = model.predict_proba(&x)?;
    let class_columns: Vec<Column> = model
        .classes
        .iter()
        .enumerate()
        .map(|(k, class)| Column::new(class.as_str().into(), probas.column(k).to_vec()))
        .collect();
    DataFrame::new(class_columns)
}

/// Non-feature columns of a normalized plate.
pub fn metadata_columns(df: &DataFrame) -> PolarsResult<DataFrame> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .filter(|c| !is_feature_column(c))
        .map(|c| c.to_string())
        .collect();
    df.select(names)
}

/// Applies every discovered classifier to every normalized plate.
pub fn classify_plates(config: &PipelineConfig, plates: &[String]) -> PolarsResult<usize> {
    let models = discover_models(&config.models_dir)?;
    if models.is_empty() {
        warn!("No classifiers found under {}", config.models_dir.display());
        return Ok(0);
    }

    let mut written = 0;
    for plate in plates {
        let input = normalized_path(config, plate);
        if !input.is_file() {
            warn!("No normalized features for plate {}, skipping", plate);
            continue;
        }
        let pending: Vec<&ClassifierEntry> = models
            .iter()
            .filter(|m| {
                !classifications_file(&config.classifications_dir().join(&m.output_dir), plate).is_file()
            })
            .collect();
        if pending.is_empty() {
            info!("Plate {} already classified by every model", plate);
            continue;
        }

        info!("Getting phenotypic class probabilities for plate {}...", plate);
        let mut features = read_csv_gz(&input)?;
        normalize_image_keys(&mut features)?;
        let metadata = metadata_columns(&features)?;

        for entry in pending {
            let model = PhenotypeClassifier::load(&entry.path)?;
            let probas = probas_dataframe(&features, &model, entry.name.feature_type)?;
            let mut out = metadata.hstack(probas.get_columns())?;
            let output = classifications_file(&config.classifications_dir().join(&entry.output_dir), plate);
            write_csv_gz(&mut out, &output)?;
            info!("Saved {} probabilities to {}", entry.name.dir_name(), output.display());
            written += 1;
        }
    }
    Ok(written)
}

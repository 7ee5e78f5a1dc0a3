//! Pipeline configuration: every filesystem location and external-tool
//! setting a stage needs, passed explicitly instead of hardcoded per stage.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::helper_functions::project_root;
use crate::segmentation::cellpose::ModelSpecs;
use crate::segmentation::correspondence::OverlapPolicy;

pub const CONFIG_ENV: &str = "PHENOTYPER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// `<images_root>/<plate>/<image folder>/<r01c01f01p01-ch1...>.tiff`
    pub images_root: PathBuf,
    pub segmentation_root: PathBuf,
    pub features_root: PathBuf,
    /// IDR screen annotation CSV.
    pub annotations_path: PathBuf,
    /// IDR plates TSV (plate, manifest path), used for downloads.
    pub plate_manifest_path: PathBuf,
    pub output_root: PathBuf,
    /// Pretrained classifiers (`multi_class_models/`, `single_class_models/`).
    pub models_dir: PathBuf,
    pub tools: ExternalTools,
    pub nuclei_model: ModelSpecs,
    pub cytoplasm_model: ModelSpecs,
    pub overlap_policy: OverlapPolicy,
    pub cell_line_plates: BTreeMap<String, Vec<String>>,
    pub comparison: ComparisonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalTools {
    pub python: PathBuf,
    /// Helper that runs cellpose on one image and writes a raw label mask.
    pub cellpose_script: PathBuf,
    pub cellprofiler: String,
    pub cellprofiler_pipeline: PathBuf,
    /// Helper that exports DeepProfiler outputs of one plate as a CSV table.
    pub deepprofiler_export_script: PathBuf,
    pub deepprofiler_config: String,
    pub deepprofiler_experiment: String,
    /// Program used to fetch plate folders (e.g. `ascp`), followed by its
    /// leading arguments; source and destination are appended.
    pub fetch_command: Vec<String>,
    pub fetch_remote_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// (label stored in `Metadata_Model_Type`, directory of probability files)
    pub runs: Vec<ComparisonRun>,
    /// Downsample negative controls to the treatment group size before testing.
    pub downsample_controls: bool,
    pub seed: u64,
    pub output_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRun {
    pub label: String,
    pub probabilities_dir: PathBuf,
}

impl Default for ExternalTools {
    fn default() -> Self {
        let root = project_root();
        ExternalTools {
            python: PathBuf::from("python"),
            cellpose_script: root.join("scripts/run_cellpose.py"),
            cellprofiler: "cellprofiler".to_string(),
            cellprofiler_pipeline: root.join("pipelines/process-cell-health.cppipe"),
            deepprofiler_export_script: root.join("scripts/export_deepprofiler.py"),
            deepprofiler_config: "cell_health_nuc_config.json".to_string(),
            deepprofiler_experiment: "efn_pretrained".to_string(),
            fetch_command: vec![
                "ascp".to_string(),
                "-TQ".to_string(),
                "-l40m".to_string(),
                "-P".to_string(),
                "33001".to_string(),
                "-i".to_string(),
                "asperaweb_id_dsa.openssh".to_string(),
            ],
            fetch_remote_prefix: "idr0080@fasp.ebi.ac.uk:".to_string(),
        }
    }
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        ComparisonConfig {
            runs: Vec::new(),
            downsample_controls: false,
            seed: 42,
            output_file: "well_comparisons.parquet".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let root = project_root();
        let data = root.join("data");
        let output_root = data.join("outputs");
        let mut cell_line_plates = BTreeMap::new();
        cell_line_plates.insert(
            "A549".to_string(),
            vec!["SQ00014610".into(), "SQ00014611".into(), "SQ00014612".into()],
        );
        cell_line_plates.insert(
            "ES2".to_string(),
            vec!["SQ00014613".into(), "SQ00014614".into(), "SQ00014615".into()],
        );
        cell_line_plates.insert(
            "HCC44".to_string(),
            vec!["SQ00014616".into(), "SQ00014617".into(), "SQ00014618".into()],
        );

        let classifications = output_root.join("classifications/multi_class_models");
        PipelineConfig {
            images_root: data.join("cell-health"),
            segmentation_root: data.join("cell-health-segmented"),
            features_root: data.join("cell-health-features"),
            annotations_path: root.join("manifest/idr0080-screenA-annotation.csv"),
            plate_manifest_path: root.join("manifest/idr0080-screenA-plates.tsv"),
            models_dir: root.join("models"),
            tools: ExternalTools::default(),
            nuclei_model: ModelSpecs::nuclei(),
            cytoplasm_model: ModelSpecs::cytoplasm(),
            overlap_policy: OverlapPolicy::default(),
            cell_line_plates,
            comparison: ComparisonConfig {
                runs: vec![
                    ComparisonRun {
                        label: "final".to_string(),
                        probabilities_dir: classifications.join("final__CP_areashape_only"),
                    },
                    ComparisonRun {
                        label: "shuffled".to_string(),
                        probabilities_dir: classifications
                            .join("shuffled_baseline__CP_areashape_only"),
                    },
                ],
                ..ComparisonConfig::default()
            },
            output_root,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&json)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// `$PHENOTYPER_CONFIG`, then `<project_root>/config.json`, then defaults.
    pub fn from_env() -> Result<Self> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            let path = PathBuf::from(path);
            info!("Loading configuration from {}", path.display());
            return Self::load(&path);
        }
        let default_path = project_root().join("config.json");
        if default_path.is_file() {
            info!("Loading configuration from {}", default_path.display());
            return Self::load(&default_path);
        }
        info!("No configuration file found, using defaults under {}", project_root().display());
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing config {}", path.display()))
    }

    pub fn cp_features_dir(&self) -> PathBuf {
        self.features_root.join("cp")
    }

    pub fn dp_project_dir(&self) -> PathBuf {
        self.features_root.join("dp-project")
    }

    pub fn dp_features_dir(&self) -> PathBuf {
        self.features_root.join("dp")
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.output_root.join("merged")
    }

    pub fn normalized_dir(&self) -> PathBuf {
        self.output_root.join("normalized")
    }

    pub fn scaler_dir(&self) -> PathBuf {
        self.output_root.join("normalization-scalers")
    }

    pub fn classifications_dir(&self) -> PathBuf {
        self.output_root.join("classifications")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.output_root.join("classification-profiles")
    }

    pub fn comparisons_dir(&self) -> PathBuf {
        self.output_root.join("comparisons")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.images_root.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "output_root": "/tmp/out", "overlap_policy": "first_containing" }"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.output_root, PathBuf::from("/tmp/out"));
        assert_eq!(config.merged_dir(), PathBuf::from("/tmp/out/merged"));
        assert_eq!(config.overlap_policy, OverlapPolicy::FirstContaining);
        assert_eq!(config.nuclei_model.diameter, 80.0);
        assert_eq!(config.cell_line_plates["ES2"].len(), 3);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg/config.json");
        let config = PipelineConfig::default();
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.comparison.runs, config.comparison.runs);
        assert_eq!(loaded.images_root, config.images_root);
    }
}

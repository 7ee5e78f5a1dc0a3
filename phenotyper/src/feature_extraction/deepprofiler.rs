//! DeepProfiler project layout: index and nucleus locations are compiled
//! here, profiling and single-cell export are external commands.

use std::path::{Component, Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::data_handling::annotations::Annotations;
use crate::data_handling::manifest::ImageManifest;
use crate::models::CELL_ID;
use crate::segmentation::correspondence::read_locations;
use crate::segmentation::stage::SegmentationPaths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    #[serde(rename = "Metadata_Plate")]
    pub plate: String,
    #[serde(rename = "Metadata_Well")]
    pub well: String,
    #[serde(rename = "Metadata_Site")]
    pub site: String,
    #[serde(rename = "Plate_Map_Name")]
    pub plate_map_name: String,
    /// DNA image, relative to the project's `inputs/images`.
    #[serde(rename = "DNA")]
    pub dna: String,
    #[serde(rename = "Reagent")]
    pub reagent: String,
    #[serde(rename = "Reagent_Replicate")]
    pub reagent_replicate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NucleusLocation {
    #[serde(rename = "Cell_ID")]
    pub cell_id: usize,
    #[serde(rename = "Nuclei_Location_Center_X")]
    pub x: f64,
    #[serde(rename = "Nuclei_Location_Center_Y")]
    pub y: f64,
}

pub fn index_path(project: &Path) -> PathBuf {
    project.join("inputs/metadata/index.csv")
}

pub fn images_dir(project: &Path) -> PathBuf {
    project.join("inputs/images")
}

pub fn locations_path(project: &Path, plate: &str, well: &str, site: &str) -> PathBuf {
    project
        .join("inputs/locations")
        .join(plate)
        .join(format!("{}-{}-Nuclei.csv", well, site))
}

/// `target` expressed relative to `base` (both absolute or both relative).
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = base.iter().zip(&target).take_while(|(a, b)| a == b).count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for part in &target[common..] {
        relative.push(part.as_os_str());
    }
    relative
}

/// Builds `index.csv` rows for every DNA image; images without a unique
/// annotation are left out.
pub fn compile_index(
    manifest: &ImageManifest,
    annotations: &Annotations,
    project: &Path,
) -> Vec<IndexRow> {
    let images = images_dir(project);
    let mut rows = Vec::new();
    for record in manifest.nuclei_images() {
        let reagent = match annotations.reagent_or_default(&record.plate, &record.well) {
            Ok(r) => r,
            Err(e) => {
                error!("Leaving {} out of the DP index: {}", record.key(), e);
                continue;
            }
        };
        let site = record.site_label();
        rows.push(IndexRow {
            plate_map_name: format!("{}_{}_{}", record.plate, record.well, site),
            plate: record.plate.clone(),
            well: record.well.clone(),
            site,
            dna: relative_path(&images, &record.path).to_string_lossy().into_owned(),
            reagent,
            reagent_replicate: 1,
        });
    }
    rows
}

pub fn write_index(project: &Path, rows: &[IndexRow]) -> Result<PathBuf> {
    let path = index_path(project);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(&path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    info!("index.csv with {} images saved to {}", rows.len(), path.display());
    Ok(path)
}

/// Copies nucleus centroids of every segmented field into the project's
/// per-image location files. Returns how many files were written.
pub fn compile_locations(
    manifest: &ImageManifest,
    segmentation_root: &Path,
    project: &Path,
) -> Result<usize> {
    let mut written = 0;
    for record in manifest.nuclei_images() {
        let target = locations_path(project, &record.plate, &record.well, &record.site_label());
        if target.is_file() {
            info!("{} + {} already has locations compiled!", record.plate, record.identifier);
            continue;
        }
        let source = SegmentationPaths::for_image(segmentation_root, record).nuclei_locations;
        let cells = match read_locations(&source) {
            Ok(cells) => cells,
            Err(e) => {
                warn!("No segmentation data for {}: {:#}", record.identifier, e);
                continue;
            }
        };

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut wtr = csv::Writer::from_path(&target)?;
        if cells.is_empty() {
            wtr.write_record([CELL_ID, "Nuclei_Location_Center_X", "Nuclei_Location_Center_Y"])?;
        }
        for cell in cells {
            wtr.serialize(NucleusLocation { cell_id: cell.cell_id, x: cell.x, y: cell.y })?;
        }
        wtr.flush()?;
        written += 1;
    }
    info!("Compiled {} location files", written);
    Ok(written)
}

/// Writes index and location files of the DP project.
pub fn compile_project(
    config: &PipelineConfig,
    manifest: &ImageManifest,
    annotations: &Annotations,
) -> Result<()> {
    let project = config.dp_project_dir();
    std::fs::create_dir_all(&project)?;
    if index_path(&project).is_file() {
        info!("DP index already compiled at {}", index_path(&project).display());
    } else {
        info!("compiling index.csv file...");
        let rows = compile_index(manifest, annotations, &project);
        write_index(&project, &rows)?;
    }
    info!("Compiling locations!");
    compile_locations(manifest, &config.segmentation_root, &project)?;
    Ok(())
}

fn features_dir(config: &PipelineConfig) -> PathBuf {
    config
        .dp_project_dir()
        .join("outputs")
        .join(&config.tools.deepprofiler_experiment)
        .join("features")
}

fn run(mut cmd: Command, what: &str) -> Result<()> {
    let output = cmd.output().with_context(|| format!("launching {}", what))?;
    if !output.status.success() {
        bail!("{} failed: {}", what, String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}

/// Profiles the project with the pretrained model unless features exist.
pub fn run_deepprofiler(config: &PipelineConfig) -> Result<()> {
    let features = features_dir(config);
    if features.is_dir() {
        info!("DP features already present in {}", features.display());
        return Ok(());
    }
    let mut cmd = Command::new(&config.tools.python);
    cmd.arg("-m")
        .arg("deepprofiler")
        .arg("--gpu").arg("0")
        .arg("--exp").arg(&config.tools.deepprofiler_experiment)
        .arg("--root").arg(config.dp_project_dir())
        .arg("--config").arg(&config.tools.deepprofiler_config)
        .arg("profile");
    info!("Running DeepProfiler on {}", config.dp_project_dir().display());
    run(cmd, "DeepProfiler profile")
}

pub fn single_cell_path(config: &PipelineConfig, plate: &str) -> PathBuf {
    config
        .dp_features_dir()
        .join(format!("{}-dp-single-cell.csv.gz", plate))
}

/// Exports DP single-cell tables per plate. Returns the plates that failed.
pub fn export_single_cells(config: &PipelineConfig, plates: &[String]) -> Vec<String> {
    let mut failed = Vec::new();
    for plate in plates {
        let output = single_cell_path(config, plate);
        if output.is_file() {
            info!("DP single cells for {} already exported", plate);
            continue;
        }
        let mut cmd = Command::new(&config.tools.python);
        cmd.arg(&config.tools.deepprofiler_export_script)
            .arg("--index").arg(index_path(&config.dp_project_dir()))
            .arg("--features").arg(features_dir(config))
            .arg("--plate").arg(plate)
            .arg("--output").arg(&output);
        if let Err(e) = std::fs::create_dir_all(config.dp_features_dir())
            .map_err(anyhow::Error::from)
            .and_then(|_| run(cmd, "DP single-cell export"))
        {
            error!("Export for plate {} failed: {:#}", plate, e);
            failed.push(plate.clone());
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_handling::manifest::ImageRecord;
    use crate::segmentation::correspondence::{write_locations, LocationRecord};
    use crate::segmentation::geometry::Point;
    use polars::df;

    fn record(root: &Path, well: &str, row: u32, column: u32) -> ImageRecord {
        let identifier = format!("r{:02}c{:02}f01p01", row, column);
        ImageRecord {
            plate: "SQ1".into(),
            image_folder: "Images".into(),
            well: well.into(),
            row,
            column,
            site: 1,
            channel: 1,
            path: root.join(format!("images/SQ1/Images/{}-ch1sk1fk1fl1.tiff", identifier)),
            identifier,
        }
    }

    #[test]
    fn relative_paths_climb_out_of_the_project() {
        assert_eq!(
            relative_path(Path::new("/data/dp/inputs/images"), Path::new("/data/cell-health/P/a.tiff")),
            PathBuf::from("../../../cell-health/P/a.tiff")
        );
    }

    #[test]
    fn index_rows_follow_manifest_and_annotations() {
        let root = tempfile::tempdir().unwrap();
        let manifest = ImageManifest::from_records(vec![
            record(root.path(), "A1", 1, 1),
            record(root.path(), "A2", 1, 2),
            record(root.path(), "C3", 3, 3),
        ]);
        let annotations = Annotations::from_dataframe(
            &df![
                "Plate" => &["SQ1", "SQ1"],
                "Well" => &["A1", "A2"],
                "Reagent Identifier" => &[Some("KRAS-1"), None]
            ]
            .unwrap(),
        )
        .unwrap();

        let project = root.path().join("dp");
        let rows = compile_index(&manifest, &annotations, &project);
        // C3 has no annotation
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].plate_map_name, "SQ1_A1_01");
        assert_eq!(rows[0].dna, "../../../images/SQ1/Images/r01c01f01p01-ch1sk1fk1fl1.tiff");
        assert_eq!(rows[1].reagent, "no reagent");

        let path = write_index(&project, &rows).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with(
            "Metadata_Plate,Metadata_Well,Metadata_Site,Plate_Map_Name,DNA,Reagent,Reagent_Replicate\n"
        ));
    }

    #[test]
    fn locations_are_copied_with_nuclei_columns() {
        let root = tempfile::tempdir().unwrap();
        let rec = record(root.path(), "A1", 1, 1);
        let seg_root = root.path().join("segmented");
        let source = SegmentationPaths::for_image(&seg_root, &rec).nuclei_locations;
        write_locations(&source, &[LocationRecord::new(0, Point::new(3.5, 4.0))]).unwrap();

        let manifest = ImageManifest::from_records(vec![rec, record(root.path(), "B1", 2, 1)]);
        let project = root.path().join("dp");
        assert_eq!(compile_locations(&manifest, &seg_root, &project).unwrap(), 1);

        let text = std::fs::read_to_string(locations_path(&project, "SQ1", "A1", "01")).unwrap();
        assert_eq!(text, "Cell_ID,Nuclei_Location_Center_X,Nuclei_Location_Center_Y\n0,3.5,4.0\n");
        // second pass finds the file in place
        assert_eq!(compile_locations(&manifest, &seg_root, &project).unwrap(), 0);
    }
}

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use crate::config::PipelineConfig;

/// Per-object table written by the CellProfiler pipeline.
pub const NUCLEI_TABLE: &str = "Nuclei.csv";

pub fn plate_output_dir(config: &PipelineConfig, plate: &str) -> PathBuf {
    config.cp_features_dir().join(plate)
}

fn cellprofiler_command(
    program: &Path,
    config: &PipelineConfig,
    plate: &str,
    output_dir: &Path,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-c")
        .arg("-r")
        .arg("-p").arg(&config.tools.cellprofiler_pipeline)
        .arg("-o").arg(output_dir)
        .arg("-i").arg(&config.images_root)
        .arg("-g").arg(format!("Metadata_Plate={}", plate));
    cmd
}

/// Runs the CellProfiler pipeline for one plate; output goes to a log file
/// next to the feature tables.
pub fn run_cellprofiler_plate(config: &PipelineConfig, plate: &str) -> Result<()> {
    let output_dir = plate_output_dir(config, plate);
    std::fs::create_dir_all(&output_dir)?;

    let program = which::which(&config.tools.cellprofiler)
        .with_context(|| format!("locating {}", config.tools.cellprofiler))?;
    let log_path = output_dir.join("CP_plate_run.log");
    let log = File::create(&log_path)?;

    let status = cellprofiler_command(&program, config, plate, &output_dir)
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .status()
        .with_context(|| format!("launching {}", program.display()))?;
    if !status.success() {
        bail!("CellProfiler failed for plate {} (see {})", plate, log_path.display());
    }
    info!("CellProfiler run completed for {}, log at {}", plate, log_path.display());
    Ok(())
}

/// Extracts CP features for every plate that has no nuclei table yet.
/// Returns the plates that failed.
pub fn run_cellprofiler_plates(config: &PipelineConfig, plates: &[String]) -> Vec<String> {
    let mut failed = Vec::new();
    for plate in plates {
        if plate_output_dir(config, plate).join(NUCLEI_TABLE).is_file() {
            info!("CP features for {} already extracted", plate);
            continue;
        }
        info!("Extracting CP features for plate {}...", plate);
        if let Err(e) = run_cellprofiler_plate(config, plate) {
            error!("{:#}", e);
            failed.push(plate.clone());
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_groups_by_plate() {
        let config = PipelineConfig {
            images_root: PathBuf::from("/data/cell-health"),
            ..PipelineConfig::default()
        };
        let cmd = cellprofiler_command(Path::new("cellprofiler"), &config, "SQ00014610", Path::new("/out"));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(&args[..2], &["-c", "-r"]);
        assert!(args.windows(2).any(|w| w == ["-i", "/data/cell-health"]));
        assert_eq!(args.last().map(String::as_str), Some("Metadata_Plate=SQ00014610"));
    }

    #[test]
    fn finished_plates_are_not_rerun() {
        let root = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig {
            features_root: root.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        config.tools.cellprofiler = "definitely-not-cellprofiler".to_string();
        let done = plate_output_dir(&config, "P1");
        std::fs::create_dir_all(&done).unwrap();
        std::fs::write(done.join(NUCLEI_TABLE), "ImageNumber\n").unwrap();

        let failed = run_cellprofiler_plates(&config, &["P1".to_string(), "P2".to_string()]);
        assert_eq!(failed, vec!["P2"]);
    }
}

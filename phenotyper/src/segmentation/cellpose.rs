use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::segmentation::mask::LabelMask;

/// Parameters handed to the cellpose network for one object class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpecs {
    pub model_type: String,
    pub channels: [u8; 2],
    /// 0 lets cellpose estimate the diameter.
    pub diameter: f64,
    pub flow_threshold: f64,
    pub cellprob_threshold: f64,
    pub remove_edge_masks: bool,
}

impl ModelSpecs {
    pub fn nuclei() -> Self {
        ModelSpecs {
            model_type: "cyto".to_string(),
            channels: [0, 0],
            diameter: 80.0,
            flow_threshold: 0.0,
            cellprob_threshold: 0.0,
            remove_edge_masks: true,
        }
    }

    /// Tuned for the DNA/ER/RNA overlay.
    pub fn cytoplasm() -> Self {
        ModelSpecs {
            model_type: "cyto".to_string(),
            channels: [1, 3],
            diameter: 0.0,
            flow_threshold: 0.0,
            cellprob_threshold: 0.4,
            remove_edge_masks: true,
        }
    }
}

/// Image in, integer label mask out.
pub trait SegmentationModel {
    fn segment(&self, image: &Path, specs: &ModelSpecs) -> Result<LabelMask>;
}

/// Runs cellpose through a python helper script that writes the raw label
/// mask of one image to a TIFF.
pub struct CellposeCommand {
    pub python: PathBuf,
    pub script: PathBuf,
}

impl CellposeCommand {
    pub fn new(python: PathBuf, script: PathBuf) -> Self {
        CellposeCommand { python, script }
    }

    fn command(&self, image: &Path, masks_out: &Path, specs: &ModelSpecs) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.arg(&self.script)
            .arg("--image").arg(image)
            .arg("--masks").arg(masks_out)
            .arg("--model-type").arg(&specs.model_type)
            .arg("--diameter").arg(specs.diameter.to_string())
            .arg("--channels")
            .arg(specs.channels[0].to_string())
            .arg(specs.channels[1].to_string())
            .arg("--flow-threshold").arg(specs.flow_threshold.to_string())
            .arg("--cellprob-threshold").arg(specs.cellprob_threshold.to_string());
        cmd
    }
}

impl SegmentationModel for CellposeCommand {
    fn segment(&self, image: &Path, specs: &ModelSpecs) -> Result<LabelMask> {
        let workdir = tempfile::tempdir()?;
        let masks_out = workdir.path().join("masks.tiff");

        debug!("cellpose {} on {}", specs.model_type, image.display());
        let output = self
            .command(image, &masks_out, specs)
            .output()
            .with_context(|| format!("launching {}", self.python.display()))?;
        if !output.status.success() {
            bail!(
                "cellpose failed on {}: {}",
                image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mask = LabelMask::read_tiff(&masks_out)?;
        info!("cellpose found {} objects in {}", mask.object_labels().len(), image.display());
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_carries_every_model_parameter() {
        let runner = CellposeCommand::new("python".into(), "run_cellpose.py".into());
        let cmd = runner.command(
            Path::new("img.tiff"),
            Path::new("out.tiff"),
            &ModelSpecs::cytoplasm(),
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "run_cellpose.py", "--image", "img.tiff", "--masks", "out.tiff",
                "--model-type", "cyto", "--diameter", "0", "--channels", "1", "3",
                "--flow-threshold", "0", "--cellprob-threshold", "0.4",
            ]
        );
    }

    #[test]
    fn failing_helper_is_an_error() {
        let runner = CellposeCommand::new("false".into(), "missing.py".into());
        assert!(runner.segment(Path::new("img.tiff"), &ModelSpecs::nuclei()).is_err());
    }
}

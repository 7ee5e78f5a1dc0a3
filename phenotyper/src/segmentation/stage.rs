use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::data_handling::manifest::{ImageManifest, ImageRecord};
use crate::segmentation::cellpose::{ModelSpecs, SegmentationModel};
use crate::segmentation::correspondence::{
    match_nuclei_to_cytoplasm, write_locations, CellCorrespondence,
};
use crate::segmentation::mask::LabelMask;
use crate::segmentation::overlay::{overlay_channels, GrayImage};

/// Output files of one field of view.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationPaths {
    pub nuclei_masks: PathBuf,
    pub cytoplasm_masks: PathBuf,
    pub nuclei_locations: PathBuf,
    pub cytoplasm_locations: PathBuf,
}

impl SegmentationPaths {
    pub fn for_image(segmentation_root: &Path, record: &ImageRecord) -> Self {
        let dir = segmentation_root.join(&record.plate).join(&record.image_folder);
        let file = |suffix: &str| dir.join(format!("{}-{}", record.identifier, suffix));
        SegmentationPaths {
            nuclei_masks: file("nuc-masks.tiff"),
            cytoplasm_masks: file("cyto-masks.tiff"),
            nuclei_locations: file("nuc-locations.tsv"),
            cytoplasm_locations: file("cyto-locations.tsv"),
        }
    }

    pub fn all_exist(&self) -> bool {
        [
            &self.nuclei_masks,
            &self.cytoplasm_masks,
            &self.nuclei_locations,
            &self.cytoplasm_locations,
        ]
        .iter()
        .all(|p| p.is_file())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SegmentationSummary {
    pub segmented: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cells: usize,
}

fn run_model(model: &dyn SegmentationModel, image: &Path, specs: &ModelSpecs) -> Result<LabelMask> {
    let mut mask = model.segment(image, specs)?;
    if specs.remove_edge_masks {
        mask.remove_edge_masks();
    }
    Ok(mask)
}

/// Segments nuclei and cytoplasm of one field and pairs them.
pub fn segment_image(
    config: &PipelineConfig,
    manifest: &ImageManifest,
    record: &ImageRecord,
    model: &dyn SegmentationModel,
) -> Result<(LabelMask, LabelMask, CellCorrespondence)> {
    let channels = manifest.channels_for(&record.plate, &record.identifier);
    if channels.len() < 3 {
        bail!(
            "{} has {} channel images, DNA/ER/RNA are needed",
            record.identifier,
            channels.len()
        );
    }

    let nuclei_mask = run_model(model, &record.path, &config.nuclei_model)?;

    let overlay = overlay_channels(
        &GrayImage::read_tiff(&channels[0].path)?,
        &GrayImage::read_tiff(&channels[1].path)?,
        &GrayImage::read_tiff(&channels[2].path)?,
    )?;
    let overlay_file = tempfile::Builder::new().suffix(".tiff").tempfile()?;
    overlay.write_tiff(overlay_file.path())?;
    let cytoplasm_mask = run_model(model, overlay_file.path(), &config.cytoplasm_model)?;

    let cytoplasm_outlines: Vec<_> = cytoplasm_mask
        .outlines()
        .into_iter()
        .map(|o| o.outline)
        .collect();
    let cells = match_nuclei_to_cytoplasm(
        &nuclei_mask.centroids(),
        &cytoplasm_outlines,
        config.overlap_policy,
    );
    Ok((nuclei_mask, cytoplasm_mask, cells))
}

/// Segments every field in the manifest, skipping fields whose outputs exist.
pub fn segment_images(
    config: &PipelineConfig,
    manifest: &ImageManifest,
    model: &dyn SegmentationModel,
) -> SegmentationSummary {
    let mut summary = SegmentationSummary::default();
    let mut current_plate = String::new();

    for record in manifest.nuclei_images() {
        if record.plate != current_plate {
            info!("Segmenting plate {}", record.plate);
            current_plate = record.plate.clone();
        }
        let paths = SegmentationPaths::for_image(&config.segmentation_root, record);
        if paths.all_exist() {
            info!("Already segmented {}", record.identifier);
            summary.skipped += 1;
            continue;
        }

        let result = segment_image(config, manifest, record, model).and_then(
            |(nuclei_mask, cytoplasm_mask, cells)| {
                nuclei_mask.write_tiff(&paths.nuclei_masks)?;
                cytoplasm_mask.write_tiff(&paths.cytoplasm_masks)?;
                write_locations(&paths.nuclei_locations, &cells.nuclei)?;
                write_locations(&paths.cytoplasm_locations, &cells.cytoplasm)?;
                Ok(cells.cell_count())
            },
        );
        match result {
            Ok(0) => {
                warn!("No paired cells in {} ({})", record.identifier, record.plate);
                summary.segmented += 1;
            }
            Ok(cells) => {
                info!("Segmented {} ({} cells)", record.identifier, cells);
                summary.segmented += 1;
                summary.cells += cells;
            }
            Err(e) => {
                error!("Segmentation of {} failed: {:#}", record.key(), e);
                summary.failed += 1;
            }
        }
    }

    info!(
        "Segmentation done: {} segmented, {} skipped, {} failed, {} cells",
        summary.segmented, summary.skipped, summary.failed, summary.cells
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::correspondence::read_locations;
    use std::fs::File;
    use std::io::BufWriter;
    use tiff::encoder::{colortype, TiffEncoder};

    /// Nuclei: one 2x2 blob at (3..5, 3..5). Cytoplasm: a 6x6 block around it.
    struct FixedMasks;

    impl SegmentationModel for FixedMasks {
        fn segment(&self, _image: &Path, specs: &ModelSpecs) -> Result<LabelMask> {
            let mut labels = vec![0u32; 100];
            let (lo, hi) = if specs.channels == [0, 0] { (3, 5) } else { (1, 7) };
            for y in lo..hi {
                for x in lo..hi {
                    labels[y * 10 + x] = 1;
                }
            }
            // stray object on the border, removed before matching
            labels[0] = 9;
            LabelMask::new(10, 10, labels)
        }
    }

    fn write_gray(path: &Path) {
        let file = File::create(path).unwrap();
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).unwrap();
        encoder
            .write_image::<colortype::Gray8>(10, 10, &[10u8; 100])
            .unwrap();
    }

    #[test]
    fn fields_are_segmented_once() {
        let root = tempfile::tempdir().unwrap();
        let images = root.path().join("images/SQ00014610/Images");
        std::fs::create_dir_all(&images).unwrap();
        for ch in 1..=3 {
            write_gray(&images.join(format!("r01c01f01p01-ch{}sk1fk1fl1.tiff", ch)));
        }

        let config = PipelineConfig {
            images_root: root.path().join("images"),
            segmentation_root: root.path().join("segmented"),
            ..PipelineConfig::default()
        };
        let manifest = ImageManifest::build(&config.images_root).unwrap();

        let summary = segment_images(&config, &manifest, &FixedMasks);
        assert_eq!(summary.segmented, 1);
        assert_eq!(summary.cells, 1);

        let record = manifest.nuclei_images().next().unwrap();
        let paths = SegmentationPaths::for_image(&config.segmentation_root, record);
        assert!(paths.all_exist());
        let nuclei = read_locations(&paths.nuclei_locations).unwrap();
        assert_eq!(nuclei.len(), 1);
        assert_eq!(nuclei[0].cell_id, 0);
        assert_eq!((nuclei[0].x, nuclei[0].y), (3.5, 3.5));
        let saved = LabelMask::read_tiff(&paths.nuclei_masks).unwrap();
        assert_eq!(saved.object_labels(), vec![1]);

        let again = segment_images(&config, &manifest, &FixedMasks);
        assert_eq!(again.skipped, 1);
        assert_eq!(again.segmented, 0);
    }

    #[test]
    fn missing_channels_fail_the_field() {
        let root = tempfile::tempdir().unwrap();
        let images = root.path().join("images/P1/Images");
        std::fs::create_dir_all(&images).unwrap();
        write_gray(&images.join("r01c01f01p01-ch1sk1fk1fl1.tiff"));

        let config = PipelineConfig {
            images_root: root.path().join("images"),
            segmentation_root: root.path().join("segmented"),
            ..PipelineConfig::default()
        };
        let manifest = ImageManifest::build(&config.images_root).unwrap();
        let summary = segment_images(&config, &manifest, &FixedMasks);
        assert_eq!(summary.failed, 1);
    }
}

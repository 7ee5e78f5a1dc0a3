use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analysis::well_significance::run_well_comparisons;
use crate::classification::classify::classify_plates;
use crate::classification::profiles::derive_profiles;
use crate::config::PipelineConfig;
use crate::data_handling::annotations::Annotations;
use crate::data_handling::manifest::ImageManifest;
use crate::data_handling::plate_manifest::PlateManifest;
use crate::download::{download_plates, CommandFetcher};
use crate::feature_extraction::{cellprofiler, deepprofiler};
use crate::preprocessing::merge::merge_plates;
use crate::preprocessing::normalize::normalize_plates;
use crate::segmentation::cellpose::CellposeCommand;
use crate::segmentation::stage::segment_images;

mod analysis;
mod classification;
mod config;
mod data_handling;
mod download;
mod feature_extraction;
mod helper_functions;
mod models;
mod preprocessing;
mod segmentation;

fn main() -> Result<()> {
    // Setup logging and project configuration
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting the Cell Health pipeline");
    let config = PipelineConfig::from_env()?;

    // Fetch raw plates that are not on disk yet
    if config.plate_manifest_path.is_file() {
        let entries = PlateManifest::load_entries(&config.plate_manifest_path)?;
        let fetcher = CommandFetcher::new(
            config.tools.fetch_command.clone(),
            config.tools.fetch_remote_prefix.clone(),
        );
        let downloads = download_plates(&entries, &config.downloads_dir(), &fetcher)?;
        info!(
            "Downloads: {} fetched, {} present, {} failed",
            downloads.downloaded.len(),
            downloads.skipped.len(),
            downloads.failed.len()
        );
        for plate in &downloads.failed {
            error!("Could not download plate {}", plate);
        }
    } else {
        warn!("No plate manifest at {}, skipping downloads", config.plate_manifest_path.display());
    }

    config.save(&config.output_root.join("pipeline_config.json"))?;

    let manifest = ImageManifest::build(&config.images_root)?;
    if manifest.is_empty() {
        warn!("No channel images found under {}", config.images_root.display());
    }
    let plates = manifest.plates();
    info!("Found {} images across {} plates", manifest.len(), plates.len());
    let annotations = Annotations::load(&config.annotations_path)?;

    // Segmentation
    let cellpose = CellposeCommand::new(config.tools.python.clone(), config.tools.cellpose_script.clone());
    let segmentation = segment_images(&config, &manifest, &cellpose);
    info!(
        "Segmentation: {} segmented, {} skipped, {} failed, {} cells",
        segmentation.segmented, segmentation.skipped, segmentation.failed, segmentation.cells
    );

    // Feature extraction
    for plate in cellprofiler::run_cellprofiler_plates(&config, &plates) {
        error!("CellProfiler failed on plate {}", plate);
    }
    deepprofiler::compile_project(&config, &manifest, &annotations)?;
    deepprofiler::run_deepprofiler(&config)?;
    for plate in deepprofiler::export_single_cells(&config, &plates) {
        error!("DeepProfiler export failed for plate {}", plate);
    }

    // Preprocessing
    for summary in merge_plates(&config, &plates)? {
        for (well, site) in &summary.failed_images {
            warn!("Well {} site {} was not merged", well, site);
        }
    }
    normalize_plates(&config, &annotations, &plates)?;

    // Classification
    let classified = classify_plates(&config, &plates)?;
    info!("Wrote {} classification tables", classified);
    let profiles = derive_profiles(&config)?;
    info!("Wrote {} profile tables", profiles);

    // Well-level significance
    if let Some(path) = run_well_comparisons(&config, &annotations)? {
        info!("Well comparisons saved to {}", path.display());
    }

    info!("Cell Health pipeline finished");
    Ok(())
}

//! Typed index of every channel image on disk, built once and handed to the
//! stages that iterate images.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::helper_functions::{files_with_suffix, sub_directories};
use crate::models::{polars_err, ImageKey};

/// Channel holding the DNA (nuclei) stain.
pub const NUCLEI_CHANNEL: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageRecord {
    pub plate: String,
    /// Folder between plate and image files (usually `Images`).
    pub image_folder: String,
    pub well: String,
    pub row: u32,
    pub column: u32,
    pub site: u32,
    pub channel: u32,
    /// File-name stem shared by all channels of one field, e.g. `r01c01f01p01`.
    pub identifier: String,
    pub path: PathBuf,
}

impl ImageRecord {
    pub fn key(&self) -> ImageKey {
        ImageKey { plate: self.plate.clone(), well: self.well.clone(), site: self.site }
    }

    /// Two-digit site as it appears in file names.
    pub fn site_label(&self) -> String {
        format!("{:02}", self.site)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageManifest {
    records: Vec<ImageRecord>,
}

fn image_name_pattern() -> PolarsResult<Regex> {
    Regex::new(r"^(r(\d{2})c(\d{2})f(\d{2})p\d{2})-ch(\d+).*\.tiff?$")
        .map_err(|e| polars_err(Box::new(e)))
}

/// `(row, column) → well`, e.g. `(1, 1) → "A1"`, `(2, 12) → "B12"`.
pub fn well_name(row: u32, column: u32) -> String {
    let letter = char::from_u32(64 + row).unwrap_or('?');
    format!("{}{}", letter, column)
}

/// CellProfiler well `r01c01` → `A1`.
pub fn format_cp_well(cp_well: &str) -> Option<String> {
    let row: u32 = cp_well.get(1..3)?.parse().ok()?;
    let column: u32 = cp_well.get(4..6)?.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some(well_name(row, column))
}

/// CellProfiler field `f01` → `1`.
pub fn format_cp_site(cp_site: &str) -> Option<String> {
    let site: u32 = cp_site.get(1..3)?.parse().ok()?;
    Some(site.to_string())
}

/// Site text without leading zeros (`"01"` → `"1"`); non-numeric text is kept.
pub fn normalize_site(site: &str) -> String {
    match site.trim().parse::<u32>() {
        Ok(n) => n.to_string(),
        Err(_) => site.to_string(),
    }
}

impl ImageManifest {
    pub fn from_records(mut records: Vec<ImageRecord>) -> Self {
        records.sort();
        ImageManifest { records }
    }

    /// Walks `<images_root>/<plate>/<image folder>/` for channel TIFFs.
    pub fn build(images_root: &Path) -> PolarsResult<Self> {
        let pattern = image_name_pattern()?;
        let mut records = Vec::new();

        for plate_dir in sub_directories(images_root)? {
            let plate = dir_name(&plate_dir);
            for folder in sub_directories(&plate_dir)? {
                let image_folder = dir_name(&folder);
                let mut skipped = 0usize;
                for path in files_with_suffix(&folder, ".tif")?
                    .into_iter()
                    .chain(files_with_suffix(&folder, ".tiff")?)
                {
                    let name = dir_name(&path);
                    let Some(caps) = pattern.captures(&name) else {
                        skipped += 1;
                        continue;
                    };
                    let number = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
                    let (row, column) = (number(2), number(3));
                    records.push(ImageRecord {
                        plate: plate.clone(),
                        image_folder: image_folder.clone(),
                        well: well_name(row, column),
                        row,
                        column,
                        site: number(4),
                        channel: number(5),
                        identifier: caps[1].to_string(),
                        path: path.clone(),
                    });
                }
                if skipped > 0 {
                    warn!("Skipped {} unrecognised files in {}", skipped, folder.display());
                }
            }
            debug!("Indexed plate {}", plate);
        }

        let manifest = ImageManifest::from_records(records);
        info!(
            "Image manifest: {} images across {} plates",
            manifest.len(),
            manifest.plates().len()
        );
        Ok(manifest)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn plates(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.records.iter().map(|r| r.plate.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// One record per field of view: its DNA channel.
    pub fn nuclei_images(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.iter().filter(|r| r.channel == NUCLEI_CHANNEL)
    }

    /// All channels of one field, ascending by channel.
    pub fn channels_for(&self, plate: &str, identifier: &str) -> Vec<&ImageRecord> {
        let mut channels: Vec<&ImageRecord> = self
            .records
            .iter()
            .filter(|r| r.plate == plate && r.identifier == identifier)
            .collect();
        channels.sort_by_key(|r| r.channel);
        channels
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn cp_well_and_site_conversion() {
        assert_eq!(format_cp_well("r01c01").as_deref(), Some("A1"));
        assert_eq!(format_cp_well("r08c12").as_deref(), Some("H12"));
        assert_eq!(format_cp_well("bogus"), None);
        assert_eq!(format_cp_site("f01").as_deref(), Some("1"));
        assert_eq!(format_cp_site("f12").as_deref(), Some("12"));
        assert_eq!(normalize_site("09"), "9");
        assert_eq!(normalize_site("x"), "x");
    }

    #[test]
    fn manifest_indexes_plate_tree() {
        let root = tempfile::tempdir().unwrap();
        let folder = root.path().join("SQ00014610/Images");
        fs::create_dir_all(&folder).unwrap();
        for name in [
            "r02c03f04p01-ch1sk1fk1fl1.tiff",
            "r02c03f04p01-ch3sk1fk1fl1.tiff",
            "r02c03f04p01-ch2sk1fk1fl1.tiff",
            "r01c01f01p01-ch1sk1fk1fl1.tiff",
            "Index.idx.xml.tiff",
        ] {
            fs::write(folder.join(name), b"").unwrap();
        }
        fs::write(folder.join("notes.txt"), b"").unwrap();

        let manifest = ImageManifest::build(root.path()).unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.plates(), vec!["SQ00014610"]);

        let nuclei: Vec<_> = manifest.nuclei_images().collect();
        assert_eq!(nuclei.len(), 2);
        assert_eq!(nuclei[1].well, "B3");
        assert_eq!(nuclei[1].site, 4);
        assert_eq!(nuclei[1].identifier, "r02c03f04p01");
        assert_eq!(nuclei[1].image_folder, "Images");

        let channels = manifest.channels_for("SQ00014610", "r02c03f04p01");
        assert_eq!(channels.iter().map(|r| r.channel).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn short_tif_extension_is_indexed() {
        let root = tempfile::tempdir().unwrap();
        let folder = root.path().join("SQ00014611/Images");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("r01c01f01p01-ch1sk1fk1fl1.tif"), b"").unwrap();
        fs::write(folder.join("r01c01f01p01-ch2sk1fk1fl1.tiff"), b"").unwrap();

        let manifest = ImageManifest::build(root.path()).unwrap();
        assert_eq!(manifest.len(), 2);
        let channels = manifest.channels_for("SQ00014611", "r01c01f01p01");
        assert_eq!(channels.iter().map(|r| r.channel).collect::<Vec<_>>(), vec![1, 2]);
        assert!(channels[0].path.to_string_lossy().ends_with(".tif"));
    }
}

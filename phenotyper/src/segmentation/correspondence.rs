//! Pairs nuclei with the cytoplasm objects that enclose them.
//!
//! Every cytoplasm object is identified by its position in the cytoplasm
//! outline list (`Cell_ID`). A nucleus is paired with a cytoplasm object when
//! its centroid lies inside that object's outline polygon. Several nuclei in
//! one cytoplasm yield several nucleus rows with the same `Cell_ID`, while the
//! cytoplasm itself is written once. Nuclei outside every polygon and
//! cytoplasm objects without a nucleus are dropped.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{CELL_ID, LOCATION_X, LOCATION_Y};
use crate::segmentation::geometry::{Point, Polygon};

/// What to do with a nucleus that lies inside several (overlapping)
/// cytoplasm polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Pair the nucleus with every enclosing cytoplasm.
    #[default]
    AllContaining,
    /// Pair the nucleus only with the first enclosing cytoplasm (outline order).
    FirstContaining,
}

/// One row of a `*-locations.tsv` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(rename = "Cell_ID")]
    pub cell_id: usize,
    #[serde(rename = "Location_Center_X")]
    pub x: f64,
    #[serde(rename = "Location_Center_Y")]
    pub y: f64,
}

impl LocationRecord {
    pub fn new(cell_id: usize, p: Point) -> Self {
        LocationRecord { cell_id, x: p.x, y: p.y }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellCorrespondence {
    pub nuclei: Vec<LocationRecord>,
    pub cytoplasm: Vec<LocationRecord>,
}

impl CellCorrespondence {
    pub fn cell_count(&self) -> usize {
        self.cytoplasm.len()
    }
}

pub fn match_nuclei_to_cytoplasm(
    nuclei: &[Point],
    cytoplasm: &[Polygon],
    policy: OverlapPolicy,
) -> CellCorrespondence {
    let mut claimed = vec![false; nuclei.len()];
    let mut nuclei_rows = Vec::new();
    let mut cytoplasm_rows = Vec::new();

    for (cell_id, outline) in cytoplasm.iter().enumerate() {
        let Some(cyto_center) = outline.centroid() else {
            continue;
        };
        for (n, nucleus) in nuclei.iter().enumerate() {
            if policy == OverlapPolicy::FirstContaining && claimed[n] {
                continue;
            }
            if outline.contains(nucleus) {
                claimed[n] = true;
                nuclei_rows.push(LocationRecord::new(cell_id, *nucleus));
                cytoplasm_rows.push(LocationRecord::new(cell_id, cyto_center));
            }
        }
    }

    let cytoplasm_rows = dedup_by_cell_id(cytoplasm_rows);
    debug!(
        "{} nuclei, {} cytoplasm outlines -> {} nucleus rows, {} cells",
        nuclei.len(),
        cytoplasm.len(),
        nuclei_rows.len(),
        cytoplasm_rows.len()
    );

    CellCorrespondence { nuclei: nuclei_rows, cytoplasm: cytoplasm_rows }
}

/// Keeps the first row of every `Cell_ID`.
fn dedup_by_cell_id(rows: Vec<LocationRecord>) -> Vec<LocationRecord> {
    let mut seen = HashSet::new();
    rows.into_iter().filter(|r| seen.insert(r.cell_id)).collect()
}

pub fn write_locations(path: &Path, rows: &[LocationRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    if rows.is_empty() {
        wtr.write_record([CELL_ID, LOCATION_X, LOCATION_Y])?;
    }
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_locations(path: &Path) -> Result<Vec<LocationRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for record in rdr.deserialize() {
        rows.push(record.with_context(|| format!("parsing {}", path.display()))?);
    }
    Ok(rows)
}

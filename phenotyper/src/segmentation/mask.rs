//! Integer label masks as produced by the segmentation model: 0 is
//! background, every positive label is one object.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

use crate::segmentation::geometry::{Point, Polygon};

/// Moore neighbourhood, clockwise on screen (y grows downwards), starting West.
const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
];

#[derive(Debug, Clone, PartialEq)]
pub struct LabelMask {
    pub width: usize,
    pub height: usize,
    /// Row-major labels.
    pub labels: Vec<u32>,
}

/// Boundary of one labelled object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectOutline {
    pub label: u32,
    pub outline: Polygon,
}

impl ObjectOutline {
    pub fn centroid(&self) -> Option<Point> {
        self.outline.centroid()
    }
}

impl LabelMask {
    pub fn new(width: usize, height: usize, labels: Vec<u32>) -> Result<Self> {
        if labels.len() != width * height {
            bail!(
                "label buffer has {} entries, expected {}x{}",
                labels.len(),
                width,
                height
            );
        }
        Ok(LabelMask { width, height, labels })
    }

    pub fn get(&self, x: i64, y: i64) -> u32 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return 0;
        }
        self.labels[y as usize * self.width + x as usize]
    }

    /// Distinct positive labels, ascending.
    pub fn object_labels(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.labels.iter().copied().filter(|&l| l > 0).collect();
        set.into_iter().collect()
    }

    pub fn read_tiff(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening mask {}", path.display()))?;
        let mut decoder = Decoder::new(file)?;
        let (width, height) = decoder.dimensions()?;
        let labels: Vec<u32> = match decoder.read_image()? {
            DecodingResult::U8(v) => v.into_iter().map(u32::from).collect(),
            DecodingResult::U16(v) => v.into_iter().map(u32::from).collect(),
            DecodingResult::U32(v) => v,
            DecodingResult::U64(v) => v.into_iter().map(|l| l as u32).collect(),
            DecodingResult::I8(v) => v.into_iter().map(|l| l.max(0) as u32).collect(),
            DecodingResult::I16(v) => v.into_iter().map(|l| l.max(0) as u32).collect(),
            DecodingResult::I32(v) => v.into_iter().map(|l| l.max(0) as u32).collect(),
            DecodingResult::I64(v) => v.into_iter().map(|l| l.max(0) as u32).collect(),
            _ => bail!("unsupported mask pixel format in {}", path.display()),
        };
        LabelMask::new(width as usize, height as usize, labels)
    }

    pub fn write_tiff(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path).with_context(|| format!("creating mask {}", path.display()))?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
        encoder.write_image::<colortype::Gray32>(
            self.width as u32,
            self.height as u32,
            &self.labels,
        )?;
        Ok(())
    }

    /// Clears every object touching the image border.
    pub fn remove_edge_masks(&mut self) -> usize {
        if self.labels.is_empty() {
            return 0;
        }
        let mut edge: BTreeSet<u32> = BTreeSet::new();
        for x in 0..self.width {
            edge.insert(self.labels[x]);
            edge.insert(self.labels[(self.height - 1) * self.width + x]);
        }
        for y in 0..self.height {
            edge.insert(self.labels[y * self.width]);
            edge.insert(self.labels[y * self.width + self.width - 1]);
        }
        edge.remove(&0);
        if edge.is_empty() {
            return 0;
        }
        for l in self.labels.iter_mut() {
            if edge.contains(l) {
                *l = 0;
            }
        }
        edge.len()
    }

    /// Ordered boundary pixels of every object, by ascending label. Points are
    /// pixel coordinates (x = column, y = row).
    pub fn outlines(&self) -> Vec<ObjectOutline> {
        self.object_labels()
            .into_iter()
            .filter_map(|label| {
                let boundary = self.trace_boundary(label);
                if boundary.is_empty() {
                    None
                } else {
                    Some(ObjectOutline { label, outline: Polygon::new(boundary) })
                }
            })
            .collect()
    }

    /// Centroid (mean of outline vertices) of every object, by ascending label.
    pub fn centroids(&self) -> Vec<Point> {
        self.outlines()
            .iter()
            .filter_map(ObjectOutline::centroid)
            .collect()
    }

    fn first_pixel(&self, label: u32) -> Option<(i64, i64)> {
        self.labels
            .iter()
            .position(|&l| l == label)
            .map(|i| ((i % self.width) as i64, (i / self.width) as i64))
    }

    /// Moore-neighbour tracing from the top-left pixel of the object, stopping
    /// once the walk would repeat its first move.
    fn trace_boundary(&self, label: u32) -> Vec<Point> {
        let Some(start) = self.first_pixel(label) else {
            return Vec::new();
        };
        let to_point = |(x, y): (i64, i64)| Point::new(x as f64, y as f64);
        let mut boundary = vec![to_point(start)];

        // The West neighbour of the top-left pixel is always background.
        let Some((second, mut backtrack)) = self.step(label, start, 0) else {
            return boundary;
        };
        let mut current = second;
        let max_steps = 4 * self.labels.len() + 8;

        for _ in 0..max_steps {
            if current == start {
                if let Some((next, _)) = self.step(label, current, backtrack) {
                    if next == second {
                        break;
                    }
                }
            }
            boundary.push(to_point(current));
            match self.step(label, current, backtrack) {
                Some((next, next_backtrack)) => {
                    current = next;
                    backtrack = next_backtrack;
                }
                None => break,
            }
        }
        boundary
    }

    /// Scans clockwise around `p`, starting after the backtrack direction, for
    /// the next pixel of `label`. Returns it together with the direction (seen
    /// from the new pixel) of the last background pixel examined.
    fn step(&self, label: u32, p: (i64, i64), backtrack: usize) -> Option<((i64, i64), usize)> {
        for k in 1..=8 {
            let idx = (backtrack + k) % 8;
            let (dx, dy) = NEIGHBOURS[idx];
            let candidate = (p.0 + dx, p.1 + dy);
            if self.get(candidate.0, candidate.1) == label {
                let (px, py) = NEIGHBOURS[(idx + 7) % 8];
                let previous = (p.0 + px, p.1 + py);
                let offset = (previous.0 - candidate.0, previous.1 - candidate.1);
                let dir = NEIGHBOURS.iter().position(|&n| n == offset).unwrap_or(0);
                return Some((candidate, dir));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from_rows(rows: &[&[u32]]) -> LabelMask {
        let height = rows.len();
        let width = rows[0].len();
        let labels = rows.iter().flat_map(|r| r.iter().copied()).collect();
        LabelMask::new(width, height, labels).unwrap()
    }

    #[test]
    fn square_outline_walks_the_border_once() {
        let mask = mask_from_rows(&[
            &[0, 0, 0, 0, 0],
            &[0, 1, 1, 1, 0],
            &[0, 1, 1, 1, 0],
            &[0, 1, 1, 1, 0],
            &[0, 0, 0, 0, 0],
        ]);
        let outlines = mask.outlines();
        assert_eq!(outlines.len(), 1);
        let verts = &outlines[0].outline.vertices;
        // 8 border pixels of a 3x3 block, centre pixel excluded
        assert_eq!(verts.len(), 8);
        assert!(!verts.contains(&Point::new(2.0, 2.0)));
        assert_eq!(verts[0], Point::new(1.0, 1.0));
        assert_eq!(verts[1], Point::new(2.0, 1.0));
        assert_eq!(outlines[0].centroid(), Some(Point::new(2.0, 2.0)));
    }

    #[test]
    fn single_pixel_and_thin_objects() {
        let mask = mask_from_rows(&[
            &[0, 0, 0, 0, 0, 0],
            &[0, 2, 0, 0, 0, 0],
            &[0, 0, 0, 3, 3, 3],
            &[0, 0, 0, 0, 0, 0],
        ]);
        let outlines = mask.outlines();
        assert_eq!(outlines.len(), 2);
        assert_eq!(outlines[0].label, 2);
        assert_eq!(outlines[0].outline.vertices, vec![Point::new(1.0, 1.0)]);
        // a one-pixel-thick line is walked there and back
        assert_eq!(outlines[1].outline.vertices.len(), 4);
        assert_eq!(outlines[1].centroid(), Some(Point::new(4.0, 2.0)));
    }

    #[test]
    fn edge_objects_are_removed() {
        let mut mask = mask_from_rows(&[
            &[1, 1, 0, 0],
            &[0, 0, 0, 0],
            &[0, 2, 2, 0],
            &[0, 0, 0, 3],
        ]);
        assert_eq!(mask.remove_edge_masks(), 2);
        assert_eq!(mask.object_labels(), vec![2]);
    }

    #[test]
    fn mask_tiff_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("masks/nuc-masks.tiff");
        let mask = mask_from_rows(&[&[0, 7, 7], &[0, 0, 70000]]);
        mask.write_tiff(&path).unwrap();
        assert_eq!(LabelMask::read_tiff(&path).unwrap(), mask);
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        assert!(LabelMask::new(3, 3, vec![0; 8]).is_err());
    }
}

//! Composite of the DNA, ER and RNA channels used as cytoplasm model input.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

/// Per-channel gains for (DNA, ER, RNA). The ER channel is blanked.
pub const CHANNEL_GAINS: [u16; 3] = [2, 0, 5];

#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

/// Interleaved 8-bit RGB image.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GrayImage {
    /// Reads a single-channel TIFF as 8 bits; 16-bit data keeps its high byte.
    pub fn read_tiff(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening image {}", path.display()))?;
        let mut decoder = Decoder::new(file)?;
        let (width, height) = decoder.dimensions()?;
        let pixels: Vec<u8> = match decoder.read_image()? {
            DecodingResult::U8(v) => v,
            DecodingResult::U16(v) => v.into_iter().map(|p| (p >> 8) as u8).collect(),
            DecodingResult::F32(v) => v.into_iter().map(|p| p.clamp(0.0, 255.0) as u8).collect(),
            _ => bail!("unsupported pixel format in {}", path.display()),
        };
        ensure!(
            pixels.len() == width as usize * height as usize,
            "{} is not a single-channel image",
            path.display()
        );
        Ok(GrayImage { width: width as usize, height: height as usize, pixels })
    }
}

impl RgbImage {
    pub fn write_tiff(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
        encoder.write_image::<colortype::RGB8>(self.width as u32, self.height as u32, &self.pixels)?;
        Ok(())
    }
}

/// Stacks DNA, ER and RNA into one RGB image with [`CHANNEL_GAINS`],
/// saturating at 255.
pub fn overlay_channels(dna: &GrayImage, er: &GrayImage, rna: &GrayImage) -> Result<RgbImage> {
    for other in [er, rna] {
        ensure!(
            other.width == dna.width && other.height == dna.height,
            "channel sizes differ: {}x{} vs {}x{}",
            dna.width,
            dna.height,
            other.width,
            other.height
        );
    }
    let mut pixels = Vec::with_capacity(dna.pixels.len() * 3);
    for i in 0..dna.pixels.len() {
        for (channel, gain) in [dna, er, rna].iter().zip(CHANNEL_GAINS) {
            let v = u16::from(channel.pixels[i]) * gain;
            pixels.push(v.min(255) as u8);
        }
    }
    Ok(RgbImage { width: dna.width, height: dna.height, pixels })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(pixels: Vec<u8>) -> GrayImage {
        GrayImage { width: pixels.len(), height: 1, pixels }
    }

    #[test]
    fn gains_saturate_and_blank_er() {
        let rgb = overlay_channels(&gray(vec![10, 200]), &gray(vec![99, 99]), &gray(vec![20, 60]))
            .unwrap();
        assert_eq!(rgb.pixels, vec![20, 0, 100, 255, 0, 255]);
    }

    #[test]
    fn mismatched_channels_are_rejected() {
        assert!(overlay_channels(&gray(vec![1]), &gray(vec![1, 2]), &gray(vec![1])).is_err());
    }

    #[test]
    fn sixteen_bit_input_keeps_high_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch1.tiff");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).unwrap();
        encoder
            .write_image::<colortype::Gray16>(2, 1, &[0x1234u16, 0xff00])
            .unwrap();
        drop(encoder);

        let img = GrayImage::read_tiff(&path).unwrap();
        assert_eq!(img.pixels, vec![0x12, 0xff]);
    }
}

//! Renders a snapshot history as a 24-bit BMP, one scanline per snapshot and
//! one pixel column per 16-byte granule of the span.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::Snapshot;
use crate::engine::MIN_BLOCK_SIZE;
use crate::util::fls;

const FILE_HEADER_SIZE: u32 = 14;
const INFO_HEADER_SIZE: u32 = 40;

// BMP stores pixels in BGR order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Color {
    b: u8,
    g: u8,
    r: u8,
}

impl Color {
    const BACKGROUND: Color = Color { b: 0, g: 0, r: 0 };

    /// Saturated blue, brighter for larger size classes.
    fn free_block(size: u64) -> Color {
        let level = fls(size).saturating_sub(fls(MIN_BLOCK_SIZE));
        let boost = 100 + 155 * level.min(32) / 32;
        Color {
            b: (200 + boost / 4).min(255) as u8,
            g: 50,
            r: 50,
        }
    }

    /// Green for tightly-used blocks shading into red as waste grows.
    fn allocated_block(waste_ratio: f64) -> Color {
        let waste = waste_ratio.clamp(0.0, 1.0);
        Color {
            b: 50,
            g: (200.0 * (1.0 - waste)) as u8,
            r: (200.0 * waste) as u8,
        }
    }
}

/// Writes the rendered history to `path`; does nothing for an empty history.
pub fn save_history(path: &Path, history: &[Snapshot]) -> Result<()> {
    if history.is_empty() {
        return Ok(());
    }
    let file =
        File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write_history(&mut out, history).with_context(|| format!("writing {}", path.display()))?;
    out.flush()?;
    Ok(())
}

fn render(history: &[Snapshot]) -> (usize, usize, Vec<Color>) {
    let width = (history[0].total / MIN_BLOCK_SIZE) as usize;
    let height = history.len();
    let mut pixels = vec![Color::BACKGROUND; width * height];

    for (y, state) in history.iter().enumerate() {
        for block in &state.blocks {
            let start = (block.address / MIN_BLOCK_SIZE) as usize;
            let end = (((block.address + block.size) / MIN_BLOCK_SIZE) as usize).min(width);
            if start >= width {
                continue;
            }
            let color = if block.free {
                Color::free_block(block.size)
            } else {
                Color::allocated_block(block.waste_ratio)
            };
            pixels[y * width + start..y * width + end].fill(color);
        }
    }

    (width, height, pixels)
}

fn write_history<W: Write>(out: &mut W, history: &[Snapshot]) -> io::Result<()> {
    let (width, height, pixels) = render(history);
    write_bmp(out, width, height, &pixels)
}

/// Emits a 24-bit uncompressed BMP, rows padded to 4 bytes, bottom-up.
fn write_bmp<W: Write>(out: &mut W, width: usize, height: usize, pixels: &[Color]) -> io::Result<()> {
    let padding = (4 - (width * 3) % 4) % 4;
    let image_size = ((width * 3 + padding) * height) as u32;
    let data_offset = FILE_HEADER_SIZE + INFO_HEADER_SIZE;

    // file header
    out.write_all(b"BM")?;
    out.write_all(&(data_offset + image_size).to_le_bytes())?;
    out.write_all(&0u16.to_le_bytes())?;
    out.write_all(&0u16.to_le_bytes())?;
    out.write_all(&data_offset.to_le_bytes())?;

    // info header
    out.write_all(&INFO_HEADER_SIZE.to_le_bytes())?;
    out.write_all(&(width as i32).to_le_bytes())?;
    out.write_all(&(height as i32).to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?; // planes
    out.write_all(&24u16.to_le_bytes())?; // bits per pixel
    out.write_all(&0u32.to_le_bytes())?; // no compression
    out.write_all(&image_size.to_le_bytes())?;
    out.write_all(&0i32.to_le_bytes())?;
    out.write_all(&0i32.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?;

    let pad = [0u8; 3];
    for y in (0..height).rev() {
        for color in &pixels[y * width..(y + 1) * width] {
            out.write_all(&[color.b, color.g, color.r])?;
        }
        out.write_all(&pad[..padding])?;
    }
    Ok(())
}

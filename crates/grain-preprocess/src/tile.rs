//! Fixed R×C tiling with remainder absorption.
//!
//! `step_h = height / rows`, `step_w = width / cols`; the last row and the
//! last column stretch to the image edge so the grid covers every pixel
//! exactly once. Order is row-major everywhere.

use crate::{PreprocessError, Result};
use image::{imageops, RgbImage};

/// Grid shape (rows × cols).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    rows: usize,
    cols: usize,
}

/// Pixel rectangle of one tile, half-open on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub row: usize,
    pub col: usize,
    pub y0: u32,
    pub y1: u32,
    pub x0: u32,
    pub x1: u32,
}

impl TileRect {
    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }
}

/// A cropped tile plus where it came from.
#[derive(Debug, Clone)]
pub struct Tile {
    pub rect: TileRect,
    pub image: RgbImage,
}

impl TileGrid {
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(PreprocessError::EmptyGrid { rows, cols });
        }
        Ok(Self { rows, cols })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn tile_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Tile rectangles for an image of `height × width`, row-major.
    pub fn rects(&self, height: u32, width: u32) -> Result<Vec<TileRect>> {
        if (height as usize) < self.rows || (width as usize) < self.cols {
            return Err(PreprocessError::DegenerateTile {
                height,
                width,
                rows: self.rows,
                cols: self.cols,
            });
        }
        let step_h = height / self.rows as u32;
        let step_w = width / self.cols as u32;

        let mut rects = Vec::with_capacity(self.tile_count());
        for r in 0..self.rows {
            let y0 = r as u32 * step_h;
            let y1 = if r + 1 < self.rows { y0 + step_h } else { height };
            for c in 0..self.cols {
                let x0 = c as u32 * step_w;
                let x1 = if c + 1 < self.cols { x0 + step_w } else { width };
                rects.push(TileRect { row: r, col: c, y0, y1, x0, x1 });
            }
        }
        Ok(rects)
    }
}

/// Split `image` into `rows × cols` tiles.
pub fn tile(image: &RgbImage, rows: usize, cols: usize) -> Result<Vec<Tile>> {
    let grid = TileGrid::new(rows, cols)?;
    let rects = grid.rects(image.height(), image.width())?;
    Ok(rects
        .into_iter()
        .map(|rect| Tile {
            image: imageops::crop_imm(image, rect.x0, rect.y0, rect.width(), rect.height()).to_image(),
            rect,
        })
        .collect())
}

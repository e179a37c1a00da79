//! grain‑preprocess – tile + resize + normalize RGB photographs.
//!
//! Output is a `(N, 3, S, S)` CHW `f32` tensor, N = rows·cols in row-major
//! tile order, ImageNet-normalized.

use image::RgbImage;
use ndarray::{s, Array4};
use resize::{new, Pixel, Type};
use rgb::FromSlice;
use thiserror::Error;

pub mod tile;
pub use tile::{tile, Tile, TileGrid, TileRect};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Tile grid must be non-empty, got {rows}x{cols}")]
    EmptyGrid { rows: usize, cols: usize },
    #[error("Image {height}x{width} is smaller than the {rows}x{cols} grid; tiles would be empty")]
    DegenerateTile { height: u32, width: u32, rows: usize, cols: usize },
    #[error("Tile edge must be positive")]
    ZeroTileSize,
    #[error("Resize failed: {0}")]
    Resize(#[from] resize::Error),
    #[error("Resized buffer does not match {width}x{height}")]
    BufferSize { width: u32, height: u32 },
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

/// How the grid is cut out of the photograph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridLayout {
    /// Crop the R×C grid from the original image, resize each tile.
    #[default]
    CropThenResize,
    /// Resize the whole image to `(cols·S) × (rows·S)`, then cut exact tiles.
    ResizeThenSplit,
}

#[derive(Debug, Clone)]
pub struct TileTransform {
    tile_size: u32,
    layout: GridLayout,
    mean: [f32; 3],
    std: [f32; 3],
}

impl TileTransform {
    /// Create a transform that outputs S×S tiles with ImageNet normalization.
    pub fn new(tile_size: u32) -> Result<Self> {
        if tile_size == 0 {
            return Err(PreprocessError::ZeroTileSize);
        }
        Ok(Self {
            tile_size,
            layout: GridLayout::default(),
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        })
    }

    pub fn with_layout(mut self, layout: GridLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    /// Tile, resize and normalize one photograph.
    pub fn run(&self, image: &RgbImage, grid: &TileGrid) -> Result<Array4<f32>> {
        let s = self.tile_size as usize;
        let mut out = Array4::<f32>::zeros((grid.tile_count(), 3, s, s));

        match self.layout {
            GridLayout::CropThenResize => {
                let tiles = tile(image, grid.rows(), grid.cols())?;
                for (i, t) in tiles.iter().enumerate() {
                    let px = resize_rgb(&t.image, self.tile_size, self.tile_size)?;
                    self.write_chw(px.as_raw(), out.slice_mut(s![i, .., .., ..]));
                }
            }
            GridLayout::ResizeThenSplit => {
                // same guard as the crop path
                grid.rects(image.height(), image.width())?;
                let full_w = self.tile_size * grid.cols() as u32;
                let full_h = self.tile_size * grid.rows() as u32;
                let full = resize_rgb(image, full_w, full_h)?;
                for (i, rect) in grid.rects(full_h, full_w)?.iter().enumerate() {
                    let crop = image::imageops::crop_imm(&full, rect.x0, rect.y0, rect.width(), rect.height())
                        .to_image();
                    self.write_chw(crop.as_raw(), out.slice_mut(s![i, .., .., ..]));
                }
            }
        }
        log::trace!("preprocessed {:?} → {:?}", image.dimensions(), out.shape());
        Ok(out)
    }

    /// Packed RGB8 (HWC) → normalized CHW.
    fn write_chw(&self, rgb: &[u8], mut dst: ndarray::ArrayViewMut3<f32>) {
        let s = self.tile_size as usize;
        for (idx, px) in rgb.chunks_exact(3).enumerate() {
            let (y, x) = (idx / s, idx % s);
            for c in 0..3 {
                dst[(c, y, x)] = (px[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }
    }
}

/// Bilinear (triangle) resize.
fn resize_rgb(src: &RgbImage, dst_w: u32, dst_h: u32) -> Result<RgbImage> {
    if src.dimensions() == (dst_w, dst_h) {
        return Ok(src.clone());
    }
    let mut dst = vec![0u8; (dst_w * dst_h * 3) as usize];
    let mut resizer = new(
        src.width() as usize,
        src.height() as usize,
        dst_w as usize,
        dst_h as usize,
        Pixel::RGB8,
        Type::Triangle,
    )?;
    resizer.resize(src.as_raw().as_rgb(), dst.as_rgb_mut())?;
    RgbImage::from_raw(dst_w, dst_h, dst).ok_or(PreprocessError::BufferSize {
        width: dst_w,
        height: dst_h,
    })
}

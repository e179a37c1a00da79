//! Dense kernels on `ndarray` tensors (NCHW, f32).
//!
//! Only what the heads need: linear, 2-D convolution (stride 1, zero
//! padding), layer norm, GELU, ReLU, bilinear resampling with
//! `align_corners = true`, global average pooling.

use crate::{ModelError, Result};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};

/// Fully connected layer, `y = x·Wᵀ + b`, `W: (out, in)`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "linear weight {:?} vs bias {}",
                weight.dim(),
                bias.len()
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// `x: (batch, in)` → `(batch, out)`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(ModelError::ShapeMismatch(format!(
                "linear expects {} inputs, got {}",
                self.in_features(),
                x.ncols()
            )));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }
}

/// 2-D convolution, stride 1, symmetric zero padding `(k - 1) / 2`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `(out, in·k·k)`, rows laid out as `[in][ky][kx]`.
    kernel: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    k: usize,
}

impl Conv2d {
    /// `weight: (out, in, k, k)` as stored by PyTorch.
    pub fn new(weight: Array4<f32>, bias: Array1<f32>) -> Result<Self> {
        let (out, inp, kh, kw) = weight.dim();
        if kh != kw || kh % 2 == 0 {
            return Err(ModelError::ShapeMismatch(format!(
                "only odd square kernels are supported, got {kh}x{kw}"
            )));
        }
        if bias.len() != out {
            return Err(ModelError::ShapeMismatch(format!(
                "conv weight has {out} filters but bias has {}",
                bias.len()
            )));
        }
        let kernel = weight
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((out, inp * kh * kw))
            .map_err(|e| ModelError::ShapeMismatch(e.to_string()))?;
        Ok(Self { kernel, bias, in_channels: inp, k: kh })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn kernel_size(&self) -> usize {
        self.k
    }

    pub fn param_count(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }

    /// Single feature map `(in, H, W)` → `(out, H, W)`.
    pub fn forward(&self, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (c, h, w) = x.dim();
        if c != self.in_channels {
            return Err(ModelError::ShapeMismatch(format!(
                "conv expects {} channels, got {c}",
                self.in_channels
            )));
        }
        let cols = if self.k == 1 {
            x.as_standard_layout()
                .into_owned()
                .into_shape_with_order((c, h * w))
                .map_err(|e| ModelError::ShapeMismatch(e.to_string()))?
        } else {
            im2col(x, self.k)
        };
        let mut y = self.kernel.dot(&cols);
        y += &self.bias.view().insert_axis(Axis(1));
        y.into_shape_with_order((self.out_channels(), h, w))
            .map_err(|e| ModelError::ShapeMismatch(e.to_string()))
    }
}

/// Unfold `(C, H, W)` into `(C·k·k, H·W)` with zero padding.
fn im2col(x: ArrayView3<f32>, k: usize) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let pad = (k / 2) as isize;
    let mut cols = Array2::<f32>::zeros((c * k * k, h * w));
    for ci in 0..c {
        for ky in 0..k {
            for kx in 0..k {
                let row = (ci * k + ky) * k + kx;
                let dy = ky as isize - pad;
                let dx = kx as isize - pad;
                let mut dst = cols.row_mut(row);
                for y in 0..h {
                    let sy = y as isize + dy;
                    if sy < 0 || sy >= h as isize {
                        continue;
                    }
                    for xo in 0..w {
                        let sx = xo as isize + dx;
                        if sx < 0 || sx >= w as isize {
                            continue;
                        }
                        dst[y * w + xo] = x[(ci, sy as usize, sx as usize)];
                    }
                }
            }
        }
    }
    cols
}

/// Row-wise layer norm over the last axis of `(batch, dim)`.
pub fn layer_norm(x: &mut Array2<f32>, gamma: ArrayView1<f32>, beta: ArrayView1<f32>, eps: f32) {
    let dim = x.ncols() as f32;
    for mut row in x.rows_mut() {
        let mean = row.sum() / dim;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim;
        let inv = 1.0 / (var + eps).sqrt();
        Zip::from(&mut row).and(&gamma).and(&beta).for_each(|v, &g, &b| {
            *v = (*v - mean) * inv * g + b;
        });
    }
}

/// Error function, Abramowitz–Stegun 7.1.26 (|ε| < 1.5e-7).
pub fn erf(x: f32) -> f32 {
    let x = x as f64;
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [0.254_829_592, -0.284_496_736, 1.421_413_741, -1.453_152_027, 1.061_405_429];
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A[4] * t + A[3]) * t + A[2]) * t + A[1]) * t + A[0]) * t;
    (sign * (1.0 - poly * (-x * x).exp())) as f32
}

/// Exact (erf-based) GELU, in place.
pub fn gelu<D: ndarray::Dimension>(x: &mut ndarray::Array<f32, D>) {
    x.mapv_inplace(|v| 0.5 * v * (1.0 + erf(v * std::f32::consts::FRAC_1_SQRT_2)));
}

pub fn relu<D: ndarray::Dimension>(x: &mut ndarray::Array<f32, D>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Bilinear resample of `(C, H, W)` to `(C, oh, ow)`, `align_corners = true`.
pub fn resize_bilinear(x: ArrayView3<f32>, oh: usize, ow: usize) -> Array3<f32> {
    let (c, h, w) = x.dim();
    let ys = sample_grid(h, oh);
    let xs = sample_grid(w, ow);
    let mut out = Array3::<f32>::zeros((c, oh, ow));
    for ci in 0..c {
        let src = x.index_axis(Axis(0), ci);
        let mut dst = out.index_axis_mut(Axis(0), ci);
        for (oy, &(y0, y1, wy)) in ys.iter().enumerate() {
            for (ox, &(x0, x1, wx)) in xs.iter().enumerate() {
                let top = src[(y0, x0)] * (1.0 - wx) + src[(y0, x1)] * wx;
                let bot = src[(y1, x0)] * (1.0 - wx) + src[(y1, x1)] * wx;
                dst[(oy, ox)] = top * (1.0 - wy) + bot * wy;
            }
        }
    }
    out
}

/// 2× bilinear upsample, `align_corners = true`.
pub fn upsample2x(x: ArrayView3<f32>) -> Array3<f32> {
    let (_, h, w) = x.dim();
    resize_bilinear(x, h * 2, w * 2)
}

/// Source taps `(lo, hi, weight_hi)` for each output coordinate.
fn sample_grid(input: usize, output: usize) -> Vec<(usize, usize, f32)> {
    let scale = if output > 1 {
        (input as f32 - 1.0) / (output as f32 - 1.0)
    } else {
        0.0
    };
    (0..output)
        .map(|o| {
            let src = o as f32 * scale;
            let lo = (src.floor() as usize).min(input - 1);
            let hi = (lo + 1).min(input - 1);
            (lo, hi, src - lo as f32)
        })
        .collect()
}

/// `(N, C, H, W)` → `(N, C)` spatial mean.
pub fn global_avg_pool(x: ArrayView4<f32>) -> Array2<f32> {
    let (n, c, h, w) = x.dim();
    let area = (h * w) as f32;
    let mut out = Array2::<f32>::zeros((n, c));
    for (i, tile) in x.outer_iter().enumerate() {
        for (j, plane) in tile.outer_iter().enumerate() {
            out[(i, j)] = plane.sum() / area;
        }
    }
    out
}

/// Broadcast a `(E,)` vector to `(E, h, w)`.
pub fn broadcast_spatial(v: ArrayView1<f32>, h: usize, w: usize) -> Array3<f32> {
    let e = v.len();
    let mut out = Array3::<f32>::zeros((e, h, w));
    for (mut plane, &val) in out.outer_iter_mut().zip(v.iter()) {
        plane.fill(val);
    }
    out
}

/// Channel concat of same-sized `(C_i, H, W)` maps.
pub fn concat_channels(parts: &[ArrayView3<f32>]) -> Result<Array3<f32>> {
    ndarray::concatenate(Axis(0), parts).map_err(|e| ModelError::ShapeMismatch(format!("channel concat: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array};

    #[test]
    fn linear_matches_hand_computation() {
        let l = Linear::new(arr2(&[[1.0, 2.0], [0.0, -1.0], [0.5, 0.5]]), arr1(&[0.0, 1.0, -1.0])).unwrap();
        let y = l.forward(arr2(&[[3.0, 4.0]]).view()).unwrap();
        assert_eq!(y, arr2(&[[11.0, -3.0, 2.5]]));
    }

    #[test]
    fn conv1x1_is_channel_mixing() {
        let w = Array::from_shape_vec((1, 2, 1, 1), vec![2.0, -1.0]).unwrap();
        let conv = Conv2d::new(w, arr1(&[0.5])).unwrap();
        let x = Array::from_shape_vec((2, 1, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = conv.forward(x.view()).unwrap();
        assert_eq!(y.into_raw_vec_and_offset().0, vec![2.0 - 3.0 + 0.5, 4.0 - 4.0 + 0.5]);
    }

    #[test]
    fn conv3x3_box_filter_with_zero_padding() {
        let w = Array4::<f32>::ones((1, 1, 3, 3));
        let conv = Conv2d::new(w, arr1(&[0.0])).unwrap();
        let x = Array3::<f32>::ones((1, 3, 3));
        let y = conv.forward(x.view()).unwrap();
        // corners see 4 pixels, edges 6, centre 9
        assert_eq!(y[(0, 0, 0)], 4.0);
        assert_eq!(y[(0, 0, 1)], 6.0);
        assert_eq!(y[(0, 1, 1)], 9.0);
    }

    #[test]
    fn even_kernels_rejected() {
        assert!(Conv2d::new(Array4::zeros((1, 1, 2, 2)), arr1(&[0.0])).is_err());
    }

    #[test]
    fn layer_norm_zero_mean_unit_var() {
        let mut x = arr2(&[[1.0, 2.0, 3.0, 4.0]]);
        layer_norm(&mut x, Array1::ones(4).view(), Array1::zeros(4).view(), 1e-5);
        let mean = x.sum() / 4.0;
        let var = x.mapv(|v| v * v).sum() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn gelu_reference_points() {
        let mut x = arr1(&[-3.0f32, -1.0, 0.0, 1.0, 3.0]);
        gelu(&mut x);
        let expected = [-0.004_049_7, -0.158_655_3, 0.0, 0.841_344_7, 2.995_950_3];
        for (a, b) in x.iter().zip(expected) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn align_corners_keeps_the_corners() {
        let x = Array::from_shape_vec((1, 2, 2), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let y = upsample2x(x.view());
        assert_eq!(y.dim(), (1, 4, 4));
        assert_eq!(y[(0, 0, 0)], 0.0);
        assert_eq!(y[(0, 0, 3)], 1.0);
        assert_eq!(y[(0, 3, 0)], 2.0);
        assert_eq!(y[(0, 3, 3)], 3.0);
        // (1/3, 1/3) of the way in
        assert!((y[(0, 1, 1)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn resize_to_odd_target() {
        let x = Array3::<f32>::from_elem((2, 4, 4), 7.0);
        let y = resize_bilinear(x.view(), 7, 5);
        assert_eq!(y.dim(), (2, 7, 5));
        assert!(y.iter().all(|&v| (v - 7.0).abs() < 1e-6));
    }

    #[test]
    fn pooling_and_broadcast() {
        let x = Array::from_shape_vec((1, 2, 1, 2), vec![1.0, 3.0, 10.0, 20.0]).unwrap();
        assert_eq!(global_avg_pool(x.view()), arr2(&[[2.0, 15.0]]));
        let b = broadcast_spatial(arr1(&[1.0, -2.0]).view(), 2, 3);
        assert_eq!(b.dim(), (2, 2, 3));
        assert!(b.index_axis(Axis(0), 1).iter().all(|&v| v == -2.0));
    }
}

//! Spatial resampling of `[B, C, H, W]` feature maps.
//!
//! Both modes are separable, so each is expressed as a pair of dense
//! `[out, in]` weight matrices applied along height and width. Semantics
//! follow PyTorch's `F.interpolate` with `align_corners=False`.

use candle_core::{Device, Result, Tensor};

/// Cubic convolution coefficient used by PyTorch.
const CUBIC_A: f64 = -0.75;

/// Bicubic resize to `(out_h, out_w)`.
pub fn bicubic(xs: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_, _, in_h, in_w) = xs.dims4()?;
    let wh = bicubic_weights(in_h, out_h, xs.device())?;
    let ww = bicubic_weights(in_w, out_w, xs.device())?;
    apply_separable(xs, &wh, &ww)
}

/// Area (adaptive average pool) resize to `(out_h, out_w)`.
pub fn area(xs: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_, _, in_h, in_w) = xs.dims4()?;
    let wh = area_weights(in_h, out_h, xs.device())?;
    let ww = area_weights(in_w, out_w, xs.device())?;
    apply_separable(xs, &wh, &ww)
}

fn apply_separable(xs: &Tensor, wh: &Tensor, ww: &Tensor) -> Result<Tensor> {
    let dtype = xs.dtype();
    let wh = wh.to_dtype(dtype)?;
    let ww = ww.to_dtype(dtype)?.t()?.contiguous()?;
    wh.broadcast_matmul(&xs.contiguous()?)?.broadcast_matmul(&ww)
}

fn cubic_coefficients(t: f64) -> [f64; 4] {
    let a = CUBIC_A;
    let near = |x: f64| ((a + 2.0) * x - (a + 3.0)) * x * x + 1.0;
    let far = |x: f64| ((a * x - 5.0 * a) * x + 8.0 * a) * x - 4.0 * a;
    [far(t + 1.0), near(t), near(1.0 - t), far(2.0 - t)]
}

fn bicubic_weights(in_len: usize, out_len: usize, device: &Device) -> Result<Tensor> {
    let scale = in_len as f64 / out_len as f64;
    let mut weights = vec![0f32; out_len * in_len];
    let last = in_len as isize - 1;

    for dst in 0..out_len {
        let src = (dst as f64 + 0.5) * scale - 0.5;
        let base = src.floor();
        let coeffs = cubic_coefficients(src - base);
        for (tap, coeff) in coeffs.iter().enumerate() {
            let idx = (base as isize - 1 + tap as isize).clamp(0, last) as usize;
            weights[dst * in_len + idx] += *coeff as f32;
        }
    }
    Tensor::from_vec(weights, (out_len, in_len), device)
}

fn area_weights(in_len: usize, out_len: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; out_len * in_len];
    for dst in 0..out_len {
        let start = (dst * in_len) / out_len;
        let end = ((dst + 1) * in_len).div_ceil(out_len);
        let count = (end - start) as f32;
        for src in start..end {
            weights[dst * in_len + src] = 1.0 / count;
        }
    }
    Tensor::from_vec(weights, (out_len, in_len), device)
}

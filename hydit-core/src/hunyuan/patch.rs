use candle_core::Tensor;

use crate::error::{shape_bail, Result};

/// `(N, C, H, W) -> (N, (H/p)(W/p), p*p*C)`, row-major over the patch grid.
/// Returns the tokens with the grid height and width.
pub fn patchify(img: &Tensor, p: usize) -> Result<(Tensor, usize, usize)> {
    let (n, c, height, width) = img.dims4()?;
    if p == 0 || height % p != 0 || width % p != 0 {
        shape_bail!("spatial size {height}x{width} is not divisible by patch size {p}");
    }
    let (h, w) = (height / p, width / p);
    let xs = img
        .reshape((n, c, h, p, w, p))?
        .permute(vec![0, 2, 4, 3, 5, 1])?
        .reshape((n, h * w, p * p * c))?;
    Ok((xs, h, w))
}

/// Inverse of [`patchify`]: `(N, h*w, p*p*c) -> (N, c, h*p, w*p)`.
pub fn unpatchify(x: &Tensor, h: usize, w: usize, p: usize, c: usize) -> Result<Tensor> {
    let (n, t, d) = x.dims3()?;
    if h * w != t {
        shape_bail!("patch grid {h}x{w} does not cover {t} tokens");
    }
    if p * p * c != d {
        shape_bail!("token width {d} is not patch {p}x{p} times {c} channels");
    }
    Ok(x.reshape((n, h, w, p, p, c))?
        .permute(vec![0, 5, 1, 3, 2, 4])?
        .reshape((n, c, h * p, w * p))?)
}

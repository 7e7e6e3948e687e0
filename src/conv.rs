//! Geometry and raw kernels for "same" padded, strided 2d convolutions over NHWC buffers
//!
//! A convolution relates a "big" grid to a "small" grid. A strided convolution reads the big grid
//! and writes the small one, its transpose does the opposite. Three kernels cover the forward pass
//! and both gradients for either direction:
//!
//! | kernel        | conv2d            | conv_transpose2d  |
//! |---------------|-------------------|-------------------|
//! | `correlate`   | forward           | input gradient    |
//! | `scatter`     | input gradient    | forward           |
//! | `weight_grad` | weight gradient   | weight gradient   |
//!
//! Weights are laid out `[kernel, kernel, big_channels, small_channels]`.

/// Shapes, stride and padding relating the big and the small grid of a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub big_h: usize,
    pub big_w: usize,
    pub big_c: usize,
    pub small_h: usize,
    pub small_w: usize,
    pub small_c: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad_top: usize,
    pub pad_left: usize,
}

impl ConvGeometry {
    /// Geometry of a convolution reading `[batch, in_h, in_w, in_c]` and producing `out_c` channels
    /// on a grid of side `ceil(in / stride)`
    pub fn conv(
        batch: usize,
        (in_h, in_w, in_c): (usize, usize, usize),
        out_c: usize,
        kernel: usize,
        stride: usize,
    ) -> Self {
        let small_h = in_h.div_ceil(stride);
        let small_w = in_w.div_ceil(stride);
        Self {
            batch,
            big_h: in_h,
            big_w: in_w,
            big_c: in_c,
            small_h,
            small_w,
            small_c: out_c,
            kernel,
            stride,
            pad_top: same_padding(in_h, small_h, kernel, stride),
            pad_left: same_padding(in_w, small_w, kernel, stride),
        }
    }

    /// Geometry of a transposed convolution reading `[batch, in_h, in_w, in_c]` and producing
    /// `out_c` channels on a grid of side `in * stride`
    pub fn transposed(
        batch: usize,
        (in_h, in_w, in_c): (usize, usize, usize),
        out_c: usize,
        kernel: usize,
        stride: usize,
    ) -> Self {
        let big_h = in_h * stride;
        let big_w = in_w * stride;
        Self {
            batch,
            big_h,
            big_w,
            big_c: out_c,
            small_h: in_h,
            small_w: in_w,
            small_c: in_c,
            kernel,
            stride,
            pad_top: same_padding(big_h, in_h, kernel, stride),
            pad_left: same_padding(big_w, in_w, kernel, stride),
        }
    }

    pub fn big_shape(&self) -> Vec<usize> {
        vec![self.batch, self.big_h, self.big_w, self.big_c]
    }

    pub fn small_shape(&self) -> Vec<usize> {
        vec![self.batch, self.small_h, self.small_w, self.small_c]
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.kernel, self.kernel, self.big_c, self.small_c]
    }

    fn big_len(&self) -> usize {
        self.batch * self.big_h * self.big_w * self.big_c
    }

    fn small_len(&self) -> usize {
        self.batch * self.small_h * self.small_w * self.small_c
    }

    fn weight_len(&self) -> usize {
        self.kernel * self.kernel * self.big_c * self.small_c
    }

    /// Row of the big grid touched by kernel row `ky` at small row `sy`, if inside the grid
    fn big_row(&self, sy: usize, ky: usize) -> Option<usize> {
        (sy * self.stride + ky)
            .checked_sub(self.pad_top)
            .filter(|&y| y < self.big_h)
    }

    fn big_col(&self, sx: usize, kx: usize) -> Option<usize> {
        (sx * self.stride + kx)
            .checked_sub(self.pad_left)
            .filter(|&x| x < self.big_w)
    }

    fn big_offset(&self, n: usize, y: usize, x: usize) -> usize {
        ((n * self.big_h + y) * self.big_w + x) * self.big_c
    }

    fn small_offset(&self, n: usize, y: usize, x: usize) -> usize {
        ((n * self.small_h + y) * self.small_w + x) * self.small_c
    }

    fn weight_offset(&self, ky: usize, kx: usize, c: usize) -> usize {
        ((ky * self.kernel + kx) * self.big_c + c) * self.small_c
    }

    /// Visits every (small pixel, big pixel, kernel tap) triple inside the grids as offsets
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize, usize)) {
        for n in 0..self.batch {
            for sy in 0..self.small_h {
                for sx in 0..self.small_w {
                    let small_off = self.small_offset(n, sy, sx);
                    for ky in 0..self.kernel {
                        let Some(by) = self.big_row(sy, ky) else {
                            continue;
                        };
                        for kx in 0..self.kernel {
                            let Some(bx) = self.big_col(sx, kx) else {
                                continue;
                            };
                            f(small_off, self.big_offset(n, by, bx), ky, kx);
                        }
                    }
                }
            }
        }
    }
}

/// Begin padding so that `small` outputs with the given stride cover a `big` sized input
fn same_padding(big: usize, small: usize, kernel: usize, stride: usize) -> usize {
    (small.saturating_sub(1) * stride + kernel).saturating_sub(big) / 2
}

/// Big grid to small grid: `small[s, o] = sum big[b, i] * w[ky, kx, i, o]`
pub fn correlate(geometry: &ConvGeometry, big: &[f32], weights: &[f32]) -> Vec<f32> {
    debug_assert_eq!(big.len(), geometry.big_len());
    debug_assert_eq!(weights.len(), geometry.weight_len());
    let small_c = geometry.small_c;
    let mut small = vec![0.0; geometry.small_len()];
    geometry.for_each_tap(|small_off, big_off, ky, kx| {
        let out = &mut small[small_off..small_off + small_c];
        for (c, &x) in big[big_off..big_off + geometry.big_c].iter().enumerate() {
            // post-ReLU inputs are mostly zero
            if x == 0.0 {
                continue;
            }
            let w_off = geometry.weight_offset(ky, kx, c);
            for (o, w) in out.iter_mut().zip(&weights[w_off..w_off + small_c]) {
                *o += x * w;
            }
        }
    });
    small
}

/// Small grid to big grid, the adjoint of [`correlate`]
pub fn scatter(geometry: &ConvGeometry, small: &[f32], weights: &[f32]) -> Vec<f32> {
    debug_assert_eq!(small.len(), geometry.small_len());
    debug_assert_eq!(weights.len(), geometry.weight_len());
    let small_c = geometry.small_c;
    let mut big = vec![0.0; geometry.big_len()];
    geometry.for_each_tap(|small_off, big_off, ky, kx| {
        let s = &small[small_off..small_off + small_c];
        for (c, b) in big[big_off..big_off + geometry.big_c].iter_mut().enumerate() {
            let w_off = geometry.weight_offset(ky, kx, c);
            *b += s
                .iter()
                .zip(&weights[w_off..w_off + small_c])
                .map(|(s, w)| s * w)
                .sum::<f32>();
        }
    });
    big
}

/// Gradient of `sum(small * correlate(big, w))` with respect to `w`
pub fn weight_grad(geometry: &ConvGeometry, big: &[f32], small: &[f32]) -> Vec<f32> {
    debug_assert_eq!(big.len(), geometry.big_len());
    debug_assert_eq!(small.len(), geometry.small_len());
    let small_c = geometry.small_c;
    let mut grad = vec![0.0; geometry.weight_len()];
    geometry.for_each_tap(|small_off, big_off, ky, kx| {
        let s = &small[small_off..small_off + small_c];
        for (c, &x) in big[big_off..big_off + geometry.big_c].iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            let w_off = geometry.weight_offset(ky, kx, c);
            for (g, s) in grad[w_off..w_off + small_c].iter_mut().zip(s) {
                *g += x * s;
            }
        }
    });
    grad
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn random_vec(rng: &mut Pcg64Mcg, len: usize) -> Vec<f32> {
        (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn test_same_geometry() {
        // 28 -> 14 with a 5x5 kernel needs 3 rows of padding, 1 before and 2 after
        let g = ConvGeometry::conv(2, (28, 28, 1), 64, 5, 2);
        assert_eq!((g.small_h, g.small_w), (14, 14));
        assert_eq!((g.pad_top, g.pad_left), (1, 1));

        let g = ConvGeometry::conv(1, (14, 14, 64), 128, 5, 2);
        assert_eq!((g.small_h, g.pad_top), (7, 1));

        let g = ConvGeometry::transposed(1, (7, 7, 256), 128, 5, 1);
        assert_eq!((g.big_h, g.big_w, g.pad_top), (7, 7, 2));

        let g = ConvGeometry::transposed(1, (7, 7, 128), 64, 5, 2);
        assert_eq!((g.big_h, g.pad_top), (14, 1));
        assert_eq!(g.weight_shape(), vec![5, 5, 64, 128]);
    }

    #[test]
    fn test_identity_kernel() {
        // a centred 3x3 kernel with a single one is the identity for stride 1
        let g = ConvGeometry::conv(1, (3, 3, 1), 1, 3, 1);
        let mut weights = vec![0.0; 9];
        weights[4] = 1.0;
        let input = (1..=9).map(|v| v as f32).collect::<Vec<_>>();
        assert_eq!(correlate(&g, &input, &weights), input);
        assert_eq!(scatter(&g, &input, &weights), input);
    }

    #[test]
    fn test_strided_sum() {
        // all ones kernel over a 4x4 grid of ones, stride 2, k 3: pad_top is 0
        let g = ConvGeometry::conv(1, (4, 4, 1), 1, 3, 2);
        assert_eq!(g.pad_top, 0);
        let out = correlate(&g, &[1.0; 16], &[1.0; 9]);
        // the last window hangs over the bottom/right edge
        assert_eq!(out, vec![9.0, 6.0, 6.0, 4.0]);
    }

    #[test]
    fn test_scatter_is_adjoint_of_correlate() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        for g in [
            ConvGeometry::conv(2, (6, 5, 3), 4, 3, 2),
            ConvGeometry::conv(1, (5, 5, 2), 3, 5, 1),
            ConvGeometry::transposed(2, (3, 3, 4), 2, 5, 2),
        ] {
            let big = random_vec(&mut rng, g.big_len());
            let small = random_vec(&mut rng, g.small_len());
            let weights = random_vec(&mut rng, g.weight_len());
            let lhs = dot(&correlate(&g, &big, &weights), &small);
            let rhs = dot(&big, &scatter(&g, &small, &weights));
            assert!((lhs - rhs).abs() < 1e-4, "{lhs} != {rhs} for {g:?}");
        }
    }

    #[test]
    fn test_weight_grad_matches_finite_differences() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let g = ConvGeometry::conv(2, (5, 4, 2), 3, 3, 2);
        let big = random_vec(&mut rng, g.big_len());
        let upstream = random_vec(&mut rng, g.small_len());
        let weights = random_vec(&mut rng, g.weight_len());
        let grad = weight_grad(&g, &big, &upstream);

        // the objective is linear in the weights so a unit perturbation is exact up to rounding
        for idx in [0, 5, g.weight_len() - 1] {
            let mut bumped = weights.clone();
            bumped[idx] += 1.0;
            let delta = dot(&correlate(&g, &big, &bumped), &upstream)
                - dot(&correlate(&g, &big, &weights), &upstream);
            assert!((delta - grad[idx]).abs() < 1e-4);
        }
    }
}

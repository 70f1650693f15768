use super::PoolMethod;
use crate::{errors::ShapeMismatch, Error};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView3};

fn mismatch(name: &'static str, expected: &[usize], actual: &[usize]) -> Error {
    Error::ShapeMismatch(ShapeMismatch {
        name,
        expected: expected.to_vec(),
        actual: actual.to_vec(),
    })
}

/// Reshapes a `channels x pixels` matrix back into a `channels x height x width` map
pub(crate) fn to_map(mat: Array2<f32>, dim: (usize, usize, usize)) -> Result<Array3<f32>, Error> {
    let mat = if mat.is_standard_layout() {
        mat
    } else {
        mat.as_standard_layout().into_owned()
    };

    let actual = mat.shape().to_vec();
    mat.into_shape(dim)
        .map_err(|_| mismatch("feature map", &[dim.0, dim.1, dim.2], &actual))
}

/// Flattens a `channels x height x width` map into a `channels x pixels` matrix
pub(crate) fn to_matrix(map: &Array3<f32>) -> Array2<f32> {
    let (c, h, w) = map.dim();
    Array2::from_shape_fn((c, h * w), |(ch, px)| map[[ch, px / w, px % w]])
}

/// A stride 1 convolution with "same" zero padding
#[derive(Clone, Debug)]
pub struct Conv2d {
    /// `out x in x kernel x kernel`
    weights: Array4<f32>,
    /// The weights flattened to `out x (in * kernel * kernel)`
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

impl Conv2d {
    pub fn new(weights: Array4<f32>, bias: Array1<f32>) -> Result<Self, Error> {
        let (out, _, kh, kw) = weights.dim();

        if kh != kw || kh % 2 == 0 {
            return Err(Error::InvalidNetwork(format!(
                "convolution kernels must be square with an odd size, not {}x{}",
                kh, kw
            )));
        }

        if bias.len() != out {
            return Err(Error::InvalidNetwork(format!(
                "convolution has {} filters, but {} biases",
                out,
                bias.len()
            )));
        }

        let weights = weights.as_standard_layout().into_owned();
        let (o, i, k, _) = weights.dim();
        let kernel = weights
            .clone()
            .into_shape((o, i * k * k))
            .map_err(|_| mismatch("convolution weights", &[o, i * k * k], weights.shape()))?;

        Ok(Self {
            weights,
            kernel,
            bias,
        })
    }

    #[inline]
    pub fn in_channels(&self) -> usize {
        self.weights.dim().1
    }

    #[inline]
    pub fn out_channels(&self) -> usize {
        self.weights.dim().0
    }

    #[inline]
    pub fn kernel_size(&self) -> usize {
        self.weights.dim().2
    }

    #[inline]
    pub fn weights(&self) -> &Array4<f32> {
        &self.weights
    }

    #[inline]
    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Convolves the `in x height x width` input, yielding `out x height x width`
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>, Error> {
        let (c, h, w) = input.dim();
        if c != self.in_channels() {
            return Err(mismatch(
                "convolution input",
                &[self.in_channels(), h, w],
                &[c, h, w],
            ));
        }

        let cols = im2col(input.view(), self.kernel_size());
        let mut out = self.kernel.dot(&cols);

        for (mut row, b) in out.outer_iter_mut().zip(self.bias.iter()) {
            row.mapv_inplace(|v| v + b);
        }

        to_map(out, (self.out_channels(), h, w))
    }

    /// Propagates the gradient of the output back to the input
    pub fn backward(&self, grad_out: &Array3<f32>) -> Result<Array3<f32>, Error> {
        let (o, h, w) = grad_out.dim();
        if o != self.out_channels() {
            return Err(mismatch(
                "convolution gradient",
                &[self.out_channels(), h, w],
                &[o, h, w],
            ));
        }

        let grad_cols = self.kernel.t().dot(&to_matrix(grad_out));
        Ok(col2im(&grad_cols, (self.in_channels(), h, w), self.kernel_size()))
    }
}

/// Unrolls every `k x k` patch of the input into a column, yielding a
/// `(channels * k * k) x (height * width)` matrix
fn im2col(input: ArrayView3<'_, f32>, k: usize) -> Array2<f32> {
    let (c, h, w) = input.dim();
    let pad = (k / 2) as isize;
    let mut cols = Array2::zeros((c * k * k, h * w));

    for ch in 0..c {
        for ky in 0..k {
            for kx in 0..k {
                let row = (ch * k + ky) * k + kx;
                let mut col = cols.row_mut(row);

                for y in 0..h {
                    let sy = y as isize + ky as isize - pad;
                    if sy < 0 || sy >= h as isize {
                        continue;
                    }

                    for x in 0..w {
                        let sx = x as isize + kx as isize - pad;
                        if sx < 0 || sx >= w as isize {
                            continue;
                        }

                        col[y * w + x] = input[[ch, sy as usize, sx as usize]];
                    }
                }
            }
        }
    }

    cols
}

/// The adjoint of `im2col`, every column entry is accumulated back onto the
/// pixel it was sampled from
fn col2im(cols: &Array2<f32>, dim: (usize, usize, usize), k: usize) -> Array3<f32> {
    let (c, h, w) = dim;
    let pad = (k / 2) as isize;
    let mut img = Array3::zeros(dim);

    for ch in 0..c {
        for ky in 0..k {
            for kx in 0..k {
                let col = cols.row((ch * k + ky) * k + kx);

                for y in 0..h {
                    let sy = y as isize + ky as isize - pad;
                    if sy < 0 || sy >= h as isize {
                        continue;
                    }

                    for x in 0..w {
                        let sx = x as isize + kx as isize - pad;
                        if sx < 0 || sx >= w as isize {
                            continue;
                        }

                        img[[ch, sy as usize, sx as usize]] += col[y * w + x];
                    }
                }
            }
        }
    }

    img
}

pub(crate) fn relu(mut input: Array3<f32>) -> Array3<f32> {
    input.mapv_inplace(|v| v.max(0.0));
    input
}

/// Masks the gradient with the activations that were positive
pub(crate) fn relu_backward(activation: &Array3<f32>, mut grad: Array3<f32>) -> Array3<f32> {
    grad.zip_mut_with(activation, |g, a| {
        if *a <= 0.0 {
            *g = 0.0;
        }
    });
    grad
}

/// 2x2 pooling with a stride of 2, odd trailing rows and columns are dropped
pub(crate) fn pool(method: PoolMethod, input: &Array3<f32>) -> Array3<f32> {
    let (c, h, w) = input.dim();
    Array3::from_shape_fn((c, h / 2, w / 2), |(ch, y, x)| {
        let window = [
            input[[ch, 2 * y, 2 * x]],
            input[[ch, 2 * y, 2 * x + 1]],
            input[[ch, 2 * y + 1, 2 * x]],
            input[[ch, 2 * y + 1, 2 * x + 1]],
        ];

        match method {
            PoolMethod::Avg => window.iter().sum::<f32>() * 0.25,
            PoolMethod::Max => window.iter().copied().fold(f32::MIN, f32::max),
        }
    })
}

pub(crate) fn pool_backward(
    method: PoolMethod,
    input: &Array3<f32>,
    grad_out: &Array3<f32>,
) -> Array3<f32> {
    let mut grad = Array3::zeros(input.raw_dim());

    for ((ch, y, x), g) in grad_out.indexed_iter() {
        let coords = [
            (2 * y, 2 * x),
            (2 * y, 2 * x + 1),
            (2 * y + 1, 2 * x),
            (2 * y + 1, 2 * x + 1),
        ];

        match method {
            PoolMethod::Avg => {
                for (py, px) in &coords {
                    grad[[ch, *py, *px]] += g * 0.25;
                }
            }
            PoolMethod::Max => {
                // Ties go to the first maximum, same as the forward pass
                let mut best = coords[0];
                for &(py, px) in &coords[1..] {
                    if input[[ch, py, px]] > input[[ch, best.0, best.1]] {
                        best = (py, px);
                    }
                }
                grad[[ch, best.0, best.1]] += g;
            }
        }
    }

    grad
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn seq_map(c: usize, h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((c, h, w), |(ch, y, x)| {
            ((ch * 7 + y * 3 + x * 5) % 11) as f32 * 0.1 - 0.5
        })
    }

    fn test_conv() -> Conv2d {
        let weights = Array4::from_shape_fn((2, 3, 3, 3), |(o, i, y, x)| {
            ((o * 13 + i * 5 + y * 3 + x) % 7) as f32 * 0.1 - 0.3
        });
        Conv2d::new(weights, Array1::from(vec![0.1, -0.2])).unwrap()
    }

    #[test]
    fn identity_kernel() {
        let mut weights = Array4::zeros((1, 1, 3, 3));
        weights[[0, 0, 1, 1]] = 1.0;
        let conv = Conv2d::new(weights, Array1::from(vec![0.5])).unwrap();

        let input = seq_map(1, 4, 5);
        let out = conv.forward(&input).unwrap();
        assert_eq!(out, input.mapv(|v| v + 0.5));
    }

    #[test]
    fn rejects_bad_kernels() {
        assert!(Conv2d::new(Array4::zeros((1, 1, 2, 2)), Array1::zeros(1)).is_err());
        assert!(Conv2d::new(Array4::zeros((1, 1, 3, 1)), Array1::zeros(1)).is_err());
        assert!(Conv2d::new(Array4::zeros((2, 1, 3, 3)), Array1::zeros(1)).is_err());
        assert!(test_conv().forward(&seq_map(2, 3, 3)).is_err());
    }

    #[test]
    fn conv_backward_is_adjoint() {
        // <conv(x) - b, g> == <x, conv'(g)> for a linear map and its adjoint
        let conv = test_conv();
        let x = seq_map(3, 5, 4);
        let g = seq_map(2, 5, 4).mapv(|v| v * 2.0 + 0.3);

        let mut y = conv.forward(&x).unwrap();
        for (mut plane, b) in y.outer_iter_mut().zip(conv.bias().iter()) {
            plane.mapv_inplace(|v| v - b);
        }

        let lhs: f32 = (&y * &g).sum();
        let rhs: f32 = (&x * &conv.backward(&g).unwrap()).sum();
        assert_relative_eq!(lhs, rhs, epsilon = 1e-4, max_relative = 1e-4);
    }

    #[test]
    fn pools() {
        let input = seq_map(2, 5, 4);
        let avg = pool(PoolMethod::Avg, &input);
        let max = pool(PoolMethod::Max, &input);

        assert_eq!(avg.dim(), (2, 2, 2));
        let expected = (input[[1, 2, 2]] + input[[1, 2, 3]] + input[[1, 3, 2]] + input[[1, 3, 3]])
            * 0.25;
        assert_relative_eq!(avg[[1, 1, 1]], expected);
        assert!(max[[1, 1, 1]] >= avg[[1, 1, 1]]);

        let g = Array3::from_elem((2, 2, 2), 1.0);
        let ga = pool_backward(PoolMethod::Avg, &input, &g);
        assert_relative_eq!(ga.sum(), 8.0);
        // the dropped trailing row gets no gradient
        assert_eq!(ga[[0, 4, 0]], 0.0);

        let gm = pool_backward(PoolMethod::Max, &input, &g);
        assert_relative_eq!(gm.sum(), 8.0);
        assert_eq!(gm.iter().filter(|v| **v != 0.0).count(), 8);
    }

    #[test]
    fn relu_masks() {
        let act = relu(Array3::from_shape_vec((1, 1, 3), vec![-1.0, 0.0, 2.0]).unwrap());
        assert_eq!(act.as_slice().unwrap(), &[0.0, 0.0, 2.0]);

        let grad = relu_backward(&act, Array3::from_elem((1, 1, 3), 3.0));
        assert_eq!(grad.as_slice().unwrap(), &[0.0, 0.0, 3.0]);
    }
}

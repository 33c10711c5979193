//! Tensor Operations for Neural Networks
//!
//! A minimal dense tensor used by every layer of the language model. Data
//! lives in a flat `Vec<f32>` in row-major order together with its shape.
//!
//! Most layer code works on 2-D tensors of shape `[seq_len, features]`; the
//! model stacks one such tensor per batch row into `[batch, seq_len, vocab]`
//! logits.
//!
//! ## Example
//!
//! ```rust
//! use charlm::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! ```
//!
//! ## Performance
//!
//! Matrix multiplication above a small work threshold uses a cache-blocked
//! algorithm parallelised over output rows with Rayon. Element-wise
//! operations and row softmax are parallel as well.

use rayon::prelude::*;

/// A multi-dimensional array of `f32` values in row-major layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor holds no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows of a 2-D tensor
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Number of columns of a 2-D tensor
    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    /// Borrow row `i` of a 2-D tensor
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// SIMD-friendly inner loop: `result[j] += a_val * b[j]`
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// 2-D matrix multiplication `[m, k] @ [k, n] -> [m, n]`
    ///
    /// Small products run sequentially; larger ones use the parallel
    /// cache-blocked kernel.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2-D or the inner dimensions differ
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let n = other.shape[1];
        let k = self.shape[1];

        if m * n * k >= 1_000 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::matmul_inner_simd(
                    a_val,
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Parallel cache-blocked matrix multiplication over 8-row blocks
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose of a 2-D tensor
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose expects a 2-D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Softmax over the last axis of a 2-D tensor, one row at a time
    ///
    /// Uses the max-subtraction form so large logits cannot overflow `exp`.
    pub fn softmax_rows(&self) -> Tensor {
        let cols = *self.shape.last().expect("softmax on a scalar tensor");
        let result: Vec<f32> = self
            .data
            .par_chunks(cols)
            .flat_map_iter(|row| softmax(row).into_iter())
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition
    ///
    /// Supports exact shape match and broadcasting a 1-D tensor over the
    /// last dimension (bias addition).
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = *self.shape.last().unwrap_or(&0);
        if other.shape.len() == 1 && other.data.len() == last_dim {
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % last_dim])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place element-wise accumulation (`self += other`)
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for add_assign");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// In-place scaling of all elements
    pub fn scale(&mut self, scalar: f32) {
        self.data.par_iter_mut().for_each(|x| *x *= scalar);
    }

    /// Sum over rows of a 2-D tensor, giving a 1-D tensor of length `cols`
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut out = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (o, &v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        Tensor::new(out, vec![cols])
    }

    /// Copy columns `start..start + width` of a 2-D tensor
    ///
    /// Used to slice one attention head out of a `[seq, n_embd]` projection.
    pub fn narrow_cols(&self, start: usize, width: usize) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        assert!(start + width <= cols, "column slice out of bounds");
        let mut out = Vec::with_capacity(rows * width);
        for i in 0..rows {
            out.extend_from_slice(&self.data[i * cols + start..i * cols + start + width]);
        }
        Tensor::new(out, vec![rows, width])
    }

    /// Write `src` into columns `start..start + src.cols()` of a 2-D tensor
    pub fn write_cols(&mut self, start: usize, src: &Tensor) {
        let rows = self.rows();
        let cols = self.cols();
        let width = src.cols();
        assert_eq!(src.rows(), rows, "row count mismatch in write_cols");
        assert!(start + width <= cols, "column slice out of bounds");
        for i in 0..rows {
            self.data[i * cols + start..i * cols + start + width]
                .copy_from_slice(&src.data[i * width..(i + 1) * width]);
        }
    }

    /// Stack equally shaped tensors along a new leading axis
    pub fn stack(parts: &[Tensor]) -> Tensor {
        let inner = parts
            .first()
            .map(|t| t.shape.clone())
            .unwrap_or_default();
        let mut data = Vec::with_capacity(parts.iter().map(Tensor::len).sum());
        for part in parts {
            assert_eq!(part.shape, inner, "stack requires equal shapes");
            data.extend_from_slice(&part.data);
        }
        let mut shape = vec![parts.len()];
        shape.extend(inner);
        Tensor::new(data, shape)
    }

    /// Sum of squared elements
    pub fn sum_of_squares(&self) -> f32 {
        self.data.iter().map(|&v| v * v).sum()
    }
}

/// Numerically stable softmax of a single slice
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_values: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp_values.iter().sum();
    exp_values.into_iter().map(|v| v / sum).collect()
}

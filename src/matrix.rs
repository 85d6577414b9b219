//! Coding matrices over GF(256).
//!
//! [`EncodeMatrix`] is the systematic (K + M) × K Cauchy matrix; a
//! [`DecodeMatrix`] is derived from it for one [`ErasureSet`] and never
//! reused for another.

use tracing::debug;

use crate::{check_counts, gf, Error};

// =============================================================================
// Matrix
// =============================================================================

/// Dense row-major matrix of field elements.
///
/// Element (r, c) lives at `r * cols + c` in [`Matrix::as_slice`], which is
/// the layout backends rely on when they need a flat buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    /// Build from a row-major buffer. Returns `None` if the length is not
    /// `rows * cols`.
    pub fn from_row_major(rows: usize, cols: usize, data: Vec<u8>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u8 {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.cols + col] = value;
    }

    #[inline]
    pub fn row(&self, row: usize) -> &[u8] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Row-major backing storage.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Swap rows and columns. Only moves elements, never alters them.
    pub fn transpose(&self) -> Matrix {
        let mut t = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                t.set(c, r, self.get(r, c));
            }
        }
        t
    }

    /// New matrix made of the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Matrix {
        let mut data = Vec::with_capacity(rows.len() * self.cols);
        for &r in rows {
            data.extend_from_slice(self.row(r));
        }
        Matrix {
            rows: rows.len(),
            cols: self.cols,
            data,
        }
    }

    /// Matrix product `self × rhs` over GF(256).
    pub fn mul(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.cols, rhs.rows, "matrix dimensions do not agree");
        let mut out = Matrix::zeros(self.rows, rhs.cols);
        for r in 0..self.rows {
            let out_row = out.row_mut(r);
            for (k, &coeff) in self.row(r).iter().enumerate() {
                gf::muladd_mem(out_row, rhs.row(k), coeff);
            }
        }
        out
    }

    /// Invert a square matrix by Gauss-Jordan elimination.
    ///
    /// The pivot for each column is the first nonzero entry at or below the
    /// diagonal, scanning top-down. Field arithmetic is exact so no partial
    /// pivoting is needed.
    ///
    /// # Errors
    /// Returns `Error::SingularMatrix` naming the first column without a pivot.
    pub fn invert(&self) -> Result<Matrix, Error> {
        assert_eq!(self.rows, self.cols, "only square matrices can be inverted");
        let n = self.rows;
        let mut work = self.clone();
        let mut inv = Matrix::identity(n);

        for col in 0..n {
            let pivot_row = (col..n)
                .find(|&r| work.get(r, col) != 0)
                .ok_or(Error::SingularMatrix { column: col })?;
            if pivot_row != col {
                work.swap_rows(pivot_row, col);
                inv.swap_rows(pivot_row, col);
            }

            let scale = gf::inverse(work.get(col, col))?;
            scale_row(work.row_mut(col), scale);
            scale_row(inv.row_mut(col), scale);

            for r in 0..n {
                let factor = work.get(r, col);
                if r == col || factor == 0 {
                    continue;
                }
                let (target, pivot) = work.two_rows_mut(r, col);
                gf::muladd_mem(target, pivot, factor);
                let (target, pivot) = inv.two_rows_mut(r, col);
                gf::muladd_mem(target, pivot, factor);
            }
        }

        Ok(inv)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.data.split_at_mut(second * self.cols);
        head[first * self.cols..(first + 1) * self.cols].swap_with_slice(&mut tail[..self.cols]);
    }

    /// Mutable row `target` alongside shared row `source`.
    fn two_rows_mut(&mut self, target: usize, source: usize) -> (&mut [u8], &[u8]) {
        debug_assert_ne!(target, source);
        let cols = self.cols;
        if target < source {
            let (head, tail) = self.data.split_at_mut(source * cols);
            (&mut head[target * cols..(target + 1) * cols], &tail[..cols])
        } else {
            let (head, tail) = self.data.split_at_mut(target * cols);
            (&mut tail[..cols], &head[source * cols..(source + 1) * cols])
        }
    }
}

fn scale_row(row: &mut [u8], coeff: u8) {
    for v in row.iter_mut() {
        *v = gf::mul(*v, coeff);
    }
}

// =============================================================================
// Encode Matrix
// =============================================================================

/// Systematic Cauchy encode matrix.
///
/// Rows 0..K form the identity, so data units pass through unchanged. Parity
/// row i (K <= i < K + M) holds `1 / (i + j)` in column j, with + being XOR.
/// Row and column labels are disjoint, so every square submatrix of the
/// parity block is a Cauchy matrix and therefore invertible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeMatrix {
    data_count: usize,
    parity_count: usize,
    matrix: Matrix,
}

impl EncodeMatrix {
    /// # Errors
    /// Returns `Error::InvalidParameters` when either count is zero, when
    /// `parity_count > data_count`, or when the stripe exceeds 256 units.
    pub fn cauchy(data_count: usize, parity_count: usize) -> Result<Self, Error> {
        check_counts(data_count, parity_count)?;

        let total = data_count + parity_count;
        let mut matrix = Matrix::zeros(total, data_count);
        for i in 0..data_count {
            matrix.set(i, i, 1);
        }
        for i in data_count..total {
            for j in 0..data_count {
                // i >= data_count > j, so i ^ j is never zero
                matrix.set(i, j, gf::inverse((i ^ j) as u8)?);
            }
        }

        debug!(k = data_count, m = parity_count, "built cauchy encode matrix");

        Ok(Self {
            data_count,
            parity_count,
            matrix,
        })
    }

    #[inline]
    pub fn data_count(&self) -> usize {
        self.data_count
    }

    #[inline]
    pub fn parity_count(&self) -> usize {
        self.parity_count
    }

    #[inline]
    pub fn total_count(&self) -> usize {
        self.data_count + self.parity_count
    }

    /// The full (K + M) × K matrix.
    #[inline]
    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    #[inline]
    pub fn row(&self, unit: usize) -> &[u8] {
        self.matrix.row(unit)
    }

    /// The M × K coefficient block that generates parity.
    pub fn parity_rows(&self) -> Matrix {
        let rows: Vec<usize> = (self.data_count..self.total_count()).collect();
        self.matrix.select_rows(&rows)
    }
}

// =============================================================================
// Erasure Set
// =============================================================================

/// Sorted, de-duplicated indices of the units treated as lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErasureSet {
    data_count: usize,
    parity_count: usize,
    indices: Vec<u8>,
}

impl ErasureSet {
    /// # Errors
    /// Returns `Error::InconsistentErasureSet` if an index is outside the
    /// stripe or more than `parity_count` units are erased, and
    /// `Error::InvalidParameters` if the counts themselves are invalid.
    pub fn new(data_count: usize, parity_count: usize, indices: &[usize]) -> Result<Self, Error> {
        check_counts(data_count, parity_count)?;
        let total = data_count + parity_count;

        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        if let Some(&unit) = sorted.iter().find(|&&i| i >= total) {
            return Err(Error::InconsistentErasureSet {
                reason: "erased unit is outside the stripe",
                unit,
            });
        }
        if sorted.len() > parity_count {
            return Err(Error::InconsistentErasureSet {
                reason: "more units erased than there are parity units",
                unit: sorted[parity_count],
            });
        }

        Ok(Self {
            data_count,
            parity_count,
            indices: sorted.into_iter().map(|i| i as u8).collect(),
        })
    }

    /// The first `parity_count` units: the pattern the verbs EC demo erases.
    pub fn leading(data_count: usize, parity_count: usize) -> Result<Self, Error> {
        let indices: Vec<usize> = (0..parity_count).collect();
        Self::new(data_count, parity_count, &indices)
    }

    #[inline]
    pub fn data_count(&self) -> usize {
        self.data_count
    }

    #[inline]
    pub fn parity_count(&self) -> usize {
        self.parity_count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn contains(&self, unit: usize) -> bool {
        self.indices.iter().any(|&i| i as usize == unit)
    }

    #[inline]
    pub fn indices(&self) -> &[u8] {
        &self.indices
    }

    /// The first K units not erased, ascending. These are the rows a decode
    /// matrix is built from.
    pub fn survivors(&self) -> Vec<u8> {
        (0..self.data_count + self.parity_count)
            .filter(|&i| !self.contains(i))
            .take(self.data_count)
            .map(|i| i as u8)
            .collect()
    }

    /// Per-unit erasure flags, the form offload engines take.
    pub fn to_flags(&self) -> Vec<bool> {
        (0..self.data_count + self.parity_count)
            .map(|i| self.contains(i))
            .collect()
    }
}

// =============================================================================
// Decode Matrix
// =============================================================================

/// Inverse of the surviving rows of an [`EncodeMatrix`], specialised to one
/// [`ErasureSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeMatrix {
    encode: EncodeMatrix,
    erasures: ErasureSet,
    survivors: Vec<u8>,
    inverse: Matrix,
    recovery: Matrix,
}

impl DecodeMatrix {
    /// # Errors
    /// Returns `Error::InconsistentErasureSet` if the erasure set was built
    /// for different counts, and `Error::SingularMatrix` if the surviving rows
    /// do not invert (which a correct Cauchy matrix never produces).
    pub fn build(encode: &EncodeMatrix, erasures: &ErasureSet) -> Result<Self, Error> {
        if erasures.data_count() != encode.data_count()
            || erasures.parity_count() != encode.parity_count()
        {
            return Err(Error::InconsistentErasureSet {
                reason: "erasure set was built for a different stripe shape",
                unit: erasures.data_count() + erasures.parity_count(),
            });
        }

        let survivors = erasures.survivors();
        let rows: Vec<usize> = survivors.iter().map(|&i| i as usize).collect();
        let inverse = encode.matrix().select_rows(&rows).invert()?;

        // Erased data unit e comes straight from the inverse; erased parity
        // unit p is its encode row applied to the recovered data.
        let mut recovery = Matrix::zeros(erasures.len(), encode.data_count());
        for (out, &unit) in erasures.indices().iter().enumerate() {
            let unit = unit as usize;
            if unit < encode.data_count() {
                recovery.row_mut(out).copy_from_slice(inverse.row(unit));
            } else {
                let row = Matrix {
                    rows: 1,
                    cols: encode.data_count(),
                    data: encode.row(unit).to_vec(),
                };
                recovery
                    .row_mut(out)
                    .copy_from_slice(row.mul(&inverse).row(0));
            }
        }

        debug!(
            k = encode.data_count(),
            m = encode.parity_count(),
            erasures = ?erasures.indices(),
            survivors = ?survivors,
            "built decode matrix"
        );

        Ok(Self {
            encode: encode.clone(),
            erasures: erasures.clone(),
            survivors,
            inverse,
            recovery,
        })
    }

    /// The encode matrix this was derived from.
    #[inline]
    pub fn encode_matrix(&self) -> &EncodeMatrix {
        &self.encode
    }

    #[inline]
    pub fn erasures(&self) -> &ErasureSet {
        &self.erasures
    }

    /// Units the decode reads, ascending.
    #[inline]
    pub fn survivors(&self) -> &[u8] {
        &self.survivors
    }

    /// K × K inverse of the surviving encode rows.
    #[inline]
    pub fn inverse(&self) -> &Matrix {
        &self.inverse
    }

    /// |E| × K rows producing each erased unit from the survivors.
    #[inline]
    pub fn recovery(&self) -> &Matrix {
        &self.recovery
    }
}

/// All `r`-element subsets of `0..n` in lexicographic order.
pub(crate) fn combinations(n: usize, r: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    if r > n {
        return out;
    }
    let mut current: Vec<usize> = (0..r).collect();
    loop {
        out.push(current.clone());
        // Rightmost position that can still advance.
        let Some(pos) = (0..r).rev().find(|&i| current[i] < n - r + i) else {
            return out;
        };
        current[pos] += 1;
        for i in pos + 1..r {
            current[i] = current[i - 1] + 1;
        }
    }
}

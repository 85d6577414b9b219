//! In-process table-driven codec.

use tracing::debug;

use crate::codec::{check_decode_layout, check_encode_layout, Codec};
use crate::gf;
use crate::matrix::{DecodeMatrix, EncodeMatrix, Matrix};
use crate::{Block, BlockMut, Error};

/// Coefficients of a coding matrix expanded into split-nibble tables.
///
/// Each coefficient becomes 32 bytes: 16 products for the low nibble followed
/// by 16 for the high nibble, so one output byte costs two lookups and an XOR
/// per input unit.
#[derive(Debug, Clone)]
pub struct ExpandedTables {
    rows: usize,
    cols: usize,
    tables: Vec<[u8; 32]>,
    coeffs: Vec<u8>,
}

impl ExpandedTables {
    pub fn new(matrix: &Matrix) -> Self {
        let coeffs = matrix.as_slice().to_vec();
        let tables = coeffs
            .iter()
            .map(|&c| {
                let (lo, hi) = gf::nibble_tables(c);
                let mut t = [0u8; 32];
                t[..16].copy_from_slice(lo);
                t[16..].copy_from_slice(hi);
                t
            })
            .collect();
        Self {
            rows: matrix.rows(),
            cols: matrix.cols(),
            tables,
            coeffs,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// outputs[r] = Σ_c coeff(r, c) · inputs[c]
    pub fn apply(&self, inputs: &[Block<'_>], outputs: &mut [BlockMut<'_>]) {
        debug_assert_eq!(inputs.len(), self.cols);
        debug_assert_eq!(outputs.len(), self.rows);

        for (r, out) in outputs.iter_mut().enumerate() {
            out.data.fill(0);
            for (c, input) in inputs.iter().enumerate() {
                let idx = r * self.cols + c;
                match self.coeffs[idx] {
                    0 => {}
                    1 => gf::xor_mem(out.data, input.data),
                    _ => muladd_expanded(out.data, input.data, &self.tables[idx]),
                }
            }
        }
    }
}

/// dst[i] ^= lo[src[i] & 0x0f] ^ hi[src[i] >> 4]
#[inline]
fn muladd_expanded(dst: &mut [u8], src: &[u8], table: &[u8; 32]) {
    debug_assert_eq!(dst.len(), src.len());
    let (lo, hi) = table.split_at(16);
    for (d, &s) in dst.iter_mut().zip(src) {
        *d ^= lo[(s & 0x0f) as usize] ^ hi[(s >> 4) as usize];
    }
}

/// Software backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCodec;

impl SoftwareCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for SoftwareCodec {
    fn name(&self) -> &'static str {
        "software"
    }

    fn encode(
        &mut self,
        matrix: &EncodeMatrix,
        data: &[Block<'_>],
        parity: &mut [BlockMut<'_>],
    ) -> Result<(), Error> {
        let unit_size = check_encode_layout(matrix, data, parity)?;
        let tables = ExpandedTables::new(&matrix.parity_rows());
        tables.apply(data, parity);

        debug!(
            k = matrix.data_count(),
            m = matrix.parity_count(),
            unit_size,
            "software encode"
        );
        Ok(())
    }

    fn decode(
        &mut self,
        matrix: &DecodeMatrix,
        survivors: &[Block<'_>],
        recovered: &mut [BlockMut<'_>],
    ) -> Result<(), Error> {
        let (unit_size, survivors) = check_decode_layout(matrix, survivors, recovered)?;
        if recovered.is_empty() {
            return Ok(());
        }
        let tables = ExpandedTables::new(matrix.recovery());
        tables.apply(&survivors, recovered);

        debug!(
            erasures = ?matrix.erasures().indices(),
            unit_size,
            "software decode"
        );
        Ok(())
    }
}

//! The backend-agnostic coding interface.

use crate::matrix::{DecodeMatrix, EncodeMatrix};
use crate::{Block, BlockMut, Error};

/// A backend that applies coding matrices to unit buffers.
///
/// Implementations must be deterministic: the same matrix and input bytes
/// always produce the same output bytes, whichever backend runs them.
pub trait Codec {
    /// Short backend name used in logs and mismatch reports.
    fn name(&self) -> &'static str;

    /// Make `region` accessible to the backend. Backends that work on plain
    /// process memory need nothing.
    fn register(&mut self, _region: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// Undo [`Codec::register`] for `region`.
    fn deregister(&mut self, _region: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// Compute all M parity units.
    ///
    /// `data` must be units 0..K in order and `parity` units K..K+M in order.
    fn encode(
        &mut self,
        matrix: &EncodeMatrix,
        data: &[Block<'_>],
        parity: &mut [BlockMut<'_>],
    ) -> Result<(), Error>;

    /// Rebuild the erased units.
    ///
    /// `survivors` must include every unit in [`DecodeMatrix::survivors`];
    /// other surviving units are ignored. `recovered` must be exactly the
    /// erased units, ascending.
    fn decode(
        &mut self,
        matrix: &DecodeMatrix,
        survivors: &[Block<'_>],
        recovered: &mut [BlockMut<'_>],
    ) -> Result<(), Error>;
}

/// Check the unit layout of an encode call and return the unit size.
pub(crate) fn check_encode_layout(
    matrix: &EncodeMatrix,
    data: &[Block<'_>],
    parity: &[BlockMut<'_>],
) -> Result<usize, Error> {
    let k = matrix.data_count();
    let m = matrix.parity_count();
    let invalid = |reason: &'static str| Error::InvalidParameters {
        data: k,
        parity: m,
        reason,
    };

    if data.len() != k {
        return Err(invalid("encode needs exactly K data units"));
    }
    if parity.len() != m {
        return Err(invalid("encode needs exactly M parity units"));
    }
    if data.iter().enumerate().any(|(i, b)| b.index as usize != i) {
        return Err(invalid("data units must be indices 0..K in order"));
    }
    if parity.iter().enumerate().any(|(i, b)| b.index as usize != k + i) {
        return Err(invalid("parity units must be indices K..K+M in order"));
    }

    let lengths = data
        .iter()
        .map(|b| (b.index, b.data.len()))
        .chain(parity.iter().map(|b| (b.index, b.data.len())));
    check_unit_sizes(lengths)
}

/// Check the unit layout of a decode call.
///
/// `survivors` may hold any surviving units as long as it includes every unit
/// the decode matrix was built from. Returns the unit size and those units,
/// in decode matrix order.
pub(crate) fn check_decode_layout<'b>(
    matrix: &DecodeMatrix,
    survivors: &[Block<'b>],
    recovered: &[BlockMut<'_>],
) -> Result<(usize, Vec<Block<'b>>), Error> {
    let erasures = matrix.erasures();
    let total = erasures.data_count() + erasures.parity_count();
    for b in survivors {
        let unit = b.index as usize;
        if unit >= total {
            return Err(Error::InconsistentErasureSet {
                reason: "surviving unit is outside the stripe",
                unit,
            });
        }
        if erasures.contains(unit) {
            return Err(Error::InconsistentErasureSet {
                reason: "surviving unit is in the erasure set",
                unit,
            });
        }
    }

    let mut selected = Vec::with_capacity(matrix.survivors().len());
    for &unit in matrix.survivors() {
        let Some(b) = survivors.iter().find(|b| b.index == unit) else {
            return Err(Error::InconsistentErasureSet {
                reason: "decode matrix needs a surviving unit that was not supplied",
                unit: unit as usize,
            });
        };
        selected.push(b.clone());
    }

    let erased = erasures.indices();
    if recovered.len() != erased.len() {
        return Err(Error::InconsistentErasureSet {
            reason: "decode must be given one output per erased unit",
            unit: recovered.len(),
        });
    }
    for (b, &e) in recovered.iter().zip(erased) {
        if b.index != e {
            return Err(Error::InconsistentErasureSet {
                reason: "output unit is not in the erasure set",
                unit: b.index as usize,
            });
        }
    }

    let lengths = survivors
        .iter()
        .map(|b| (b.index, b.data.len()))
        .chain(recovered.iter().map(|b| (b.index, b.data.len())));
    let unit_size = check_unit_sizes(lengths)?;
    Ok((unit_size, selected))
}

fn check_unit_sizes(mut lengths: impl Iterator<Item = (u8, usize)>) -> Result<usize, Error> {
    let Some((_, expected)) = lengths.next() else {
        return Ok(0);
    };
    for (unit, actual) in lengths {
        if actual != expected {
            return Err(Error::UnitSizeMismatch {
                unit: unit as usize,
                expected,
                actual,
            });
        }
    }
    Ok(expected)
}

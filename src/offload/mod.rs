//! # Hardware Offload
//!
//! Drives an erasure-coding accelerator the way verbs-style NIC EC offload is
//! driven:
//!
//! - Every buffer the engine touches lives in a registered memory region and
//!   is described by a scatter-gather entry carrying that region's key.
//! - A calculation context is allocated once per encode matrix, with the
//!   matrix supplied in transposed K × M layout.
//! - Decode takes per-unit erasure flags and a transposed K × |E| decode
//!   matrix.
//!
//! [`OffloadCodec`] performs these transforms itself, so callers hand it the
//! same [`EncodeMatrix`] and [`DecodeMatrix`] they hand the software codec.
//!
//! ## Example
//!
//! ```rust
//! use stripe_ec::{Codec, EmulatedAccelerator, OffloadCodec, Params, Pattern, Stripe};
//! use stripe_ec::matrix::EncodeMatrix;
//!
//! let params = Params::new(2, 1, 16).unwrap();
//! let matrix = EncodeMatrix::cauchy(2, 1).unwrap();
//! let mut stripe = Stripe::new(params);
//! stripe.fill(&Pattern::Sequential);
//!
//! let mut offload = OffloadCodec::new(EmulatedAccelerator::new());
//! offload.register(stripe.as_bytes()).unwrap();
//! let (data, mut parity) = stripe.split_encode();
//! offload.encode(&matrix, &data, &mut parity).unwrap();
//! ```

mod emulated;

pub use emulated::EmulatedAccelerator;

use tracing::{debug, warn};

use crate::codec::{check_decode_layout, check_encode_layout, Codec};
use crate::matrix::{DecodeMatrix, EncodeMatrix, Matrix};
use crate::{Block, BlockMut, Error};

/// Key of a registered memory region (the verbs `lkey`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey(pub u32);

/// Attributes for allocating an EC calculation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalcAttrs {
    /// Maximum calculations in flight.
    pub max_inflight: u32,
    /// Data units per stripe.
    pub k: usize,
    /// Parity units per stripe.
    pub m: usize,
    /// Field width in bits. Only 8 is supported.
    pub w: u8,
    /// Must equal `k`.
    pub max_data_sge: usize,
    /// Must equal `m`.
    pub max_code_sge: usize,
    /// Completion steering hint.
    pub affinity_hint: u32,
    /// Poll for completion instead of waiting on events.
    pub polling: bool,
    /// K × M row-major: entry (j, i) is data unit j's coefficient in parity
    /// unit i.
    pub encode_matrix: Vec<u8>,
}

impl CalcAttrs {
    /// Synchronous single-calculation attributes for `matrix`.
    pub fn for_matrix(matrix: &EncodeMatrix) -> Self {
        Self {
            max_inflight: 1,
            k: matrix.data_count(),
            m: matrix.parity_count(),
            w: 8,
            max_data_sge: matrix.data_count(),
            max_code_sge: matrix.parity_count(),
            affinity_hint: 0,
            polling: true,
            encode_matrix: transpose_encode(matrix).as_slice().to_vec(),
        }
    }
}

/// An allocated EC calculation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcCalc {
    id: u32,
    attrs: CalcAttrs,
}

impl EcCalc {
    pub fn new(id: u32, attrs: CalcAttrs) -> Self {
        Self { id, attrs }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn attrs(&self) -> &CalcAttrs {
        &self.attrs
    }
}

/// Scatter-gather entry the engine reads from.
#[derive(Debug, Clone, Copy)]
pub struct Sge<'a> {
    pub buf: &'a [u8],
    pub key: RegionKey,
    /// Stripe unit the buffer holds, echoed back in errors.
    pub unit: u8,
}

/// Scatter-gather entry the engine writes to.
#[derive(Debug)]
pub struct SgeMut<'a> {
    pub buf: &'a mut [u8],
    pub key: RegionKey,
    pub unit: u8,
}

/// Memory layout of one calculation.
///
/// For encode, `inputs` are the K data units and `outputs` the M parity
/// units. For decode, `inputs` are the K surviving units and `outputs` the
/// erased ones, each in ascending unit order.
#[derive(Debug)]
pub struct EcMem<'a> {
    pub inputs: Vec<Sge<'a>>,
    pub outputs: Vec<SgeMut<'a>>,
    pub block_size: usize,
}

/// An execution context able to run EC calculations on registered memory.
pub trait Accelerator {
    /// Register `region` for local read/write access.
    fn register(&mut self, region: &[u8]) -> Result<RegionKey, Error>;

    fn deregister(&mut self, key: RegionKey) -> Result<(), Error>;

    /// # Errors
    /// `Error::InvalidParameters` for attributes the engine cannot honour.
    fn alloc_calc(&mut self, attrs: CalcAttrs) -> Result<EcCalc, Error>;

    fn dealloc_calc(&mut self, _calc: EcCalc) {}

    /// Compute parity, blocking until the engine completes.
    fn encode_sync(&mut self, calc: &EcCalc, mem: &mut EcMem<'_>) -> Result<(), Error>;

    /// Rebuild erased units, blocking until the engine completes.
    ///
    /// `erasures` has one flag per unit of the stripe. `decode_matrix` is
    /// K × |E| row-major: entry (j, i) is surviving unit j's coefficient in
    /// erased unit i.
    fn decode_sync(
        &mut self,
        calc: &EcCalc,
        mem: &mut EcMem<'_>,
        erasures: &[bool],
        decode_matrix: &[u8],
    ) -> Result<(), Error>;
}

/// Parity rows of `matrix` in the offload layout: K × M, with
/// `t[j * M + i] == encode[(K + i) * K + j]`.
pub fn transpose_encode(matrix: &EncodeMatrix) -> Matrix {
    matrix.parity_rows().transpose()
}

/// Recovery rows of `matrix` in the offload layout: K × |E|, with
/// `t[j * E + i] == recovery[i * K + j]`.
pub fn transpose_recovery(matrix: &DecodeMatrix) -> Matrix {
    matrix.recovery().transpose()
}

#[derive(Debug, Clone, Copy)]
struct Region {
    start: usize,
    len: usize,
    key: RegionKey,
}

impl Region {
    fn covers(&self, buf: &[u8]) -> bool {
        let addr = buf.as_ptr() as usize;
        addr >= self.start && addr + buf.len() <= self.start + self.len
    }
}

fn lookup_key(regions: &[Region], unit: u8, buf: &[u8]) -> Result<RegionKey, Error> {
    regions
        .iter()
        .find(|r| r.covers(buf))
        .map(|r| r.key)
        .ok_or(Error::UnregisteredBuffer {
            unit: unit as usize,
            addr: buf.as_ptr() as usize,
            len: buf.len(),
        })
}

/// Reuse the cached calculation if it was built for `matrix`, otherwise
/// replace it.
fn prepare_calc<'c, A: Accelerator>(
    device: &mut A,
    slot: &'c mut Option<EcCalc>,
    matrix: &EncodeMatrix,
) -> Result<&'c EcCalc, Error> {
    let attrs = CalcAttrs::for_matrix(matrix);
    let calc = match slot.take() {
        Some(calc) if calc.attrs() == &attrs => calc,
        stale => {
            if let Some(old) = stale {
                device.dealloc_calc(old);
            }
            let calc = device.alloc_calc(attrs)?;
            debug!(id = calc.id(), k = matrix.data_count(), m = matrix.parity_count(), "allocated ec calc");
            calc
        }
    };
    Ok(slot.insert(calc))
}

/// Hardware-offload backend over an [`Accelerator`].
#[derive(Debug)]
pub struct OffloadCodec<A: Accelerator> {
    device: A,
    regions: Vec<Region>,
    calc: Option<EcCalc>,
}

impl<A: Accelerator> OffloadCodec<A> {
    pub fn new(device: A) -> Self {
        Self {
            device,
            regions: Vec::new(),
            calc: None,
        }
    }

    #[inline]
    pub fn device(&self) -> &A {
        &self.device
    }

    /// Register `region` with the device and remember its key.
    pub fn register_region(&mut self, region: &[u8]) -> Result<RegionKey, Error> {
        let key = self.device.register(region)?;
        self.regions.push(Region {
            start: region.as_ptr() as usize,
            len: region.len(),
            key,
        });
        debug!(key = key.0, len = region.len(), "registered region");
        Ok(key)
    }

    /// Deregister the region previously registered for exactly `region`.
    ///
    /// # Errors
    /// `Error::UnknownRegion` if no such registration exists.
    pub fn deregister_region(&mut self, region: &[u8]) -> Result<(), Error> {
        let start = region.as_ptr() as usize;
        let pos = self
            .regions
            .iter()
            .position(|r| r.start == start && r.len == region.len())
            .ok_or(Error::UnknownRegion {
                addr: start,
                len: region.len(),
            })?;
        let entry = self.regions.remove(pos);
        self.device.deregister(entry.key)?;
        debug!(key = entry.key.0, "deregistered region");
        Ok(())
    }

    fn input_sges<'b>(&self, blocks: &[Block<'b>]) -> Result<Vec<Sge<'b>>, Error> {
        blocks
            .iter()
            .map(|b| {
                Ok(Sge {
                    buf: b.data,
                    key: lookup_key(&self.regions, b.index, b.data)?,
                    unit: b.index,
                })
            })
            .collect()
    }
}

fn output_sges<'b>(
    regions: &[Region],
    blocks: &'b mut [BlockMut<'_>],
) -> Result<Vec<SgeMut<'b>>, Error> {
    blocks
        .iter_mut()
        .map(|b| {
            let key = lookup_key(regions, b.index, b.data)?;
            Ok(SgeMut {
                buf: &mut *b.data,
                key,
                unit: b.index,
            })
        })
        .collect()
}

impl<A: Accelerator> Codec for OffloadCodec<A> {
    fn name(&self) -> &'static str {
        "offload"
    }

    fn register(&mut self, region: &[u8]) -> Result<(), Error> {
        self.register_region(region).map(|_| ())
    }

    fn deregister(&mut self, region: &[u8]) -> Result<(), Error> {
        self.deregister_region(region)
    }

    fn encode(
        &mut self,
        matrix: &EncodeMatrix,
        data: &[Block<'_>],
        parity: &mut [BlockMut<'_>],
    ) -> Result<(), Error> {
        let block_size = check_encode_layout(matrix, data, parity)?;
        let inputs = self.input_sges(data)?;
        let outputs = output_sges(&self.regions, parity)?;
        let mut mem = EcMem {
            inputs,
            outputs,
            block_size,
        };

        let calc = prepare_calc(&mut self.device, &mut self.calc, matrix)?;
        self.device.encode_sync(calc, &mut mem)?;

        debug!(calc = calc.id(), block_size, "offload encode");
        Ok(())
    }

    fn decode(
        &mut self,
        matrix: &DecodeMatrix,
        survivors: &[Block<'_>],
        recovered: &mut [BlockMut<'_>],
    ) -> Result<(), Error> {
        let (block_size, survivors) = check_decode_layout(matrix, survivors, recovered)?;
        if recovered.is_empty() {
            return Ok(());
        }
        let inputs = self.input_sges(&survivors)?;
        let outputs = output_sges(&self.regions, recovered)?;
        let mut mem = EcMem {
            inputs,
            outputs,
            block_size,
        };
        let decode_matrix = transpose_recovery(matrix);
        let flags = matrix.erasures().to_flags();

        let calc = prepare_calc(&mut self.device, &mut self.calc, matrix.encode_matrix())?;
        self.device
            .decode_sync(calc, &mut mem, &flags, decode_matrix.as_slice())?;

        debug!(
            calc = calc.id(),
            erasures = ?matrix.erasures().indices(),
            block_size,
            "offload decode"
        );
        Ok(())
    }
}

impl<A: Accelerator> Drop for OffloadCodec<A> {
    fn drop(&mut self) {
        if let Some(calc) = self.calc.take() {
            self.device.dealloc_calc(calc);
        }
        for region in self.regions.drain(..) {
            if let Err(e) = self.device.deregister(region.key) {
                warn!(key = region.key.0, error = %e, "failed to deregister region");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::ErasureSet;
    use crate::software::SoftwareCodec;
    use crate::stripe::{Pattern, Stripe};
    use crate::Params;

    fn encoded_pair(params: Params, pattern: &Pattern) -> (Stripe, Stripe) {
        let matrix =
            EncodeMatrix::cauchy(params.data_count(), params.parity_count()).unwrap();
        let mut sw = Stripe::new(params);
        let mut hw = Stripe::new(params);
        sw.fill(pattern);
        hw.fill(pattern);

        {
            let (data, mut parity) = sw.split_encode();
            SoftwareCodec::new()
                .encode(&matrix, &data, &mut parity)
                .unwrap();
        }
        {
            let mut offload = OffloadCodec::new(EmulatedAccelerator::new());
            offload.register(hw.as_bytes()).unwrap();
            let (data, mut parity) = hw.split_encode();
            offload.encode(&matrix, &data, &mut parity).unwrap();
        }
        (sw, hw)
    }

    #[test]
    fn test_transpose_encode_layout() {
        let matrix = EncodeMatrix::cauchy(4, 2).unwrap();
        let t = transpose_encode(&matrix);
        let (k, m) = (4, 2);
        let enc = matrix.matrix().as_slice();
        for i in 0..m {
            for j in 0..k {
                assert_eq!(t.as_slice()[j * m + i], enc[(i + k) * k + j]);
            }
        }
    }

    #[test]
    fn test_transpose_only_permutes() {
        let encode = EncodeMatrix::cauchy(7, 3).unwrap();
        let mut before = encode.parity_rows().as_slice().to_vec();
        let mut after = transpose_encode(&encode).as_slice().to_vec();
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);

        let set = ErasureSet::new(7, 3, &[0, 4, 8]).unwrap();
        let decode = DecodeMatrix::build(&encode, &set).unwrap();
        let t = transpose_recovery(&decode);
        assert_eq!(t.rows(), 7);
        assert_eq!(t.cols(), 3);
        for i in 0..3 {
            for j in 0..7 {
                assert_eq!(t.get(j, i), decode.recovery().get(i, j));
            }
        }
    }

    #[test]
    fn test_offload_encode_matches_software() {
        let params = Params::new(6, 3, 128).unwrap();
        let (sw, hw) = encoded_pair(params, &Pattern::Random { seed: 42 });
        assert_eq!(sw.as_bytes(), hw.as_bytes());
    }

    #[test]
    fn test_offload_decode_every_pattern() {
        let params = Params::new(4, 2, 64).unwrap();
        let encode = EncodeMatrix::cauchy(4, 2).unwrap();
        let (reference, _) = encoded_pair(params, &Pattern::Random { seed: 9 });

        for a in 0..6 {
            for b in a..6 {
                let set = ErasureSet::new(4, 2, &[a, b]).unwrap();
                let decode = DecodeMatrix::build(&encode, &set).unwrap();

                let mut hw = reference.clone();
                hw.erase(&set);
                let mut offload = OffloadCodec::new(EmulatedAccelerator::new());
                offload.register(hw.as_bytes()).unwrap();
                let (survivors, mut recovered) = hw.split_decode(&decode);
                offload.decode(&decode, &survivors, &mut recovered).unwrap();
                drop(recovered);
                drop(survivors);
                offload.deregister(hw.as_bytes()).unwrap();

                assert_eq!(hw.as_bytes(), reference.as_bytes(), "erased {a},{b}");
            }
        }
    }

    #[test]
    fn test_unregistered_buffer() {
        let params = Params::new(2, 1, 8).unwrap();
        let matrix = EncodeMatrix::cauchy(2, 1).unwrap();
        let mut stripe = Stripe::new(params);
        let mut offload = OffloadCodec::new(EmulatedAccelerator::new());

        let (data, mut parity) = stripe.split_encode();
        let err = offload.encode(&matrix, &data, &mut parity).unwrap_err();
        assert!(matches!(err, Error::UnregisteredBuffer { unit: 0, len: 8, .. }));
    }

    #[test]
    fn test_registration_must_cover_buffer() {
        let params = Params::new(2, 1, 8).unwrap();
        let matrix = EncodeMatrix::cauchy(2, 1).unwrap();
        let mut stripe = Stripe::new(params);
        let mut offload = OffloadCodec::new(EmulatedAccelerator::new());

        // Only the data units are registered; the parity unit is not.
        offload.register(&stripe.as_bytes()[..16]).unwrap();
        let (data, mut parity) = stripe.split_encode();
        let err = offload.encode(&matrix, &data, &mut parity).unwrap_err();
        assert!(matches!(err, Error::UnregisteredBuffer { unit: 2, .. }));
    }

    #[test]
    fn test_deregistered_buffer_is_rejected() {
        let params = Params::new(2, 1, 8).unwrap();
        let matrix = EncodeMatrix::cauchy(2, 1).unwrap();
        let mut stripe = Stripe::new(params);
        let mut offload = OffloadCodec::new(EmulatedAccelerator::new());

        offload.register(stripe.as_bytes()).unwrap();
        offload.deregister(stripe.as_bytes()).unwrap();
        assert_eq!(offload.device().region_count(), 0);

        let (data, mut parity) = stripe.split_encode();
        assert!(matches!(
            offload.encode(&matrix, &data, &mut parity),
            Err(Error::UnregisteredBuffer { .. })
        ));
    }

    #[test]
    fn test_deregister_unknown_region() {
        let stripe = Stripe::new(Params::new(2, 1, 8).unwrap());
        let mut offload = OffloadCodec::new(EmulatedAccelerator::new());
        offload.register(stripe.as_bytes()).unwrap();

        let err = offload.deregister(&stripe.as_bytes()[8..]).unwrap_err();
        assert_eq!(
            err,
            Error::UnknownRegion {
                addr: stripe.as_bytes()[8..].as_ptr() as usize,
                len: 16,
            }
        );
        assert_eq!(offload.device().region_count(), 1);
    }

    #[test]
    fn test_decode_with_every_survivor() {
        let params = Params::new(4, 2, 32).unwrap();
        let encode = EncodeMatrix::cauchy(4, 2).unwrap();
        let (reference, _) = encoded_pair(params, &Pattern::Random { seed: 21 });
        let set = ErasureSet::new(4, 2, &[0]).unwrap();
        let decode = DecodeMatrix::build(&encode, &set).unwrap();

        let mut codecs: Vec<Box<dyn Codec>> = vec![
            Box::new(SoftwareCodec::new()),
            Box::new(OffloadCodec::new(EmulatedAccelerator::new())),
        ];
        for codec in codecs.iter_mut() {
            let mut buf = reference.as_bytes().to_vec();
            buf[..32].fill(0);
            codec.register(&buf).unwrap();
            {
                let (erased, rest) = buf.split_at_mut(32);
                // Units 1..=5: one more than the decode matrix reads.
                let survivors: Vec<Block> = rest
                    .chunks_exact(32)
                    .enumerate()
                    .map(|(i, unit)| Block::new((i + 1) as u8, unit))
                    .collect();
                let mut recovered = [BlockMut::new(0, erased)];
                codec.decode(&decode, &survivors, &mut recovered).unwrap();
            }
            codec.deregister(&buf).unwrap();
            assert_eq!(buf, reference.as_bytes(), "{}", codec.name());
        }
    }

    #[test]
    fn test_calc_reused_for_same_matrix() {
        let params = Params::new(3, 2, 16).unwrap();
        let matrix = EncodeMatrix::cauchy(3, 2).unwrap();
        let mut stripe = Stripe::new(params);
        stripe.fill(&Pattern::Sequential);
        let mut offload = OffloadCodec::new(EmulatedAccelerator::new());
        offload.register(stripe.as_bytes()).unwrap();

        for _ in 0..3 {
            let (data, mut parity) = stripe.split_encode();
            offload.encode(&matrix, &data, &mut parity).unwrap();
        }
        assert_eq!(offload.device().calcs_allocated(), 1);
        assert_eq!(offload.device().calcs_completed(), 3);
    }

    #[test]
    fn test_calc_attrs_for_matrix() {
        let matrix = EncodeMatrix::cauchy(4, 2).unwrap();
        let attrs = CalcAttrs::for_matrix(&matrix);
        assert_eq!(attrs.k, 4);
        assert_eq!(attrs.m, 2);
        assert_eq!(attrs.w, 8);
        assert_eq!(attrs.max_data_sge, 4);
        assert_eq!(attrs.max_code_sge, 2);
        assert_eq!(attrs.encode_matrix, vec![0x47, 0xa7, 0xa7, 0x47, 0x7a, 0xba, 0xba, 0x7a]);
    }
}

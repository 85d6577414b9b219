//! Owned storage for one stripe of K data and M parity units.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::matrix::{DecodeMatrix, ErasureSet};
use crate::{Block, BlockMut, Params};

/// Test content for the data units of a stripe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Data unit i is filled with the byte `i + 1`.
    Sequential,
    /// Data unit i is filled with `bytes[i]`; missing entries fill with 0.
    Fill(Vec<u8>),
    /// Seeded pseudo-random bytes.
    Random { seed: u64 },
}

/// One stripe, backed by a single contiguous buffer.
///
/// Unit i occupies bytes `i * unit_size .. (i + 1) * unit_size`, data units
/// first. Backends only ever borrow views of it for the length of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stripe {
    params: Params,
    buf: Vec<u8>,
}

impl Stripe {
    /// A zeroed stripe.
    pub fn new(params: Params) -> Self {
        Self {
            params,
            buf: vec![0; params.stripe_bytes()],
        }
    }

    #[inline]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The whole backing buffer, for registration.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn unit(&self, index: usize) -> &[u8] {
        let size = self.params.unit_size();
        &self.buf[index * size..(index + 1) * size]
    }

    #[inline]
    pub fn unit_mut(&mut self, index: usize) -> &mut [u8] {
        let size = self.params.unit_size();
        &mut self.buf[index * size..(index + 1) * size]
    }

    /// Fill the data units from `pattern` and zero the parity units.
    pub fn fill(&mut self, pattern: &Pattern) {
        let data_bytes = self.params.data_count() * self.params.unit_size();
        let (data, parity) = self.buf.split_at_mut(data_bytes);
        parity.fill(0);

        match pattern {
            Pattern::Sequential => {
                for (i, unit) in data.chunks_exact_mut(self.params.unit_size()).enumerate() {
                    unit.fill((i + 1) as u8);
                }
            }
            Pattern::Fill(bytes) => {
                for (i, unit) in data.chunks_exact_mut(self.params.unit_size()).enumerate() {
                    unit.fill(bytes.get(i).copied().unwrap_or(0));
                }
            }
            Pattern::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                rng.fill(data);
            }
        }
    }

    /// Zero every erased unit.
    pub fn erase(&mut self, erasures: &ErasureSet) {
        for &i in erasures.indices() {
            self.unit_mut(i as usize).fill(0);
        }
    }

    /// Whether every byte of `index` has the same value.
    pub fn is_uniform(&self, index: usize) -> bool {
        let unit = self.unit(index);
        unit.iter().all(|&b| b == unit[0])
    }

    /// Data units to read and parity units to write, for an encode call.
    pub fn split_encode(&mut self) -> (Vec<Block<'_>>, Vec<BlockMut<'_>>) {
        let size = self.params.unit_size();
        let (data, parity) = self.buf.split_at_mut(self.params.data_count() * size);
        let data = data
            .chunks_exact(size)
            .enumerate()
            .map(|(i, d)| Block::new(i as u8, d))
            .collect();
        let k = self.params.data_count();
        let parity = parity
            .chunks_exact_mut(size)
            .enumerate()
            .map(|(i, p)| BlockMut::new((k + i) as u8, p))
            .collect();
        (data, parity)
    }

    /// Surviving units to read and erased units to write, for a decode call
    /// with `matrix`. Units that are neither are left out.
    pub fn split_decode(&mut self, matrix: &DecodeMatrix) -> (Vec<Block<'_>>, Vec<BlockMut<'_>>) {
        let survivors = matrix.survivors();
        let erasures = matrix.erasures();
        let mut read = Vec::with_capacity(survivors.len());
        let mut write = Vec::with_capacity(erasures.len());

        for (i, unit) in self.buf.chunks_exact_mut(self.params.unit_size()).enumerate() {
            if erasures.contains(i) {
                write.push(BlockMut::new(i as u8, unit));
            } else if survivors.contains(&(i as u8)) {
                read.push(Block::new(i as u8, &*unit));
            }
        }
        (read, write)
    }
}

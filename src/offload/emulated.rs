//! In-process stand-in for an EC offload engine.
//!
//! Enforces what a NIC would: every scatter-gather entry must carry the key of
//! a live registration that covers it, blocks must match the declared size,
//! and calculation attributes must be ones the engine supports. The
//! arithmetic reads the coding matrices in their transposed offload layout.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{Accelerator, CalcAttrs, EcCalc, EcMem, RegionKey, Sge, SgeMut};
use crate::{check_counts, gf, Error};

/// Software emulation of an [`Accelerator`].
#[derive(Debug, Default)]
pub struct EmulatedAccelerator {
    regions: BTreeMap<RegionKey, (usize, usize)>,
    live_calcs: BTreeSet<u32>,
    next_key: u32,
    next_calc: u32,
    calcs_allocated: u64,
    calcs_completed: u64,
}

impl EmulatedAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live registrations.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn calcs_allocated(&self) -> u64 {
        self.calcs_allocated
    }

    /// Encode and decode calculations run to completion.
    pub fn calcs_completed(&self) -> u64 {
        self.calcs_completed
    }

    fn check_calc(&self, calc: &EcCalc) -> Result<(), Error> {
        if self.live_calcs.contains(&calc.id()) {
            Ok(())
        } else {
            Err(Error::InvalidParameters {
                data: calc.attrs().k,
                parity: calc.attrs().m,
                reason: "ec calc was not allocated by this device",
            })
        }
    }

    /// Validate keys and sizes of every entry.
    fn check_mem(&self, mem: &EcMem<'_>) -> Result<(), Error> {
        let entries = mem
            .inputs
            .iter()
            .map(|s: &Sge<'_>| (s.unit, s.buf.as_ptr() as usize, s.buf.len(), s.key))
            .chain(
                mem.outputs
                    .iter()
                    .map(|s: &SgeMut<'_>| (s.unit, s.buf.as_ptr() as usize, s.buf.len(), s.key)),
            );

        for (unit, addr, len, key) in entries {
            let unit = unit as usize;
            if len != mem.block_size {
                return Err(Error::UnitSizeMismatch {
                    unit,
                    expected: mem.block_size,
                    actual: len,
                });
            }
            let covered = self
                .regions
                .get(&key)
                .is_some_and(|&(start, rlen)| addr >= start && addr + len <= start + rlen);
            if !covered {
                return Err(Error::UnregisteredBuffer { unit, addr, len });
            }
        }
        Ok(())
    }
}

/// outputs[i] = Σ_j t[j * cols + i] · inputs[j], reading `t` as K × cols.
fn run_transposed(t: &[u8], cols: usize, mem: &mut EcMem<'_>) {
    for (i, out) in mem.outputs.iter_mut().enumerate() {
        for (j, input) in mem.inputs.iter().enumerate() {
            let coeff = t[j * cols + i];
            if j == 0 {
                gf::mul_mem(out.buf, input.buf, coeff);
            } else {
                gf::muladd_mem(out.buf, input.buf, coeff);
            }
        }
    }
}

impl Accelerator for EmulatedAccelerator {
    fn register(&mut self, region: &[u8]) -> Result<RegionKey, Error> {
        let key = RegionKey(self.next_key);
        self.next_key += 1;
        self.regions
            .insert(key, (region.as_ptr() as usize, region.len()));
        Ok(key)
    }

    fn deregister(&mut self, key: RegionKey) -> Result<(), Error> {
        self.regions
            .remove(&key)
            .map(|_| ())
            .ok_or(Error::UnknownRegionKey { key: key.0 })
    }

    fn alloc_calc(&mut self, attrs: CalcAttrs) -> Result<EcCalc, Error> {
        check_counts(attrs.k, attrs.m)?;
        let invalid = |reason: &'static str| Error::InvalidParameters {
            data: attrs.k,
            parity: attrs.m,
            reason,
        };
        if attrs.w != 8 {
            return Err(invalid("engine only supports w = 8"));
        }
        if attrs.max_data_sge != attrs.k {
            return Err(invalid("max_data_sge must equal k"));
        }
        if attrs.max_code_sge != attrs.m {
            return Err(invalid("max_code_sge must equal m"));
        }
        if attrs.max_inflight == 0 {
            return Err(invalid("max_inflight must be at least 1"));
        }
        if attrs.encode_matrix.len() != attrs.k * attrs.m {
            return Err(invalid("encode matrix must be k * m coefficients"));
        }

        let id = self.next_calc;
        self.next_calc += 1;
        self.live_calcs.insert(id);
        self.calcs_allocated += 1;
        Ok(EcCalc::new(id, attrs))
    }

    fn dealloc_calc(&mut self, calc: EcCalc) {
        self.live_calcs.remove(&calc.id());
    }

    fn encode_sync(&mut self, calc: &EcCalc, mem: &mut EcMem<'_>) -> Result<(), Error> {
        self.check_calc(calc)?;
        let attrs = calc.attrs();
        if mem.inputs.len() != attrs.max_data_sge || mem.outputs.len() != attrs.max_code_sge {
            return Err(Error::InvalidParameters {
                data: mem.inputs.len(),
                parity: mem.outputs.len(),
                reason: "sge counts do not match the ec calc",
            });
        }
        self.check_mem(mem)?;

        run_transposed(&attrs.encode_matrix, attrs.m, mem);
        self.calcs_completed += 1;
        debug!(calc = calc.id(), block_size = mem.block_size, "emulated encode complete");
        Ok(())
    }

    fn decode_sync(
        &mut self,
        calc: &EcCalc,
        mem: &mut EcMem<'_>,
        erasures: &[bool],
        decode_matrix: &[u8],
    ) -> Result<(), Error> {
        self.check_calc(calc)?;
        let attrs = calc.attrs();
        let erased = erasures.iter().filter(|&&e| e).count();

        if erasures.len() != attrs.k + attrs.m {
            return Err(Error::InconsistentErasureSet {
                reason: "erasure flags must cover every unit of the stripe",
                unit: erasures.len(),
            });
        }
        if erased > attrs.m || erased != mem.outputs.len() {
            return Err(Error::InconsistentErasureSet {
                reason: "erased unit count does not match decode outputs",
                unit: erased,
            });
        }
        if mem.inputs.len() != attrs.k {
            return Err(Error::InconsistentErasureSet {
                reason: "decode needs exactly k surviving units",
                unit: mem.inputs.len(),
            });
        }
        if decode_matrix.len() != attrs.k * erased {
            return Err(Error::InvalidParameters {
                data: attrs.k,
                parity: attrs.m,
                reason: "decode matrix must be k * erasures coefficients",
            });
        }
        self.check_mem(mem)?;

        run_transposed(decode_matrix, erased, mem);
        self.calcs_completed += 1;
        debug!(calc = calc.id(), erased, "emulated decode complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::EncodeMatrix;

    #[test]
    fn test_alloc_calc_validates_attrs() {
        let matrix = EncodeMatrix::cauchy(4, 2).unwrap();
        let mut device = EmulatedAccelerator::new();

        let mut attrs = CalcAttrs::for_matrix(&matrix);
        attrs.w = 16;
        assert!(matches!(
            device.alloc_calc(attrs),
            Err(Error::InvalidParameters { .. })
        ));

        let mut attrs = CalcAttrs::for_matrix(&matrix);
        attrs.max_data_sge = 3;
        assert!(device.alloc_calc(attrs).is_err());

        let mut attrs = CalcAttrs::for_matrix(&matrix);
        attrs.encode_matrix.pop();
        assert!(device.alloc_calc(attrs).is_err());

        let mut attrs = CalcAttrs::for_matrix(&matrix);
        attrs.m = 5;
        attrs.max_code_sge = 5;
        assert!(device.alloc_calc(attrs).is_err());

        assert!(device.alloc_calc(CalcAttrs::for_matrix(&matrix)).is_ok());
        assert_eq!(device.calcs_allocated(), 1);
    }

    #[test]
    fn test_deallocated_calc_is_rejected() {
        let matrix = EncodeMatrix::cauchy(1, 1).unwrap();
        let mut device = EmulatedAccelerator::new();
        let calc = device.alloc_calc(CalcAttrs::for_matrix(&matrix)).unwrap();
        let stale = calc.clone();
        device.dealloc_calc(calc);

        let input = [1u8; 4];
        let mut output = [0u8; 4];
        let key = device.register(&input).unwrap();
        let out_key = device.register(&output).unwrap();
        let mut mem = EcMem {
            inputs: vec![Sge {
                buf: &input,
                key,
                unit: 0,
            }],
            outputs: vec![SgeMut {
                buf: &mut output,
                key: out_key,
                unit: 1,
            }],
            block_size: 4,
        };
        assert!(device.encode_sync(&stale, &mut mem).is_err());
    }

    #[test]
    fn test_encode_sync_reads_transposed_matrix() {
        let matrix = EncodeMatrix::cauchy(2, 2).unwrap();
        let mut device = EmulatedAccelerator::new();
        let calc = device.alloc_calc(CalcAttrs::for_matrix(&matrix)).unwrap();

        let mut buf = vec![0u8; 4 * 8];
        buf[..8].fill(0x01);
        buf[8..16].fill(0x02);
        let key = device.register(&buf).unwrap();
        {
            let (data, parity) = buf.split_at_mut(16);
            let (d0, d1) = data.split_at(8);
            let (p0, p1) = parity.split_at_mut(8);
            let mut mem = EcMem {
                inputs: vec![
                    Sge { buf: d0, key, unit: 0 },
                    Sge { buf: d1, key, unit: 1 },
                ],
                outputs: vec![
                    SgeMut { buf: p0, key, unit: 2 },
                    SgeMut { buf: p1, key, unit: 3 },
                ],
                block_size: 8,
            };
            device.encode_sync(&calc, &mut mem).unwrap();
        }

        for (i, chunk) in buf[16..].chunks_exact(8).enumerate() {
            let row = matrix.row(2 + i);
            let expected = gf::mul(row[0], 0x01) ^ gf::mul(row[1], 0x02);
            assert!(chunk.iter().all(|&b| b == expected));
        }
        assert_eq!(device.calcs_completed(), 1);
    }

    #[test]
    fn test_wrong_key_reports_stripe_unit() {
        let matrix = EncodeMatrix::cauchy(1, 1).unwrap();
        let mut device = EmulatedAccelerator::new();
        let calc = device.alloc_calc(CalcAttrs::for_matrix(&matrix)).unwrap();

        let survivor = [7u8; 4];
        let mut erased = [0u8; 4];
        let in_key = device.register(&survivor).unwrap();
        let _out_key = device.register(&erased).unwrap();
        // Rebuild unit 0 from unit 1, but the output carries the input's key,
        // which does not cover it.
        let mut mem = EcMem {
            inputs: vec![Sge {
                buf: &survivor,
                key: in_key,
                unit: 1,
            }],
            outputs: vec![SgeMut {
                buf: &mut erased,
                key: in_key,
                unit: 0,
            }],
            block_size: 4,
        };
        assert!(matches!(
            device.decode_sync(&calc, &mut mem, &[true, false], &[1]),
            Err(Error::UnregisteredBuffer { unit: 0, len: 4, .. })
        ));
    }

    #[test]
    fn test_deregister_unknown_key() {
        let mut device = EmulatedAccelerator::new();
        let region = [0u8; 8];
        let key = device.register(&region).unwrap();
        device.deregister(key).unwrap();
        assert_eq!(device.region_count(), 0);
        assert_eq!(
            device.deregister(key),
            Err(Error::UnknownRegionKey { key: key.0 })
        );
        assert_eq!(
            device.deregister(RegionKey(99)),
            Err(Error::UnknownRegionKey { key: 99 })
        );
    }

    #[test]
    fn test_decode_sync_checks_erasure_count() {
        let matrix = EncodeMatrix::cauchy(1, 1).unwrap();
        let mut device = EmulatedAccelerator::new();
        let calc = device.alloc_calc(CalcAttrs::for_matrix(&matrix)).unwrap();

        let input = [7u8; 4];
        let mut output = [0u8; 4];
        let in_key = device.register(&input).unwrap();
        let out_key = device.register(&output).unwrap();
        let mut mem = EcMem {
            inputs: vec![Sge {
                buf: &input,
                key: in_key,
                unit: 1,
            }],
            outputs: vec![SgeMut {
                buf: &mut output,
                key: out_key,
                unit: 0,
            }],
            block_size: 4,
        };
        // No unit flagged, yet one output requested.
        assert!(matches!(
            device.decode_sync(&calc, &mut mem, &[false, false], &[1]),
            Err(Error::InconsistentErasureSet { .. })
        ));
        device
            .decode_sync(&calc, &mut mem, &[true, false], &[1])
            .unwrap();
        drop(mem);
        assert_eq!(output, [7u8; 4]);
    }
}

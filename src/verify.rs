//! Cross-checks two codecs over one stripe.
//!
//! Each backend gets its own copy of the stripe, so neither can observe the
//! other's writes. Parity is compared after encode; after decode the rebuilt
//! units are compared with each other and with the original content.

use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::matrix::{combinations, DecodeMatrix, EncodeMatrix, ErasureSet};
use crate::stripe::{Pattern, Stripe};
use crate::{Error, Params};

/// Which half of a verification pass produced a mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Encode,
    Decode,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Encode => write!(f, "encode"),
            Stage::Decode => write!(f, "decode"),
        }
    }
}

/// Outcome of a successful verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Units erased before decoding.
    pub erasures: Vec<u8>,
    /// First byte of every unit of the reference stripe after encoding, data
    /// then parity.
    pub leading_bytes: Vec<u8>,
    /// The same, read from the candidate's stripe.
    pub candidate_leading_bytes: Vec<u8>,
    /// Whether each parity unit holds a single repeated byte.
    pub parity_uniform: bool,
    /// Bytes compared across both stages.
    pub bytes_compared: usize,
}

/// Runs encode and decode through two codecs and demands identical results.
#[derive(Debug, Clone)]
pub struct StripeVerifier {
    params: Params,
    encode: EncodeMatrix,
}

/// Label used when recovered data is compared against the original stripe.
const ORIGINAL: &str = "original";

impl StripeVerifier {
    /// # Errors
    /// Returns `Error::InvalidParameters` if no encode matrix exists for
    /// `params`.
    pub fn new(params: Params) -> Result<Self, Error> {
        let encode = EncodeMatrix::cauchy(params.data_count(), params.parity_count())?;
        Ok(Self { params, encode })
    }

    #[inline]
    pub fn params(&self) -> &Params {
        &self.params
    }

    #[inline]
    pub fn encode_matrix(&self) -> &EncodeMatrix {
        &self.encode
    }

    /// One full pass: encode, compare parity, erase, decode, compare.
    ///
    /// # Errors
    /// `Error::BackendMismatch` for the first differing byte, or whatever
    /// either codec reports.
    pub fn verify(
        &self,
        pattern: &Pattern,
        erasures: &ErasureSet,
        reference: &mut dyn Codec,
        candidate: &mut dyn Codec,
    ) -> Result<VerifyReport, Error> {
        let decode = DecodeMatrix::build(&self.encode, erasures)?;

        let mut original = Stripe::new(self.params);
        original.fill(pattern);
        let mut ref_stripe = original.clone();
        let mut cand_stripe = original.clone();

        reference.register(ref_stripe.as_bytes())?;
        if let Err(err) = candidate.register(cand_stripe.as_bytes()) {
            if let Err(release) = reference.deregister(ref_stripe.as_bytes()) {
                warn!(reference = reference.name(), error = %release, "failed to deregister stripe");
            }
            return Err(err);
        }

        let result = self.run(
            &decode,
            &mut original,
            &mut ref_stripe,
            &mut cand_stripe,
            reference,
            candidate,
        );

        // Release both registrations even when the pass failed.
        let ref_release = reference.deregister(ref_stripe.as_bytes());
        let cand_release = candidate.deregister(cand_stripe.as_bytes());
        let report = result?;
        ref_release?;
        cand_release?;

        info!(
            reference = reference.name(),
            candidate = candidate.name(),
            erasures = ?report.erasures,
            bytes = report.bytes_compared,
            "backends agree"
        );
        Ok(report)
    }

    fn run(
        &self,
        decode: &DecodeMatrix,
        original: &mut Stripe,
        ref_stripe: &mut Stripe,
        cand_stripe: &mut Stripe,
        reference: &mut dyn Codec,
        candidate: &mut dyn Codec,
    ) -> Result<VerifyReport, Error> {
        let k = self.params.data_count();
        let total = self.params.total_count();
        let mut bytes_compared = 0;

        // Encode
        {
            let (data, mut parity) = ref_stripe.split_encode();
            reference.encode(&self.encode, &data, &mut parity)?;
        }
        {
            let (data, mut parity) = cand_stripe.split_encode();
            candidate.encode(&self.encode, &data, &mut parity)?;
        }
        for unit in k..total {
            compare(
                Stage::Encode,
                (reference.name(), ref_stripe.unit(unit)),
                (candidate.name(), cand_stripe.unit(unit)),
                unit,
            )?;
            bytes_compared += self.params.unit_size();
        }
        debug!(reference = reference.name(), candidate = candidate.name(), "parity agrees");

        let leading_bytes = (0..total).map(|i| ref_stripe.unit(i)[0]).collect();
        let candidate_leading_bytes = (0..total).map(|i| cand_stripe.unit(i)[0]).collect();
        let parity_uniform = (k..total).all(|i| ref_stripe.is_uniform(i));

        // The reference parity is now part of the expected stripe.
        original.clone_from(ref_stripe);

        // Decode
        let erasures = decode.erasures();
        ref_stripe.erase(erasures);
        cand_stripe.erase(erasures);
        {
            let (survivors, mut recovered) = ref_stripe.split_decode(decode);
            reference.decode(decode, &survivors, &mut recovered)?;
        }
        {
            let (survivors, mut recovered) = cand_stripe.split_decode(decode);
            candidate.decode(decode, &survivors, &mut recovered)?;
        }
        for &unit in erasures.indices() {
            let unit = unit as usize;
            compare(
                Stage::Decode,
                (reference.name(), ref_stripe.unit(unit)),
                (candidate.name(), cand_stripe.unit(unit)),
                unit,
            )?;
            compare(
                Stage::Decode,
                (ORIGINAL, original.unit(unit)),
                (reference.name(), ref_stripe.unit(unit)),
                unit,
            )?;
            bytes_compared += 2 * self.params.unit_size();
        }

        Ok(VerifyReport {
            erasures: erasures.indices().to_vec(),
            leading_bytes,
            candidate_leading_bytes,
            parity_uniform,
            bytes_compared,
        })
    }

    /// Run [`StripeVerifier::verify`] for every erasure set of 1..=M units.
    ///
    /// The number of sets grows combinatorially with K + M; this is meant for
    /// small stripes.
    pub fn verify_exhaustive(
        &self,
        pattern: &Pattern,
        reference: &mut dyn Codec,
        candidate: &mut dyn Codec,
    ) -> Result<Vec<VerifyReport>, Error> {
        let k = self.params.data_count();
        let m = self.params.parity_count();
        let mut reports = Vec::new();
        for size in 1..=m {
            for indices in combinations(k + m, size) {
                let erasures = ErasureSet::new(k, m, &indices)?;
                reports.push(self.verify(pattern, &erasures, reference, candidate)?);
            }
        }
        Ok(reports)
    }
}

/// First differing byte between two units, as a `BackendMismatch`.
fn compare(
    stage: Stage,
    (reference, expected): (&'static str, &[u8]),
    (candidate, actual): (&'static str, &[u8]),
    unit: usize,
) -> Result<(), Error> {
    let Some(offset) = expected.iter().zip(actual).position(|(a, b)| a != b) else {
        return Ok(());
    };
    let err = Error::BackendMismatch {
        stage,
        reference,
        candidate,
        unit,
        offset,
        expected: expected[offset],
        actual: actual[offset],
    };
    warn!(%err, "backend mismatch");
    Err(err)
}

//! Encode a stripe with the software and offload codecs, erase units, decode,
//! and check that both backends agree byte for byte.
//!
//! # Usage
//!
//! ```bash
//! stripe-verify
//! stripe-verify --data 8 --parity 3 --erase 0,5,9
//! stripe-verify --data 6 --parity 2 --seed 42 --exhaustive
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, Level};

use stripe_ec::{
    Codec, EmulatedAccelerator, ErasureSet, OffloadCodec, Params, Pattern, SoftwareCodec,
    StripeVerifier,
};

#[derive(Parser, Debug)]
#[command(name = "stripe-verify")]
#[command(about = "Cross-check software and offload GF(256) erasure coding")]
struct Args {
    /// Data units per stripe (K)
    #[arg(short = 'k', long, default_value = "4")]
    data: usize,

    /// Parity units per stripe (M)
    #[arg(short = 'm', long, default_value = "2")]
    parity: usize,

    /// Bytes per unit
    #[arg(long, default_value = "64")]
    unit_size: usize,

    /// Units to erase before decoding (defaults to the first M)
    #[arg(long, value_delimiter = ',')]
    erase: Option<Vec<usize>>,

    /// Fill data units with seeded random bytes instead of 0x01, 0x02, ...
    #[arg(long)]
    seed: Option<u64>,

    /// Verify every erasure set of 1..=M units
    #[arg(long)]
    exhaustive: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_encode(name: &str, k: usize, leading_bytes: &[u8]) {
    let (data, parity) = leading_bytes.split_at(k);
    println!("{name} encode: {} -> {}", hex(data), hex(parity));
}

fn join(units: &[u8]) -> String {
    units
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let params = Params::new(args.data, args.parity, args.unit_size)
        .context("invalid stripe parameters")?;
    let verifier = StripeVerifier::new(params).context("failed to build encode matrix")?;
    let pattern = match args.seed {
        Some(seed) => Pattern::Random { seed },
        None => Pattern::Sequential,
    };

    let mut software = SoftwareCodec::new();
    let mut offload = OffloadCodec::new(EmulatedAccelerator::new());

    info!(
        k = params.data_count(),
        m = params.parity_count(),
        unit_size = params.unit_size(),
        ?pattern,
        "verifying {} against {}",
        offload.name(),
        software.name()
    );

    let reports = if args.exhaustive {
        verifier
            .verify_exhaustive(&pattern, &mut software, &mut offload)
            .context("exhaustive verification failed")?
    } else {
        let erasures = match &args.erase {
            Some(units) => ErasureSet::new(params.data_count(), params.parity_count(), units),
            None => ErasureSet::leading(params.data_count(), params.parity_count()),
        }
        .context("invalid erasure set")?;
        let report = verifier
            .verify(&pattern, &erasures, &mut software, &mut offload)
            .context("verification failed")?;
        vec![report]
    };
    let Some(first) = reports.first() else {
        bail!("no erasure sets were verified");
    };

    // Encoding does not depend on the erasure set; show the first pass.
    print_encode(software.name(), params.data_count(), &first.leading_bytes);
    print_encode(
        offload.name(),
        params.data_count(),
        &first.candidate_leading_bytes,
    );

    // Constant data units must encode to constant parity units.
    if pattern == Pattern::Sequential {
        if let Some(report) = reports.iter().find(|r| !r.parity_uniform) {
            bail!(
                "parity over constant data units is not constant (erased {})",
                join(&report.erasures)
            );
        }
    }

    for report in &reports {
        println!(
            "erased {}: {} decode: ok, {} decode: ok",
            join(&report.erasures),
            software.name(),
            offload.name()
        );
    }
    if args.exhaustive {
        let bytes: usize = reports.iter().map(|r| r.bytes_compared).sum();
        println!(
            "decode: ok ({} erasure sets, {bytes} bytes compared)",
            reports.len()
        );
    }
    Ok(())
}

/// Prints the signatures of PE binaries and checks them against the
/// authenticode digest of each file.
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use authenticode_verify::{
    AuthenticodeSignedData, CmsExtractor, DigestAlgorithm, DigestMap, SignedPeFile,
    VerificationError,
};
use clap::Parser;
use cms::signed_data::SignerIdentifier;
use x509_cert::Certificate;

#[derive(Parser, Debug)]
#[command(about = "Verify the Authenticode signatures of PE binaries")]
struct Cli {
    /// PE files to inspect
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Precomputed authenticode digest, as ALGORITHM=HEX (e.g. sha256=ab12...)
    #[arg(long = "hash", value_parser = parse_hash)]
    hashes: Vec<(DigestAlgorithm, Vec<u8>)>,

    /// More verbose logging, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_hash(value: &str) -> Result<(DigestAlgorithm, Vec<u8>), String> {
    let (algorithm, digest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ALGORITHM=HEX, got {value}"))?;
    let algorithm = algorithm.parse().map_err(|err| format!("{err}"))?;
    let digest = hex::decode(digest).map_err(|err| format!("invalid digest: {err}"))?;
    Ok((algorithm, digest))
}

fn print_certificate(certificate: &Certificate) {
    let tbs = &certificate.tbs_certificate;
    println!("      - Subject: {}", tbs.subject);
    println!("        Issuer: {}", tbs.issuer);
    println!("        Serial: {}", hex::encode(tbs.serial_number.as_bytes()));
    println!("        Valid from: {}", tbs.validity.not_before.to_date_time());
    println!("        Valid to: {}", tbs.validity.not_after.to_date_time());
}

fn print_signed_data(signed_data: &AuthenticodeSignedData) {
    println!("    Included certificates:");
    for certificate in signed_data.certificates() {
        print_certificate(certificate);
    }

    println!();
    println!("    Signer:");
    match signed_data.signer_info().map(|info| &info.sid) {
        Some(SignerIdentifier::IssuerAndSerialNumber(issuer)) => {
            println!("        Issuer: {}", issuer.issuer);
            println!(
                "        Serial: {}",
                hex::encode(issuer.serial_number.as_bytes())
            );
        }
        Some(SignerIdentifier::SubjectKeyIdentifier(ski)) => {
            println!("        Subject key identifier: {}", hex::encode(ski.0.as_bytes()));
        }
        None => println!("        (none)"),
    }
    println!(
        "        Digest: {} {}",
        signed_data.digest_algorithm_oid(),
        hex::encode(signed_data.message_digest())
    );
}

fn inspect(path: &PathBuf, expected_hashes: &DigestMap) -> Result<(), VerificationError> {
    let mut pe = SignedPeFile::new(BufReader::new(File::open(path)?))?;

    for signed_data in pe.signed_datas(&CmsExtractor)? {
        print_signed_data(&signed_data?);
        println!();
    }

    match pe.verify(expected_hashes.clone()) {
        Ok(()) => {
            println!("    Authenticode digest: valid");
            println!("    (signer signature and certificate chain are not checked)");
        }
        Err(err) => {
            println!("    Authenticode digest: invalid");
            println!("    {}", err);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    stderrlog::new()
        .module("authenticode_verify")
        .verbosity(usize::from(cli.verbose) + 1)
        .init()
        .expect("Failed to initialize the logger");

    let expected_hashes: DigestMap = cli.hashes.into_iter().collect();
    for path in &cli.files {
        println!("{}:", path.display());
        if let Err(err) = inspect(path, &expected_hashes) {
            println!("    Error while parsing: {}", err);
        }
    }
}

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use log::debug;

use crate::authenticode::{DigestAlgorithm, DigestMap, Fingerprinter, StreamingFingerprinter};
use crate::certificate::{CmsExtractor, SignedDataExtractor, SignedDataHandle};
use crate::errors::VerificationError;
use crate::signed_pe::SignedPeFile;

/// Digest algorithms the handles need that `provided` does not already hold.
///
/// A handle whose algorithm cannot be told is left out here; it will fail on
/// its own when verified.
pub fn required_digests<H: SignedDataHandle>(
    handles: &[H],
    provided: &DigestMap,
) -> BTreeSet<DigestAlgorithm> {
    handles
        .iter()
        .filter_map(|handle| handle.digest_algorithm().ok())
        .filter(|algorithm| !provided.contains_key(algorithm))
        .collect()
}

fn verify_one<H: SignedDataHandle>(
    handle: &H,
    hashes: &DigestMap,
) -> Result<(), VerificationError> {
    let algorithm = handle.digest_algorithm()?;
    let expected = hashes
        .get(&algorithm)
        .ok_or(VerificationError::MissingDigest(algorithm))?;
    handle.verify(expected)
}

/// Verifies `handles` in order and stops at the first one that checks out.
///
/// When none does, the error of the last one is returned as is.
pub fn verify_signed_datas<H: SignedDataHandle>(
    handles: &[H],
    hashes: &DigestMap,
) -> Result<(), VerificationError> {
    let mut last_error = None;

    for (index, handle) in handles.iter().enumerate() {
        match verify_one(handle, hashes) {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!("Signed data #{} failed to verify: {}", index, err);
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or(VerificationError::NoValidSignedData))
}

impl<R: Read + Seek> SignedPeFile<R> {
    /// Verifies the file with the CMS decoder, hashing the file only for the
    /// algorithms missing from `expected_hashes`.
    pub fn verify(&mut self, expected_hashes: DigestMap) -> Result<(), VerificationError> {
        self.verify_with(
            &CmsExtractor,
            &mut StreamingFingerprinter::default(),
            expected_hashes,
        )
    }

    pub fn verify_with<E, F>(
        &mut self,
        extractor: &E,
        fingerprinter: &mut F,
        mut hashes: DigestMap,
    ) -> Result<(), VerificationError>
    where
        E: SignedDataExtractor,
        F: Fingerprinter,
    {
        // The digests are computed in a single pass, so every handle has to
        // be known beforehand.
        let handles = self
            .signed_datas(extractor)?
            .collect::<Result<Vec<_>, _>>()?;

        let needed = required_digests(&handles, &hashes);
        if !needed.is_empty() {
            let exclusions = self.exclusion_ranges()?;
            let file_length = self.file_length();
            let computed = fingerprinter.authenticode_hashes(
                self.reader_mut(),
                file_length,
                &exclusions,
                &needed,
            )?;
            hashes.extend(computed);
        }

        verify_signed_datas(&handles, &hashes)
    }
}

pub fn verify_pe_file<P: AsRef<Path>>(
    path: P,
    expected_hashes: DigestMap,
) -> Result<(), VerificationError> {
    let file = BufReader::new(File::open(path)?);
    SignedPeFile::new(file)?.verify(expected_hashes)
}

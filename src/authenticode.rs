use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::str::FromStr;

use const_oid::db::rfc5912::{ID_SHA_1, ID_SHA_256, ID_SHA_384, ID_SHA_512};
use digest::{Digest, DynDigest, Output};
use log::debug;
use x509_cert::der::asn1::ObjectIdentifier;

use crate::errors::UnknownDigestAlgorithm;
use crate::pe::ExclusionMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

/// Digests of a file keyed by the algorithm that produced them.
pub type DigestMap = BTreeMap<DigestAlgorithm, Vec<u8>>;

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha1 => ID_SHA_1,
            DigestAlgorithm::Sha256 => ID_SHA_256,
            DigestAlgorithm::Sha384 => ID_SHA_384,
            DigestAlgorithm::Sha512 => ID_SHA_512,
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ]
        .into_iter()
        .find(|algorithm| algorithm.oid() == *oid)
    }

    pub fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            DigestAlgorithm::Sha1 => Box::new(sha1::Sha1::new()),
            DigestAlgorithm::Sha256 => Box::new(sha2::Sha256::new()),
            DigestAlgorithm::Sha384 => Box::new(sha2::Sha384::new()),
            DigestAlgorithm::Sha512 => Box::new(sha2::Sha512::new()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = UnknownDigestAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(UnknownDigestAlgorithm(s.to_string())),
        }
    }
}

/// Computes authenticode digests of a file, given the ranges to leave out.
pub trait Fingerprinter {
    /// Hashes every byte of the file outside of `exclusions`, once per algorithm.
    fn authenticode_hashes<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        file_length: u64,
        exclusions: &ExclusionMap,
        algorithms: &BTreeSet<DigestAlgorithm>,
    ) -> io::Result<DigestMap>;
}

/// Reads the file front to back a single time, feeding every requested hasher
/// from the same buffer.
#[derive(Debug, Clone)]
pub struct StreamingFingerprinter {
    buffer_size: usize,
}

impl Default for StreamingFingerprinter {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
        }
    }
}

impl StreamingFingerprinter {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

/// Byte spans of `[0, file_length)` left once `exclusions` are cut out.
pub fn included_ranges(exclusions: &ExclusionMap, file_length: u64) -> Vec<(u64, u64)> {
    let mut included = Vec::new();
    let mut position = 0u64;

    for (_, range) in exclusions.ranges() {
        let start = range.start.min(file_length);
        if start > position {
            included.push((position, start));
        }
        position = position.max(range.end().min(file_length));
    }
    if position < file_length {
        included.push((position, file_length));
    }

    included
}

fn hash_ranges<R, F>(
    reader: &mut R,
    file_length: u64,
    exclusions: &ExclusionMap,
    buffer_size: usize,
    mut update: F,
) -> io::Result<()>
where
    R: Read + Seek,
    F: FnMut(&[u8]),
{
    let mut buffer = vec![0u8; buffer_size];

    for (start, end) in included_ranges(exclusions, file_length) {
        reader.seek(SeekFrom::Start(start))?;
        let mut remaining = end - start;
        while remaining > 0 {
            let chunk = remaining.min(buffer.len() as u64) as usize;
            reader.read_exact(&mut buffer[..chunk])?;
            update(&buffer[..chunk]);
            remaining -= chunk as u64;
        }
    }

    Ok(())
}

impl Fingerprinter for StreamingFingerprinter {
    fn authenticode_hashes<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        file_length: u64,
        exclusions: &ExclusionMap,
        algorithms: &BTreeSet<DigestAlgorithm>,
    ) -> io::Result<DigestMap> {
        debug!(
            "Computing authenticode digests ({}) over {} bytes",
            algorithms
                .iter()
                .map(DigestAlgorithm::name)
                .collect::<Vec<_>>()
                .join(", "),
            file_length
        );

        let mut hashers: Vec<Box<dyn DynDigest>> =
            algorithms.iter().map(DigestAlgorithm::hasher).collect();
        hash_ranges(reader, file_length, exclusions, self.buffer_size, |data| {
            for hasher in hashers.iter_mut() {
                hasher.update(data);
            }
        })?;

        Ok(algorithms
            .iter()
            .zip(hashers)
            .map(|(algorithm, hasher)| (*algorithm, hasher.finalize().into_vec()))
            .collect())
    }
}

/// Authenticode digest of a file with a statically known hash function.
pub fn authenticode_digest<D, R>(
    reader: &mut R,
    file_length: u64,
    exclusions: &ExclusionMap,
) -> io::Result<Output<D>>
where
    D: Digest,
    R: Read + Seek,
{
    let mut digest = D::new();
    hash_ranges(
        reader,
        file_length,
        exclusions,
        StreamingFingerprinter::default().buffer_size,
        |data| Digest::update(&mut digest, data),
    )?;

    Ok(digest.finalize())
}

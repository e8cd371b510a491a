use std::io;

use crate::authenticode::DigestAlgorithm;
use thiserror::Error;
use x509_cert::der::asn1::ObjectIdentifier;

/// Structural errors found while walking the PE headers or the certificate table.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("MZ header not found")]
    MissingDosHeader,
    #[error("PE header location is beyond file boundaries ({offset} >= {file_length})")]
    PeHeaderOutOfBounds { offset: u64, file_length: u64 },
    #[error("PE header not found")]
    MissingPeHeader,
    #[error("The optional header exceeds the file length ({size} + {offset} > {file_length})")]
    OptionalHeaderOutOfBounds {
        offset: u64,
        size: u16,
        file_length: u64,
    },
    #[error("The optional header size is {0} < 68, which is insufficient for authenticode")]
    OptionalHeaderTooSmall(u16),
    #[error("The PE optional header magic is {0:#x}, which is unknown")]
    UnknownOptionalHeaderMagic(u16),
    #[error("Unexpected end of file while reading {what} at offset {offset:#x}")]
    Truncated { what: &'static str, offset: u64 },
    #[error("The PE file does not contain a certificate table")]
    NoCertificateTable,
    #[error("Position of certificate table entry is beyond length of file ({0:#x})")]
    EntryBeyondFileLength(u64),
    #[error("Invalid length in certificate table header: {0}")]
    InvalidEntryLength(u32),
    #[error("Certificate table entry at {position:#x} with length {length} exceeds the table ending at {table_end:#x}")]
    EntryExceedsTable {
        position: u64,
        length: u32,
        table_end: u64,
    },
    #[error("Unknown certificate revision {0:#x}")]
    UnknownRevision(u16),
    #[error("A SignedData structure was not found in the PE file's certificate table")]
    NoSignedData,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Failed to decode the signed data")]
    Decode(#[from] der::Error),
    #[error("Failed to compute the authenticode digest")]
    Io(#[from] io::Error),
    #[error("The content info is not a signed data structure, got {0}")]
    NotSignedData(ObjectIdentifier),
    #[error("The signed data does not carry SpcIndirectDataContent, got {0}")]
    UnexpectedContentType(ObjectIdentifier),
    #[error("The signed data has no encapsulated content")]
    MissingContent,
    #[error("Unsupported digest algorithm {0}")]
    UnsupportedDigestAlgorithm(ObjectIdentifier),
    #[error("No {0} digest is available for this file")]
    MissingDigest(DigestAlgorithm),
    #[error("Expected exactly one signer information, found {0}")]
    SignerInfoCount(usize),
    #[error("Digest algorithm of the signer ({signer}) does not match the authenticode one ({authenticode})")]
    DigestAlgorithmMismatch {
        signer: ObjectIdentifier,
        authenticode: ObjectIdentifier,
    },
    #[error("Authenticode is not matching, expected: {expected}, got: {computed}")]
    InvalidAuthenticode { expected: String, computed: String },
    #[error("No certificate was found")]
    NoCertificate,
    #[error("Missing certificate from a signed data information")]
    MissingCertificate(Box<cms::signed_data::SignerIdentifier>),
    #[error("No valid SignedData structure was found")]
    NoValidSignedData,
}

/// A digest algorithm name that does not map to any [`DigestAlgorithm`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown digest algorithm: {0}")]
pub struct UnknownDigestAlgorithm(pub String);

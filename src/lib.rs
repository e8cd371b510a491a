//! # Authenticode verify
//!
//! Locates the Authenticode signatures embedded in a PE image, works out which
//! bytes the image digest leaves out, and checks every signed data of the
//! certificate table against that digest until one of them holds.

pub mod errors;
pub mod pe;
pub mod certificate_table;
pub mod authenticode;
pub mod certificate;
pub mod signed_pe;
pub mod verify;

pub use authenticode::{DigestAlgorithm, DigestMap, Fingerprinter, StreamingFingerprinter};
pub use certificate::{
    AuthenticodeSignedData, CmsExtractor, SignedDataExtractor, SignedDataHandle,
};
pub use errors::{ParseError, UnknownDigestAlgorithm, VerificationError};
pub use pe::{locate_exclusion_ranges, ExclusionKind, ExclusionMap, RelativeRange};
pub use signed_pe::SignedPeFile;
pub use verify::{verify_pe_file, verify_signed_datas};

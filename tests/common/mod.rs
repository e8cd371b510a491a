#![allow(dead_code)]
//! Synthetic PE images and scripted collaborators shared by the integration tests.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::{self, Cursor, Read, Seek};
use std::rc::Rc;

use authenticode_verify::certificate::{
    DigestInfo, SpcAttributeTypeAndOptionalValue, SpcIndirectDataContent, SPC_INDIRECT_DATA_OBJID,
    SPC_PE_IMAGE_DATA_OBJID,
};
use authenticode_verify::certificate_table::aligned_length;
use authenticode_verify::pe::ExclusionMap;
use authenticode_verify::{
    DigestAlgorithm, DigestMap, Fingerprinter, SignedDataExtractor, SignedDataHandle,
    SignedPeFile, StreamingFingerprinter, VerificationError,
};
use cms::builder::{SignedDataBuilder, SignerInfoBuilder};
use cms::cert::CertificateChoices;
use cms::signed_data::{EncapsulatedContentInfo, SignerIdentifier};
use const_oid::AssociatedOid;
use der::asn1::{Null, OctetString};
use der::{Any, Encode};
use digest::{Digest, Output};
use signature::{Keypair, Signer};
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::spki::{
    AlgorithmIdentifierOwned, DynSignatureAlgorithmIdentifier, EncodePublicKey,
    SignatureBitStringEncoding,
};
use x509_cert::Certificate;

pub const PE32: u16 = 0x10B;
pub const PE32_PLUS: u16 = 0x20B;
pub const PE_OFFSET: usize = 0x80;
pub const OPTIONAL_HEADER_OFFSET: usize = PE_OFFSET + 24;

pub fn rva_base(magic: u16) -> usize {
    OPTIONAL_HEADER_OFFSET + if magic == PE32 { 92 } else { 108 }
}

pub fn cert_base(magic: u16) -> usize {
    OPTIONAL_HEADER_OFFSET + if magic == PE32 { 128 } else { 144 }
}

fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// A headers-only PE image padded with filler bytes up to `file_length`.
///
/// The data directory count is only written when the optional header is
/// large enough to hold it.
pub fn pe_image(
    magic: u16,
    optional_header_size: u16,
    number_of_rva: u32,
    file_length: usize,
) -> Vec<u8> {
    let headers_end = OPTIONAL_HEADER_OFFSET + usize::from(optional_header_size);
    let mut bytes = vec![0u8; file_length.max(headers_end)];

    bytes[0..2].copy_from_slice(b"MZ");
    put_u32(&mut bytes, 0x3C, PE_OFFSET as u32);
    bytes[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");
    // Machine: AMD64 / i386
    put_u16(&mut bytes, PE_OFFSET + 4, if magic == PE32 { 0x14C } else { 0x8664 });
    put_u16(&mut bytes, PE_OFFSET + 20, optional_header_size);
    put_u16(&mut bytes, OPTIONAL_HEADER_OFFSET, magic);
    // A recognisable checksum, it must never reach the digest.
    put_u32(&mut bytes, OPTIONAL_HEADER_OFFSET + 64, 0xDEAD_BEEF);

    if rva_base(magic) + 4 <= headers_end {
        put_u32(&mut bytes, rva_base(magic), number_of_rva);
    }
    for (index, byte) in bytes.iter_mut().enumerate().skip(headers_end) {
        *byte = (index % 251) as u8;
    }

    bytes
}

pub fn set_certificate_directory(bytes: &mut [u8], magic: u16, address: u32, size: u32) {
    let base = cert_base(magic);
    put_u32(bytes, base, address);
    put_u32(bytes, base + 4, size);
}

/// A table entry padded the way the table walk expects.
pub fn certificate_entry(revision: u16, certificate_type: u16, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 8) as u32;
    let mut entry = Vec::new();
    entry.extend_from_slice(&length.to_le_bytes());
    entry.extend_from_slice(&revision.to_le_bytes());
    entry.extend_from_slice(&certificate_type.to_le_bytes());
    entry.extend_from_slice(payload);
    entry.resize(aligned_length(length) as usize, 0);
    entry
}

/// Appends `table` at the end of the image and points the data directory at it.
pub fn attach_certificate_table(bytes: &mut Vec<u8>, magic: u16, table: &[u8]) -> (u32, u32) {
    let padded = bytes.len().div_ceil(8) * 8;
    bytes.resize(padded, 0);
    let address = bytes.len() as u32;
    let size = table.len() as u32;
    bytes.extend_from_slice(table);
    set_certificate_directory(bytes, magic, address, size);
    (address, size)
}

pub fn open(bytes: Vec<u8>) -> SignedPeFile<Cursor<Vec<u8>>> {
    SignedPeFile::new(Cursor::new(bytes)).expect("Failed to open an in-memory PE")
}

/// Handle whose behaviour is dictated by the payload it was extracted from:
/// `[algorithm, succeeds, id]` with algorithm 1 = SHA-1, 2 = SHA-256.
#[derive(Debug)]
pub struct ScriptedHandle {
    pub id: u8,
    pub algorithm: Option<DigestAlgorithm>,
    pub succeeds: bool,
    pub attempts: Rc<RefCell<Vec<u8>>>,
}

impl SignedDataHandle for ScriptedHandle {
    fn digest_algorithm(&self) -> Result<DigestAlgorithm, VerificationError> {
        self.algorithm
            .ok_or(VerificationError::UnsupportedDigestAlgorithm(
                ObjectIdentifier::new_unwrap("1.2.840.113549.2.5"),
            ))
    }

    fn verify(&self, expected_hash: &[u8]) -> Result<(), VerificationError> {
        self.attempts.borrow_mut().push(self.id);
        if self.succeeds {
            Ok(())
        } else {
            Err(VerificationError::InvalidAuthenticode {
                expected: format!("entry {}", self.id),
                computed: hex::encode(expected_hash),
            })
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedExtractor {
    pub attempts: Rc<RefCell<Vec<u8>>>,
}

impl SignedDataExtractor for ScriptedExtractor {
    type Handle = ScriptedHandle;

    fn extract(&self, certificate: Vec<u8>) -> Result<Self::Handle, VerificationError> {
        if certificate.len() < 3 {
            return Err(der::Error::from(der::ErrorKind::Failed).into());
        }
        Ok(ScriptedHandle {
            id: certificate[2],
            algorithm: match certificate[0] {
                1 => Some(DigestAlgorithm::Sha1),
                2 => Some(DigestAlgorithm::Sha256),
                _ => None,
            },
            succeeds: certificate[1] != 0,
            attempts: self.attempts.clone(),
        })
    }
}

pub fn scripted_payload(algorithm: u8, succeeds: bool, id: u8) -> Vec<u8> {
    vec![algorithm, u8::from(succeeds), id, 0xAA, 0x55]
}

pub fn scripted_handle(id: u8, algorithm: DigestAlgorithm, succeeds: bool) -> ScriptedHandle {
    ScriptedHandle {
        id,
        algorithm: Some(algorithm),
        succeeds,
        attempts: Rc::new(RefCell::new(Vec::new())),
    }
}

/// Records every hashing pass before delegating to the streaming one.
#[derive(Debug, Default)]
pub struct CountingFingerprinter {
    pub passes: Vec<BTreeSet<DigestAlgorithm>>,
    inner: StreamingFingerprinter,
}

impl Fingerprinter for CountingFingerprinter {
    fn authenticode_hashes<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        file_length: u64,
        exclusions: &ExclusionMap,
        algorithms: &BTreeSet<DigestAlgorithm>,
    ) -> io::Result<DigestMap> {
        self.passes.push(algorithms.clone());
        self.inner
            .authenticode_hashes(reader, file_length, exclusions, algorithms)
    }
}

/// Produces a DER encoded PKCS#7 ContentInfo signing `digest` as an
/// authenticode image digest.
pub fn create_signed_data<D, S, Signature>(
    digest: Output<D>,
    certificates: Vec<Certificate>,
    sid: SignerIdentifier,
    signer: &S,
) -> Vec<u8>
where
    D: Digest + AssociatedOid,
    S: Keypair + DynSignatureAlgorithmIdentifier,
    S::VerifyingKey: EncodePublicKey,
    S: Signer<Signature>,
    Signature: SignatureBitStringEncoding,
{
    let digest_algorithm = AlgorithmIdentifierOwned {
        oid: D::OID,
        parameters: Some(Null.into()),
    };
    let indirect_data = SpcIndirectDataContent {
        data: SpcAttributeTypeAndOptionalValue {
            content_type: SPC_PE_IMAGE_DATA_OBJID,
            value: Some(Any::encode_from(&OctetString::new([]).unwrap()).unwrap()),
        },
        message_digest: DigestInfo {
            digest_algorithm: digest_algorithm.clone(),
            digest: OctetString::new(digest.to_vec()).unwrap(),
        },
    };
    let signature_content = EncapsulatedContentInfo {
        econtent_type: SPC_INDIRECT_DATA_OBJID,
        econtent: Some(Any::encode_from(&indirect_data).unwrap()),
    };

    let mut signed_data_builder = SignedDataBuilder::new(&signature_content);
    let signer_info = SignerInfoBuilder::new(
        signer,
        sid,
        digest_algorithm.clone(),
        &signature_content,
        None,
    )
    .unwrap();

    let mut signed_data_builder = signed_data_builder
        .add_signer_info(signer_info)
        .unwrap()
        .add_digest_algorithm(digest_algorithm)
        .unwrap();

    for certificate in certificates {
        signed_data_builder = signed_data_builder
            .add_certificate(CertificateChoices::Certificate(certificate))
            .unwrap();
    }

    signed_data_builder.build().unwrap().to_der().unwrap()
}

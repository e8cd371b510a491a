use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use const_oid::db::rfc5911::ID_SIGNED_DATA;
use const_oid::AssociatedOid;
use der::asn1::OctetString;
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::{Any, Decode, Sequence};
use x509_cert::ext::pkix::SubjectKeyIdentifier;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

use crate::authenticode::DigestAlgorithm;
use crate::errors::VerificationError;

/// SPC_INDIRECT_DATA_OBJID <http://oid-info.com/get/1.3.6.1.4.1.311.2.1.4>
pub const SPC_INDIRECT_DATA_OBJID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.4");
/// <https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-oshared/1537695a-28f0-4828-8b7b-d6dab62b8030>
pub const SPC_PE_IMAGE_DATA_OBJID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.15");

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct DigestInfo {
    pub digest_algorithm: AlgorithmIdentifierOwned,
    pub digest: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcAttributeTypeAndOptionalValue {
    pub content_type: ObjectIdentifier,
    pub value: Option<Any>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcIndirectDataContent {
    pub data: SpcAttributeTypeAndOptionalValue,
    pub message_digest: DigestInfo,
}

pub trait SignedDataExt {
    fn as_spc_indirect_data_content(&self) -> Result<SpcIndirectDataContent, VerificationError>;
}

impl SignedDataExt for SignedData {
    fn as_spc_indirect_data_content(&self) -> Result<SpcIndirectDataContent, VerificationError> {
        let content_info = &self.encap_content_info;
        if content_info.econtent_type != SPC_INDIRECT_DATA_OBJID {
            return Err(VerificationError::UnexpectedContentType(
                content_info.econtent_type,
            ));
        }

        Ok(content_info
            .econtent
            .as_ref()
            .ok_or(VerificationError::MissingContent)?
            .decode_as::<SpcIndirectDataContent>()?)
    }
}

/// One signature of the certificate table, ready to be checked against a file digest.
pub trait SignedDataHandle {
    /// Algorithm of the digest this signature covers.
    fn digest_algorithm(&self) -> Result<DigestAlgorithm, VerificationError>;

    fn verify(&self, expected_hash: &[u8]) -> Result<(), VerificationError>;
}

/// Turns the payload of a `WIN_CERT_TYPE_PKCS_SIGNED_DATA` entry into a handle.
pub trait SignedDataExtractor {
    type Handle: SignedDataHandle;

    fn extract(&self, certificate: Vec<u8>) -> Result<Self::Handle, VerificationError>;
}

/// Decodes payloads as PKCS#7 `SignedData` wrapping an `SpcIndirectDataContent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmsExtractor;

impl SignedDataExtractor for CmsExtractor {
    type Handle = AuthenticodeSignedData;

    fn extract(&self, certificate: Vec<u8>) -> Result<Self::Handle, VerificationError> {
        AuthenticodeSignedData::from_der(&certificate)
    }
}

#[derive(Clone, Debug)]
pub struct AuthenticodeSignedData {
    signed_data: SignedData,
    indirect_data: SpcIndirectDataContent,
}

impl AuthenticodeSignedData {
    pub fn from_der(bytes: &[u8]) -> Result<Self, VerificationError> {
        let content_info = ContentInfo::from_der(bytes)?;
        if content_info.content_type != ID_SIGNED_DATA {
            return Err(VerificationError::NotSignedData(content_info.content_type));
        }

        let signed_data = content_info.content.decode_as::<SignedData>()?;
        let indirect_data = signed_data.as_spc_indirect_data_content()?;
        Ok(Self {
            signed_data,
            indirect_data,
        })
    }

    pub fn signed_data(&self) -> &SignedData {
        &self.signed_data
    }

    pub fn indirect_data(&self) -> &SpcIndirectDataContent {
        &self.indirect_data
    }

    /// The authenticode digest this signature was made over.
    pub fn message_digest(&self) -> &[u8] {
        self.indirect_data.message_digest.digest.as_bytes()
    }

    pub fn digest_algorithm_oid(&self) -> ObjectIdentifier {
        self.indirect_data.message_digest.digest_algorithm.oid
    }

    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.signed_data
            .certificates
            .iter()
            .flat_map(|set| set.0.iter())
            .filter_map(|choice| match choice {
                CertificateChoices::Certificate(certificate) => Some(certificate),
                _ => None,
            })
    }

    pub fn signer_info(&self) -> Option<&SignerInfo> {
        self.signed_data.signer_infos.0.iter().next()
    }

    pub fn signer_certificate(&self, sid: &SignerIdentifier) -> Option<&Certificate> {
        self.certificates().find(|certificate| {
            let tbs = &certificate.tbs_certificate;
            match sid {
                SignerIdentifier::IssuerAndSerialNumber(issuer) => {
                    tbs.issuer == issuer.issuer && tbs.serial_number == issuer.serial_number
                }
                SignerIdentifier::SubjectKeyIdentifier(ski) => {
                    subject_key_identifier(certificate).as_ref() == Some(ski)
                }
            }
        })
    }
}

fn subject_key_identifier(certificate: &Certificate) -> Option<SubjectKeyIdentifier> {
    certificate
        .tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|extension| extension.extn_id == SubjectKeyIdentifier::OID)
        .and_then(|extension| SubjectKeyIdentifier::from_der(extension.extn_value.as_bytes()).ok())
}

impl SignedDataHandle for AuthenticodeSignedData {
    fn digest_algorithm(&self) -> Result<DigestAlgorithm, VerificationError> {
        let oid = self.digest_algorithm_oid();
        DigestAlgorithm::from_oid(&oid).ok_or(VerificationError::UnsupportedDigestAlgorithm(oid))
    }

    /// Checks the signer layout and that `expected_hash` is the digest this
    /// signature was made over. The signature value and the trust chain are
    /// left to the caller.
    fn verify(&self, expected_hash: &[u8]) -> Result<(), VerificationError> {
        let signer_infos = &self.signed_data.signer_infos.0;
        if signer_infos.len() != 1 {
            return Err(VerificationError::SignerInfoCount(signer_infos.len()));
        }
        let signer_info = self
            .signer_info()
            .ok_or(VerificationError::SignerInfoCount(0))?;

        let authenticode = self.digest_algorithm_oid();
        if signer_info.digest_alg.oid != authenticode {
            return Err(VerificationError::DigestAlgorithmMismatch {
                signer: signer_info.digest_alg.oid,
                authenticode,
            });
        }
        self.digest_algorithm()?;

        if self.message_digest() != expected_hash {
            return Err(VerificationError::InvalidAuthenticode {
                expected: hex::encode(self.message_digest()),
                computed: hex::encode(expected_hash),
            });
        }

        if self.certificates().next().is_none() {
            return Err(VerificationError::NoCertificate);
        }
        if self.signer_certificate(&signer_info.sid).is_none() {
            return Err(VerificationError::MissingCertificate(Box::new(
                signer_info.sid.clone(),
            )));
        }

        Ok(())
    }
}

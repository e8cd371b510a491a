use std::io::{self, Read, Seek};

use log::trace;

use crate::certificate::SignedDataExtractor;
use crate::certificate_table::{
    CertificateEntries, WIN_CERT_REVISION_2_0, WIN_CERT_TYPE_PKCS_SIGNED_DATA,
};
use crate::errors::{ParseError, VerificationError};
use crate::pe::{locate_exclusion_ranges, stream_length, ExclusionKind, ExclusionMap};

/// A PE file opened for Authenticode inspection.
///
/// Every operation repositions the underlying handle with absolute seeks
/// before reading, hence `&mut self` everywhere.
pub struct SignedPeFile<R> {
    reader: R,
    file_length: u64,
}

impl<R: Read + Seek> SignedPeFile<R> {
    pub fn new(mut reader: R) -> io::Result<Self> {
        let file_length = stream_length(&mut reader)?;
        Ok(Self {
            reader,
            file_length,
        })
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub(crate) fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Ranges Authenticode leaves out of the digest. Recomputed on every call.
    pub fn exclusion_ranges(&mut self) -> Result<ExclusionMap, ParseError> {
        locate_exclusion_ranges(&mut self.reader, self.file_length)
    }

    /// Like [`Self::exclusion_ranges`], but a file that does not parse as PE
    /// just has no ranges.
    pub fn authenticode_omit_sections(&mut self) -> Option<ExclusionMap> {
        self.exclusion_ranges().ok()
    }

    /// Walks the certificate table. Fails upfront when the file has none.
    pub fn certificate_entries(&mut self) -> Result<CertificateEntries<'_, R>, ParseError> {
        let table = self
            .exclusion_ranges()?
            .get(ExclusionKind::CertTable)
            .ok_or(ParseError::NoCertificateTable)?;

        Ok(CertificateEntries::new(
            &mut self.reader,
            self.file_length,
            table,
        ))
    }

    /// Signed data of every `WIN_CERT_TYPE_PKCS_SIGNED_DATA` entry, decoded
    /// by `extractor` one entry at a time.
    pub fn signed_datas<'f, E: SignedDataExtractor>(
        &'f mut self,
        extractor: &'f E,
    ) -> Result<SignedDatas<'f, R, E>, ParseError> {
        Ok(SignedDatas {
            entries: self.certificate_entries()?,
            extractor,
            found: false,
            done: false,
        })
    }
}

pub struct SignedDatas<'f, R, E> {
    entries: CertificateEntries<'f, R>,
    extractor: &'f E,
    found: bool,
    done: bool,
}

impl<'f, R, E> SignedDatas<'f, R, E>
where
    R: Read + Seek,
    E: SignedDataExtractor,
{
    fn next_handle(&mut self) -> Option<Result<E::Handle, VerificationError>> {
        for entry in self.entries.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err.into())),
            };

            if entry.revision != WIN_CERT_REVISION_2_0 {
                return Some(Err(ParseError::UnknownRevision(entry.revision).into()));
            }
            if entry.certificate_type != WIN_CERT_TYPE_PKCS_SIGNED_DATA {
                trace!(
                    "Skipping certificate table entry of type {:#x}",
                    entry.certificate_type
                );
                continue;
            }

            self.found = true;
            return Some(self.extractor.extract(entry.certificate));
        }

        if self.found {
            None
        } else {
            Some(Err(ParseError::NoSignedData.into()))
        }
    }
}

impl<'f, R, E> Iterator for SignedDatas<'f, R, E>
where
    R: Read + Seek,
    E: SignedDataExtractor,
{
    type Item = Result<E::Handle, VerificationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let item = self.next_handle();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

//! Walks the attribute certificate table referenced by the security data directory.
//! See <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format#the-attribute-certificate-table-image-only>
use std::io::{Read, Seek};

use goblin::pe::certificate_table::{AttributeCertificateRevision, AttributeCertificateType};
use scroll::{IOread, SizeWith};

use crate::errors::ParseError;
use crate::pe::{read_at, read_bytes_at, RelativeRange};

/// WIN_CERT_REVISION_2_0
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;
/// WIN_CERT_TYPE_PKCS_SIGNED_DATA
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

/// WIN_CERTIFICATE without its trailing `bCertificate`
#[derive(Debug, Clone, Copy, IOread, SizeWith)]
pub struct WindowsCertificateHeader {
    /// dwLength, header included
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
}

pub const HEADER_SIZE: u32 = 8;

/// Advance applied after an entry of `length` bytes.
///
/// This always pads, even when `length` is already a multiple of 8: this is
/// what the table walk has to do to stay in step with existing signed images.
pub fn aligned_length(length: u32) -> u64 {
    u64::from(length) + (8 - u64::from(length % 8))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateTableEntry {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
    pub certificate: Vec<u8>,
}

impl CertificateTableEntry {
    pub fn attribute_revision(&self) -> Option<AttributeCertificateRevision> {
        AttributeCertificateRevision::try_from(self.revision).ok()
    }

    pub fn attribute_type(&self) -> Option<AttributeCertificateType> {
        AttributeCertificateType::try_from(self.certificate_type).ok()
    }

    pub fn is_pkcs_signed_data(&self) -> bool {
        matches!(
            self.attribute_type(),
            Some(AttributeCertificateType::PkcsSignedData)
        )
    }
}

/// Lazy walk over the certificate table, see
/// [`crate::SignedPeFile::certificate_entries`].
///
/// Every entry is read through an absolute seek, so nothing but `position`
/// has to survive between two calls to `next`. The walk stops for good after
/// the first error.
pub struct CertificateEntries<'f, R> {
    reader: &'f mut R,
    file_length: u64,
    table_end: u64,
    position: u64,
    done: bool,
}

impl<'f, R: Read + Seek> CertificateEntries<'f, R> {
    pub fn new(reader: &'f mut R, file_length: u64, table: RelativeRange) -> Self {
        Self {
            reader,
            file_length,
            table_end: table.end(),
            position: table.start,
            done: false,
        }
    }

    /// Offset of the next entry to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn read_entry(&mut self) -> Result<CertificateTableEntry, ParseError> {
        let position = self.position;
        let header_end = position + u64::from(HEADER_SIZE);
        if header_end > self.file_length || header_end > self.table_end {
            return Err(ParseError::EntryBeyondFileLength(position));
        }

        let header: WindowsCertificateHeader =
            read_at(self.reader, position, "certificate header")?;
        // Also rules out a negative payload read.
        if header.length <= HEADER_SIZE {
            return Err(ParseError::InvalidEntryLength(header.length));
        }
        if position + u64::from(header.length) > self.table_end {
            return Err(ParseError::EntryExceedsTable {
                position,
                length: header.length,
                table_end: self.table_end,
            });
        }

        let mut certificate = vec![0u8; (header.length - HEADER_SIZE) as usize];
        read_bytes_at(self.reader, header_end, &mut certificate, "certificate data")?;

        self.position += aligned_length(header.length);
        Ok(CertificateTableEntry {
            length: header.length,
            revision: header.revision,
            certificate_type: header.certificate_type,
            certificate,
        })
    }
}

impl<'f, R: Read + Seek> Iterator for CertificateEntries<'f, R> {
    type Item = Result<CertificateTableEntry, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.table_end {
            return None;
        }

        let entry = self.read_entry();
        if entry.is_err() {
            self.done = true;
        }
        Some(entry)
    }
}

//! Discovery of the byte ranges that Authenticode leaves out of the image digest.
//!
//! Only the handful of PE/COFF fields needed for that are read:
//! <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format>

use std::io::{self, Read, Seek, SeekFrom};

use log::debug;
use scroll::{IOread, LE};

use crate::errors::ParseError;

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_MAGIC: &[u8; 4] = b"PE\0\0";
/// Offset of `e_lfanew` in the DOS header.
const PE_POINTER_OFFSET: u64 = 0x3C;
/// IMAGE_NT_OPTIONAL_HDR32_MAGIC
pub const OPTIONAL_HEADER_MAGIC_PE32: u16 = 0x10B;
/// IMAGE_NT_OPTIONAL_HDR64_MAGIC
pub const OPTIONAL_HEADER_MAGIC_PE32_PLUS: u16 = 0x20B;
/// Smallest optional header that still holds the checksum field.
pub const MIN_OPTIONAL_HEADER_SIZE: u16 = 68;
/// The certificate table is the fifth data directory.
const CERTIFICATE_TABLE_DIRECTORY_INDEX: u32 = 4;

/// A span of bytes inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativeRange {
    pub start: u64,
    pub length: u32,
}

impl RelativeRange {
    pub fn new(start: u64, length: u32) -> Self {
        Self { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + u64::from(self.length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExclusionKind {
    /// `CheckSum` field of the optional header
    Checksum,
    /// Certificate table entry of the data directory
    DataDirCertTable,
    /// The certificate table itself
    CertTable,
}

impl ExclusionKind {
    pub const ALL: [ExclusionKind; 3] = [
        ExclusionKind::Checksum,
        ExclusionKind::DataDirCertTable,
        ExclusionKind::CertTable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionKind::Checksum => "checksum",
            ExclusionKind::DataDirCertTable => "datadir_certtable",
            ExclusionKind::CertTable => "certtable",
        }
    }
}

/// The ranges found by [`locate_exclusion_ranges`].
///
/// A kind is only present when the matching structure was found and made sense,
/// so a partial map is a perfectly valid answer for an unsigned binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionMap {
    checksum: Option<RelativeRange>,
    datadir_certtable: Option<RelativeRange>,
    certtable: Option<RelativeRange>,
}

impl ExclusionMap {
    pub fn get(&self, kind: ExclusionKind) -> Option<RelativeRange> {
        match kind {
            ExclusionKind::Checksum => self.checksum,
            ExclusionKind::DataDirCertTable => self.datadir_certtable,
            ExclusionKind::CertTable => self.certtable,
        }
    }

    pub fn contains(&self, kind: ExclusionKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn checksum(&self) -> Option<RelativeRange> {
        self.checksum
    }

    pub fn datadir_certtable(&self) -> Option<RelativeRange> {
        self.datadir_certtable
    }

    pub fn certtable(&self) -> Option<RelativeRange> {
        self.certtable
    }

    pub fn len(&self) -> usize {
        self.kinds().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kinds present in the map, in declaration order.
    pub fn kinds(&self) -> impl Iterator<Item = ExclusionKind> + '_ {
        ExclusionKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }

    /// Present ranges sorted by their start offset.
    pub fn ranges(&self) -> Vec<(ExclusionKind, RelativeRange)> {
        let mut ranges: Vec<_> = ExclusionKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|range| (kind, range)))
            .collect();
        ranges.sort_by_key(|(_, range)| range.start);
        ranges
    }

    fn insert(&mut self, kind: ExclusionKind, range: RelativeRange) {
        let slot = match kind {
            ExclusionKind::Checksum => &mut self.checksum,
            ExclusionKind::DataDirCertTable => &mut self.datadir_certtable,
            ExclusionKind::CertTable => &mut self.certtable,
        };
        *slot = Some(range);
    }
}

/// Seeks to `offset` and reads a little endian scalar, mapping short reads to
/// [`ParseError::Truncated`].
pub(crate) fn read_at<R, N>(
    reader: &mut R,
    offset: u64,
    what: &'static str,
) -> Result<N, ParseError>
where
    R: Read + Seek,
    N: scroll::ctx::FromCtx<scroll::Endian> + scroll::ctx::SizeWith<scroll::Endian>,
{
    reader.seek(SeekFrom::Start(offset))?;
    reader.ioread_with::<N>(LE).map_err(|err| truncated(err, what, offset))
}

pub(crate) fn read_bytes_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), ParseError> {
    reader.seek(SeekFrom::Start(offset))?;
    reader
        .read_exact(buf)
        .map_err(|err| truncated(err, what, offset))
}

fn truncated(err: io::Error, what: &'static str, offset: u64) -> ParseError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ParseError::Truncated { what, offset }
    } else {
        ParseError::Io(err)
    }
}

/// Returns the total length of a seekable stream.
pub fn stream_length<R: Seek>(reader: &mut R) -> io::Result<u64> {
    reader.seek(SeekFrom::End(0))
}

/// Finds the checksum, the certificate table data directory entry and the
/// certificate table of a PE image.
///
/// Only a file that is not PE/COFF at all yields an error; a missing or
/// nonsensical certificate table just leaves the corresponding kinds out.
pub fn locate_exclusion_ranges<R: Read + Seek>(
    reader: &mut R,
    file_length: u64,
) -> Result<ExclusionMap, ParseError> {
    let mut map = ExclusionMap::default();

    let mut dos_magic = [0u8; 2];
    read_bytes_at(reader, 0, &mut dos_magic, "DOS header")?;
    if &dos_magic != DOS_MAGIC {
        return Err(ParseError::MissingDosHeader);
    }

    let pe_offset = u64::from(read_at::<_, u32>(reader, PE_POINTER_OFFSET, "e_lfanew")?);
    if pe_offset >= file_length {
        return Err(ParseError::PeHeaderOutOfBounds {
            offset: pe_offset,
            file_length,
        });
    }

    let mut pe_magic = [0u8; 4];
    read_bytes_at(reader, pe_offset, &mut pe_magic, "PE signature")?;
    if &pe_magic != PE_MAGIC {
        return Err(ParseError::MissingPeHeader);
    }

    let optional_header_size: u16 = read_at(reader, pe_offset + 20, "SizeOfOptionalHeader")?;
    let optional_header_offset = pe_offset + 24;
    let optional_header_end = optional_header_offset + u64::from(optional_header_size);
    if optional_header_end > file_length {
        // Windows may still load this, but it cannot carry signed data.
        return Err(ParseError::OptionalHeaderOutOfBounds {
            offset: optional_header_offset,
            size: optional_header_size,
            file_length,
        });
    }
    if optional_header_size < MIN_OPTIONAL_HEADER_SIZE {
        return Err(ParseError::OptionalHeaderTooSmall(optional_header_size));
    }

    let magic: u16 = read_at(reader, optional_header_offset, "optional header magic")?;
    let (rva_base, cert_base) = match magic {
        // NumberOfRvaAndSizes, certificate table directory entry
        OPTIONAL_HEADER_MAGIC_PE32 => (optional_header_offset + 92, optional_header_offset + 128),
        OPTIONAL_HEADER_MAGIC_PE32_PLUS => {
            (optional_header_offset + 108, optional_header_offset + 144)
        }
        other => return Err(ParseError::UnknownOptionalHeaderMagic(other)),
    };

    map.insert(
        ExclusionKind::Checksum,
        RelativeRange::new(optional_header_offset + 64, 4),
    );

    if optional_header_end < rva_base + 4 {
        debug!("The optional header size cannot accommodate the NumberOfRvaAndSizes field");
        return Ok(map);
    }
    let number_of_rva: u32 = read_at(reader, rva_base, "NumberOfRvaAndSizes")?;
    if number_of_rva <= CERTIFICATE_TABLE_DIRECTORY_INDEX {
        debug!(
            "The data directory has no certificate table entry; NumberOfRvaAndSizes = {}",
            number_of_rva
        );
        return Ok(map);
    }
    if optional_header_end < cert_base + 8 {
        debug!("The optional header size cannot accommodate the certificate table directory entry");
        return Ok(map);
    }

    map.insert(
        ExclusionKind::DataDirCertTable,
        RelativeRange::new(cert_base, 8),
    );

    let address: u32 = read_at(reader, cert_base, "certificate table address")?;
    let size: u32 = read_at(reader, cert_base + 4, "certificate table size")?;
    if size == 0 {
        debug!("The certificate table is empty");
        return Ok(map);
    }

    let table = RelativeRange::new(u64::from(address), size);
    if table.start < optional_header_end || table.end() > file_length {
        debug!(
            "The location of the certificate table makes no sense, it is either beyond the \
             boundaries of the file or in the middle of the PE header; \
             VirtualAddress: {:#x}, Size: {:#x}",
            address, size
        );
        return Ok(map);
    }

    map.insert(ExclusionKind::CertTable, table);
    Ok(map)
}

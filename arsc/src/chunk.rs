use anyhow::{ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::trace;

use crate::io;
use crate::pool::StringPoolChunk;
use crate::table::{LibraryChunk, PackageChunk, TableChunk, TypeChunk, TypeSpecChunk};
use crate::xml::{
    XmlCdataChunk, XmlChunk, XmlEndElementChunk, XmlNamespaceChunk, XmlResourceMapChunk,
    XmlStartElementChunk,
};

/// Bytes taken by the `type, header_size, chunk_size` frame every chunk
/// starts with.
pub const METADATA_SIZE: u16 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    Null = 0x0000,
    StringPool = 0x0001,
    Table = 0x0002,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlCdata = 0x0104,
    XmlResourceMap = 0x0180,
    TablePackage = 0x0200,
    TableType = 0x0201,
    TableTypeSpec = 0x0202,
    TableLibrary = 0x0203,
    TableOverlayable = 0x0204,
    TableOverlayablePolicy = 0x0205,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            ty if ty == ChunkType::Null as u16 => ChunkType::Null,
            ty if ty == ChunkType::StringPool as u16 => ChunkType::StringPool,
            ty if ty == ChunkType::Table as u16 => ChunkType::Table,
            ty if ty == ChunkType::Xml as u16 => ChunkType::Xml,
            ty if ty == ChunkType::XmlStartNamespace as u16 => ChunkType::XmlStartNamespace,
            ty if ty == ChunkType::XmlEndNamespace as u16 => ChunkType::XmlEndNamespace,
            ty if ty == ChunkType::XmlStartElement as u16 => ChunkType::XmlStartElement,
            ty if ty == ChunkType::XmlEndElement as u16 => ChunkType::XmlEndElement,
            ty if ty == ChunkType::XmlCdata as u16 => ChunkType::XmlCdata,
            ty if ty == ChunkType::XmlResourceMap as u16 => ChunkType::XmlResourceMap,
            ty if ty == ChunkType::TablePackage as u16 => ChunkType::TablePackage,
            ty if ty == ChunkType::TableType as u16 => ChunkType::TableType,
            ty if ty == ChunkType::TableTypeSpec as u16 => ChunkType::TableTypeSpec,
            ty if ty == ChunkType::TableLibrary as u16 => ChunkType::TableLibrary,
            ty if ty == ChunkType::TableOverlayable as u16 => ChunkType::TableOverlayable,
            ty if ty == ChunkType::TableOverlayablePolicy as u16 => {
                ChunkType::TableOverlayablePolicy
            }
            _ => return None,
        })
    }
}

/// Flags threaded into every chunk's serialization.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SerializeOptions(u32);

impl SerializeOptions {
    pub const NONE: Self = Self(0);
    /// Re-share identical strings and styles in every string pool.
    pub const SHRINK: Self = Self(1);
    /// Clear the public flag on entries and the public bit in type-spec
    /// configuration masks.
    pub const PRIVATE_RESOURCES: Self = Self(2);

    pub fn shrink(self) -> bool {
        self.0 & Self::SHRINK.0 != 0
    }

    pub fn strip_public(self) -> bool {
        self.0 & Self::PRIVATE_RESOURCES.0 != 0
    }
}

impl std::ops::BitOr for SerializeOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The frame read off the front of every chunk, plus where it started.
/// Child constructors use `start` to resolve intra-chunk offsets.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChunkHeader {
    pub type_code: u16,
    pub header_size: u16,
    pub size: u32,
    pub start: u64,
}

impl ChunkHeader {
    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }
}

/// Emits the chunk frame up front and patches the 32-bit chunk-size slot
/// once the payload has been written, since the size is not known until
/// then.
pub(crate) struct ChunkWriter {
    start: u64,
    header_size: u16,
}

impl ChunkWriter {
    pub fn begin(w: &mut (impl Write + Seek), type_code: u16, header_size: u16) -> Result<Self> {
        let start = w.stream_position()?;
        w.write_u16::<LittleEndian>(type_code)?;
        w.write_u16::<LittleEndian>(header_size)?;
        w.write_u32::<LittleEndian>(0)?;
        Ok(Self { start, header_size })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Zero-fills whatever remains of the declared header after the typed
    /// fields. Headers can be larger than the fields a format version
    /// defines.
    pub fn pad_header(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let pos = w.stream_position()?;
        for _ in pos..self.start + self.header_size as u64 {
            w.write_u8(0)?;
        }
        Ok(())
    }

    /// Checks that the header fields written so far add up to the declared
    /// header size.
    pub fn end_header(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let written = w.stream_position()? - self.start;
        ensure!(
            written == self.header_size as u64,
            "malformed header: wrote {} bytes but header size is {}",
            written,
            self.header_size
        );
        Ok(())
    }

    /// Overwrites a 32-bit slot at `offset` from the chunk start; used for
    /// header fields whose value is only known after the payload exists.
    pub fn patch_u32(&self, w: &mut (impl Write + Seek), offset: u64, value: u32) -> Result<()> {
        let pos = w.stream_position()?;
        w.seek(SeekFrom::Start(self.start + offset))?;
        w.write_u32::<LittleEndian>(value)?;
        w.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn finish(self, w: &mut (impl Write + Seek)) -> Result<()> {
        io::write_padding(w)?;
        let size = w.stream_position()? - self.start;
        self.patch_u32(w, 4, size as u32)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    StringPool(StringPoolChunk),
    Table(TableChunk),
    Xml(XmlChunk),
    XmlStartNamespace(XmlNamespaceChunk),
    XmlEndNamespace(XmlNamespaceChunk),
    XmlStartElement(XmlStartElementChunk),
    XmlEndElement(XmlEndElementChunk),
    XmlCdata(XmlCdataChunk),
    XmlResourceMap(XmlResourceMapChunk),
    TablePackage(PackageChunk),
    TableType(TypeChunk),
    TableTypeSpec(TypeSpecChunk),
    TableLibrary(LibraryChunk),
    Unknown(UnknownChunk),
}

impl Chunk {
    pub fn parse(r: &mut (impl Read + Seek)) -> Result<Self> {
        let start = r.stream_position()?;
        let type_code = r.read_u16::<LittleEndian>()?;
        let header_size = r.read_u16::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        ensure!(
            header_size >= METADATA_SIZE && size >= header_size as u32,
            "malformed chunk frame: header size {}, chunk size {}",
            header_size,
            size
        );
        let header = ChunkHeader {
            type_code,
            header_size,
            size,
            start,
        };
        let chunk = match ChunkType::from_u16(type_code) {
            Some(ChunkType::StringPool) => {
                trace!("string pool");
                Chunk::StringPool(StringPoolChunk::parse(r, header)?)
            }
            Some(ChunkType::Table) => {
                trace!("table");
                Chunk::Table(TableChunk::parse(r, header)?)
            }
            Some(ChunkType::Xml) => {
                trace!("xml");
                Chunk::Xml(XmlChunk::parse(r, header)?)
            }
            Some(ChunkType::XmlStartNamespace) => {
                trace!("xml start namespace");
                Chunk::XmlStartNamespace(XmlNamespaceChunk::parse(r, header)?)
            }
            Some(ChunkType::XmlEndNamespace) => {
                trace!("xml end namespace");
                Chunk::XmlEndNamespace(XmlNamespaceChunk::parse(r, header)?)
            }
            Some(ChunkType::XmlStartElement) => {
                trace!("xml start element");
                Chunk::XmlStartElement(XmlStartElementChunk::parse(r, header)?)
            }
            Some(ChunkType::XmlEndElement) => {
                trace!("xml end element");
                Chunk::XmlEndElement(XmlEndElementChunk::parse(r, header)?)
            }
            Some(ChunkType::XmlCdata) => {
                trace!("xml cdata");
                Chunk::XmlCdata(XmlCdataChunk::parse(r, header)?)
            }
            Some(ChunkType::XmlResourceMap) => {
                trace!("xml resource map");
                Chunk::XmlResourceMap(XmlResourceMapChunk::parse(r, header)?)
            }
            Some(ChunkType::TablePackage) => {
                trace!("table package");
                Chunk::TablePackage(PackageChunk::parse(r, header)?)
            }
            Some(ChunkType::TableType) => {
                trace!("table type");
                Chunk::TableType(TypeChunk::parse(r, header)?)
            }
            Some(ChunkType::TableTypeSpec) => {
                trace!("table type spec");
                Chunk::TableTypeSpec(TypeSpecChunk::parse(r, header)?)
            }
            Some(ChunkType::TableLibrary) => {
                trace!("table library");
                Chunk::TableLibrary(LibraryChunk::parse(r, header)?)
            }
            // Chunks with no model surface keep their bytes verbatim.
            Some(ChunkType::Null)
            | Some(ChunkType::TableOverlayable)
            | Some(ChunkType::TableOverlayablePolicy)
            | None => {
                trace!("opaque chunk 0x{:04x}", type_code);
                Chunk::Unknown(UnknownChunk::parse(r, header)?)
            }
        };
        r.seek(SeekFrom::Start(header.end()))?;
        Ok(chunk)
    }

    pub fn write(&self, w: &mut (impl Write + Seek), options: SerializeOptions) -> Result<()> {
        match self {
            Chunk::StringPool(chunk) => chunk.write(w, options),
            Chunk::Table(chunk) => chunk.write(w, options),
            Chunk::Xml(chunk) => chunk.write(w, options),
            Chunk::XmlStartNamespace(chunk) => chunk.write(w, ChunkType::XmlStartNamespace),
            Chunk::XmlEndNamespace(chunk) => chunk.write(w, ChunkType::XmlEndNamespace),
            Chunk::XmlStartElement(chunk) => chunk.write(w),
            Chunk::XmlEndElement(chunk) => chunk.write(w),
            Chunk::XmlCdata(chunk) => chunk.write(w),
            Chunk::XmlResourceMap(chunk) => chunk.write(w),
            Chunk::TablePackage(chunk) => chunk.write(w, options),
            Chunk::TableType(chunk) => chunk.write(w, options),
            Chunk::TableTypeSpec(chunk) => chunk.write(w, options),
            Chunk::TableLibrary(chunk) => chunk.write(w),
            Chunk::Unknown(chunk) => chunk.write(w),
        }
    }
}

/// A chunk the model has no mutation surface for. Header body and payload
/// are preserved byte-for-byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownChunk {
    pub type_code: u16,
    header_size: u16,
    header: Vec<u8>,
    payload: Vec<u8>,
}

impl UnknownChunk {
    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let mut header_body = vec![0; header.header_size as usize - METADATA_SIZE as usize];
        r.read_exact(&mut header_body)?;
        let mut payload = vec![0; header.size as usize - header.header_size as usize];
        r.read_exact(&mut payload)?;
        Ok(Self {
            type_code: header.type_code,
            header_size: header.header_size,
            header: header_body,
            payload,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let chunk = ChunkWriter::begin(w, self.type_code, self.header_size)?;
        w.write_all(&self.header)?;
        chunk.end_header(w)?;
        w.write_all(&self.payload)?;
        chunk.finish(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn options_combine() {
        let options = SerializeOptions::SHRINK | SerializeOptions::PRIVATE_RESOURCES;
        assert!(options.shrink());
        assert!(options.strip_public());
        assert!(!SerializeOptions::NONE.shrink());
    }

    #[test]
    fn unknown_chunk_preserves_bytes() {
        let mut bytes = Vec::new();
        // type 0x0204, header size 12, chunk size 20
        bytes.extend_from_slice(&[0x04, 0x02, 0x0c, 0x00, 0x14, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let chunk = Chunk::parse(&mut Cursor::new(bytes.as_slice())).unwrap();
        assert!(matches!(chunk, Chunk::Unknown(_)));
        let mut w = Cursor::new(Vec::new());
        chunk.write(&mut w, SerializeOptions::NONE).unwrap();
        assert_eq!(w.into_inner(), bytes);
    }
}

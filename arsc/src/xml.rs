use anyhow::{bail, Context as _, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::chunk::{Chunk, ChunkHeader, ChunkType, ChunkWriter, SerializeOptions};
use crate::pool::StringPoolChunk;
use crate::value::{ResTableRef, ResValue, ResValueType};

/// A compiled XML document: a string pool, usually a resource map, and the
/// stream of node chunks.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XmlChunk {
    chunks: Vec<Chunk>,
}

impl XmlChunk {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        let mut chunks = Vec::new();
        while r.stream_position()? < header.end() {
            chunks.push(Chunk::parse(r)?);
        }
        Ok(Self { chunks })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek), options: SerializeOptions) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::Xml as u16, crate::chunk::METADATA_SIZE)?;
        chunk.end_header(w)?;
        for child in &self.chunks {
            child.write(w, options)?;
        }
        chunk.finish(w)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut Vec<Chunk> {
        &mut self.chunks
    }

    pub fn add_chunk(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    /// The document's string pool; every index in the node chunks resolves
    /// against it.
    pub fn string_pool(&self) -> Result<&StringPoolChunk> {
        self.chunks
            .iter()
            .find_map(|chunk| match chunk {
                Chunk::StringPool(pool) => Some(pool),
                _ => None,
            })
            .context("xml document has no string pool")
    }

    pub fn resource_map(&self) -> Option<&XmlResourceMapChunk> {
        self.chunks.iter().find_map(|chunk| match chunk {
            Chunk::XmlResourceMap(map) => Some(map),
            _ => None,
        })
    }
}

/// Common trailer of every XML node chunk header: the source line it came
/// from and an optional comment string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XmlNodeHeader {
    pub line_number: u32,
    /// Pool index of the comment, -1 when there is none.
    pub comment_index: i32,
}

impl XmlNodeHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let line_number = r.read_u32::<LittleEndian>()?;
        let comment_index = r.read_i32::<LittleEndian>()?;
        Ok(Self {
            line_number,
            comment_index,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.line_number)?;
        w.write_i32::<LittleEndian>(self.comment_index)?;
        Ok(())
    }
}

impl Default for XmlNodeHeader {
    fn default() -> Self {
        Self {
            line_number: 1,
            comment_index: -1,
        }
    }
}

/// Start or end of a namespace scope; the chunk type code tells which.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XmlNamespaceChunk {
    header_size: u16,
    pub node: XmlNodeHeader,
    pub prefix_index: i32,
    pub uri_index: i32,
}

impl XmlNamespaceChunk {
    const HEADER_SIZE: u16 = 16;

    pub fn new(prefix_index: i32, uri_index: i32) -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            node: XmlNodeHeader::default(),
            prefix_index,
            uri_index,
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let node = XmlNodeHeader::read(r)?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        Ok(Self {
            header_size: header.header_size,
            node,
            prefix_index: r.read_i32::<LittleEndian>()?,
            uri_index: r.read_i32::<LittleEndian>()?,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek), ty: ChunkType) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ty as u16, self.header_size)?;
        self.node.write(w)?;
        chunk.end_header(w)?;
        w.write_i32::<LittleEndian>(self.prefix_index)?;
        w.write_i32::<LittleEndian>(self.uri_index)?;
        chunk.finish(w)
    }
}

/// Element start tag with its interned attributes.
///
/// The id/class/style indices are exposed 0-based with -1 meaning absent;
/// the wire stores them 1-based with 0 meaning absent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XmlStartElementChunk {
    header_size: u16,
    pub node: XmlNodeHeader,
    pub namespace_index: i32,
    pub name_index: u32,
    pub id_index: i32,
    pub class_index: i32,
    pub style_index: i32,
    pub attributes: Vec<XmlAttribute>,
}

impl XmlStartElementChunk {
    const HEADER_SIZE: u16 = 16;
    /// Offset from the element header to the attribute array, and the size
    /// of each attribute record. The format admits no other values.
    const ATTRIBUTE_START: u16 = 20;
    const ATTRIBUTE_SIZE: u16 = 20;

    const SYSTEM_PACKAGE_ID: u32 = 0x01;

    pub fn new(namespace_index: i32, name_index: u32) -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            node: XmlNodeHeader::default(),
            namespace_index,
            name_index,
            id_index: -1,
            class_index: -1,
            style_index: -1,
            attributes: Vec::new(),
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let node = XmlNodeHeader::read(r)?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        let element_start = r.stream_position()?;
        let namespace_index = r.read_i32::<LittleEndian>()?;
        let name_index = r.read_u32::<LittleEndian>()?;
        let attribute_start = r.read_u16::<LittleEndian>()?;
        let attribute_size = r.read_u16::<LittleEndian>()?;
        let attribute_count = r.read_u16::<LittleEndian>()?;
        let id_index = r.read_u16::<LittleEndian>()?;
        let class_index = r.read_u16::<LittleEndian>()?;
        let style_index = r.read_u16::<LittleEndian>()?;
        debug_assert_eq!(attribute_start, Self::ATTRIBUTE_START);
        debug_assert_eq!(attribute_size, Self::ATTRIBUTE_SIZE);
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for index in 0..attribute_count {
            r.seek(SeekFrom::Start(
                element_start + attribute_start as u64 + index as u64 * attribute_size as u64,
            ))?;
            attributes.push(XmlAttribute::read(r)?);
        }
        Ok(Self {
            header_size: header.header_size,
            node,
            namespace_index,
            name_index,
            id_index: id_index as i32 - 1,
            class_index: class_index as i32 - 1,
            style_index: style_index as i32 - 1,
            attributes,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::XmlStartElement as u16, self.header_size)?;
        self.node.write(w)?;
        chunk.end_header(w)?;
        w.write_i32::<LittleEndian>(self.namespace_index)?;
        w.write_u32::<LittleEndian>(self.name_index)?;
        w.write_u16::<LittleEndian>(Self::ATTRIBUTE_START)?;
        w.write_u16::<LittleEndian>(Self::ATTRIBUTE_SIZE)?;
        w.write_u16::<LittleEndian>(self.attributes.len() as u16)?;
        w.write_u16::<LittleEndian>((self.id_index + 1) as u16)?;
        w.write_u16::<LittleEndian>((self.class_index + 1) as u16)?;
        w.write_u16::<LittleEndian>((self.style_index + 1) as u16)?;
        for attribute in &self.attributes {
            attribute.write(w)?;
        }
        chunk.finish(w)
    }

    /// Resolves the element name through the document pool.
    pub fn name<'a>(&self, document: &'a XmlChunk) -> Result<&'a str> {
        document.string_pool()?.get(self.name_index)
    }

    /// Rewrites attribute values of type REFERENCE through `references`.
    /// References into the system package (top byte 0x01) are left alone.
    pub fn remap_references(&mut self, references: &HashMap<u32, u32>) {
        for attribute in &mut self.attributes {
            let value = &mut attribute.typed_value;
            if value.data_type != ResValueType::Reference as u8 {
                continue;
            }
            if value.data >> 24 == Self::SYSTEM_PACKAGE_ID {
                continue;
            }
            if let Some(&new) = references.get(&value.data) {
                value.data = new;
            }
        }
    }
}

/// One interned attribute of a start element.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XmlAttribute {
    pub namespace_index: i32,
    pub name_index: u32,
    /// Pool index of the raw value text, -1 when the value is typed only.
    pub raw_value_index: i32,
    pub typed_value: ResValue,
}

impl XmlAttribute {
    /// Wire size of one attribute record.
    pub const SIZE: u16 = 20;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        Ok(Self {
            namespace_index: r.read_i32::<LittleEndian>()?,
            name_index: r.read_u32::<LittleEndian>()?,
            raw_value_index: r.read_i32::<LittleEndian>()?,
            typed_value: ResValue::read(r)?,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace_index)?;
        w.write_u32::<LittleEndian>(self.name_index)?;
        w.write_i32::<LittleEndian>(self.raw_value_index)?;
        self.typed_value.write(w)
    }

    pub fn name<'a>(&self, document: &'a XmlChunk) -> Result<&'a str> {
        document.string_pool()?.get(self.name_index)
    }

    pub fn raw_value<'a>(&self, document: &'a XmlChunk) -> Result<Option<&'a str>> {
        if self.raw_value_index < 0 {
            return Ok(None);
        }
        document
            .string_pool()?
            .get(self.raw_value_index as u32)
            .map(Some)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XmlEndElementChunk {
    header_size: u16,
    pub node: XmlNodeHeader,
    pub namespace_index: i32,
    pub name_index: u32,
}

impl XmlEndElementChunk {
    const HEADER_SIZE: u16 = 16;

    pub fn new(namespace_index: i32, name_index: u32) -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            node: XmlNodeHeader::default(),
            namespace_index,
            name_index,
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let node = XmlNodeHeader::read(r)?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        Ok(Self {
            header_size: header.header_size,
            node,
            namespace_index: r.read_i32::<LittleEndian>()?,
            name_index: r.read_u32::<LittleEndian>()?,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::XmlEndElement as u16, self.header_size)?;
        self.node.write(w)?;
        chunk.end_header(w)?;
        w.write_i32::<LittleEndian>(self.namespace_index)?;
        w.write_u32::<LittleEndian>(self.name_index)?;
        chunk.finish(w)
    }

    pub fn name<'a>(&self, document: &'a XmlChunk) -> Result<&'a str> {
        document.string_pool()?.get(self.name_index)
    }
}

/// Character data between tags: the raw text plus a typed rendition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XmlCdataChunk {
    header_size: u16,
    pub node: XmlNodeHeader,
    pub raw_value_index: u32,
    pub typed_value: ResValue,
}

impl XmlCdataChunk {
    const HEADER_SIZE: u16 = 16;

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let node = XmlNodeHeader::read(r)?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        Ok(Self {
            header_size: header.header_size,
            node,
            raw_value_index: r.read_u32::<LittleEndian>()?,
            typed_value: ResValue::read(r)?,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::XmlCdata as u16, self.header_size)?;
        self.node.write(w)?;
        chunk.end_header(w)?;
        w.write_u32::<LittleEndian>(self.raw_value_index)?;
        self.typed_value.write(w)?;
        chunk.finish(w)
    }

    pub fn text<'a>(&self, document: &'a XmlChunk) -> Result<&'a str> {
        document.string_pool()?.get(self.raw_value_index)
    }
}

/// Maps attribute-name pool indices to resource identifiers, one word per
/// slot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XmlResourceMapChunk {
    ids: Vec<u32>,
}

impl XmlResourceMapChunk {
    pub fn new(ids: Vec<u32>) -> Self {
        Self { ids }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        let count = (header.size - header.header_size as u32) / 4;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(r.read_u32::<LittleEndian>()?);
        }
        Ok(Self { ids })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let chunk = ChunkWriter::begin(
            w,
            ChunkType::XmlResourceMap as u16,
            crate::chunk::METADATA_SIZE,
        )?;
        chunk.end_header(w)?;
        for &id in &self.ids {
            w.write_u32::<LittleEndian>(id)?;
        }
        chunk.finish(w)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// The resource identifier backing the attribute at `index`.
    pub fn get(&self, index: u32) -> Result<ResTableRef> {
        match self.ids.get(index as usize) {
            Some(&id) => Ok(ResTableRef::from(id)),
            None => bail!(
                "attribute index {} out of range for resource map of {}",
                index,
                self.ids.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SerializeOptions;
    use std::io::Cursor;

    fn attribute(name_index: u32, value: ResValue) -> XmlAttribute {
        XmlAttribute {
            namespace_index: -1,
            name_index,
            raw_value_index: -1,
            typed_value: value,
        }
    }

    /// A document shaped like a compiled manifest: pool, resource map,
    /// namespace scope, one element with attributes, cdata.
    fn test_document() -> XmlChunk {
        let mut pool = StringPoolChunk::new();
        for s in ["android", "http://schemas.android.com/apk/res/android", "manifest", "versionCode", "text"] {
            pool.add(s);
        }
        let mut document = XmlChunk::new();
        document.add_chunk(Chunk::StringPool(pool));
        document.add_chunk(Chunk::XmlResourceMap(XmlResourceMapChunk::new(vec![
            0x0101_021b,
        ])));
        document.add_chunk(Chunk::XmlStartNamespace(XmlNamespaceChunk::new(0, 1)));
        let mut element = XmlStartElementChunk::new(-1, 2);
        element.attributes.push(attribute(
            3,
            ResValue::new(ResValueType::IntDec, 42),
        ));
        document.add_chunk(Chunk::XmlStartElement(element));
        document.add_chunk(Chunk::XmlCdata(XmlCdataChunk {
            header_size: 16,
            node: XmlNodeHeader::default(),
            raw_value_index: 4,
            typed_value: ResValue::new(ResValueType::String, 4),
        }));
        document.add_chunk(Chunk::XmlEndElement(XmlEndElementChunk::new(-1, 2)));
        document.add_chunk(Chunk::XmlEndNamespace(XmlNamespaceChunk::new(0, 1)));
        document
    }

    fn roundtrip(document: &XmlChunk) -> XmlChunk {
        let mut w = Cursor::new(Vec::new());
        document.write(&mut w, SerializeOptions::NONE).unwrap();
        let bytes = w.into_inner();
        match Chunk::parse(&mut Cursor::new(bytes.as_slice())).unwrap() {
            Chunk::Xml(document) => document,
            other => panic!("expected xml chunk, got {other:?}"),
        }
    }

    #[test]
    fn document_roundtrips() {
        let document = test_document();
        assert_eq!(roundtrip(&document), document);
    }

    #[test]
    fn name_resolution() {
        let document = test_document();
        let Chunk::XmlStartElement(element) = &document.chunks()[3] else {
            panic!("expected start element");
        };
        assert_eq!(element.name(&document).unwrap(), "manifest");
        assert_eq!(
            element.attributes[0].name(&document).unwrap(),
            "versionCode"
        );
        assert_eq!(
            u32::from(document.resource_map().unwrap().get(0).unwrap()),
            0x0101_021b
        );
        assert!(document.resource_map().unwrap().get(7).is_err());
    }

    #[test]
    fn special_indices_survive_the_one_based_wire_form() {
        let mut element = XmlStartElementChunk::new(-1, 0);
        element.attributes.push(attribute(0, ResValue::new(ResValueType::Null, 0)));
        element.id_index = 0;
        let mut w = Cursor::new(Vec::new());
        element.write(&mut w).unwrap();
        let bytes = w.into_inner();
        // id slot sits after namespace/name/start/size/count.
        assert_eq!(u16::from_le_bytes(bytes[30..32].try_into().unwrap()), 1);
        // class slot holds 0 for "absent".
        assert_eq!(u16::from_le_bytes(bytes[32..34].try_into().unwrap()), 0);
        let parsed =
            match Chunk::parse(&mut Cursor::new(bytes.as_slice())).unwrap() {
                Chunk::XmlStartElement(element) => element,
                other => panic!("expected start element, got {other:?}"),
            };
        assert_eq!(parsed.id_index, 0);
        assert_eq!(parsed.class_index, -1);
        assert_eq!(parsed.style_index, -1);
    }

    #[test]
    fn remap_references_skips_system_and_unlisted() {
        let mut element = XmlStartElementChunk::new(-1, 0);
        element.attributes.push(attribute(0, ResValue::new(ResValueType::IntDec, 1)));
        element.attributes.push(attribute(
            1,
            ResValue::new(ResValueType::Reference, 0x7f01_0001),
        ));
        element.attributes.push(attribute(
            2,
            ResValue::new(ResValueType::Reference, 0x0101_0001),
        ));
        element.attributes.push(attribute(
            3,
            ResValue::new(ResValueType::Reference, 0x7f01_0002),
        ));
        let references = HashMap::from([
            (0x7f01_0001, 0x7f01_0099),
            (0x0101_0001, 0x7f01_00aa),
            (1, 2),
        ]);
        element.remap_references(&references);
        assert_eq!(element.attributes[0].typed_value.data, 1); // not a reference
        assert_eq!(element.attributes[1].typed_value.data, 0x7f01_0099);
        assert_eq!(element.attributes[2].typed_value.data, 0x0101_0001); // system
        assert_eq!(element.attributes[3].typed_value.data, 0x7f01_0002); // unlisted
    }
}

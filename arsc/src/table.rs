use anyhow::{bail, ensure, Context as _, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroU8;
use tracing::warn;

use crate::chunk::{Chunk, ChunkHeader, ChunkType, ChunkWriter, SerializeOptions};
use crate::config::ResTableConfig;
use crate::pool::StringPoolChunk;
use crate::value::ResValue;

/// Sentinel offset marking an absent entry in a dense offset table.
pub const NO_ENTRY: u32 = 0xffff_ffff;

/// A resource entry in a (type, configuration) slot: either one value or a
/// map of `(reference, value)` pairs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    /// 8 for simple entries, 16 for complex ones.
    pub header_size: u16,
    pub flags: u16,
    /// Index into the owning package's key string pool.
    pub key_index: u32,
    pub value: EntryValue,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EntryValue {
    Simple(ResValue),
    Complex {
        /// Resource identifier of the parent entry, or 0.
        parent_entry: u32,
        values: Vec<(u32, ResValue)>,
    },
}

impl Entry {
    pub const FLAG_COMPLEX: u16 = 0x0001;
    pub const FLAG_PUBLIC: u16 = 0x0002;

    pub const SIMPLE_HEADER_SIZE: u16 = 8;
    pub const COMPLEX_HEADER_SIZE: u16 = 16;
    /// Reference word plus value: the wire size of one complex mapping.
    pub const MAPPING_SIZE: usize = 12;

    pub fn simple(key_index: u32, value: ResValue) -> Self {
        Self {
            header_size: Self::SIMPLE_HEADER_SIZE,
            flags: 0,
            key_index,
            value: EntryValue::Simple(value),
        }
    }

    pub fn complex(key_index: u32, parent_entry: u32, values: Vec<(u32, ResValue)>) -> Self {
        Self {
            header_size: Self::COMPLEX_HEADER_SIZE,
            flags: Self::FLAG_COMPLEX,
            key_index,
            value: EntryValue::Complex {
                parent_entry,
                values,
            },
        }
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let header_size = r.read_u16::<LittleEndian>()?;
        let flags = r.read_u16::<LittleEndian>()?;
        let key_index = r.read_u32::<LittleEndian>()?;
        let value = if flags & Self::FLAG_COMPLEX != 0 {
            debug_assert_eq!(header_size, Self::COMPLEX_HEADER_SIZE);
            let parent_entry = r.read_u32::<LittleEndian>()?;
            let count = r.read_u32::<LittleEndian>()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let reference = r.read_u32::<LittleEndian>()?;
                values.push((reference, ResValue::read(r)?));
            }
            EntryValue::Complex {
                parent_entry,
                values,
            }
        } else {
            debug_assert_eq!(header_size, Self::SIMPLE_HEADER_SIZE);
            EntryValue::Simple(ResValue::read(r)?)
        };
        Ok(Self {
            header_size,
            flags,
            key_index,
            value,
        })
    }

    pub fn write(&self, w: &mut impl Write, options: SerializeOptions) -> Result<()> {
        let mut flags = self.flags;
        if options.strip_public() {
            flags &= !Self::FLAG_PUBLIC;
        }
        w.write_u16::<LittleEndian>(self.header_size)?;
        w.write_u16::<LittleEndian>(flags)?;
        w.write_u32::<LittleEndian>(self.key_index)?;
        match &self.value {
            EntryValue::Simple(value) => value.write(w)?,
            EntryValue::Complex {
                parent_entry,
                values,
            } => {
                w.write_u32::<LittleEndian>(*parent_entry)?;
                w.write_u32::<LittleEndian>(values.len() as u32)?;
                for (reference, value) in values {
                    w.write_u32::<LittleEndian>(*reference)?;
                    value.write(w)?;
                }
            }
        }
        Ok(())
    }

    pub fn is_complex(&self) -> bool {
        self.flags & Self::FLAG_COMPLEX != 0
    }

    pub fn is_public(&self) -> bool {
        self.flags & Self::FLAG_PUBLIC != 0
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.header_size as usize
            + match &self.value {
                EntryValue::Simple(_) => ResValue::SIZE as usize,
                EntryValue::Complex { values, .. } => values.len() * Self::MAPPING_SIZE,
            }
    }

    /// Resolves the entry's key name through the owning package.
    pub fn key_name<'a>(&self, package: &'a PackageChunk) -> Result<&'a str> {
        package.key_string_pool().get(self.key_index)
    }
}

/// One slab of entries for a single resource type under a single device
/// configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeChunk {
    header_size: u16,
    id: NonZeroU8,
    flags: u8,
    reserved: u16,
    total_entry_count: u32,
    pub configuration: ResTableConfig,
    entries: BTreeMap<u16, Entry>,
}

impl TypeChunk {
    pub const FLAG_SPARSE: u8 = 0x01;

    /// Fixed header bytes past the frame, before the configuration record.
    const FIXED_HEADER: u16 = 12;
    /// Header offset of the entries-start field, patched after the offset
    /// table is sized.
    const ENTRIES_START_OFFSET: u64 = 16;

    pub fn new(id: NonZeroU8, configuration: ResTableConfig) -> Self {
        Self {
            header_size: crate::chunk::METADATA_SIZE + Self::FIXED_HEADER + configuration.size as u16,
            id,
            flags: 0,
            reserved: 0,
            total_entry_count: 0,
            configuration,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let id = NonZeroU8::new(r.read_u8()?).context("type chunk id of 0 is invalid")?;
        let flags = r.read_u8()?;
        let reserved = r.read_u16::<LittleEndian>()?;
        let entry_count = r.read_u32::<LittleEndian>()?;
        let entries_start = r.read_u32::<LittleEndian>()?;
        let configuration = ResTableConfig::read(r)?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;

        let sparse = flags & Self::FLAG_SPARSE != 0;
        let mut total_entry_count = entry_count;
        let mut offsets = Vec::with_capacity(entry_count as usize);
        if sparse {
            for _ in 0..entry_count {
                let index = r.read_u16::<LittleEndian>()?;
                let offset = r.read_u16::<LittleEndian>()? as u32 * 4;
                total_entry_count = total_entry_count.max(index as u32 + 1);
                offsets.push((index, offset));
            }
        } else {
            ensure!(
                entry_count <= 1 << 16,
                "type chunk declares {} entries, more than the index space holds",
                entry_count
            );
            for index in 0..entry_count {
                let offset = r.read_u32::<LittleEndian>()?;
                if offset != NO_ENTRY {
                    offsets.push((index as u16, offset));
                }
            }
        }

        let mut entries = BTreeMap::new();
        for (index, offset) in offsets {
            r.seek(SeekFrom::Start(
                header.start + entries_start as u64 + offset as u64,
            ))?;
            entries.insert(index, Entry::read(r)?);
        }

        Ok(Self {
            header_size: header.header_size,
            id,
            flags,
            reserved,
            total_entry_count,
            configuration,
            entries,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek), options: SerializeOptions) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::TableType as u16, self.header_size)?;
        w.write_u8(self.id.get())?;
        w.write_u8(self.flags)?;
        w.write_u16::<LittleEndian>(self.reserved)?;
        // The on-disk count sizes the offset table: every logical slot when
        // dense, only the present pairs when sparse.
        let table_len = if self.is_sparse() {
            self.entries.len() as u32
        } else {
            self.total_entry_count
        };
        w.write_u32::<LittleEndian>(table_len)?;
        w.write_u32::<LittleEndian>(0)?; // entries start, patched below
        self.configuration.write(w)?;
        chunk.pad_header(w)?;
        chunk.end_header(w)?;

        let table_pos = w.stream_position()?;
        for _ in 0..table_len {
            w.write_u32::<LittleEndian>(NO_ENTRY)?;
        }
        let entries_pos = w.stream_position()?;
        chunk.patch_u32(
            w,
            Self::ENTRIES_START_OFFSET,
            (entries_pos - chunk.start()) as u32,
        )?;

        for (slot, (&index, entry)) in self.entries.iter().enumerate() {
            ensure!(
                (index as u32) < self.total_entry_count,
                "entry index {} outside type chunk of {} entries",
                index,
                self.total_entry_count
            );
            let offset = w.stream_position()? - entries_pos;
            entry.write(w, options)?;
            let resume = w.stream_position()?;
            if self.is_sparse() {
                assert_eq!(offset % 4, 0, "sparse entries must stay 4-byte aligned");
                ensure!(
                    offset / 4 <= u16::MAX as u64,
                    "sparse entry offset {} does not fit the 16-bit wire form",
                    offset
                );
                w.seek(SeekFrom::Start(table_pos + 4 * slot as u64))?;
                w.write_u16::<LittleEndian>(index)?;
                w.write_u16::<LittleEndian>((offset / 4) as u16)?;
            } else {
                w.seek(SeekFrom::Start(table_pos + 4 * index as u64))?;
                w.write_u32::<LittleEndian>(offset as u32)?;
            }
            w.seek(SeekFrom::Start(resume))?;
        }
        chunk.finish(w)
    }

    pub fn id(&self) -> NonZeroU8 {
        self.id
    }

    pub fn is_sparse(&self) -> bool {
        self.flags & Self::FLAG_SPARSE != 0
    }

    /// Switches between the sparse and dense wire encodings. The entries
    /// themselves are untouched.
    pub fn set_sparse_entries(&mut self, sparse: bool) {
        if sparse {
            self.flags |= Self::FLAG_SPARSE;
        } else {
            self.flags &= !Self::FLAG_SPARSE;
        }
    }

    pub fn total_entry_count(&self) -> u32 {
        self.total_entry_count
    }

    pub fn entries(&self) -> &BTreeMap<u16, Entry> {
        &self.entries
    }

    /// Replaces the whole entry map and the logical entry count.
    pub fn set_entries(&mut self, entries: BTreeMap<u16, Entry>, total_entry_count: u32) -> Result<()> {
        if let Some((&highest, _)) = entries.last_key_value() {
            ensure!(
                (highest as u32) < total_entry_count,
                "entry index {} outside type chunk of {} entries",
                highest,
                total_entry_count
            );
        }
        self.entries = entries;
        self.total_entry_count = total_entry_count;
        Ok(())
    }

    /// Sets (`Some`) or removes (`None`) entries by index. Indices outside
    /// the logical entry count are ignored.
    pub fn override_entries(&mut self, overrides: BTreeMap<u16, Option<Entry>>) {
        for (index, entry) in overrides {
            if (index as u32) >= self.total_entry_count {
                continue;
            }
            match entry {
                Some(entry) => {
                    self.entries.insert(index, entry);
                }
                None => {
                    self.entries.remove(&index);
                }
            }
        }
    }

    /// Resolves this chunk's type name through the owning package.
    pub fn type_name<'a>(&self, package: &'a PackageChunk) -> Result<&'a str> {
        package.type_string_pool().get(self.id.get() as u32 - 1)
    }
}

/// Per-entry configuration-change masks for one resource type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeSpecChunk {
    header_size: u16,
    id: NonZeroU8,
    res0: u8,
    types_count: u16,
    pub masks: Vec<u32>,
}

impl TypeSpecChunk {
    /// Mask bit marking an entry as public; cleared when serializing with
    /// `PRIVATE_RESOURCES`.
    pub const SPEC_PUBLIC: u32 = 0x4000_0000;

    const HEADER_SIZE: u16 = 16;

    pub fn new(id: NonZeroU8, masks: Vec<u32>) -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            id,
            res0: 0,
            types_count: 0,
            masks,
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let id = NonZeroU8::new(r.read_u8()?).context("type spec id of 0 is invalid")?;
        let res0 = r.read_u8()?;
        debug_assert_eq!(res0, 0, "type spec reserved field 0 should be 0");
        let types_count = r.read_u16::<LittleEndian>()?;
        let entry_count = r.read_u32::<LittleEndian>()?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        let mut masks = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            masks.push(r.read_u32::<LittleEndian>()?);
        }
        Ok(Self {
            header_size: header.header_size,
            id,
            res0,
            types_count,
            masks,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek), options: SerializeOptions) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::TableTypeSpec as u16, self.header_size)?;
        w.write_u8(self.id.get())?;
        w.write_u8(self.res0)?;
        w.write_u16::<LittleEndian>(self.types_count)?;
        w.write_u32::<LittleEndian>(self.masks.len() as u32)?;
        chunk.end_header(w)?;
        for &mask in &self.masks {
            let mask = if options.strip_public() {
                mask & !Self::SPEC_PUBLIC
            } else {
                mask
            };
            w.write_u32::<LittleEndian>(mask)?;
        }
        chunk.finish(w)
    }

    pub fn id(&self) -> NonZeroU8 {
        self.id
    }
}

/// Maps build-time package ids of shared libraries to their package names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LibraryChunk {
    header_size: u16,
    entries: Vec<LibraryEntry>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LibraryEntry {
    pub package_id: u32,
    pub package_name: String,
}

impl LibraryChunk {
    const HEADER_SIZE: u16 = 12;

    pub fn new() -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            entries: Vec::new(),
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let count = r.read_u32::<LittleEndian>()?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let package_id = r.read_u32::<LittleEndian>()?;
            ensure!(
                package_id <= 0xff,
                "library package id 0x{:x} does not fit in one byte",
                package_id
            );
            entries.push(LibraryEntry {
                package_id,
                package_name: read_package_name(r)?,
            });
        }
        Ok(Self {
            header_size: header.header_size,
            entries,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::TableLibrary as u16, self.header_size)?;
        w.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        chunk.end_header(w)?;
        for entry in &self.entries {
            ensure!(
                entry.package_id <= 0xff,
                "library package id 0x{:x} does not fit in one byte",
                entry.package_id
            );
            w.write_u32::<LittleEndian>(entry.package_id)?;
            write_package_name(w, &entry.package_name)?;
        }
        chunk.finish(w)
    }

    pub fn entries(&self) -> &[LibraryEntry] {
        &self.entries
    }

    pub fn add_entry(&mut self, entry: LibraryEntry) {
        self.entries.push(entry);
    }
}

impl Default for LibraryChunk {
    fn default() -> Self {
        Self::new()
    }
}

/// All resources of one package: a type string pool, a key string pool, and
/// the type / type-spec / library children.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageChunk {
    header_size: u16,
    pub id: u32,
    name: String,
    last_public_type: u32,
    last_public_key: u32,
    type_id_offset: u32,
    /// Header bytes past the last known field, preserved for round-trips.
    header_tail: Vec<u8>,
    chunks: Vec<Chunk>,
    type_pool: usize,
    key_pool: usize,
}

impl PackageChunk {
    /// Header offset of the type string pool offset slot.
    const TYPE_OFFSET: u64 = 268;
    /// Header offset of the key string pool offset slot.
    const KEY_OFFSET: u64 = 276;
    /// Header size before `type_id_offset` was added to the format.
    const OLD_HEADER_SIZE: u16 = 284;
    const HEADER_SIZE: u16 = 288;

    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            id,
            name: name.into(),
            last_public_type: 0,
            last_public_key: 0,
            type_id_offset: 0,
            header_tail: Vec::new(),
            chunks: vec![
                Chunk::StringPool(StringPoolChunk::new()),
                Chunk::StringPool(StringPoolChunk::new()),
            ],
            type_pool: 0,
            key_pool: 1,
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        ensure!(
            header.header_size >= Self::OLD_HEADER_SIZE,
            "package header of {} bytes is below the {}-byte minimum",
            header.header_size,
            Self::OLD_HEADER_SIZE
        );
        let id = r.read_u32::<LittleEndian>()?;
        let name = read_package_name(r)?;
        let type_strings = r.read_u32::<LittleEndian>()?;
        let last_public_type = r.read_u32::<LittleEndian>()?;
        let key_strings = r.read_u32::<LittleEndian>()?;
        let last_public_key = r.read_u32::<LittleEndian>()?;
        let type_id_offset = if header.header_size >= Self::HEADER_SIZE {
            r.read_u32::<LittleEndian>()?
        } else {
            0
        };
        let consumed = r.stream_position()? - header.start;
        let mut header_tail = vec![0; header.header_size as usize - consumed as usize];
        r.read_exact(&mut header_tail)?;
        if !header_tail.is_empty() {
            warn!(
                "package {:?} header carries {} undeclared bytes",
                name,
                header_tail.len()
            );
        }

        let mut chunks = Vec::new();
        let mut type_pool = None;
        let mut key_pool = None;
        while r.stream_position()? < header.end() {
            let child_start = r.stream_position()?;
            let child = Chunk::parse(r)?;
            let relative = (child_start - header.start) as u32;
            if relative == type_strings {
                ensure!(
                    matches!(child, Chunk::StringPool(_)),
                    "package type-strings offset does not point at a string pool"
                );
                type_pool = Some(chunks.len());
            }
            if relative == key_strings {
                ensure!(
                    matches!(child, Chunk::StringPool(_)),
                    "package key-strings offset does not point at a string pool"
                );
                key_pool = Some(chunks.len());
            }
            if matches!(child, Chunk::TableLibrary(_))
                && chunks.iter().any(|c| matches!(c, Chunk::TableLibrary(_)))
            {
                bail!("package {:?} contains two library chunks", name);
            }
            chunks.push(child);
        }
        let type_pool = type_pool.context("package has no type string pool")?;
        let key_pool = key_pool.context("package has no key string pool")?;

        let package = Self {
            header_size: header.header_size,
            id,
            name,
            last_public_type,
            last_public_key,
            type_id_offset,
            header_tail,
            chunks,
            type_pool,
            key_pool,
        };
        let type_count = package.type_string_pool().len();
        for type_chunk in package.type_chunks() {
            ensure!(
                type_chunk.id().get() as usize <= type_count,
                "type chunk id {} has no name in a type pool of {}",
                type_chunk.id(),
                type_count
            );
        }
        Ok(package)
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek), options: SerializeOptions) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::TablePackage as u16, self.header_size)?;
        w.write_u32::<LittleEndian>(self.id)?;
        write_package_name(w, &self.name)?;
        w.write_u32::<LittleEndian>(0)?; // type strings offset, patched below
        w.write_u32::<LittleEndian>(self.last_public_type)?;
        w.write_u32::<LittleEndian>(0)?; // key strings offset, patched below
        w.write_u32::<LittleEndian>(self.last_public_key)?;
        if self.header_size >= Self::HEADER_SIZE {
            w.write_u32::<LittleEndian>(self.type_id_offset)?;
        }
        w.write_all(&self.header_tail)?;
        chunk.end_header(w)?;
        for (position, child) in self.chunks.iter().enumerate() {
            let relative = (w.stream_position()? - chunk.start()) as u32;
            if position == self.type_pool {
                chunk.patch_u32(w, Self::TYPE_OFFSET, relative)?;
            }
            if position == self.key_pool {
                chunk.patch_u32(w, Self::KEY_OFFSET, relative)?;
            }
            child.write(w, options)?;
        }
        chunk.finish(w)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn type_string_pool(&self) -> &StringPoolChunk {
        match &self.chunks[self.type_pool] {
            Chunk::StringPool(pool) => pool,
            _ => unreachable!("type pool index always names a string pool"),
        }
    }

    pub fn type_string_pool_mut(&mut self) -> &mut StringPoolChunk {
        match &mut self.chunks[self.type_pool] {
            Chunk::StringPool(pool) => pool,
            _ => unreachable!("type pool index always names a string pool"),
        }
    }

    pub fn key_string_pool(&self) -> &StringPoolChunk {
        match &self.chunks[self.key_pool] {
            Chunk::StringPool(pool) => pool,
            _ => unreachable!("key pool index always names a string pool"),
        }
    }

    pub fn key_string_pool_mut(&mut self) -> &mut StringPoolChunk {
        match &mut self.chunks[self.key_pool] {
            Chunk::StringPool(pool) => pool,
            _ => unreachable!("key pool index always names a string pool"),
        }
    }

    pub fn type_chunks(&self) -> impl Iterator<Item = &TypeChunk> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            Chunk::TableType(type_chunk) => Some(type_chunk),
            _ => None,
        })
    }

    pub fn type_spec_chunks(&self) -> impl Iterator<Item = &TypeSpecChunk> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            Chunk::TableTypeSpec(spec) => Some(spec),
            _ => None,
        })
    }

    pub fn library_chunk(&self) -> Option<&LibraryChunk> {
        self.chunks.iter().find_map(|chunk| match chunk {
            Chunk::TableLibrary(library) => Some(library),
            _ => None,
        })
    }

    pub fn add_type_chunk(&mut self, type_chunk: TypeChunk) {
        self.chunks.push(Chunk::TableType(type_chunk));
    }

    pub fn add_type_spec_chunk(&mut self, spec: TypeSpecChunk) {
        self.chunks.push(Chunk::TableTypeSpec(spec));
    }

    pub fn add_library_chunk(&mut self, library: LibraryChunk) -> Result<()> {
        ensure!(
            self.library_chunk().is_none(),
            "package {:?} already has a library chunk",
            self.name
        );
        self.chunks.push(Chunk::TableLibrary(library));
        Ok(())
    }

    /// Deletes key strings, remaps every surviving entry's key index, and
    /// drops type chunks whose entries all vanished. When the last type
    /// chunk of an id goes, its type spec goes with it. Returns the number
    /// of type chunks removed.
    pub fn delete_key_strings(&mut self, keys: &BTreeSet<u32>) -> Result<usize> {
        let remap = self.key_string_pool_mut().delete_strings(keys);
        let mut doomed = BTreeSet::new();
        let mut had_ids = BTreeSet::new();
        let mut remaining_ids = BTreeSet::new();
        for (position, chunk) in self.chunks.iter_mut().enumerate() {
            let Chunk::TableType(type_chunk) = chunk else {
                continue;
            };
            had_ids.insert(type_chunk.id());
            let mut overrides: BTreeMap<u16, Option<Entry>> = BTreeMap::new();
            let mut survivors = false;
            for (&index, entry) in type_chunk.entries() {
                ensure!(
                    (entry.key_index as usize) < remap.len(),
                    "entry key index {} outside key pool of {}",
                    entry.key_index,
                    remap.len()
                );
                let new_key = remap[entry.key_index as usize];
                if new_key < 0 {
                    overrides.insert(index, None);
                } else {
                    survivors = true;
                    if new_key as u32 != entry.key_index {
                        let mut entry = entry.clone();
                        entry.key_index = new_key as u32;
                        overrides.insert(index, Some(entry));
                    }
                }
            }
            let had_entries = !type_chunk.entries().is_empty();
            type_chunk.override_entries(overrides);
            if had_entries && !survivors {
                doomed.insert(position);
            } else {
                remaining_ids.insert(type_chunk.id());
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        let deleted = doomed.len();
        for (position, chunk) in self.chunks.iter().enumerate() {
            if let Chunk::TableTypeSpec(spec) = chunk {
                if had_ids.contains(&spec.id()) && !remaining_ids.contains(&spec.id()) {
                    doomed.insert(position);
                }
            }
        }

        let old_chunks = std::mem::take(&mut self.chunks);
        for (position, chunk) in old_chunks.into_iter().enumerate() {
            if doomed.contains(&position) {
                continue;
            }
            if position == self.type_pool {
                self.type_pool = self.chunks.len();
            }
            if position == self.key_pool {
                self.key_pool = self.chunks.len();
            }
            self.chunks.push(chunk);
        }
        Ok(deleted)
    }

    fn type_chunks_mut(&mut self) -> impl Iterator<Item = &mut TypeChunk> {
        self.chunks.iter_mut().filter_map(|chunk| match chunk {
            Chunk::TableType(type_chunk) => Some(type_chunk),
            _ => None,
        })
    }
}

/// The top-level resource table: one global string pool plus the packages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableChunk {
    header_size: u16,
    chunks: Vec<Chunk>,
    string_pool: usize,
}

impl TableChunk {
    const HEADER_SIZE: u16 = 12;

    pub fn new() -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            chunks: vec![Chunk::StringPool(StringPoolChunk::new())],
            string_pool: 0,
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let package_count = r.read_u32::<LittleEndian>()?;
        ensure!(package_count >= 1, "resource table declares no packages");
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;
        let mut chunks = Vec::new();
        let mut string_pool = None;
        while r.stream_position()? < header.end() {
            let child = Chunk::parse(r)?;
            if string_pool.is_none() && matches!(child, Chunk::StringPool(_)) {
                string_pool = Some(chunks.len());
            }
            chunks.push(child);
        }
        let string_pool = string_pool.context("resource table has no global string pool")?;
        ensure!(
            chunks.iter().any(|c| matches!(c, Chunk::TablePackage(_))),
            "resource table has no package chunk"
        );
        Ok(Self {
            header_size: header.header_size,
            chunks,
            string_pool,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek), options: SerializeOptions) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::Table as u16, self.header_size)?;
        let package_count = self
            .chunks
            .iter()
            .filter(|c| matches!(c, Chunk::TablePackage(_)))
            .count();
        w.write_u32::<LittleEndian>(package_count as u32)?;
        chunk.end_header(w)?;
        for child in &self.chunks {
            child.write(w, options)?;
        }
        chunk.finish(w)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn string_pool(&self) -> &StringPoolChunk {
        match &self.chunks[self.string_pool] {
            Chunk::StringPool(pool) => pool,
            _ => unreachable!("global pool index always names a string pool"),
        }
    }

    pub fn string_pool_mut(&mut self) -> &mut StringPoolChunk {
        match &mut self.chunks[self.string_pool] {
            Chunk::StringPool(pool) => pool,
            _ => unreachable!("global pool index always names a string pool"),
        }
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageChunk> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            Chunk::TablePackage(package) => Some(package),
            _ => None,
        })
    }

    pub fn packages_mut(&mut self) -> impl Iterator<Item = &mut PackageChunk> {
        self.chunks.iter_mut().filter_map(|chunk| match chunk {
            Chunk::TablePackage(package) => Some(package),
            _ => None,
        })
    }

    pub fn add_package_chunk(&mut self, package: PackageChunk) {
        self.chunks.push(Chunk::TablePackage(package));
    }

    /// Deletes global strings and rewrites every STRING-typed value through
    /// the remap. Simple entries whose string vanished are dropped; complex
    /// entries must only reference surviving strings, since they may still
    /// carry a parent or override another entry.
    pub fn delete_strings(&mut self, indexes: &BTreeSet<u32>) -> Result<()> {
        let remap = self.string_pool_mut().delete_strings(indexes);
        for package in self.packages_mut() {
            for type_chunk in package.type_chunks_mut() {
                let mut overrides: BTreeMap<u16, Option<Entry>> = BTreeMap::new();
                for (&index, entry) in type_chunk.entries() {
                    match &entry.value {
                        EntryValue::Complex { .. } => {
                            let mut entry = entry.clone();
                            let mut changed = false;
                            let EntryValue::Complex { values, .. } = &mut entry.value else {
                                unreachable!();
                            };
                            for (reference, value) in values {
                                if !value.is_string() {
                                    continue;
                                }
                                let new = remap_index(&remap, value.data)?;
                                ensure!(
                                    new >= 0,
                                    "string {} of complex value 0x{:08x} was deleted but is still referenced",
                                    value.data,
                                    reference
                                );
                                if new as u32 != value.data {
                                    value.data = new as u32;
                                    changed = true;
                                }
                            }
                            if changed {
                                overrides.insert(index, Some(entry));
                            }
                        }
                        EntryValue::Simple(value) if value.is_string() => {
                            let new = remap_index(&remap, value.data)?;
                            if new < 0 {
                                overrides.insert(index, None);
                            } else if new as u32 != value.data {
                                let mut entry = entry.clone();
                                let EntryValue::Simple(value) = &mut entry.value else {
                                    unreachable!();
                                };
                                value.data = new as u32;
                                overrides.insert(index, Some(entry));
                            }
                        }
                        EntryValue::Simple(_) => {}
                    }
                }
                type_chunk.override_entries(overrides);
            }
        }
        Ok(())
    }
}

impl Default for TableChunk {
    fn default() -> Self {
        Self::new()
    }
}

fn remap_index(remap: &[i32], index: u32) -> Result<i32> {
    match remap.get(index as usize) {
        Some(&new) => Ok(new),
        None => bail!(
            "string index {} out of range for pool of {}",
            index,
            remap.len()
        ),
    }
}

/// The fixed 128-unit, NUL-padded UTF-16LE name field used by package and
/// library records.
fn read_package_name(r: &mut impl Read) -> Result<String> {
    let mut units = [0u16; 128];
    for unit in units.iter_mut() {
        *unit = r.read_u16::<LittleEndian>()?;
    }
    let len = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    Ok(String::from_utf16(&units[..len])?)
}

fn write_package_name(w: &mut impl Write, name: &str) -> Result<()> {
    let mut units = [0u16; 128];
    for (index, unit) in name.encode_utf16().enumerate() {
        ensure!(
            index < units.len() - 1,
            "package name {:?} exceeds 127 UTF-16 units",
            name
        );
        units[index] = unit;
    }
    for unit in units {
        w.write_u16::<LittleEndian>(unit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ResValueType;
    use std::io::Cursor;

    fn type_id(id: u8) -> NonZeroU8 {
        NonZeroU8::new(id).unwrap()
    }

    fn string_entry(key_index: u32, string_index: u32) -> Entry {
        Entry::simple(key_index, ResValue::new(ResValueType::String, string_index))
    }

    fn write_chunk(chunk: &Chunk, options: SerializeOptions) -> Vec<u8> {
        let mut w = Cursor::new(Vec::new());
        chunk.write(&mut w, options).unwrap();
        w.into_inner()
    }

    fn reparse(chunk: &Chunk, options: SerializeOptions) -> Chunk {
        let bytes = write_chunk(chunk, options);
        Chunk::parse(&mut Cursor::new(bytes.as_slice())).unwrap()
    }

    /// A package with type "string", keys and a dense type chunk holding the
    /// given entries.
    fn test_package(entries: &[(u16, Entry)], total: u32) -> PackageChunk {
        let mut package = PackageChunk::new(0x7f, "com.example.app");
        package.type_string_pool_mut().add("string");
        package.key_string_pool_mut().add("app_name");
        package.key_string_pool_mut().add("label");
        package.add_type_spec_chunk(TypeSpecChunk::new(type_id(1), vec![0; total as usize]));
        let mut type_chunk = TypeChunk::new(type_id(1), ResTableConfig::default());
        type_chunk
            .set_entries(entries.iter().cloned().collect(), total)
            .unwrap();
        package.add_type_chunk(type_chunk);
        package
    }

    #[test]
    fn dense_type_chunk_roundtrips_with_holes() {
        let mut type_chunk = TypeChunk::new(type_id(1), ResTableConfig::default());
        type_chunk
            .set_entries(
                [
                    (0, string_entry(0, 4)),
                    (2, Entry::complex(1, 0, vec![(5, ResValue::new(ResValueType::IntDec, 7))])),
                ]
                .into_iter()
                .collect(),
                3,
            )
            .unwrap();
        let chunk = Chunk::TableType(type_chunk.clone());
        let bytes = write_chunk(&chunk, SerializeOptions::NONE);
        // Offset table starts at the declared header size; the hole at index
        // 1 must hold the sentinel.
        let header_size = u16::from_le_bytes(bytes[2..4].try_into().unwrap()) as usize;
        let slot = |i: usize| {
            u32::from_le_bytes(
                bytes[header_size + 4 * i..header_size + 4 * i + 4]
                    .try_into()
                    .unwrap(),
            )
        };
        assert_eq!(slot(0), 0);
        assert_eq!(slot(1), NO_ENTRY);
        assert_eq!(slot(2), 16);
        assert_eq!(reparse(&chunk, SerializeOptions::NONE), chunk);
    }

    #[test]
    fn sparse_type_chunk_roundtrips() {
        let mut type_chunk = TypeChunk::new(type_id(2), ResTableConfig::default());
        type_chunk
            .set_entries(
                [(2, string_entry(0, 1)), (7, string_entry(1, 2))]
                    .into_iter()
                    .collect(),
                8,
            )
            .unwrap();
        type_chunk.set_sparse_entries(true);
        let chunk = Chunk::TableType(type_chunk);
        let reparsed = reparse(&chunk, SerializeOptions::NONE);
        assert_eq!(reparsed, chunk);
        let Chunk::TableType(reparsed) = reparsed else {
            unreachable!();
        };
        assert!(reparsed.is_sparse());
        assert_eq!(reparsed.total_entry_count(), 8);
        assert_eq!(reparsed.entries().len(), 2);
    }

    #[test]
    fn override_entries_bounds() {
        let mut type_chunk = TypeChunk::new(type_id(1), ResTableConfig::default());
        type_chunk
            .set_entries([(0, string_entry(0, 0))].into_iter().collect(), 2)
            .unwrap();
        type_chunk.override_entries(
            [
                (1, Some(string_entry(1, 1))),
                (0, None),
                (9, Some(string_entry(0, 0))), // out of range: ignored
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(type_chunk.entries().len(), 1);
        assert!(type_chunk.entries().contains_key(&1));
    }

    #[test]
    fn private_resources_strips_public_bits() {
        let mut entry = string_entry(0, 0);
        entry.flags |= Entry::FLAG_PUBLIC;
        let mut type_chunk = TypeChunk::new(type_id(1), ResTableConfig::default());
        type_chunk
            .set_entries([(0, entry)].into_iter().collect(), 1)
            .unwrap();
        let reparsed = reparse(
            &Chunk::TableType(type_chunk),
            SerializeOptions::PRIVATE_RESOURCES,
        );
        let Chunk::TableType(reparsed) = reparsed else {
            unreachable!();
        };
        assert!(!reparsed.entries()[&0].is_public());

        let spec = TypeSpecChunk::new(type_id(1), vec![TypeSpecChunk::SPEC_PUBLIC | 0x4, 0x1]);
        let reparsed = reparse(
            &Chunk::TableTypeSpec(spec),
            SerializeOptions::PRIVATE_RESOURCES,
        );
        let Chunk::TableTypeSpec(reparsed) = reparsed else {
            unreachable!();
        };
        assert_eq!(reparsed.masks, vec![0x4, 0x1]);
    }

    #[test]
    fn package_roundtrips_and_finds_pools() {
        let package = test_package(&[(0, string_entry(0, 0)), (1, string_entry(1, 1))], 2);
        let chunk = Chunk::TablePackage(package);
        assert_eq!(reparse(&chunk, SerializeOptions::NONE), chunk);
    }

    #[test]
    fn old_package_header_without_type_id_offset() {
        let package = test_package(&[(0, string_entry(0, 0))], 1);
        let mut bytes = write_chunk(&Chunk::TablePackage(package), SerializeOptions::NONE);
        // Shrink the header in place: drop the type_id_offset word.
        bytes.splice(284..288, std::iter::empty());
        bytes[2..4].copy_from_slice(&284u16.to_le_bytes());
        let size = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&size.to_le_bytes());
        // Pool offsets moved down by four bytes.
        let type_offset = u32::from_le_bytes(bytes[268..272].try_into().unwrap()) - 4;
        bytes[268..272].copy_from_slice(&type_offset.to_le_bytes());
        let key_offset = u32::from_le_bytes(bytes[276..280].try_into().unwrap()) - 4;
        bytes[276..280].copy_from_slice(&key_offset.to_le_bytes());
        let chunk = Chunk::parse(&mut Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(write_chunk(&chunk, SerializeOptions::NONE), bytes);
    }

    #[test]
    fn delete_key_strings_remaps_and_cascades() {
        let mut package = test_package(&[(0, string_entry(0, 0)), (1, string_entry(1, 1))], 2);
        // Deleting "app_name" keeps the chunk but remaps the other key.
        let deleted = package.delete_key_strings(&BTreeSet::from([0])).unwrap();
        assert_eq!(deleted, 0);
        let type_chunk = package.type_chunks().next().unwrap();
        assert_eq!(type_chunk.entries().len(), 1);
        assert_eq!(type_chunk.entries()[&1].key_index, 0);
        assert_eq!(type_chunk.entries()[&1].key_name(&package).unwrap(), "label");

        // Deleting the remaining key empties the chunk; both it and its
        // type spec go away.
        let deleted = package.delete_key_strings(&BTreeSet::from([0])).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(package.type_chunks().count(), 0);
        assert_eq!(package.type_spec_chunks().count(), 0);
        // The pools survive the compaction.
        assert_eq!(package.type_string_pool().len(), 1);
        assert!(package.key_string_pool().is_empty());
    }

    #[test]
    fn table_delete_strings_rewrites_values() {
        let mut table = TableChunk::new();
        for s in ["zero", "one", "two", "three", "four", "five", "six", "seven"] {
            table.string_pool_mut().add(s);
        }
        let mut package = PackageChunk::new(0x7f, "com.example.app");
        package.type_string_pool_mut().add("style");
        package.key_string_pool_mut().add("simple");
        package.key_string_pool_mut().add("bag");
        let mut type_chunk = TypeChunk::new(type_id(1), ResTableConfig::default());
        type_chunk
            .set_entries(
                [
                    (0, string_entry(0, 3)),
                    (1, Entry::complex(1, 0, vec![(5, ResValue::new(ResValueType::String, 7))])),
                ]
                .into_iter()
                .collect(),
                2,
            )
            .unwrap();
        package.add_type_chunk(type_chunk);
        table.add_package_chunk(package);

        table.delete_strings(&BTreeSet::from([3])).unwrap();
        let package = table.packages().next().unwrap();
        let type_chunk = package.type_chunks().next().unwrap();
        // The simple entry referenced the deleted string and is gone.
        assert!(!type_chunk.entries().contains_key(&0));
        // The complex entry survives with its sub-value remapped 7 -> 6.
        let entry = &type_chunk.entries()[&1];
        let EntryValue::Complex { values, .. } = &entry.value else {
            panic!("expected complex entry");
        };
        assert_eq!(values[0], (5, ResValue::new(ResValueType::String, 6)));
        assert_eq!(table.string_pool().get(6).unwrap(), "seven");
    }

    #[test]
    fn deleting_complex_referenced_string_is_an_error() {
        let mut table = TableChunk::new();
        table.string_pool_mut().add("kept");
        table.string_pool_mut().add("doomed");
        let mut package = PackageChunk::new(0x7f, "com.example.app");
        package.type_string_pool_mut().add("style");
        package.key_string_pool_mut().add("bag");
        let mut type_chunk = TypeChunk::new(type_id(1), ResTableConfig::default());
        type_chunk
            .set_entries(
                [(0, Entry::complex(0, 0, vec![(1, ResValue::new(ResValueType::String, 1))]))]
                    .into_iter()
                    .collect(),
                1,
            )
            .unwrap();
        package.add_type_chunk(type_chunk);
        table.add_package_chunk(package);
        assert!(table.delete_strings(&BTreeSet::from([1])).is_err());
    }

    #[test]
    fn table_roundtrips() {
        let mut table = TableChunk::new();
        table.string_pool_mut().add("hello");
        let mut package = test_package(&[(0, string_entry(0, 0))], 1);
        package
            .add_library_chunk({
                let mut library = LibraryChunk::new();
                library.add_entry(LibraryEntry {
                    package_id: 2,
                    package_name: "com.example.shared".into(),
                });
                library
            })
            .unwrap();
        table.add_package_chunk(package);
        let chunk = Chunk::Table(table);
        assert_eq!(reparse(&chunk, SerializeOptions::NONE), chunk);

        // Serialized output is stable across a round-trip.
        let bytes = write_chunk(&chunk, SerializeOptions::NONE);
        let reparsed = Chunk::parse(&mut Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(write_chunk(&reparsed, SerializeOptions::NONE), bytes);
    }

    #[test]
    fn oversized_library_package_id_is_rejected() {
        let mut library = LibraryChunk::new();
        library.add_entry(LibraryEntry {
            package_id: 0x100,
            package_name: "com.example.shared".into(),
        });
        let mut w = Cursor::new(Vec::new());
        assert!(library.write(&mut w).is_err());
    }
}

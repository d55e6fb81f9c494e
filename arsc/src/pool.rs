use anyhow::{bail, ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

use crate::chunk::{ChunkHeader, ChunkType, ChunkWriter, SerializeOptions};
use crate::io;

/// Terminates every style's span list on the wire.
pub const RES_STRING_POOL_SPAN_END: u32 = 0xffff_ffff;

/// Header offset of the styles-start field, patched after the payload is
/// serialized.
const STYLE_START_OFFSET: u64 = 24;

/// An interned table of UTF-8 or UTF-16LE strings with optional styling
/// spans. Style `i` decorates string `i`; the style list may be shorter than
/// the string list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StringPoolChunk {
    header_size: u16,
    flags: u32,
    strings: Vec<String>,
    styles: Vec<StringPoolStyle>,
    /// Armed when the parsed offset table was not monotonically increasing:
    /// the original writer shared string bytes, so re-writes must re-share
    /// them to stay faithful even without `SHRINK`.
    always_dedup: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringPoolStyle {
    pub spans: Vec<StringPoolSpan>,
}

/// Marks the range `[start, stop]` of a styled string; `name_index` points
/// at the pool string naming the style.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StringPoolSpan {
    pub name_index: u32,
    pub start: u32,
    pub stop: u32,
}

impl StringPoolChunk {
    pub const SORTED_FLAG: u32 = 1 << 0;
    pub const UTF8_FLAG: u32 = 1 << 8;

    const HEADER_SIZE: u16 = 28;

    pub fn new() -> Self {
        Self {
            header_size: Self::HEADER_SIZE,
            flags: Self::UTF8_FLAG,
            strings: Vec::new(),
            styles: Vec::new(),
            always_dedup: false,
        }
    }

    pub(crate) fn parse(r: &mut (impl Read + Seek), header: ChunkHeader) -> Result<Self> {
        let string_count = r.read_u32::<LittleEndian>()?;
        let style_count = r.read_u32::<LittleEndian>()?;
        ensure!(
            style_count <= string_count,
            "string pool has {} styles but only {} strings",
            style_count,
            string_count
        );
        let flags = r.read_u32::<LittleEndian>()?;
        let strings_start = r.read_u32::<LittleEndian>()?;
        let styles_start = r.read_u32::<LittleEndian>()?;
        r.seek(SeekFrom::Start(header.start + header.header_size as u64))?;

        let mut string_offsets = Vec::with_capacity(string_count as usize);
        let mut always_dedup = false;
        for _ in 0..string_count {
            let offset = r.read_u32::<LittleEndian>()?;
            if let Some(&previous) = string_offsets.last() {
                if offset <= previous {
                    always_dedup = true;
                }
            }
            string_offsets.push(offset);
        }
        if always_dedup {
            debug!("non-monotonic string offsets; pool will re-share strings on write");
        }
        let mut style_offsets = Vec::with_capacity(style_count as usize);
        for _ in 0..style_count {
            style_offsets.push(r.read_u32::<LittleEndian>()?);
        }

        let utf8 = flags & Self::UTF8_FLAG != 0;
        let mut strings = Vec::with_capacity(string_count as usize);
        for &offset in &string_offsets {
            r.seek(SeekFrom::Start(
                header.start + strings_start as u64 + offset as u64,
            ))?;
            strings.push(io::read_string(r, utf8)?);
        }

        let mut styles = Vec::with_capacity(style_count as usize);
        for &offset in &style_offsets {
            r.seek(SeekFrom::Start(
                header.start + styles_start as u64 + offset as u64,
            ))?;
            let mut spans = Vec::new();
            loop {
                let name_index = r.read_u32::<LittleEndian>()?;
                if name_index == RES_STRING_POOL_SPAN_END {
                    break;
                }
                ensure!(
                    name_index < string_count,
                    "style span names string {} outside pool of {}",
                    name_index,
                    string_count
                );
                spans.push(StringPoolSpan {
                    name_index,
                    start: r.read_u32::<LittleEndian>()?,
                    stop: r.read_u32::<LittleEndian>()?,
                });
            }
            styles.push(StringPoolStyle { spans });
        }

        Ok(Self {
            header_size: header.header_size,
            flags,
            strings,
            styles,
            always_dedup,
        })
    }

    pub(crate) fn write(&self, w: &mut (impl Write + Seek), options: SerializeOptions) -> Result<()> {
        let chunk = ChunkWriter::begin(w, ChunkType::StringPool as u16, self.header_size)?;
        let offset_words = self.strings.len() + self.styles.len();
        w.write_u32::<LittleEndian>(self.strings.len() as u32)?;
        w.write_u32::<LittleEndian>(self.styles.len() as u32)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.header_size as u32 + 4 * offset_words as u32)?;
        w.write_u32::<LittleEndian>(0)?; // styles start, patched below
        chunk.end_header(w)?;

        // Offset tables are only known once the blobs exist; reserve them.
        let offsets_pos = w.stream_position()?;
        for _ in 0..offset_words {
            w.write_u32::<LittleEndian>(0)?;
        }

        let dedup = options.shrink() || self.always_dedup;
        let utf8 = self.is_utf8();
        let blob_start = w.stream_position()?;
        let mut string_offsets = Vec::with_capacity(self.strings.len());
        let mut interned: HashMap<&str, u32> = HashMap::new();
        for string in &self.strings {
            if dedup {
                if let Some(&offset) = interned.get(string.as_str()) {
                    string_offsets.push(offset);
                    continue;
                }
            }
            let offset = (w.stream_position()? - blob_start) as u32;
            if dedup {
                interned.insert(string, offset);
            }
            string_offsets.push(offset);
            io::write_string(w, string, utf8)?;
        }
        io::write_padding(w)?;

        let mut style_offsets = Vec::with_capacity(self.styles.len());
        if !self.styles.is_empty() {
            let section_start = w.stream_position()?;
            chunk.patch_u32(w, STYLE_START_OFFSET, (section_start - chunk.start()) as u32)?;
            for (index, style) in self.styles.iter().enumerate() {
                if dedup {
                    if let Some(shared) = self.styles[..index].iter().position(|s| s == style) {
                        style_offsets.push(style_offsets[shared]);
                        continue;
                    }
                }
                style_offsets.push((w.stream_position()? - section_start) as u32);
                for span in &style.spans {
                    w.write_u32::<LittleEndian>(span.name_index)?;
                    w.write_u32::<LittleEndian>(span.start)?;
                    w.write_u32::<LittleEndian>(span.stop)?;
                }
                w.write_u32::<LittleEndian>(RES_STRING_POOL_SPAN_END)?;
            }
            // The reference tool closes the section with two further
            // sentinels; keep them for byte compatibility.
            w.write_u32::<LittleEndian>(RES_STRING_POOL_SPAN_END)?;
            w.write_u32::<LittleEndian>(RES_STRING_POOL_SPAN_END)?;
        }

        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(offsets_pos))?;
        for offset in string_offsets.iter().chain(style_offsets.iter()) {
            w.write_u32::<LittleEndian>(*offset)?;
        }
        w.seek(SeekFrom::Start(end))?;
        chunk.finish(w)
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & Self::UTF8_FLAG != 0
    }

    pub fn set_utf8(&mut self, utf8: bool) {
        if utf8 {
            self.flags |= Self::UTF8_FLAG;
        } else {
            self.flags &= !Self::UTF8_FLAG;
        }
    }

    pub fn is_sorted(&self) -> bool {
        self.flags & Self::SORTED_FLAG != 0
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn get(&self, index: u32) -> Result<&str> {
        match self.strings.get(index as usize) {
            Some(s) => Ok(s),
            None => bail!(
                "string index {} out of range for pool of {}",
                index,
                self.strings.len()
            ),
        }
    }

    pub fn set(&mut self, index: u32, value: impl Into<String>) -> Result<()> {
        match self.strings.get_mut(index as usize) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => bail!(
                "string index {} out of range for pool of {}",
                index,
                self.strings.len()
            ),
        }
    }

    /// Appends a string and returns its index.
    pub fn add(&mut self, value: impl Into<String>) -> u32 {
        self.strings.push(value.into());
        self.strings.len() as u32 - 1
    }

    /// Index of the first occurrence of `value`, if interned.
    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.strings.iter().position(|s| s == value).map(|i| i as u32)
    }

    pub fn strings(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }

    pub fn styles(&self) -> &[StringPoolStyle] {
        &self.styles
    }

    /// Appends a style for the next undecorated string index.
    pub fn push_style(&mut self, style: StringPoolStyle) -> Result<()> {
        ensure!(
            self.styles.len() < self.strings.len(),
            "style count would exceed string count"
        );
        for span in &style.spans {
            ensure!(
                (span.name_index as usize) < self.strings.len(),
                "style span names string {} outside pool of {}",
                span.name_index,
                self.strings.len()
            );
        }
        self.styles.push(style);
        Ok(())
    }

    /// Removes the given string indices, compacting the pool and its styles.
    ///
    /// A string named by a span of a surviving style is kept alive even when
    /// requested, so spans never dangle. Returns `remap` where `remap[old]`
    /// is the new index of surviving string `old`, or `-1` if it was
    /// deleted.
    pub fn delete_strings(&mut self, indexes: &BTreeSet<u32>) -> Vec<i32> {
        let mut doomed: BTreeSet<u32> = indexes
            .iter()
            .copied()
            .filter(|&i| (i as usize) < self.strings.len())
            .collect();
        // Spans of surviving styles pin their name strings; un-dooming a
        // string revives its style, so iterate until stable.
        loop {
            let pinned: Vec<u32> = self
                .styles
                .iter()
                .enumerate()
                .filter(|(i, _)| !doomed.contains(&(*i as u32)))
                .flat_map(|(_, style)| style.spans.iter())
                .map(|span| span.name_index)
                .filter(|name| doomed.contains(name))
                .collect();
            if pinned.is_empty() {
                break;
            }
            for name in pinned {
                doomed.remove(&name);
            }
        }

        let mut remap = Vec::with_capacity(self.strings.len());
        let mut next = 0i32;
        for index in 0..self.strings.len() as u32 {
            if doomed.contains(&index) {
                remap.push(-1);
            } else {
                remap.push(next);
                next += 1;
            }
        }

        let old_strings = std::mem::take(&mut self.strings);
        for (index, string) in old_strings.into_iter().enumerate() {
            if remap[index] >= 0 {
                self.strings.push(string);
            }
        }
        let old_styles = std::mem::take(&mut self.styles);
        for (index, mut style) in old_styles.into_iter().enumerate() {
            if remap[index] < 0 {
                continue;
            }
            for span in &mut style.spans {
                span.name_index = remap[span.name_index as usize] as u32;
            }
            self.styles.push(style);
        }
        remap
    }
}

impl Default for StringPoolChunk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use std::io::Cursor;

    fn pool(strings: &[&str]) -> StringPoolChunk {
        let mut pool = StringPoolChunk::new();
        for s in strings {
            pool.add(*s);
        }
        pool
    }

    fn write(pool: &StringPoolChunk, options: SerializeOptions) -> Vec<u8> {
        let mut w = Cursor::new(Vec::new());
        pool.write(&mut w, options).unwrap();
        w.into_inner()
    }

    fn parse(bytes: &[u8]) -> StringPoolChunk {
        match Chunk::parse(&mut Cursor::new(bytes)).unwrap() {
            Chunk::StringPool(pool) => pool,
            other => panic!("expected string pool, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_utf8_and_utf16() {
        for utf8 in [true, false] {
            let mut p = pool(&["title", "bold", "body"]);
            p.set_utf8(utf8);
            p.push_style(StringPoolStyle {
                spans: vec![StringPoolSpan {
                    name_index: 1,
                    start: 0,
                    stop: 4,
                }],
            })
            .unwrap();
            let bytes = write(&p, SerializeOptions::NONE);
            assert_eq!(bytes.len() % 4, 0);
            assert_eq!(parse(&bytes), p);
        }
    }

    #[test]
    fn lookup_and_mutation() {
        let mut p = pool(&["foo", "bar"]);
        assert_eq!(p.index_of("bar"), Some(1));
        assert_eq!(p.index_of("baz"), None);
        assert_eq!(p.add("baz"), 2);
        p.set(0, "qux").unwrap();
        assert_eq!(p.get(0).unwrap(), "qux");
        assert!(p.get(3).is_err());
    }

    #[test]
    fn shrink_emits_each_string_once() {
        let p = pool(&["foo", "bar", "foo"]);
        let bytes = write(&p, SerializeOptions::SHRINK);
        let needle: &[u8] = b"foo";
        let hits = bytes
            .windows(needle.len())
            .filter(|window| *window == needle)
            .count();
        assert_eq!(hits, 1);
        // Offset table sits right after the 28-byte pool header; slots 0 and
        // 2 must share an offset.
        let offset = |slot: usize| {
            u32::from_le_bytes(bytes[28 + 4 * slot..32 + 4 * slot].try_into().unwrap())
        };
        assert_eq!(offset(0), offset(2));
        assert_ne!(offset(0), offset(1));
    }

    #[test]
    fn non_monotonic_input_arms_dedup() {
        let p = pool(&["foo", "bar", "foo"]);
        let shrunk = write(&p, SerializeOptions::SHRINK);
        let reparsed = parse(&shrunk);
        assert!(reparsed.always_dedup);
        // Even a plain write re-shares the bytes now.
        assert_eq!(write(&reparsed, SerializeOptions::NONE), shrunk);
    }

    #[test]
    fn style_reference_suppresses_deletion() {
        let mut p = pool(&["title", "bold", "body"]);
        p.push_style(StringPoolStyle {
            spans: vec![StringPoolSpan {
                name_index: 1,
                start: 0,
                stop: 4,
            }],
        })
        .unwrap();
        let remap = p.delete_strings(&BTreeSet::from([1]));
        assert_eq!(remap, vec![0, 1, 2]);
        assert_eq!(p.len(), 3);
        assert_eq!(p.get(1).unwrap(), "bold");
    }

    #[test]
    fn deletion_compacts_and_remaps_spans() {
        let mut p = pool(&["title", "bold", "body"]);
        p.push_style(StringPoolStyle {
            spans: vec![StringPoolSpan {
                name_index: 2,
                start: 0,
                stop: 4,
            }],
        })
        .unwrap();
        let remap = p.delete_strings(&BTreeSet::from([1]));
        assert_eq!(remap, vec![0, -1, 1]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.get(0).unwrap(), "title");
        assert_eq!(p.get(1).unwrap(), "body");
        assert_eq!(p.styles()[0].spans[0].name_index, 1);
    }

    #[test]
    fn deleting_styled_string_drops_its_style() {
        let mut p = pool(&["a", "b"]);
        p.push_style(StringPoolStyle {
            spans: vec![StringPoolSpan {
                name_index: 1,
                start: 0,
                stop: 0,
            }],
        })
        .unwrap();
        let remap = p.delete_strings(&BTreeSet::from([0]));
        assert_eq!(remap, vec![-1, 0]);
        assert!(p.styles().is_empty());
        assert_eq!(p.get(0).unwrap(), "b");
    }

    #[test]
    fn out_of_range_deletions_are_ignored() {
        let mut p = pool(&["only"]);
        let remap = p.delete_strings(&BTreeSet::from([5]));
        assert_eq!(remap, vec![0]);
        assert_eq!(p.len(), 1);
    }
}

use anyhow::{ensure, Result};
use std::io::Cursor;

pub mod chunk;
pub mod config;
mod io;
pub mod pool;
pub mod table;
pub mod value;
pub mod xml;

pub use chunk::{Chunk, ChunkType, SerializeOptions, UnknownChunk};
pub use config::ResTableConfig;
pub use pool::{StringPoolChunk, StringPoolSpan, StringPoolStyle};
pub use table::{
    Entry, EntryValue, LibraryChunk, LibraryEntry, PackageChunk, TableChunk, TypeChunk,
    TypeSpecChunk,
};
pub use value::{ResTableRef, ResValue, ResValueType};
pub use xml::{
    XmlAttribute, XmlCdataChunk, XmlChunk, XmlEndElementChunk, XmlNamespaceChunk,
    XmlResourceMapChunk, XmlStartElementChunk,
};

/// A whole buffer of concatenated top-level chunks, e.g. a `resources.arsc`
/// payload or a compiled XML document.
///
/// Everything is copied out of the input during [`parse`](Self::parse); the
/// buffer can be dropped afterwards.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceFile {
    chunks: Vec<Chunk>,
}

impl ResourceFile {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(data);
        let mut chunks = Vec::new();
        while (r.position() as usize) < data.len() {
            chunks.push(Chunk::parse(&mut r)?);
            ensure!(
                r.position() as usize <= data.len(),
                "chunk runs past the end of the buffer"
            );
        }
        Ok(Self { chunks })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut Vec<Chunk> {
        &mut self.chunks
    }

    pub fn to_bytes(&self, options: SerializeOptions) -> Result<Vec<u8>> {
        let mut w = Cursor::new(Vec::new());
        for chunk in &self.chunks {
            chunk.write(&mut w, options)?;
        }
        Ok(w.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::table::Entry;
    use std::collections::BTreeMap;
    use std::io::Read as _;
    use std::num::NonZeroU8;
    use std::path::Path;

    pub fn init_logger() {
        let _ = tracing_log::LogTracer::init();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn test_table() -> TableChunk {
        let mut table = TableChunk::new();
        let app_name = table.string_pool_mut().add("Example");
        let mut package = PackageChunk::new(0x7f, "com.example.app");
        package.type_string_pool_mut().add("string");
        package.key_string_pool_mut().add("app_name");
        package.add_type_spec_chunk(TypeSpecChunk::new(
            NonZeroU8::new(1).unwrap(),
            vec![TypeSpecChunk::SPEC_PUBLIC],
        ));
        let mut type_chunk = TypeChunk::new(NonZeroU8::new(1).unwrap(), ResTableConfig::default());
        let mut entry = Entry::simple(0, ResValue::new(ResValueType::String, app_name));
        entry.flags |= Entry::FLAG_PUBLIC;
        type_chunk
            .set_entries(BTreeMap::from([(0, entry)]), 1)
            .unwrap();
        package.add_type_chunk(type_chunk);
        table.add_package_chunk(package);
        table
    }

    #[test]
    fn whole_file_roundtrips() {
        init_logger();
        let file = ResourceFile::new(vec![Chunk::Table(test_table())]);
        let bytes = file.to_bytes(SerializeOptions::NONE).unwrap();
        assert_eq!(bytes.len() % 4, 0);
        let reparsed = ResourceFile::parse(&bytes).unwrap();
        assert_eq!(reparsed, file);
        assert_eq!(reparsed.to_bytes(SerializeOptions::NONE).unwrap(), bytes);
    }

    #[test]
    fn output_reparses_under_every_option() {
        init_logger();
        let file = ResourceFile::new(vec![Chunk::Table(test_table())]);
        for options in [
            SerializeOptions::NONE,
            SerializeOptions::SHRINK,
            SerializeOptions::PRIVATE_RESOURCES,
            SerializeOptions::SHRINK | SerializeOptions::PRIVATE_RESOURCES,
        ] {
            let bytes = file.to_bytes(options).unwrap();
            let reparsed = ResourceFile::parse(&bytes).unwrap();
            // Once projected through the options, the output is a fixpoint.
            assert_eq!(reparsed.to_bytes(options).unwrap(), bytes);
        }
    }

    #[test]
    fn private_resources_projection_drops_public_bits() {
        let file = ResourceFile::new(vec![Chunk::Table(test_table())]);
        let bytes = file.to_bytes(SerializeOptions::PRIVATE_RESOURCES).unwrap();
        let reparsed = ResourceFile::parse(&bytes).unwrap();
        let Chunk::Table(table) = &reparsed.chunks()[0] else {
            panic!("expected table chunk");
        };
        let package = table.packages().next().unwrap();
        assert!(package
            .type_chunks()
            .flat_map(|t| t.entries().values())
            .all(|entry| !entry.is_public()));
        assert!(package
            .type_spec_chunks()
            .flat_map(|spec| spec.masks.iter())
            .all(|mask| mask & TypeSpecChunk::SPEC_PUBLIC == 0));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let file = ResourceFile::new(vec![Chunk::Table(test_table())]);
        let mut bytes = file.to_bytes(SerializeOptions::NONE).unwrap();
        bytes.extend_from_slice(&[0x00, 0x01]);
        assert!(ResourceFile::parse(&bytes).is_err());
    }

    #[test]
    fn roundtrip_android_platform_resources() -> Result<()> {
        init_logger();
        let Ok(home) = std::env::var("ANDROID_HOME") else {
            return Ok(());
        };
        let platforms = Path::new(&home).join("platforms");
        for entry in std::fs::read_dir(platforms)? {
            let platform = entry?;
            let android = platform.path().join("android.jar");
            if !android.exists() {
                continue;
            }
            let mut zip = zip::ZipArchive::new(std::io::BufReader::new(std::fs::File::open(
                &android,
            )?))?;
            let mut f = zip.by_name("resources.arsc")?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)?;
            tracing::info!("roundtripping {}", android.display());
            let file = ResourceFile::parse(&buf)?;
            let bytes = file.to_bytes(SerializeOptions::NONE)?;
            // Write output is a fixpoint of parse-then-write.
            let again = ResourceFile::parse(&bytes)?;
            assert_eq!(again.to_bytes(SerializeOptions::NONE)?, bytes);
        }
        Ok(())
    }
}

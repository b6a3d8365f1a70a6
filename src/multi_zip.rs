//! Zip access with variant namespacing.
//!
//! Every action payload is stored under its relative path. The variants of a
//! multi-action all share one path, so each variant gets its own namespace:
//! the default view uses bare names, variant `N` prefixes them with
//! `.variant<N>/`. Nothing else about the zip changes.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::patch_format::variant_path;

/// Writing side of a patch archive.
pub struct MultiZipWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl<W: Write + Seek> MultiZipWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
        }
    }

    /// Start a deflated metadata entry; the name is used as is.
    pub fn start_metadata(&mut self, name: &str) -> Result<()> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(9));
        self.zip
            .start_file(name.to_string(), options)
            .with_context(|| format!("Failed to start archive entry: {}", name))
    }

    /// Payload view in the default namespace.
    pub fn payloads(&mut self) -> PayloadWriter<'_, W> {
        PayloadWriter {
            zip: &mut self.zip,
            variant: None,
        }
    }

    pub fn finish(self) -> Result<W> {
        self.zip.finish().context("Failed to finish patch archive")
    }
}

impl<W: Write + Seek> Write for MultiZipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.zip.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.zip.flush()
    }
}

/// Payload writer scoped to one namespace.
pub struct PayloadWriter<'a, W: Write + Seek> {
    zip: &'a mut ZipWriter<W>,
    variant: Option<usize>,
}

impl<W: Write + Seek> PayloadWriter<'_, W> {
    pub fn variant(&mut self, n: usize) -> PayloadWriter<'_, W> {
        PayloadWriter {
            zip: &mut *self.zip,
            variant: Some(n),
        }
    }

    /// Start the payload entry of `path`. Payload bodies are already zstd
    /// frames, so entries are stored without zip compression.
    pub fn put_next_entry(&mut self, path: &str) -> Result<()> {
        let name = variant_path(path, self.variant);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true);
        self.zip
            .start_file(name.clone(), options)
            .with_context(|| format!("Failed to start archive entry: {}", name))
    }
}

impl<W: Write + Seek> Write for PayloadWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.zip.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.zip.flush()
    }
}

/// Reading side of a patch archive.
pub struct MultiZipFile<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl MultiZipFile<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open patch file: {}", path.display()))?;
        Self::new(BufReader::new(file))
            .with_context(|| format!("Failed to read patch file: {}", path.display()))
    }
}

impl<R: Read + Seek> MultiZipFile<R> {
    pub fn new(reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader).context("Not a zip archive")?;
        Ok(Self { archive })
    }

    /// Payload view in the default namespace.
    pub fn payloads(&mut self) -> PayloadReader<'_, R> {
        PayloadReader {
            archive: &mut self.archive,
            variant: None,
        }
    }

    /// Read a whole metadata entry; missing entries are an error.
    pub fn read_metadata(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut entry = self
            .archive
            .by_name(name)
            .with_context(|| format!("Entry {} not found", name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to read entry: {}", name))?;
        Ok(data)
    }
}

/// Payload reader scoped to one namespace.
pub struct PayloadReader<'a, R: Read + Seek> {
    archive: &'a mut ZipArchive<R>,
    variant: Option<usize>,
}

impl<R: Read + Seek> PayloadReader<'_, R> {
    pub fn variant(&mut self, n: usize) -> PayloadReader<'_, R> {
        PayloadReader {
            archive: &mut *self.archive,
            variant: Some(n),
        }
    }

    /// Open the payload of `path` in this namespace. Returns `None` when the
    /// entry is absent or names a directory.
    pub fn find_entry(&mut self, path: &str) -> Result<Option<impl Read + '_>> {
        let name = variant_path(path, self.variant);
        match self.archive.by_name(&name) {
            Ok(entry) if entry.is_dir() => Ok(None),
            Ok(entry) => Ok(Some(entry)),
            Err(ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to open archive entry: {}", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(reader: &mut PayloadReader<'_, Cursor<Vec<u8>>>, path: &str) -> Option<Vec<u8>> {
        let mut entry = reader.find_entry(path).unwrap()?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        Some(data)
    }

    #[test]
    fn test_variants_do_not_collide() {
        let mut writer = MultiZipWriter::new(Cursor::new(Vec::new()));
        writer.start_metadata(".patch-info").unwrap();
        writer.write_all(b"index").unwrap();
        {
            let mut payloads = writer.payloads();
            payloads.put_next_entry("lib/a.jar").unwrap();
            payloads.write_all(b"default").unwrap();
            let mut first = payloads.variant(0);
            first.put_next_entry("lib/a.jar").unwrap();
            first.write_all(b"zero").unwrap();
            let mut second = payloads.variant(1);
            second.put_next_entry("lib/a.jar").unwrap();
            second.write_all(b"one").unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();

        let mut file = MultiZipFile::new(Cursor::new(bytes)).unwrap();
        assert_eq!(file.read_metadata(".patch-info").unwrap(), b"index");

        let mut payloads = file.payloads();
        assert_eq!(read_all(&mut payloads, "lib/a.jar").unwrap(), b"default");
        assert_eq!(read_all(&mut payloads.variant(0), "lib/a.jar").unwrap(), b"zero");
        assert_eq!(read_all(&mut payloads.variant(1), "lib/a.jar").unwrap(), b"one");
        assert!(read_all(&mut payloads.variant(2), "lib/a.jar").is_none());
        assert!(read_all(&mut payloads, "lib/b.jar").is_none());
    }

    #[test]
    fn test_missing_metadata_is_an_error() {
        let writer = MultiZipWriter::new(Cursor::new(Vec::new()));
        let bytes = writer.finish().unwrap().into_inner();
        let mut file = MultiZipFile::new(Cursor::new(bytes)).unwrap();
        assert!(file.read_metadata("patch.properties").is_err());
    }
}

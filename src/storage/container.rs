//! Container file format: a single file holding named subfiles
//!
//! Layout: a 64-byte header followed by one ZSTD-compressed body. The body
//! is a sequence of `name_len | name | data_len | data` records. A CRC32 of
//! the compressed body is kept in the header.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Container format version
pub const CONTAINER_VERSION: u8 = 1;

/// Container header size (64 bytes)
pub const HEADER_SIZE: usize = 64;

/// Magic number: "HIST0"
pub const MAGIC: &[u8; 5] = b"HIST0";

/// Default compression level for ZSTD
pub const ZSTD_COMPRESSION_LEVEL: i32 = 3;

/// Flag bits in ContainerHeader.flags
pub const FLAG_COMPRESSED: u8 = 0x01; // Body is compressed with ZSTD

/// Container header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub entry_count: u32,
    pub body_size: u64,
    pub raw_size: u64,
    pub checksum: u32,
    pub flags: u8,
}

impl ContainerHeader {
    /// Serialize header to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);

        buf.put_slice(MAGIC);
        buf.put_u8(CONTAINER_VERSION);
        // Reserved
        buf.put_u16(0);
        buf.put_u32(self.entry_count);
        buf.put_u64(self.body_size);
        buf.put_u64(self.raw_size);
        buf.put_u32(self.checksum);
        buf.put_u8(self.flags);

        // Padding to 64 bytes: 5+1+2+4+8+8+4+1 = 33, need 31 more
        buf.put_bytes(0, 31);

        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf.freeze()
    }

    /// Deserialize header from bytes
    pub fn deserialize(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Storage("Invalid header size".to_string()));
        }

        let magic = &buf[0..5];
        if magic != MAGIC {
            return Err(Error::Storage(format!("Invalid magic number: {:?}", magic)));
        }
        buf.advance(5);

        let version = buf.get_u8();
        if version != CONTAINER_VERSION {
            return Err(Error::Storage(format!("Unsupported version: {}", version)));
        }
        buf.advance(2);

        Ok(Self {
            entry_count: buf.get_u32(),
            body_size: buf.get_u64(),
            raw_size: buf.get_u64(),
            checksum: buf.get_u32(),
            flags: buf.get_u8(),
        })
    }
}

/// Container file writer.
///
/// Entries are gathered in memory and written on [`ContainerWriter::finish`]
/// to a sibling temp file that is then renamed over the target.
pub struct ContainerWriter {
    path: PathBuf,
    body: BytesMut,
    entry_count: u32,
    compression_level: i32,
}

impl ContainerWriter {
    /// Start a container at `path`
    pub fn create<P: AsRef<Path>>(path: P, compression_level: i32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            body: BytesMut::new(),
            entry_count: 0,
            compression_level,
        }
    }

    /// Append a named entry
    pub fn append(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let name_len = u32::try_from(name.len())
            .map_err(|_| Error::Storage(format!("Entry name too long: {}", name)))?;
        let data_len = u32::try_from(data.len())
            .map_err(|_| Error::Storage(format!("Entry {} too large", name)))?;

        self.body.put_u32_le(name_len);
        self.body.put_slice(name.as_bytes());
        self.body.put_u32_le(data_len);
        self.body.put_slice(data);
        self.entry_count += 1;
        Ok(())
    }

    /// Compress, checksum and write the container
    pub fn finish(self) -> Result<ContainerHeader> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let compressed = zstd::encode_all(&self.body[..], self.compression_level)
            .map_err(|e| Error::Storage(format!("ZSTD compression failed: {}", e)))?;

        let mut hasher = Crc32Hasher::new();
        hasher.update(&compressed);

        let header = ContainerHeader {
            entry_count: self.entry_count,
            body_size: compressed.len() as u64,
            raw_size: self.body.len() as u64,
            checksum: hasher.finalize(),
            flags: FLAG_COMPRESSED,
        };

        let tmp_path = temp_path(&self.path);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&header.serialize())?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(header)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Container file reader
pub struct ContainerReader {
    file: File,
    header: ContainerHeader,
    path: PathBuf,
}

impl ContainerReader {
    /// Open an existing container file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let mut header_buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)
            .map_err(|e| Error::Storage(format!("Truncated container header: {}", e)))?;
        let header = ContainerHeader::deserialize(&header_buf)?;

        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
        })
    }

    /// Read and verify all entries
    pub fn read_entries(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let body_size = usize::try_from(self.header.body_size)
            .map_err(|_| Error::Storage("Container body too large".to_string()))?;
        let mut body = vec![0u8; body_size];
        self.file
            .read_exact(&mut body)
            .map_err(|e| Error::Storage(format!("Truncated container body: {}", e)))?;

        let mut hasher = Crc32Hasher::new();
        hasher.update(&body);
        let calculated = hasher.finalize();
        if calculated != self.header.checksum {
            return Err(Error::Storage(format!(
                "Checksum mismatch: expected {}, got {}",
                self.header.checksum, calculated
            )));
        }

        let raw = if self.header.flags & FLAG_COMPRESSED != 0 {
            zstd::decode_all(&body[..])
                .map_err(|e| Error::Storage(format!("ZSTD decompression failed: {}", e)))?
        } else {
            body
        };

        let mut buf = &raw[..];
        let mut entries = Vec::with_capacity(self.header.entry_count as usize);
        while buf.has_remaining() {
            let name = read_record(&mut buf)?;
            let data = read_record(&mut buf)?;
            let name = String::from_utf8(name)
                .map_err(|e| Error::Storage(format!("Invalid entry name: {}", e)))?;
            entries.push((name, data));
        }

        if entries.len() != self.header.entry_count as usize {
            return Err(Error::Storage(format!(
                "Entry count mismatch: expected {}, got {}",
                self.header.entry_count,
                entries.len()
            )));
        }
        Ok(entries)
    }

    /// Get container header
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_record(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(Error::Storage("Truncated record length".to_string()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(Error::Storage("Truncated record data".to_string()));
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    #[test]
    fn test_header_serialization() {
        let header = ContainerHeader {
            entry_count: 4,
            body_size: 120,
            raw_size: 300,
            checksum: 0xdead_beef,
            flags: FLAG_COMPRESSED,
        };
        let bytes = header.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(ContainerHeader::deserialize(&bytes).unwrap(), header);

        let mut bad = bytes.to_vec();
        bad[0] = b'X';
        assert!(ContainerHeader::deserialize(&bad).is_err());
    }

    #[test]
    fn test_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.hist");

        let mut writer = ContainerWriter::create(&path, ZSTD_COMPRESSION_LEVEL);
        writer.append("time_id", b"1_0").unwrap();
        writer.append("events", &[0u8; 512]).unwrap();
        writer.append("1_0/1/creation", b"").unwrap();
        let header = writer.finish().unwrap();

        assert_eq!(header.entry_count, 3);
        assert!(header.body_size < header.raw_size);
        assert!(!temp_path(&path).exists());

        let mut reader = ContainerReader::open(&path).unwrap();
        let entries = reader.read_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("time_id".to_string(), b"1_0".to_vec()));
        assert_eq!(entries[1].1.len(), 512);
        assert!(entries[2].1.is_empty());
    }

    #[test]
    fn test_overwrite_replaces_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.hist");

        let mut writer = ContainerWriter::create(&path, 1);
        writer.append("a", b"1").unwrap();
        writer.finish().unwrap();

        let writer = ContainerWriter::create(&path, 1);
        writer.finish().unwrap();

        let entries = ContainerReader::open(&path).unwrap().read_entries().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_checksum_verification() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.hist");

        let mut writer = ContainerWriter::create(&path, ZSTD_COMPRESSION_LEVEL);
        writer.append("events", b"some event graph bytes").unwrap();
        writer.finish().unwrap();

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 2)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.sync_all().unwrap();

        let mut reader = ContainerReader::open(&path).unwrap();
        let err = reader.read_entries().unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}

//! Binary persistence for the index/identifier-list pair.
//!
//! Two artifacts, always written and read together:
//!
//! `index.bin` header (47 bytes):
//! - version: u8 (1)
//! - encoder_id: [u8; 32] (SHA256 hash of the encoder id string)
//! - dimensions: u16 (little-endian)
//! - vector_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//! followed by `vector_count * dimensions` little-endian f32 values.
//!
//! `names.bin` header (13 bytes):
//! - version: u8 (1)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//! followed by `entry_count` entries, each a length-prefixed (u16 LE) UTF-8
//! identifier, then a one-byte label flag, then (when the flag is 1) a
//! length-prefixed (u16 LE) UTF-8 label. Labels travel with the pair so
//! serving a query never has to go back to the store.
//!
//! A present-without-its-pair file, a count disagreement between the two
//! files, or any header violation is treated as a corrupt index: the load
//! fails fast and the caller falls back to a rebuild.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::index::VectorIndex;

/// Current file format version.
const FORMAT_VERSION: u8 = 1;

/// index.bin header size: version(1) + encoder_id(32) + dimensions(2) + count(8) + checksum(4)
const INDEX_HEADER_SIZE: usize = 47;

/// names.bin header size: version(1) + count(8) + checksum(4)
const NAMES_HEADER_SIZE: usize = 13;

/// Errors that can occur loading or saving the persisted pair.
///
/// Every variant except `Io` during save means the on-disk pair must not be
/// served and a rebuild is required.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index file pair incomplete: {0} exists without its partner")]
    MissingPartner(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Encoder mismatch: index was built by a different encoder")]
    EncoderMismatch,

    #[error("Checksum mismatch: {0} may be corrupted")]
    ChecksumMismatch(String),

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Corrupt index pair: index holds {vectors} vectors but identifier list has {names} entries")]
    CountMismatch { vectors: usize, names: usize },

    #[error("Corrupt index pair: {names} identifiers but {labels} labels")]
    LabelCountMismatch { names: usize, labels: usize },

    #[error("Invalid identifier entry: {0}")]
    InvalidIdentifier(String),
}

/// SHA256 of the encoder id string, stored in the index header so an index
/// built by a different descriptor algorithm is never served.
pub fn encoder_id_hash(encoder_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(encoder_id.as_bytes());
    hasher.finalize().into()
}

/// Manager for the paired on-disk artifacts.
pub struct IndexFiles {
    index_path: PathBuf,
    names_path: PathBuf,
}

impl IndexFiles {
    pub fn new(index_path: PathBuf, names_path: PathBuf) -> Self {
        Self {
            index_path,
            names_path,
        }
    }

    /// Conventional pair layout under a data directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("index.bin"), dir.join("names.bin"))
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn names_path(&self) -> &Path {
        &self.names_path
    }

    /// True when both artifacts are present.
    pub fn exists(&self) -> bool {
        self.index_path.exists() && self.names_path.exists()
    }

    /// True when either half of the pair is present without the other.
    pub fn is_partial(&self) -> bool {
        self.index_path.exists() != self.names_path.exists()
    }

    /// Load the pair, validating headers and cross-file consistency.
    pub fn load(
        &self,
        expected_encoder: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(VectorIndex, Vec<String>, Vec<Option<String>>), PersistError> {
        if self.is_partial() {
            let present = if self.index_path.exists() {
                &self.index_path
            } else {
                &self.names_path
            };
            return Err(PersistError::MissingPartner(
                present.display().to_string(),
            ));
        }

        let index = self.load_index(expected_encoder, expected_dimensions)?;
        let (names, labels) = self.load_names()?;

        if index.vector_count() != names.len() {
            return Err(PersistError::CountMismatch {
                vectors: index.vector_count(),
                names: names.len(),
            });
        }

        Ok((index, names, labels))
    }

    /// Save the pair atomically: each file goes through temp -> fsync ->
    /// rename, names first so a crash between the two renames leaves a pair
    /// that fails the count check rather than a silently wrong one.
    pub fn save(
        &self,
        index: &VectorIndex,
        names: &[String],
        labels: &[Option<String>],
        encoder: &[u8; 32],
    ) -> Result<(), PersistError> {
        if index.vector_count() != names.len() {
            return Err(PersistError::CountMismatch {
                vectors: index.vector_count(),
                names: names.len(),
            });
        }
        if names.len() != labels.len() {
            return Err(PersistError::LabelCountMismatch {
                names: names.len(),
                labels: labels.len(),
            });
        }

        write_atomic(&self.names_path, |w| write_names(w, names, labels))?;
        write_atomic(&self.index_path, |w| write_index(w, index, encoder))?;

        Ok(())
    }

    /// Delete both artifacts if present.
    pub fn delete(&self) -> Result<(), PersistError> {
        for path in [&self.index_path, &self.names_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn load_index(
        &self,
        expected_encoder: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, PersistError> {
        let file = File::open(&self.index_path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; INDEX_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let version = header[0];
        if version > FORMAT_VERSION {
            return Err(PersistError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(header[43..47].try_into().expect("4-byte slice"));
        if stored_checksum != crc32fast::hash(&header[0..43]) {
            return Err(PersistError::ChecksumMismatch(
                self.index_path.display().to_string(),
            ));
        }

        let mut encoder = [0u8; 32];
        encoder.copy_from_slice(&header[1..33]);
        if encoder != *expected_encoder {
            return Err(PersistError::EncoderMismatch);
        }

        let dimensions = u16::from_le_bytes([header[33], header[34]]) as usize;
        if dimensions != expected_dimensions {
            return Err(PersistError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let count = u64::from_le_bytes(header[35..43].try_into().expect("8-byte slice")) as usize;

        let mut index = VectorIndex::with_capacity(dimensions, count);
        let mut vector = vec![0f32; dimensions];
        let mut buf = [0u8; 4];
        for _ in 0..count {
            for value in vector.iter_mut() {
                reader.read_exact(&mut buf)?;
                *value = f32::from_le_bytes(buf);
            }
            index
                .push(&vector)
                .expect("vector built with index dimensions");
        }

        Ok(index)
    }

    fn load_names(&self) -> Result<(Vec<String>, Vec<Option<String>>), PersistError> {
        let file = File::open(&self.names_path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; NAMES_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let version = header[0];
        if version > FORMAT_VERSION {
            return Err(PersistError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(header[9..13].try_into().expect("4-byte slice"));
        if stored_checksum != crc32fast::hash(&header[0..9]) {
            return Err(PersistError::ChecksumMismatch(
                self.names_path.display().to_string(),
            ));
        }

        let count = u64::from_le_bytes(header[1..9].try_into().expect("8-byte slice")) as usize;

        let mut names = Vec::with_capacity(count);
        let mut labels = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(read_string(&mut reader)?);

            let mut flag = [0u8; 1];
            reader.read_exact(&mut flag)?;
            labels.push(match flag[0] {
                0 => None,
                1 => Some(read_string(&mut reader)?),
                other => {
                    return Err(PersistError::InvalidIdentifier(format!(
                        "unknown label flag {other}"
                    )))
                }
            });
        }

        Ok((names, labels))
    }
}

/// Write through a temp file, fsync, then rename over the target.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), PersistError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), PersistError>,
{
    let temp_path = path.with_extension("tmp");

    let result = (|| {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
        return result;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn write_index(
    writer: &mut BufWriter<File>,
    index: &VectorIndex,
    encoder: &[u8; 32],
) -> Result<(), PersistError> {
    let mut header = [0u8; INDEX_HEADER_SIZE];
    header[0] = FORMAT_VERSION;
    header[1..33].copy_from_slice(encoder);
    header[33..35].copy_from_slice(&(index.dimensions() as u16).to_le_bytes());
    header[35..43].copy_from_slice(&(index.vector_count() as u64).to_le_bytes());
    let checksum = crc32fast::hash(&header[0..43]);
    header[43..47].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header)?;

    for vector in index.iter() {
        for &value in vector {
            writer.write_all(&value.to_le_bytes())?;
        }
    }

    Ok(())
}

fn write_names(
    writer: &mut BufWriter<File>,
    names: &[String],
    labels: &[Option<String>],
) -> Result<(), PersistError> {
    let mut header = [0u8; NAMES_HEADER_SIZE];
    header[0] = FORMAT_VERSION;
    header[1..9].copy_from_slice(&(names.len() as u64).to_le_bytes());
    let checksum = crc32fast::hash(&header[0..9]);
    header[9..13].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header)?;

    for (name, label) in names.iter().zip(labels) {
        write_string(writer, name)?;
        match label {
            None => writer.write_all(&[0u8])?,
            Some(label) => {
                writer.write_all(&[1u8])?;
                write_string(writer, label)?;
            }
        }
    }

    Ok(())
}

fn read_string(reader: &mut BufReader<File>) -> Result<String, PersistError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes)?;
    let len = u16::from_le_bytes(len_bytes) as usize;

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| PersistError::InvalidIdentifier(e.to_string()))
}

fn write_string(writer: &mut BufWriter<File>, value: &str) -> Result<(), PersistError> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(PersistError::InvalidIdentifier(format!(
            "entry too long: {} bytes",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u16).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

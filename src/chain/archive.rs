//! Cold-block archival
//!
//! Loose `<hash>.block` files are grouped by the first two hex characters
//! of their hash and compacted into one gzip archive per bucket
//! (`<prefix>.archive`), each record length-prefixed. A plain-text
//! `<prefix>.archiveL` index lists the archived hashes so startup can
//! repopulate the known-blocks set without decompressing anything.

use crate::codec::hash::Hash256;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Archival errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt archive {0}: {1}")]
    Corrupt(String, String),
}

/// Result of one archive pass
#[derive(Debug, Clone, Default)]
pub struct ArchiveStats {
    pub buckets_touched: usize,
    pub blocks_archived: usize,
}

/// Compacts loose block files into per-bucket gzip archives
pub struct BlockArchiver {
    dir: PathBuf,
}

impl BlockArchiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn archive_path(&self, prefix: &str) -> PathBuf {
        self.dir.join(format!("{}.archive", prefix))
    }

    fn index_path(&self, prefix: &str) -> PathBuf {
        self.dir.join(format!("{}.archiveL", prefix))
    }

    fn scratch_path(&self, prefix: &str) -> PathBuf {
        self.dir.join(format!("{}.scratch", prefix))
    }

    /// Runs one compaction pass over every bucket with loose block files.
    pub fn run_pass(&self) -> Result<ArchiveStats, ArchiveError> {
        let mut buckets: HashMap<String, Vec<(String, PathBuf)>> = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(hash_hex) = name.strip_suffix(".block") {
                if hash_hex.len() == 64 {
                    let prefix = hash_hex[..2].to_string();
                    buckets
                        .entry(prefix)
                        .or_default()
                        .push((hash_hex.to_string(), entry.path()));
                }
            }
        }

        let mut stats = ArchiveStats::default();
        for (prefix, blocks) in buckets {
            stats.blocks_archived += self.compact_bucket(&prefix, &blocks)?;
            stats.buckets_touched += 1;
        }
        Ok(stats)
    }

    /// Appends the given loose blocks to one bucket archive and deletes
    /// their individual files.
    fn compact_bucket(
        &self,
        prefix: &str,
        blocks: &[(String, PathBuf)],
    ) -> Result<usize, ArchiveError> {
        let archive_path = self.archive_path(prefix);
        let scratch_path = self.scratch_path(prefix);

        // Inflate the existing archive into the scratch file so new
        // records can be appended to the tail.
        if archive_path.exists() {
            let mut decoder = GzDecoder::new(BufReader::new(File::open(&archive_path)?));
            let mut scratch = BufWriter::new(File::create(&scratch_path)?);
            io::copy(&mut decoder, &mut scratch)?;
            scratch.flush()?;
        } else {
            File::create(&scratch_path)?;
        }

        let mut archived = self.read_index(prefix)?;
        let mut appended = 0;
        {
            let mut scratch = BufWriter::new(fs::OpenOptions::new().append(true).open(&scratch_path)?);
            for (hash_hex, path) in blocks {
                if archived.contains(hash_hex) {
                    // Already in the archive from an earlier pass; the
                    // loose file is a leftover.
                    fs::remove_file(path)?;
                    continue;
                }
                let payload = fs::read(path)?;
                let hash = match hex::decode(hash_hex) {
                    Ok(bytes) if bytes.len() == 32 => bytes,
                    _ => continue,
                };
                scratch.write_all(&((32 + payload.len()) as u32).to_le_bytes())?;
                scratch.write_all(&hash)?;
                scratch.write_all(&payload)?;
                fs::remove_file(path)?;
                archived.push(hash_hex.clone());
                appended += 1;
            }
            scratch.flush()?;
        }

        // Recompress the scratch file back into the bucket archive.
        let mut scratch = BufReader::new(File::open(&scratch_path)?);
        let mut encoder = GzEncoder::new(
            BufWriter::new(File::create(&archive_path)?),
            Compression::default(),
        );
        io::copy(&mut scratch, &mut encoder)?;
        encoder.finish()?.flush()?;
        fs::remove_file(&scratch_path)?;

        let mut index = BufWriter::new(File::create(self.index_path(prefix))?);
        for hash_hex in &archived {
            writeln!(index, "{}", hash_hex)?;
        }
        index.flush()?;

        Ok(appended)
    }

    fn read_index(&self, prefix: &str) -> Result<Vec<String>, ArchiveError> {
        let path = self.index_path(prefix);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut hashes = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.len() == 64 {
                hashes.push(line);
            }
        }
        Ok(hashes)
    }

    /// Loads every bucket index into a hash set without touching the
    /// compressed data. Used at startup.
    pub fn load_known_hashes(&self) -> Result<HashSet<Hash256>, ArchiveError> {
        let mut known = HashSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(prefix) = name.strip_suffix(".archiveL") {
                for hash_hex in self.read_index(prefix)? {
                    if let Ok(bytes) = hex::decode(&hash_hex) {
                        if bytes.len() == 32 {
                            let mut hash = [0u8; 32];
                            hash.copy_from_slice(&bytes);
                            known.insert(hash);
                        }
                    }
                }
            }
        }
        Ok(known)
    }

    /// Decompresses one bucket and returns its records. Test and recovery
    /// path only; normal operation never inflates archives.
    pub fn read_bucket(&self, prefix: &str) -> Result<Vec<(Hash256, Vec<u8>)>, ArchiveError> {
        let path = self.archive_path(prefix);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut decoder = GzDecoder::new(BufReader::new(File::open(&path)?));
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= raw.len() {
            let len = u32::from_le_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]])
                as usize;
            pos += 4;
            if len < 32 || pos + len > raw.len() {
                return Err(ArchiveError::Corrupt(
                    prefix.to_string(),
                    format!("record length {} at offset {}", len, pos),
                ));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&raw[pos..pos + 32]);
            records.push((hash, raw[pos + 32..pos + len].to_vec()));
            pos += len;
        }
        Ok(records)
    }
}

/// Path of a loose block file for the given hash
pub fn block_file_path(dir: &Path, hash: &Hash256) -> PathBuf {
    dir.join(format!("{}.block", hex::encode(hash)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_block(dir: &Path, hash: Hash256, payload: &[u8]) {
        fs::write(block_file_path(dir, &hash), payload).unwrap();
    }

    #[test]
    fn test_pass_moves_blocks_into_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = BlockArchiver::new(dir.path());

        let mut h1 = [0xAB; 32];
        h1[31] = 1;
        let mut h2 = [0xAB; 32];
        h2[31] = 2;
        write_block(dir.path(), h1, b"payload-one");
        write_block(dir.path(), h2, b"payload-two");

        let stats = archiver.run_pass().unwrap();
        assert_eq!(stats.buckets_touched, 1);
        assert_eq!(stats.blocks_archived, 2);

        // Loose files gone, archive and index in place.
        assert!(!block_file_path(dir.path(), &h1).exists());
        assert!(dir.path().join("ab.archive").exists());
        assert!(dir.path().join("ab.archiveL").exists());

        let mut records = archiver.read_bucket("ab").unwrap();
        records.sort_by_key(|(h, _)| *h);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (h1, b"payload-one".to_vec()));
        assert_eq!(records[1], (h2, b"payload-two".to_vec()));
    }

    #[test]
    fn test_second_pass_appends() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = BlockArchiver::new(dir.path());

        let h1 = [0x11; 32];
        write_block(dir.path(), h1, b"first");
        archiver.run_pass().unwrap();

        let mut h2 = [0x11; 32];
        h2[0] = 0x11;
        h2[31] = 9;
        write_block(dir.path(), h2, b"second");
        let stats = archiver.run_pass().unwrap();
        assert_eq!(stats.blocks_archived, 1);

        let records = archiver.read_bucket("11").unwrap();
        assert_eq!(records.len(), 2);

        let known = archiver.load_known_hashes().unwrap();
        assert!(known.contains(&h1));
        assert!(known.contains(&h2));
    }

    #[test]
    fn test_index_loads_without_decompression() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = BlockArchiver::new(dir.path());

        write_block(dir.path(), [0x42; 32], b"data");
        archiver.run_pass().unwrap();

        // Even with the compressed data gone the index still answers.
        fs::remove_file(dir.path().join("42.archive")).unwrap();
        let known = archiver.load_known_hashes().unwrap();
        assert!(known.contains(&[0x42; 32]));
    }
}

//! Block-allocated disk cache for spilled build data
//!
//! Each cache file is split into fixed-size blocks tracked by a used-bitmap.
//! An entry occupies a run of contiguous blocks in one file, found first-fit
//! across files; a new file is opened when nothing fits. Releasing an entry
//! only clears its bits.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{Error, Result};

/// Size of one cache block
pub const BLOCK_SIZE: u64 = 1024;

/// Blocks per cache file
pub const BLOCKS_PER_FILE: usize = 65536;

/// Where a cached entry lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskCachedAs {
    pub file_index: usize,
    pub first_block: usize,
    pub block_count: usize,
    /// Bytes stored on disk (after compression)
    pub stored_size: u64,
    /// Bytes handed to [`DiskCache::write`]
    pub raw_size: u64,
    pub compressed: bool,
}

impl DiskCachedAs {
    fn file_offset(&self) -> u64 {
        self.first_block as u64 * BLOCK_SIZE
    }
}

struct CacheFile {
    file: Arc<Mutex<File>>,
    used: Vec<bool>,
}

impl CacheFile {
    fn find_run(&self, blocks: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for (index, used) in self.used.iter().enumerate() {
            if *used {
                run_len = 0;
                run_start = index + 1;
                continue;
            }
            run_len += 1;
            if run_len == blocks {
                return Some(run_start);
            }
        }
        None
    }
}

/// Disk cache usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskCacheStats {
    pub files: usize,
    pub blocks_used: usize,
    pub bytes_stored: u64,
}

pub struct DiskCache {
    dir: PathBuf,
    compression: bool,
    files: Mutex<Vec<CacheFile>>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("dir", &self.dir)
            .field("compression", &self.compression)
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiskCache {
    /// Cache files are anonymous temp files in `dir` (system temp dir if `None`)
    pub fn new(dir: Option<&Path>, compression: bool) -> Self {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        Self { dir, compression, files: Mutex::new(Vec::new()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `data`, returning its location
    pub fn write(&self, data: &[u8]) -> Result<DiskCachedAs> {
        let stored = if self.compression {
            lz4_flex::compress_prepend_size(data)
        } else {
            data.to_vec()
        };
        let block_count = (stored.len() as u64).div_ceil(BLOCK_SIZE).max(1) as usize;
        if block_count > BLOCKS_PER_FILE {
            return Err(Error::DiskCache(format!(
                "{} bytes do not fit in one cache file",
                stored.len()
            )));
        }

        let (location, file) = self.reserve(block_count, stored.len() as u64, data.len() as u64)?;

        let written = (|| -> io::Result<()> {
            let mut file = lock(&file);
            file.seek(SeekFrom::Start(location.file_offset()))?;
            file.write_all(&stored)
        })();
        if let Err(e) = written {
            self.release(&location);
            return Err(Error::DiskCache(format!("write failed: {e}")));
        }

        log::trace!(
            "Disk cache: {} bytes -> file {} blocks {}..{}",
            data.len(),
            location.file_index,
            location.first_block,
            location.first_block + block_count
        );
        Ok(location)
    }

    fn reserve(&self, block_count: usize, stored_size: u64, raw_size: u64) -> Result<(DiskCachedAs, Arc<Mutex<File>>)> {
        let mut files = lock(&self.files);
        let found = files
            .iter()
            .enumerate()
            .find_map(|(index, f)| f.find_run(block_count).map(|first| (index, first)));

        let (file_index, first_block) = match found {
            Some(slot) => slot,
            None => {
                let file = tempfile::tempfile_in(&self.dir)
                    .map_err(|e| Error::DiskCache(format!("cannot create cache file in {}: {e}", self.dir.display())))?;
                file.set_len(BLOCKS_PER_FILE as u64 * BLOCK_SIZE)
                    .map_err(|e| Error::DiskCache(format!("cannot size cache file: {e}")))?;
                log::debug!("Disk cache: opened file {} in {}", files.len(), self.dir.display());
                files.push(CacheFile { file: Arc::new(Mutex::new(file)), used: vec![false; BLOCKS_PER_FILE] });
                (files.len() - 1, 0)
            }
        };

        let entry = &mut files[file_index];
        entry.used[first_block..first_block + block_count].fill(true);
        let location = DiskCachedAs {
            file_index,
            first_block,
            block_count,
            stored_size,
            raw_size,
            compressed: self.compression,
        };
        Ok((location, Arc::clone(&entry.file)))
    }

    /// Load an entry back
    pub fn read(&self, location: &DiskCachedAs) -> Result<Vec<u8>> {
        let file = {
            let files = lock(&self.files);
            let entry = files
                .get(location.file_index)
                .ok_or_else(|| Error::DiskCache(format!("no cache file {}", location.file_index)))?;
            if !entry.used[location.first_block] {
                return Err(Error::DiskCache("entry was released".into()));
            }
            Arc::clone(&entry.file)
        };

        let mut stored = vec![0u8; location.stored_size as usize];
        {
            let mut file = lock(&file);
            file.seek(SeekFrom::Start(location.file_offset()))?;
            file.read_exact(&mut stored)?;
        }

        if location.compressed {
            lz4_flex::decompress_size_prepended(&stored)
                .map_err(|e| Error::DiskCache(format!("LZ4 decompression failed: {e}")))
        } else {
            Ok(stored)
        }
    }

    /// Free an entry's blocks
    pub fn release(&self, location: &DiskCachedAs) {
        let mut files = lock(&self.files);
        if let Some(entry) = files.get_mut(location.file_index) {
            let end = (location.first_block + location.block_count).min(BLOCKS_PER_FILE);
            entry.used[location.first_block..end].fill(false);
        }
    }

    pub fn stats(&self) -> DiskCacheStats {
        let files = lock(&self.files);
        let blocks_used = files.iter().map(|f| f.used.iter().filter(|u| **u).count()).sum::<usize>();
        DiskCacheStats {
            files: files.len(),
            blocks_used,
            bytes_stored: blocks_used as u64 * BLOCK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_release() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(Some(dir.path()), true);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 7) as u8).collect();

        let loc = cache.write(&data).unwrap();
        assert!(loc.compressed);
        assert_eq!(loc.raw_size, 5000);
        assert_eq!(cache.read(&loc).unwrap(), data);
        assert_eq!(cache.stats().blocks_used, loc.block_count);

        cache.release(&loc);
        assert_eq!(cache.stats().blocks_used, 0);
        assert!(cache.read(&loc).is_err());
    }

    #[test]
    fn test_first_fit_reuses_freed_run() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(Some(dir.path()), false);

        let a = cache.write(&[1u8; 3000]).unwrap();
        let b = cache.write(&[2u8; 100]).unwrap();
        assert_eq!(a.block_count, 3);
        assert_eq!(b.first_block, 3);

        cache.release(&a);
        let c = cache.write(&[3u8; 2048]).unwrap();
        assert_eq!((c.file_index, c.first_block), (0, 0));
        assert_eq!(cache.read(&b).unwrap(), vec![2u8; 100]);
        assert_eq!(cache.read(&c).unwrap(), vec![3u8; 2048]);
        assert_eq!(cache.stats().files, 1);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(Some(dir.path()), false);
        let huge = vec![0u8; (BLOCKS_PER_FILE as u64 * BLOCK_SIZE + 1) as usize];
        assert!(matches!(cache.write(&huge), Err(Error::DiskCache(_))));
        assert_eq!(cache.stats().blocks_used, 0);
    }
}

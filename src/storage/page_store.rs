//! Page Store: a fixed-size slot file with a reserved header, a
//! free-list threaded through free sectors, and chained sectors for
//! records that don't fit in one.
//!
//! ## File layout
//! ```text
//! [ Superblock: magic, version, block_size, free_list_head, sector_count ]
//! [ Reserved buffer: 64 bytes, caller-owned (e.g. Index Store's unique_id) ]
//! [ Sector 0 ][ Sector 1 ][ Sector 2 ] ...
//! ```
//!
//! Each sector is `block_size` bytes: a 4-byte chain pointer (`-1` = tail),
//! a 4-byte CRC32 over the payload actually stored in that sector, then
//! the payload itself. `read_across` always bounds-checks and verifies
//! this checksum rather than trusting the byte stream.
//!
//! The store does not serialize logical writers against each other —
//! callers (the master table, the transaction commit path) are
//! responsible for that — but physical I/O on the single underlying
//! file handle is serialized internally.

use crate::storage::checksum::{Checksum, ChecksumType};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0x5047_5354; // "PGST"
const VERSION: u32 = 1;
const SUPERBLOCK_SIZE: u64 = 32;
pub const RESERVED_BUFFER_SIZE: usize = 64;
const HEADER_SIZE: u64 = SUPERBLOCK_SIZE + RESERVED_BUFFER_SIZE as u64;
const SECTOR_OVERHEAD: usize = 8; // 4-byte chain pointer + 4-byte CRC32
const LENGTH_PREFIX: usize = 8; // big-endian total record length

pub type SectorId = u64;

/// Chain pointer value marking the tail of a record.
const TAIL: i64 = -1;

struct Superblock {
    block_size: u16,
    free_list_head: i64,
    sector_count: u64,
}

impl Superblock {
    fn encode(&self) -> [u8; SUPERBLOCK_SIZE as usize] {
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_be_bytes());
        buf[8..10].copy_from_slice(&self.block_size.to_be_bytes());
        buf[16..24].copy_from_slice(&self.free_list_head.to_be_bytes());
        buf[24..32].copy_from_slice(&self.sector_count.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE as usize {
            return Err(StorageError::Corruption("page store header truncated".into()));
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad page store magic: {magic:#x}"
            )));
        }
        let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported page store version: {version}"
            )));
        }
        let block_size = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        let free_list_head = i64::from_be_bytes(buf[16..24].try_into().unwrap());
        let sector_count = u64::from_be_bytes(buf[24..32].try_into().unwrap());
        Ok(Superblock {
            block_size,
            free_list_head,
            sector_count,
        })
    }
}

/// A fixed-size slot file.
pub struct PageStore {
    path: PathBuf,
    file: Mutex<File>,
    read_only: bool,
    block_size: u16,
    // free_list_head and sector_count change on every alloc/free; guarded
    // by the same mutex as the file so they stay consistent with what's
    // on disk between explicit `hard_synch` calls.
    meta: Mutex<MetaState>,
}

struct MetaState {
    free_list_head: i64,
    sector_count: u64,
}

impl PageStore {
    /// Creates a brand-new page store file with the given block size.
    pub fn create<P: AsRef<Path>>(path: P, block_size: u16) -> Result<Self> {
        let path = path.as_ref();
        if !(1..=1024).contains(&block_size) {
            return Err(StorageError::Usage(format!(
                "block_size must be in 1..=1024, got {block_size}"
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let sb = Superblock {
            block_size,
            free_list_head: TAIL,
            sector_count: 0,
        };
        file.write_all(&sb.encode())?;
        file.write_all(&[0u8; RESERVED_BUFFER_SIZE])?;
        file.sync_all()?;
        fsync_parent_dir(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            read_only: false,
            block_size,
            meta: Mutex::new(MetaState {
                free_list_head: TAIL,
                sector_count: 0,
            }),
        })
    }

    /// Opens an existing page store file.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        let mut header = vec![0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact(&mut header)?;
        let sb = Superblock::decode(&header)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            read_only,
            block_size: sb.block_size,
            meta: Mutex::new(MetaState {
                free_list_head: sb.free_list_head,
                sector_count: sb.sector_count,
            }),
        })
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates the path this store believes it backs, after the caller
    /// has renamed the file on disk out from under an already-open
    /// handle (POSIX file descriptors survive a rename; `delete` would
    /// otherwise target the old name).
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    fn payload_capacity(&self) -> usize {
        (self.block_size as usize).saturating_sub(SECTOR_OVERHEAD)
    }

    fn sector_offset(&self, sector: SectorId) -> u64 {
        HEADER_SIZE + sector * self.block_size as u64
    }

    fn persist_superblock(&self, file: &mut File, meta: &MetaState) -> Result<()> {
        if self.read_only {
            return Err(StorageError::Usage("page store is read-only".into()));
        }
        let sb = Superblock {
            block_size: self.block_size,
            free_list_head: meta.free_list_head,
            sector_count: meta.sector_count,
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&sb.encode())?;
        Ok(())
    }

    pub fn read_reserved_buffer(&self) -> Result<[u8; RESERVED_BUFFER_SIZE]> {
        let mut file = self.file.lock();
        let mut buf = [0u8; RESERVED_BUFFER_SIZE];
        file.seek(SeekFrom::Start(SUPERBLOCK_SIZE))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_reserved_buffer(&self, buf: &[u8; RESERVED_BUFFER_SIZE]) -> Result<()> {
        if self.read_only {
            return Err(StorageError::Usage("page store is read-only".into()));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(SUPERBLOCK_SIZE))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Allocates one sector, preferring the free-list over growing the file.
    pub fn alloc_sector(&self) -> Result<SectorId> {
        if self.read_only {
            return Err(StorageError::Usage("page store is read-only".into()));
        }
        let mut file = self.file.lock();
        let mut meta = self.meta.lock();

        if meta.free_list_head != TAIL {
            let sector = meta.free_list_head as u64;
            let mut head = vec![0u8; 4];
            file.seek(SeekFrom::Start(self.sector_offset(sector)))?;
            file.read_exact(&mut head)?;
            let next = i32::from_be_bytes(head.try_into().unwrap()) as i64;
            meta.free_list_head = next;
            self.persist_superblock(&mut file, &meta)?;
            return Ok(sector);
        }

        let sector = meta.sector_count;
        meta.sector_count += 1;
        self.persist_superblock(&mut file, &meta)?;
        Ok(sector)
    }

    /// Returns a sector to the free-list; it becomes the new head.
    pub fn free_sector(&self, sector: SectorId) -> Result<()> {
        if self.read_only {
            return Err(StorageError::Usage("page store is read-only".into()));
        }
        let mut file = self.file.lock();
        let mut meta = self.meta.lock();

        let mut block = vec![0u8; self.block_size as usize];
        block[0..4].copy_from_slice(&(meta.free_list_head as i32).to_be_bytes());
        file.seek(SeekFrom::Start(self.sector_offset(sector)))?;
        file.write_all(&block)?;

        meta.free_list_head = sector as i64;
        self.persist_superblock(&mut file, &meta)?;
        Ok(())
    }

    /// Writes `data` across as many chained sectors as needed and returns
    /// the head sector id.
    pub fn write_across(&self, data: &[u8]) -> Result<SectorId> {
        let capacity = self.payload_capacity();
        if capacity == 0 {
            return Err(StorageError::Usage(
                "block_size too small to hold any payload".into(),
            ));
        }

        let mut framed = Vec::with_capacity(LENGTH_PREFIX + data.len());
        framed.extend_from_slice(&(data.len() as u64).to_be_bytes());
        framed.extend_from_slice(data);

        let chunks: Vec<&[u8]> = framed.chunks(capacity).collect();
        let chunk_count = chunks.len().max(1);
        let mut sectors = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            sectors.push(self.alloc_sector()?);
        }

        let mut file = self.file.lock();
        for (i, &sector) in sectors.iter().enumerate() {
            let payload = chunks.get(i).copied().unwrap_or(&[]);
            let next = if i + 1 < sectors.len() {
                sectors[i + 1] as i32
            } else {
                -1
            };
            let crc = Checksum::compute(ChecksumType::CRC32C, payload);

            let mut block = vec![0u8; self.block_size as usize];
            block[0..4].copy_from_slice(&next.to_be_bytes());
            block[4..8].copy_from_slice(&crc.to_be_bytes());
            block[8..8 + payload.len()].copy_from_slice(payload);

            file.seek(SeekFrom::Start(self.sector_offset(sector)))?;
            file.write_all(&block)?;
        }

        Ok(sectors[0])
    }

    /// Follows the chain from `head` and reassembles the original bytes
    /// passed to `write_across`.
    pub fn read_across(&self, head: SectorId) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        let mut out = Vec::new();
        let mut next = head as i64;

        while next != TAIL {
            let sector = next as u64;
            let mut block = vec![0u8; self.block_size as usize];
            file.seek(SeekFrom::Start(self.sector_offset(sector)))?;
            file.read_exact(&mut block)?;

            let chain = i32::from_be_bytes(block[0..4].try_into().unwrap());
            let crc = u32::from_be_bytes(block[4..8].try_into().unwrap());
            let payload_capacity = self.payload_capacity();
            let payload = &block[8..8 + payload_capacity];

            // We don't yet know how many of `payload_capacity` bytes are
            // meaningful versus padding until we've decoded the length
            // prefix, so checksum the whole capacity window: `write_across`
            // zero-fills the remainder, so this is reproducible.
            let actual_crc = Checksum::compute(ChecksumType::CRC32C, payload);
            if actual_crc != crc {
                return Err(StorageError::Corruption(format!(
                    "sector {sector} checksum mismatch"
                )));
            }

            out.extend_from_slice(payload);
            next = chain as i64;
        }

        if out.len() < LENGTH_PREFIX {
            return Err(StorageError::Corruption("record shorter than length prefix".into()));
        }
        let len = u64::from_be_bytes(out[0..LENGTH_PREFIX].try_into().unwrap()) as usize;
        if out.len() < LENGTH_PREFIX + len {
            return Err(StorageError::Corruption(
                "record truncated: chain shorter than declared length".into(),
            ));
        }

        Ok(out[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec())
    }

    /// Returns the sector ids in a chain, in order, without decoding the
    /// payload. Used to free a superseded chain (e.g. rewriting the
    /// persisted index set) without re-reading its contents.
    pub fn chain_sectors(&self, head: SectorId) -> Result<Vec<SectorId>> {
        let mut file = self.file.lock();
        let mut sectors = Vec::new();
        let mut next = head as i64;
        while next != TAIL {
            let sector = next as u64;
            sectors.push(sector);
            let mut chain_ptr = [0u8; 4];
            file.seek(SeekFrom::Start(self.sector_offset(sector)))?;
            file.read_exact(&mut chain_ptr)?;
            next = i32::from_be_bytes(chain_ptr) as i64;
        }
        Ok(sectors)
    }

    /// Frees every sector in a chain.
    pub fn free_chain(&self, head: SectorId) -> Result<()> {
        for sector in self.chain_sectors(head)? {
            self.free_sector(sector)?;
        }
        Ok(())
    }

    /// fsync-equivalent: flushes file content (and, the first time a page
    /// store is created, the parent directory entry — handled in
    /// `create`).
    pub fn hard_synch(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }

    /// Closes and removes the underlying file. Callers must ensure no
    /// other snapshot still needs it.
    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

fn fsync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        let dir = File::open(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: `dir` stays open and valid for the duration of the call.
            unsafe {
                libc::fsync(dir.as_raw_fd());
            }
        }
        #[cfg(not(unix))]
        {
            let _ = dir;
        }
    }
    Ok(())
}

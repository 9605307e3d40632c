//! Framed, checksummed record file shared by the row logs and the LSM index WAL.
//!
//! ```text
//! +------------------+
//! | Header (16 bytes)|  magic:[u8;8] | version:u32 | reserved:u32
//! +------------------+
//! | Frame 1          |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Frame Format
//!
//! ```text
//! +-----------+---------+-----------+-----------+
//! |len:u32    | payload |crc32:u32  |len:u32    |
//! +-----------+---------+-----------+-----------+
//! ```
//!
//! - All integers are big-endian
//! - The CRC covers the payload only
//! - The trailing length lets readers walk the file backwards
//!
//! A frame's offset is its identity: appends return offsets and reads are
//! positional, so readers never contend with the single appender. A torn frame
//! at the tail (crash mid-append) is truncated on open.

use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
pub const HEADER_SIZE: u64 = 16;
const FRAME_OVERHEAD: u64 = 12;
const VERSION: u32 = 1;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

pub struct RecordFile {
    path: PathBuf,
    reader: File,
    writer: Mutex<BufWriter<File>>,
    end: AtomicU64,
}

impl std::fmt::Debug for RecordFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFile")
            .field("path", &self.path)
            .field("end", &self.end.load(Ordering::SeqCst))
            .finish()
    }
}

impl RecordFile {
    /// Opens (or creates) a record file whose header carries `magic`.
    pub fn open(path: impl AsRef<Path>, magic: &[u8; 8]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            let mut header = [0u8; HEADER_SIZE as usize];
            header[0..8].copy_from_slice(magic);
            BigEndian::write_u32(&mut header[8..12], VERSION);
            file.write_all_at(&header, 0)?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            file.read_exact_at(&mut header, 0)
                .map_err(|e| Error::CorruptedLog(format!("{:?}: short header: {}", path, e)))?;
            if &header[0..8] != magic {
                return Err(Error::CorruptedLog(format!("{:?}: bad magic", path)));
            }
            let version = BigEndian::read_u32(&header[8..12]);
            if version != VERSION {
                return Err(Error::CorruptedLog(format!(
                    "{:?}: unsupported version {}",
                    path, version
                )));
            }
        }

        let end = Self::recover_end(&file, &path)?;

        let mut append_handle = file.try_clone()?;
        append_handle.set_len(end)?;
        std::io::Seek::seek(&mut append_handle, std::io::SeekFrom::Start(end))?;

        Ok(Self {
            path,
            reader: file,
            writer: Mutex::new(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, append_handle)),
            end: AtomicU64::new(end),
        })
    }

    /// Walks every frame and returns the offset just past the last intact one.
    fn recover_end(file: &File, path: &Path) -> Result<u64> {
        let size = file.metadata()?.len();
        let mut offset = HEADER_SIZE;
        while offset < size {
            match read_frame(file, offset, size) {
                Ok((_, next)) => offset = next,
                Err(e) => {
                    tracing::warn!(
                        path = ?path,
                        offset = offset,
                        size = size,
                        error = %e,
                        "Truncating torn tail of record file"
                    );
                    break;
                }
            }
        }
        Ok(offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset one past the last appended frame.
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.end() == HEADER_SIZE
    }

    /// Appends payloads as one write and returns the offset of each frame.
    pub fn append(&self, payloads: &[Vec<u8>]) -> Result<Vec<u64>> {
        let mut writer = self.writer.lock()?;
        let mut offset = self.end.load(Ordering::SeqCst);
        let mut offsets = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let len = payload.len() as u32;
            writer.write_u32::<BigEndian>(len)?;
            writer.write_all(payload)?;
            writer.write_u32::<BigEndian>(CRC32.checksum(payload))?;
            writer.write_u32::<BigEndian>(len)?;
            offsets.push(offset);
            offset += FRAME_OVERHEAD + payload.len() as u64;
        }
        writer.flush()?;

        // Publish only after the bytes reached the file.
        self.end.store(offset, Ordering::SeqCst);
        Ok(offsets)
    }

    /// Reads the payload of the frame at `offset`.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>> {
        let end = self.end();
        if offset < HEADER_SIZE || offset >= end {
            return Err(Error::InvalidInput(format!(
                "offset {} outside {:?} [{}, {})",
                offset, self.path, HEADER_SIZE, end
            )));
        }
        read_frame(&self.reader, offset, end).map(|(payload, _)| payload)
    }

    /// Visits frames starting at `from` (inclusive). Reverse scans without a
    /// start begin at the last frame. The visitor returns `false` to stop.
    pub fn scan(
        &self,
        from: Option<u64>,
        reverse: bool,
        visitor: &mut dyn FnMut(u64, Vec<u8>) -> Result<bool>,
    ) -> Result<()> {
        let end = self.end();

        if !reverse {
            let mut offset = from.unwrap_or(HEADER_SIZE).max(HEADER_SIZE);
            while offset < end {
                let (payload, next) = read_frame(&self.reader, offset, end)?;
                if !visitor(offset, payload)? {
                    break;
                }
                offset = next;
            }
            return Ok(());
        }

        let mut cursor = match from {
            Some(offset) if offset < end => read_frame(&self.reader, offset, end)?.1,
            _ => end,
        };
        while cursor > HEADER_SIZE {
            let mut trailer = [0u8; 4];
            self.reader.read_exact_at(&mut trailer, cursor - 4)?;
            let len = BigEndian::read_u32(&trailer) as u64;
            let start = cursor
                .checked_sub(FRAME_OVERHEAD + len)
                .filter(|start| *start >= HEADER_SIZE)
                .ok_or_else(|| {
                    Error::CorruptedLog(format!("{:?}: bad trailer at {}", self.path, cursor))
                })?;
            let (payload, _) = read_frame(&self.reader, start, end)?;
            if !visitor(start, payload)? {
                break;
            }
            cursor = start;
        }
        Ok(())
    }

    /// Pushes buffered bytes to the OS, and to disk when `fsync` is set.
    pub fn flush(&self, fsync: bool) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.flush()?;
        if fsync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

fn read_frame(file: &File, offset: u64, end: u64) -> Result<(Vec<u8>, u64)> {
    if offset + FRAME_OVERHEAD > end {
        return Err(Error::CorruptedLog(format!("frame header past end at {}", offset)));
    }
    let mut len_buf = [0u8; 4];
    file.read_exact_at(&mut len_buf, offset)?;
    let len = BigEndian::read_u32(&len_buf) as u64;

    let next = offset + FRAME_OVERHEAD + len;
    if next > end {
        return Err(Error::CorruptedLog(format!(
            "frame at {} of length {} runs past end {}",
            offset, len, end
        )));
    }

    let mut body = vec![0u8; len as usize + 8];
    file.read_exact_at(&mut body, offset + 4)?;
    let payload_len = len as usize;
    let stored_crc = BigEndian::read_u32(&body[payload_len..payload_len + 4]);
    let trailer = BigEndian::read_u32(&body[payload_len + 4..]) as u64;
    body.truncate(payload_len);

    if CRC32.checksum(&body) != stored_crc {
        return Err(Error::ChecksumMismatch(offset));
    }
    if trailer != len {
        return Err(Error::CorruptedLog(format!("trailer mismatch at {}", offset)));
    }
    Ok((body, next))
}

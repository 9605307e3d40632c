//! Immutable sorted runs.
//!
//! ```text
//! +---------+---------+-----+-------+--------+
//! | block 0 | block 1 | ... | index | footer |
//! +---------+---------+-----+-------+--------+
//!
//! block:  entry* | crc32
//! entry:  shared:u32 | unshared:u32 | value_len:u32 | key suffix | value
//! index:  count:u32 | (key_len:u32 | first_key | offset:u64 | size:u64)*
//! footer: index_offset:u64 | entries:u64 | magic[8]
//! ```
//!
//! Keys within a block are delta-encoded against the previous key.

use crate::error::Result;
use crate::log::record::CRC32;
use crate::Error;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::ops::Bound;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub const MAX_BLOCK_SIZE: usize = 4096;
const MAGIC: &[u8; 8] = b"DKVRUN01";
const FOOTER_SIZE: u64 = 24;

#[derive(Debug, Clone)]
struct BlockHandle {
    first_key: Vec<u8>,
    offset: u64,
    size: u64,
}

struct BlockBuilder {
    buffer: Vec<u8>,
    last_key: Vec<u8>,
    first_key: Option<Vec<u8>>,
}

impl BlockBuilder {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_BLOCK_SIZE),
            last_key: Vec::new(),
            first_key: None,
        }
    }

    fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = self
            .last_key
            .iter()
            .zip(key)
            .take_while(|(a, b)| a == b)
            .count();
        // Writes into a Vec cannot fail.
        let _ = self.buffer.write_u32::<BigEndian>(shared as u32);
        let _ = self.buffer.write_u32::<BigEndian>((key.len() - shared) as u32);
        let _ = self.buffer.write_u32::<BigEndian>(value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.first_key.is_none()
    }

    fn finish(mut self) -> (Vec<u8>, Vec<u8>) {
        let crc = CRC32.checksum(&self.buffer);
        let _ = self.buffer.write_u32::<BigEndian>(crc);
        (self.first_key.unwrap_or_default(), self.buffer)
    }
}

fn decode_block(data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if data.len() < 4 {
        return Err(Error::Decode("run block", "shorter than checksum".into()));
    }
    let (body, crc) = data.split_at(data.len() - 4);
    if CRC32.checksum(body) != BigEndian::read_u32(crc) {
        return Err(Error::Decode("run block", "checksum mismatch".into()));
    }

    let mut entries = Vec::new();
    let mut cursor = Cursor::new(body);
    let mut last_key: Vec<u8> = Vec::new();
    while (cursor.position() as usize) < body.len() {
        let shared = cursor.read_u32::<BigEndian>()? as usize;
        let unshared = cursor.read_u32::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        if shared > last_key.len() {
            return Err(Error::Decode("run block", format!("shared prefix {} too long", shared)));
        }
        let mut key = last_key[..shared].to_vec();
        let mut suffix = vec![0u8; unshared];
        cursor.read_exact(&mut suffix)?;
        key.extend_from_slice(&suffix);
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value)?;
        last_key.clone_from(&key);
        entries.push((key, value));
    }
    Ok(entries)
}

pub struct Run {
    id: u64,
    path: PathBuf,
    file: File,
    blocks: Vec<BlockHandle>,
    entries: u64,
}

impl Run {
    /// Writes sorted, unique `entries` to `path` and syncs the file.
    pub fn write(
        path: impl AsRef<Path>,
        id: u64,
        entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        let mut blocks = Vec::new();
        let mut offset = 0u64;
        let mut count = 0u64;
        let mut builder = BlockBuilder::new();

        let mut seal = |builder: BlockBuilder, writer: &mut BufWriter<File>, offset: &mut u64| -> Result<()> {
            let (first_key, data) = builder.finish();
            writer.write_all(&data)?;
            blocks.push(BlockHandle {
                first_key,
                offset: *offset,
                size: data.len() as u64,
            });
            *offset += data.len() as u64;
            Ok(())
        };

        for (key, value) in entries {
            builder.add(&key, &value);
            count += 1;
            if builder.len() >= MAX_BLOCK_SIZE {
                seal(std::mem::replace(&mut builder, BlockBuilder::new()), &mut writer, &mut offset)?;
            }
        }
        if !builder.is_empty() {
            seal(builder, &mut writer, &mut offset)?;
        }

        let index_offset = offset;
        writer.write_u32::<BigEndian>(blocks.len() as u32)?;
        for block in &blocks {
            writer.write_u32::<BigEndian>(block.first_key.len() as u32)?;
            writer.write_all(&block.first_key)?;
            writer.write_u64::<BigEndian>(block.offset)?;
            writer.write_u64::<BigEndian>(block.size)?;
        }
        writer.write_u64::<BigEndian>(index_offset)?;
        writer.write_u64::<BigEndian>(count)?;
        writer.write_all(MAGIC)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Self::open(path, id)
    }

    pub fn open(path: impl AsRef<Path>, id: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE {
            return Err(Error::Decode("run", format!("{:?} shorter than footer", path)));
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact_at(&mut footer, size - FOOTER_SIZE)?;
        if &footer[16..] != MAGIC {
            return Err(Error::Decode("run", format!("{:?} has a foreign footer", path)));
        }
        let index_offset = BigEndian::read_u64(&footer[..8]);
        let entries = BigEndian::read_u64(&footer[8..16]);
        if index_offset > size - FOOTER_SIZE {
            return Err(Error::Decode("run", format!("{:?} index offset out of range", path)));
        }

        let mut index = vec![0u8; (size - FOOTER_SIZE - index_offset) as usize];
        file.read_exact_at(&mut index, index_offset)?;
        let mut cursor = Cursor::new(index.as_slice());
        let count = cursor.read_u32::<BigEndian>()?;
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let mut first_key = vec![0u8; key_len];
            cursor.read_exact(&mut first_key)?;
            blocks.push(BlockHandle {
                first_key,
                offset: cursor.read_u64::<BigEndian>()?,
                size: cursor.read_u64::<BigEndian>()?,
            });
        }

        Ok(Self {
            id,
            path,
            file,
            blocks,
            entries,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn read_block(&self, index: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = &self.blocks[index];
        let mut data = vec![0u8; handle.size as usize];
        self.file.read_exact_at(&mut data, handle.offset)?;
        decode_block(&data)
    }

    /// Index of the last block whose first key is `<= key`.
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        self.blocks
            .partition_point(|b| b.first_key.as_slice() <= key)
            .checked_sub(1)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(index) = self.block_for(key) else {
            return Ok(None);
        };
        Ok(self
            .read_block(index)?
            .into_iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v))
    }

    /// Entries at or after `lower`, in key order.
    pub fn scan(&self, lower: Bound<&[u8]>) -> RunIter<'_> {
        let (start, bound) = match lower {
            Bound::Included(key) | Bound::Excluded(key) => {
                (self.block_for(key).unwrap_or(0), Some(key.to_vec()))
            }
            Bound::Unbounded => (0, None),
        };
        RunIter {
            run: self,
            next_block: start,
            buffered: Vec::new().into_iter(),
            lower: match lower {
                Bound::Included(_) => bound.map(Bound::Included),
                Bound::Excluded(_) => bound.map(Bound::Excluded),
                Bound::Unbounded => None,
            }
            .unwrap_or(Bound::Unbounded),
        }
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("blocks", &self.blocks.len())
            .field("entries", &self.entries)
            .finish()
    }
}

pub struct RunIter<'a> {
    run: &'a Run,
    next_block: usize,
    buffered: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    lower: Bound<Vec<u8>>,
}

impl Iterator for RunIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for (key, value) in self.buffered.by_ref() {
                let after_lower = match &self.lower {
                    Bound::Included(lower) => &key >= lower,
                    Bound::Excluded(lower) => &key > lower,
                    Bound::Unbounded => true,
                };
                if after_lower {
                    self.lower = Bound::Unbounded;
                    return Some(Ok((key, value)));
                }
            }

            if self.next_block >= self.run.blocks.len() {
                return None;
            }
            match self.run.read_block(self.next_block) {
                Ok(entries) => {
                    self.buffered = entries.into_iter();
                    self.next_block += 1;
                }
                Err(e) => {
                    self.next_block = self.run.blocks.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| (format!("key-{:06}", i).into_bytes(), format!("value-{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn test_write_and_get() -> Result<()> {
        let dir = tempdir()?;
        let data = entries(2_000);
        let run = Run::write(dir.path().join("1.run"), 1, data.clone())?;
        assert_eq!(run.len(), 2_000);
        assert!(run.blocks.len() > 1, "Expected several blocks");

        for (key, value) in data.iter().step_by(97) {
            assert_eq!(run.get(key)?, Some(value.clone()));
        }
        assert_eq!(run.get(b"key-999999")?, None);
        assert_eq!(run.get(b"a")?, None);
        Ok(())
    }

    #[test]
    fn test_scan_from_bound() -> Result<()> {
        let dir = tempdir()?;
        let run = Run::write(dir.path().join("1.run"), 1, entries(1_000))?;

        let from = b"key-000500".to_vec();
        let included: Vec<_> = run.scan(Bound::Included(&from)).collect::<Result<_>>()?;
        assert_eq!(included.len(), 500);
        assert_eq!(included[0].0, from);

        let excluded: Vec<_> = run.scan(Bound::Excluded(&from)).collect::<Result<_>>()?;
        assert_eq!(excluded.len(), 499);

        let all = run.scan(Bound::Unbounded).count();
        assert_eq!(all, 1_000);
        Ok(())
    }

    #[test]
    fn test_reopen_and_detect_corruption() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("7.run");
        Run::write(&path, 7, entries(100))?;

        let reopened = Run::open(&path, 7)?;
        assert_eq!(reopened.len(), 100);
        assert_eq!(reopened.get(b"key-000042")?, Some(b"value-42".to_vec()));

        // Flip a byte inside the first block
        let file = OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(&[0xff], 20)?;
        let corrupted = Run::open(&path, 7)?;
        assert!(corrupted.get(b"key-000000").is_err());
        Ok(())
    }

    #[test]
    fn test_empty_run() -> Result<()> {
        let dir = tempdir()?;
        let run = Run::write(dir.path().join("0.run"), 0, Vec::new())?;
        assert!(run.is_empty());
        assert_eq!(run.get(b"x")?, None);
        assert_eq!(run.scan(Bound::Unbounded).count(), 0);
        Ok(())
    }
}

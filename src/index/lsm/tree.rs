//! A small log-structured tree: a skip-list memtable backed by a WAL, flushed
//! into immutable sorted runs listed in a `RUNS` manifest.
//!
//! Writes are batches; one batch is one WAL frame, so a batch is either fully
//! replayed after a crash or not at all. Runs are merged into one when more
//! than [`MAX_RUNS`] accumulate.

use super::iterator::{KvIterator, MergeIterator};
use super::run::Run;
use crate::encoding::bincode;
use crate::error::Result;
use crate::log::record::RecordFile;
use crossbeam_skiplist::SkipMap;
use std::fs;
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const WAL_MAGIC: &[u8; 8] = b"DKV\x00IWAL";
const MANIFEST: &str = "RUNS";
pub const MAX_RUNS: usize = 8;

pub type Batch = Vec<(Vec<u8>, Vec<u8>)>;

#[derive(Default)]
struct Memtable {
    map: SkipMap<Vec<u8>, Vec<u8>>,
    size: AtomicUsize,
}

impl Memtable {
    fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> usize {
        let added = key.len() + value.len();
        self.map.insert(key, value);
        self.size.fetch_add(added, Ordering::Relaxed) + added
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).map(|e| e.value().clone())
    }

    fn range<'a>(&'a self, lower: &'a Bound<Vec<u8>>, upper: &'a Bound<Vec<u8>>) -> KvIterator<'a> {
        Box::new(
            self.map
                .range::<Vec<u8>, _>((lower.as_ref(), upper.as_ref()))
                .map(|e| Ok((e.key().clone(), e.value().clone()))),
        )
    }
}

struct MemState {
    table: Arc<Memtable>,
    wal: Arc<RecordFile>,
    wal_id: u64,
    /// WALs replayed into `table` on open, deleted once it is flushed.
    replayed: Vec<u64>,
}

pub struct LsmTree {
    dir: RwLock<PathBuf>,
    mem: RwLock<MemState>,
    frozen: RwLock<Option<Arc<Memtable>>>,
    /// Newest first.
    runs: RwLock<Vec<Arc<Run>>>,
    next_id: AtomicU64,
    flush_lock: Mutex<()>,
    memtable_size: usize,
}

fn wal_name(id: u64) -> String {
    format!("{:08}.wal", id)
}

fn run_name(id: u64) -> String {
    format!("{:08}.run", id)
}

fn parse_id(path: &Path, extension: &str) -> Option<u64> {
    if path.extension()?.to_str()? != extension {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

impl LsmTree {
    pub fn open(dir: impl AsRef<Path>, memtable_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let listed: Vec<u64> = match fs::read(dir.join(MANIFEST)) {
            Ok(bytes) => bincode::deserialize("run manifest", &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut wal_ids = Vec::new();
        let mut max_id = listed.iter().copied().max().unwrap_or(0);
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(id) = parse_id(&path, "wal") {
                wal_ids.push(id);
                max_id = max_id.max(id);
            } else if let Some(id) = parse_id(&path, "run") {
                max_id = max_id.max(id);
                if !listed.contains(&id) {
                    tracing::warn!(?path, "Removing run missing from manifest");
                    fs::remove_file(&path)?;
                }
            }
        }
        wal_ids.sort_unstable();

        let runs = listed
            .iter()
            .map(|id| Run::open(dir.join(run_name(*id)), *id).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let table = Arc::new(Memtable::default());
        let mut replayed_batches = 0usize;
        for id in &wal_ids {
            let wal = RecordFile::open(dir.join(wal_name(*id)), WAL_MAGIC)?;
            wal.scan(None, false, &mut |_, payload| {
                let batch: Batch = bincode::deserialize("index wal batch", &payload)?;
                for (key, value) in batch {
                    table.insert(key, value);
                }
                replayed_batches += 1;
                Ok(true)
            })?;
        }

        let wal_id = max_id + 1;
        let wal = Arc::new(RecordFile::open(dir.join(wal_name(wal_id)), WAL_MAGIC)?);

        tracing::debug!(
            dir = ?dir,
            runs = runs.len(),
            wals = wal_ids.len(),
            batches = replayed_batches,
            "Opened index tree"
        );

        Ok(Self {
            dir: RwLock::new(dir),
            mem: RwLock::new(MemState {
                table,
                wal,
                wal_id,
                replayed: wal_ids,
            }),
            frozen: RwLock::new(None),
            runs: RwLock::new(runs),
            next_id: AtomicU64::new(wal_id + 1),
            flush_lock: Mutex::new(()),
            memtable_size,
        })
    }

    pub fn dir(&self) -> Result<PathBuf> {
        Ok(self.dir.read()?.clone())
    }

    /// Points the tree at its directory after the directory was renamed.
    pub fn relocate(&self, dir: impl Into<PathBuf>) -> Result<()> {
        *self.dir.write()? = dir.into();
        Ok(())
    }

    pub fn write(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let payload = bincode::serialize("index wal batch", &batch)?;
        let full = {
            let mem = self.mem.read()?;
            mem.wal.append(&[payload])?;
            let mut size = 0;
            for (key, value) in batch {
                size = mem.table.insert(key, value);
            }
            size >= self.memtable_size
        };
        if full {
            self.flush_memtable()?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.mem.read()?.table.clone();
        if let Some(value) = table.get(key) {
            return Ok(Some(value));
        }
        let frozen = self.frozen.read()?.clone();
        if let Some(value) = frozen.as_ref().and_then(|f| f.get(key)) {
            return Ok(Some(value));
        }
        let runs = self.runs.read()?.clone();
        for run in runs.iter() {
            if let Some(value) = run.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Visits live entries in `[lower, upper]` by bound, newest version per key.
    pub fn scan(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
        reverse: bool,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let table = self.mem.read()?.table.clone();
        let frozen = self.frozen.read()?.clone();
        let runs = self.runs.read()?.clone();

        let mut sources: Vec<KvIterator<'_>> = vec![table.range(&lower, &upper)];
        if let Some(frozen) = &frozen {
            sources.push(frozen.range(&lower, &upper));
        }
        for run in runs.iter() {
            let upper = &upper;
            sources.push(Box::new(run.scan(lower.as_ref().map(Vec::as_slice)).take_while(
                move |item| match (item, upper) {
                    (Ok((key, _)), Bound::Included(u)) => key <= u,
                    (Ok((key, _)), Bound::Excluded(u)) => key < u,
                    _ => true,
                },
            )));
        }

        let merged = MergeIterator::new(sources);
        if !reverse {
            for item in merged {
                let (key, value) = item?;
                if !visitor(&key, &value)? {
                    break;
                }
            }
            return Ok(());
        }

        let collected = merged.collect::<Result<Vec<_>>>()?;
        for (key, value) in collected.iter().rev() {
            if !visitor(key, value)? {
                break;
            }
        }
        Ok(())
    }

    pub fn flush(&self, fsync: bool) -> Result<()> {
        let wal = self.mem.read()?.wal.clone();
        wal.flush(fsync)
    }

    /// Writes the memtable out as a new run and starts a fresh WAL.
    pub fn flush_memtable(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock()?;
        let dir = self.dir()?;

        let (table, retired) = {
            let mut mem = self.mem.write()?;
            if mem.table.map.is_empty() {
                return Ok(());
            }
            let wal_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let wal = Arc::new(RecordFile::open(dir.join(wal_name(wal_id)), WAL_MAGIC)?);
            let previous = std::mem::replace(
                &mut *mem,
                MemState {
                    table: Arc::new(Memtable::default()),
                    wal,
                    wal_id,
                    replayed: Vec::new(),
                },
            );
            // Published before the write lock drops so readers never miss it.
            *self.frozen.write()? = Some(previous.table.clone());
            let mut retired = previous.replayed;
            retired.push(previous.wal_id);
            (previous.table, retired)
        };

        let run_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entries = table.map.len();
        let run = Run::write(
            dir.join(run_name(run_id)),
            run_id,
            table.map.iter().map(|e| (e.key().clone(), e.value().clone())),
        )?;

        let compact = {
            let mut runs = self.runs.write()?;
            runs.insert(0, Arc::new(run));
            write_manifest(&dir, &runs)?;
            runs.len() > MAX_RUNS
        };
        *self.frozen.write()? = None;

        for id in retired {
            let path = dir.join(wal_name(id));
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(?path, error = %e, "Failed to delete index WAL");
            }
        }
        tracing::debug!(run_id, entries, "Flushed index memtable");

        if compact {
            self.merge_runs(&dir)?;
        }
        Ok(())
    }

    /// Rewrites every run into one. Caller holds the flush lock.
    fn merge_runs(&self, dir: &Path) -> Result<()> {
        let runs = self.runs.read()?.clone();
        let run_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let sources: Vec<KvIterator<'_>> = runs
            .iter()
            .map(|run| Box::new(run.scan(Bound::Unbounded)) as KvIterator<'_>)
            .collect();
        let mut failed = None;
        let merged = MergeIterator::new(sources).map_while(|item| match item {
            Ok(kv) => Some(kv),
            Err(e) => {
                failed = Some(e);
                None
            }
        });
        let run = Run::write(dir.join(run_name(run_id)), run_id, merged)?;
        if let Some(e) = failed {
            let _ = fs::remove_file(run.path());
            return Err(e);
        }

        {
            let mut current = self.runs.write()?;
            // Only flushes add runs and they hold the same lock as we do.
            *current = vec![Arc::new(run)];
            write_manifest(dir, &current)?;
        }
        for old in &runs {
            if let Err(e) = fs::remove_file(old.path()) {
                tracing::warn!(path = ?old.path(), error = %e, "Failed to delete merged run");
            }
        }
        tracing::debug!(run_id, merged = runs.len(), "Merged index runs");
        Ok(())
    }

    pub fn run_count(&self) -> Result<usize> {
        Ok(self.runs.read()?.len())
    }
}

fn write_manifest(dir: &Path, runs: &[Arc<Run>]) -> Result<()> {
    let ids: Vec<u64> = runs.iter().map(|r| r.id()).collect();
    let bytes = bincode::serialize("run manifest", &ids)?;
    let tmp = dir.join(format!("{}.tmp", MANIFEST));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, dir.join(MANIFEST))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(pairs: &[(&str, &str)]) -> Batch {
        pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    fn keys(tree: &LsmTree, reverse: bool) -> Result<Vec<String>> {
        let mut out = Vec::new();
        tree.scan(Bound::Unbounded, Bound::Unbounded, reverse, &mut |k, v| {
            out.push(format!(
                "{}={}",
                String::from_utf8_lossy(k),
                String::from_utf8_lossy(v)
            ));
            Ok(true)
        })?;
        Ok(out)
    }

    #[test]
    fn test_write_get_and_overwrite() -> Result<()> {
        let dir = tempdir()?;
        let tree = LsmTree::open(dir.path(), 1 << 20)?;
        tree.write(batch(&[("a", "1"), ("b", "2")]))?;
        tree.write(batch(&[("a", "3")]))?;

        assert_eq!(tree.get(b"a")?, Some(b"3".to_vec()));
        assert_eq!(tree.get(b"b")?, Some(b"2".to_vec()));
        assert_eq!(tree.get(b"c")?, None);
        Ok(())
    }

    #[test]
    fn test_newest_version_wins_across_runs() -> Result<()> {
        let dir = tempdir()?;
        let tree = LsmTree::open(dir.path(), 1 << 20)?;
        tree.write(batch(&[("a", "old"), ("b", "old")]))?;
        tree.flush_memtable()?;
        tree.write(batch(&[("a", "new"), ("c", "new")]))?;

        assert_eq!(tree.get(b"a")?, Some(b"new".to_vec()));
        assert_eq!(keys(&tree, false)?, vec!["a=new", "b=old", "c=new"]);
        assert_eq!(keys(&tree, true)?, vec!["c=new", "b=old", "a=new"]);
        Ok(())
    }

    #[test]
    fn test_bounded_scan() -> Result<()> {
        let dir = tempdir()?;
        let tree = LsmTree::open(dir.path(), 1 << 20)?;
        tree.write(batch(&[("a", "1"), ("b", "2")]))?;
        tree.flush_memtable()?;
        tree.write(batch(&[("c", "3"), ("d", "4")]))?;

        let mut seen = Vec::new();
        tree.scan(
            Bound::Included(b"b".to_vec()),
            Bound::Excluded(b"d".to_vec()),
            false,
            &mut |k, _| {
                seen.push(k.to_vec());
                Ok(true)
            },
        )?;
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_recovers_from_wal_and_runs() -> Result<()> {
        let dir = tempdir()?;
        {
            let tree = LsmTree::open(dir.path(), 1 << 20)?;
            tree.write(batch(&[("flushed", "1")]))?;
            tree.flush_memtable()?;
            tree.write(batch(&[("unflushed", "2")]))?;
            tree.flush(true)?;
        }

        let tree = LsmTree::open(dir.path(), 1 << 20)?;
        assert_eq!(tree.get(b"flushed")?, Some(b"1".to_vec()));
        assert_eq!(tree.get(b"unflushed")?, Some(b"2".to_vec()));

        // Replayed WALs are retired by the next flush
        tree.flush_memtable()?;
        let wals = fs::read_dir(dir.path())?
            .filter(|e| {
                e.as_ref()
                    .map(|e| parse_id(&e.path(), "wal").is_some())
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(wals, 1);
        Ok(())
    }

    #[test]
    fn test_small_memtable_flushes_and_merges_runs() -> Result<()> {
        let dir = tempdir()?;
        let tree = LsmTree::open(dir.path(), 64)?;
        for i in 0..200 {
            tree.write(vec![(format!("k{:04}", i).into_bytes(), vec![b'x'; 16])])?;
        }
        assert!(tree.run_count()? <= MAX_RUNS);
        for i in (0..200).step_by(13) {
            assert!(tree.get(format!("k{:04}", i).as_bytes())?.is_some());
        }

        let reopened = {
            drop(tree);
            LsmTree::open(dir.path(), 64)?
        };
        assert_eq!(keys(&reopened, false)?.len(), 200);
        Ok(())
    }
}

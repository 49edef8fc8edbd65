//! On-disk index generations.
//!
//! A generation is two artifacts correlated strictly by position: a binary
//! vector matrix and a JSONL metadata file. Row *i* of the matrix pairs with
//! line *i* of the metadata.
//!
//! # Vector file layout
//!
//! Little-endian throughout:
//!
//! ```text
//! magic    "CSVM"
//! version  u16
//! key_len  u16, followed by key_len bytes of UTF-8 (the array key)
//! dims     u32
//! rows     row-major f32, dims values per row
//! ```
//!
//! The row count is not stored; it is derived from the file length. A
//! trailing partial row can only come from an interrupted append.
//!
//! # Commit checkpoint
//!
//! Appends go through [`IndexStore::append_batch`], which writes metadata,
//! then vectors, fsyncs both, and only then replaces the sidecar
//! `<vectors>.commit` checkpoint. Rows past the checkpoint belong to a batch
//! that never committed: writers truncate them on open, readers ignore them.
//!
//! # Swap
//!
//! Full rebuilds and merges write a fresh generation under uuid-suffixed
//! names and then [`swap`] it over the served one. The previous generation
//! is kept under an `.old` suffix so [`rollback`] can restore it.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{DedupKey, ThreadRecord};

pub const VECTOR_MAGIC: [u8; 4] = *b"CSVM";
pub const VECTOR_VERSION: u16 = 1;

/// Paths of one index generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub vectors: PathBuf,
    pub metadata: PathBuf,
}

impl Generation {
    pub fn new(vectors: impl Into<PathBuf>, metadata: impl Into<PathBuf>) -> Self {
        Self {
            vectors: vectors.into(),
            metadata: metadata.into(),
        }
    }

    pub fn checkpoint(&self) -> PathBuf {
        with_suffix(&self.vectors, "commit")
    }

    /// The generation preserved by the last swap.
    pub fn old(&self) -> Self {
        Self {
            vectors: with_suffix(&self.vectors, "old"),
            metadata: with_suffix(&self.metadata, "old"),
        }
    }

    /// A fresh sibling generation with unique file names.
    pub fn staging(&self) -> Self {
        let tag = format!("new-{}", uuid::Uuid::new_v4().simple());
        Self {
            vectors: with_suffix(&self.vectors, &tag),
            metadata: with_suffix(&self.metadata, &tag),
        }
    }

    pub fn exists(&self) -> bool {
        self.vectors.exists() || self.metadata.exists()
    }

    fn remove_files(&self) -> Result<()> {
        for path in [self.checkpoint(), self.vectors.clone(), self.metadata.clone()] {
            remove_if_exists(&path)?;
        }
        Ok(())
    }
}

/// Contents of the `<vectors>.commit` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub rows: usize,
    pub dims: usize,
    pub updated_at: DateTime<Utc>,
}

/// Committed shape of a generation, without its contents.
#[derive(Debug, Clone)]
pub struct GenerationInfo {
    pub rows: usize,
    pub dims: Option<usize>,
    pub checkpoint: Option<Checkpoint>,
    /// Rows present on disk beyond the checkpoint (vectors, metadata).
    pub uncommitted: (usize, usize),
}

/// A generation's committed rows, fully loaded.
#[derive(Debug, Clone)]
pub struct GenerationData {
    /// Zero when the generation is empty.
    pub dims: usize,
    /// Row-major, `records.len() * dims` values.
    pub vectors: Vec<f32>,
    pub records: Vec<ThreadRecord>,
    pub checkpoint: Option<Checkpoint>,
}

impl GenerationData {
    pub fn rows(&self) -> usize {
        self.records.len()
    }
}

struct VectorScan {
    dims: usize,
    header_len: u64,
    rows: usize,
    torn: bool,
}

impl VectorScan {
    fn row_bytes(&self) -> u64 {
        (self.dims * 4) as u64
    }
}

struct MetadataScan {
    lines: Vec<String>,
    /// Byte offset just past each complete line.
    ends: Vec<u64>,
    torn: bool,
}

struct Scan {
    vectors: Option<VectorScan>,
    metadata: MetadataScan,
    checkpoint: Option<Checkpoint>,
    committed: usize,
}

fn scan(generation: &Generation, array_key: &str) -> Result<Scan> {
    let vectors = scan_vectors(&generation.vectors, array_key)?;
    let metadata = scan_metadata(&generation.metadata)?;
    let checkpoint = read_checkpoint(&generation.checkpoint())?;

    let vector_rows = vectors.as_ref().map(|v| v.rows).unwrap_or(0);
    let metadata_rows = metadata.lines.len();

    let committed = match &checkpoint {
        Some(cp) => {
            if let Some(v) = &vectors {
                if cp.rows > 0 && v.dims != cp.dims {
                    return Err(Error::Consistency(format!(
                        "checkpoint records {} dimensions but {} holds {}",
                        cp.dims,
                        generation.vectors.display(),
                        v.dims
                    )));
                }
            }
            if vector_rows < cp.rows || metadata_rows < cp.rows {
                return Err(Error::Consistency(format!(
                    "checkpoint records {} rows but vector matrix has {} and metadata has {}",
                    cp.rows, vector_rows, metadata_rows
                )));
            }
            cp.rows
        }
        None => {
            let torn_vectors = vectors.as_ref().map(|v| v.torn).unwrap_or(false);
            if torn_vectors || metadata.torn {
                return Err(Error::Consistency(format!(
                    "partial row at end of {} with no commit checkpoint",
                    if torn_vectors {
                        generation.vectors.display()
                    } else {
                        generation.metadata.display()
                    }
                )));
            }
            if vector_rows != metadata_rows {
                return Err(Error::consistency(vector_rows, metadata_rows));
            }
            vector_rows
        }
    };

    Ok(Scan {
        vectors,
        metadata,
        checkpoint,
        committed,
    })
}

/// Describe a generation's committed shape.
///
/// Fails with [`Error::Consistency`] when the artifacts disagree in a way the
/// checkpoint does not explain.
pub fn inspect(generation: &Generation, array_key: &str) -> Result<GenerationInfo> {
    let scan = scan(generation, array_key)?;
    let vector_rows = scan.vectors.as_ref().map(|v| v.rows).unwrap_or(0);
    Ok(GenerationInfo {
        rows: scan.committed,
        dims: scan.vectors.as_ref().map(|v| v.dims),
        uncommitted: (
            vector_rows - scan.committed,
            scan.metadata.lines.len() - scan.committed,
        ),
        checkpoint: scan.checkpoint,
    })
}

/// Load the committed prefix of a generation. Never modifies any file.
///
/// A missing generation loads as empty.
pub fn read_generation(generation: &Generation, array_key: &str) -> Result<GenerationData> {
    let scan = scan(generation, array_key)?;
    let committed = scan.committed;

    let records = parse_records(&generation.metadata, &scan.metadata.lines[..committed])?;

    let (dims, vectors) = match &scan.vectors {
        Some(v) if committed > 0 => {
            let mut file = File::open(&generation.vectors)?;
            file.seek(SeekFrom::Start(v.header_len))?;
            let mut blob = vec![0u8; committed * v.dims * 4];
            file.read_exact(&mut blob)?;
            (v.dims, blob_to_vec(&blob))
        }
        Some(v) => (v.dims, Vec::new()),
        None => (0, Vec::new()),
    };

    Ok(GenerationData {
        dims,
        vectors,
        records,
        checkpoint: scan.checkpoint,
    })
}

/// Append-only writer over one generation.
pub struct IndexStore {
    generation: Generation,
    array_key: String,
    dims: Option<usize>,
    rows: usize,
    keys: HashSet<DedupKey>,
    /// Byte lengths of the committed prefix of each artifact.
    vectors_len: u64,
    metadata_len: u64,
}

impl IndexStore {
    /// Open a generation for appending, creating nothing until the first batch.
    ///
    /// Rows past the commit checkpoint are truncated away. A generation
    /// without a checkpoint must have matching row counts; it gets a
    /// checkpoint before anything is appended.
    pub fn open(generation: Generation, array_key: &str) -> Result<Self> {
        let scan = scan(&generation, array_key)?;
        let committed = scan.committed;

        let vectors_len = scan
            .vectors
            .as_ref()
            .map(|v| v.header_len + committed as u64 * v.row_bytes())
            .unwrap_or(0);
        let metadata_len = if committed == 0 {
            0
        } else {
            scan.metadata.ends[committed - 1]
        };

        if let Some(v) = &scan.vectors {
            if v.rows > committed || v.torn {
                tracing::warn!(
                    path = %generation.vectors.display(),
                    rows = v.rows - committed,
                    "discarding uncommitted vector rows"
                );
                truncate_to(&generation.vectors, vectors_len)?;
            }
        }
        if scan.metadata.lines.len() > committed || scan.metadata.torn {
            tracing::warn!(
                path = %generation.metadata.display(),
                lines = scan.metadata.lines.len() - committed,
                "discarding uncommitted metadata lines"
            );
            truncate_to(&generation.metadata, metadata_len)?;
        }

        let records = parse_records(&generation.metadata, &scan.metadata.lines[..committed])?;
        let keys = records.iter().flat_map(ThreadRecord::indexed_keys).collect();
        let dims = scan.vectors.as_ref().map(|v| v.dims);

        let store = Self {
            generation,
            array_key: array_key.to_string(),
            dims,
            rows: committed,
            keys,
            vectors_len,
            metadata_len,
        };
        if scan.checkpoint.is_none() {
            if let Some(dims) = dims {
                write_checkpoint(&store.generation.checkpoint(), committed, dims)?;
            }
        }
        Ok(store)
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    /// Whether a committed row already answers to this dedup key.
    ///
    /// URL keys match any URL of any committed row, not only its first.
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    /// Durably append one batch of rows.
    ///
    /// Either the whole batch is committed or, after a crash, none of it is
    /// visible to the next reader or writer.
    pub fn append_batch(&mut self, vectors: &[Vec<f32>], records: &[ThreadRecord]) -> Result<()> {
        if vectors.len() != records.len() {
            return Err(Error::consistency(vectors.len(), records.len()));
        }
        if vectors.is_empty() {
            return Ok(());
        }

        let dims = match self.dims {
            Some(dims) => dims,
            None => vectors[0].len(),
        };
        if dims == 0 {
            return Err(Error::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(Error::DimensionMismatch {
                expected: dims,
                actual: bad.len(),
            });
        }
        if self.dims.is_none() {
            create_vector_file(&self.generation.vectors, &self.array_key, dims)?;
            self.dims = Some(dims);
            self.vectors_len = fs::metadata(&self.generation.vectors)?.len();
        }

        // A failed append on this store may have left bytes past the commit.
        truncate_to(&self.generation.metadata, self.metadata_len)?;
        truncate_to(&self.generation.vectors, self.vectors_len)?;

        // Metadata
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.generation.metadata)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let metadata_len = file.metadata()?.len();

        // Vectors
        let file = OpenOptions::new().append(true).open(&self.generation.vectors)?;
        let mut writer = BufWriter::new(file);
        for vector in vectors {
            writer.write_all(&vec_to_blob(vector))?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let vectors_len = file.metadata()?.len();

        let rows = self.rows + records.len();
        write_checkpoint(&self.generation.checkpoint(), rows, dims)?;

        self.rows = rows;
        self.vectors_len = vectors_len;
        self.metadata_len = metadata_len;
        self.keys.extend(records.iter().flat_map(ThreadRecord::indexed_keys));
        tracing::debug!(rows, batch = records.len(), "batch committed");
        Ok(())
    }
}

/// Replace the served generation with a fully written staged one.
///
/// The served files move to their `.old` names first, then the staged
/// vectors and metadata take their place, checkpoint last.
pub fn swap(staged: &Generation, served: &Generation, array_key: &str) -> Result<()> {
    if !staged.vectors.exists() || !staged.metadata.exists() {
        return Err(Error::Consistency(format!(
            "staged generation {} is incomplete",
            staged.vectors.display()
        )));
    }
    let info = inspect(staged, array_key)?;
    if info.uncommitted != (0, 0) {
        return Err(Error::Consistency(format!(
            "staged generation {} has uncommitted rows",
            staged.vectors.display()
        )));
    }

    let old = served.old();
    old.remove_files()?;
    rename_if_exists(&served.checkpoint(), &old.checkpoint())?;
    rename_if_exists(&served.vectors, &old.vectors)?;
    rename_if_exists(&served.metadata, &old.metadata)?;

    fs::rename(&staged.vectors, &served.vectors)?;
    fs::rename(&staged.metadata, &served.metadata)?;
    rename_if_exists(&staged.checkpoint(), &served.checkpoint())?;

    sync_parent(&served.vectors)?;
    sync_parent(&served.metadata)?;
    tracing::info!(
        vectors = %served.vectors.display(),
        rows = info.rows,
        "swapped in new generation"
    );
    Ok(())
}

/// Restore the generation preserved by the last swap.
///
/// The currently served generation becomes the new `.old`, so a second
/// rollback undoes the first.
pub fn rollback(served: &Generation, array_key: &str) -> Result<()> {
    let old = served.old();
    if !old.vectors.exists() || !old.metadata.exists() {
        return Err(Error::Consistency(format!(
            "no previous generation at {}",
            old.vectors.display()
        )));
    }
    inspect(&old, array_key)?;

    let staged = served.staging();
    rename_if_exists(&old.checkpoint(), &staged.checkpoint())?;
    fs::rename(&old.vectors, &staged.vectors)?;
    fs::rename(&old.metadata, &staged.metadata)?;
    swap(&staged, served, array_key)
}

/// Concatenate generations into `dest`, in order.
///
/// Metadata lines and vector rows keep their source order, so row *i* of
/// the result still pairs with line *i*. No deduplication happens here.
pub fn merge(sources: &[Generation], array_key: &str, dest: &Generation) -> Result<usize> {
    if dest.exists() {
        dest.remove_files()?;
    }
    let mut store = IndexStore::open(dest.clone(), array_key)?;
    for source in sources {
        let data = read_generation(source, array_key)?;
        if data.rows() == 0 {
            tracing::warn!(vectors = %source.vectors.display(), "skipping empty generation");
            continue;
        }
        let vectors: Vec<Vec<f32>> = data.vectors.chunks(data.dims).map(<[f32]>::to_vec).collect();
        store.append_batch(&vectors, &data.records)?;
        tracing::info!(
            vectors = %source.vectors.display(),
            rows = data.rows(),
            "merged generation"
        );
    }
    Ok(store.rows())
}

fn scan_vectors(path: &Path, array_key: &str) -> Result<Option<VectorScan>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let truncated = |_| Error::Consistency(format!("truncated header in {}", path.display()));

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(truncated)?;
    if magic != VECTOR_MAGIC {
        return Err(Error::MalformedInput(format!(
            "{} is not a vector matrix file",
            path.display()
        )));
    }

    let mut u16_buf = [0u8; 2];
    reader.read_exact(&mut u16_buf).map_err(truncated)?;
    let version = u16::from_le_bytes(u16_buf);
    if version != VECTOR_VERSION {
        return Err(Error::MalformedInput(format!(
            "unsupported vector file version {} in {}",
            version,
            path.display()
        )));
    }

    reader.read_exact(&mut u16_buf).map_err(truncated)?;
    let key_len = u16::from_le_bytes(u16_buf) as usize;
    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key).map_err(truncated)?;
    if key != array_key.as_bytes() {
        return Err(Error::Consistency(format!(
            "{} holds array '{}', expected '{}'",
            path.display(),
            String::from_utf8_lossy(&key),
            array_key
        )));
    }

    let mut u32_buf = [0u8; 4];
    reader.read_exact(&mut u32_buf).map_err(truncated)?;
    let dims = u32::from_le_bytes(u32_buf) as usize;
    if dims == 0 {
        return Err(Error::MalformedInput(format!(
            "{} declares zero dimensions",
            path.display()
        )));
    }

    let header_len = (4 + 2 + 2 + key_len + 4) as u64;
    let body = file_len - header_len;
    let row_bytes = (dims * 4) as u64;
    Ok(Some(VectorScan {
        dims,
        header_len,
        rows: (body / row_bytes) as usize,
        torn: body % row_bytes != 0,
    }))
}

fn scan_metadata(path: &Path) -> Result<MetadataScan> {
    let mut scan = MetadataScan {
        lines: Vec::new(),
        ends: Vec::new(),
        torn: false,
    };
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        offset += n as u64;
        if buf.last() != Some(&b'\n') {
            scan.torn = true;
            break;
        }
        buf.pop();
        let line = String::from_utf8(std::mem::take(&mut buf)).map_err(|_| {
            Error::MalformedInput(format!(
                "{}:{}: invalid UTF-8",
                path.display(),
                scan.lines.len() + 1
            ))
        })?;
        scan.lines.push(line);
        scan.ends.push(offset);
    }
    Ok(scan)
}

fn parse_records(path: &Path, lines: &[String]) -> Result<Vec<ThreadRecord>> {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::MalformedInput(format!("{}:{}: {}", path.display(), i + 1, e))
            })
        })
        .collect()
}

fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_checkpoint(path: &Path, rows: usize, dims: usize) -> Result<()> {
    let checkpoint = Checkpoint {
        rows,
        dims,
        updated_at: Utc::now(),
    };
    write_atomic(path, &serde_json::to_vec(&checkpoint)?)
}

fn create_vector_file(path: &Path, array_key: &str, dims: usize) -> Result<()> {
    let key = array_key.as_bytes();
    let key_len = u16::try_from(key.len())
        .map_err(|_| Error::MalformedInput(format!("array key '{}' too long", array_key)))?;
    let dims_u32 = u32::try_from(dims).map_err(|_| Error::DimensionMismatch {
        expected: u32::MAX as usize,
        actual: dims,
    })?;

    let mut header = Vec::with_capacity(12 + key.len());
    header.extend_from_slice(&VECTOR_MAGIC);
    header.extend_from_slice(&VECTOR_VERSION.to_le_bytes());
    header.extend_from_slice(&key_len.to_le_bytes());
    header.extend_from_slice(key);
    header.extend_from_slice(&dims_u32.to_le_bytes());
    write_atomic(path, &header)
}

/// Cut a file back to `len` bytes if it has grown past it. Missing files are
/// left alone.
fn truncate_to(path: &Path, len: u64) -> Result<()> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() > len {
        file.set_len(len)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Write via a temp file, fsync, rename, fsync the directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = with_suffix(path, "tmp");
    let mut file = File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp, path)?;
    sync_parent(path)
}

fn sync_parent(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    #[cfg(unix)]
    File::open(parent)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = parent;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn rename_if_exists(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

//! The content-addressed module repository: an append-only indexed file
//! holding compiled artifacts, with versions keyed by source digest and
//! compilations keyed by the predecessors' compilation timestamps.
//!
//! File layout, big-endian throughout: a 16-byte magic, a 4-byte format
//! version, an 8-byte metadata-tail offset; then length-prefixed records,
//! each addressed by the byte offset of its prefix; then the metadata
//! tail, rewritten in place at every commit (appends after a commit
//! overwrite the stale tail). A version mismatch on reopen discards the
//! file and starts a new one.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use byteorder::{BE, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// The first sixteen bytes of every repository file.
pub const MAGIC: &[u8; 16] = b"Avail repository";

/// The file format version this build reads and writes.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: u64 = 16 + 4 + 8;

/// How many digests an archive retains, most recently used last.
pub const DIGEST_CACHE_LIMIT: usize = 20;
/// How many versions an archive retains.
pub const VERSION_CACHE_LIMIT: usize = 10;
/// How many compilations a version retains.
pub const COMPILATION_CACHE_LIMIT: usize = 10;

/// Repository failures. I/O problems are recoverable by the builder; a
/// format mismatch silently discards and recreates the file.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
  /// An underlying I/O failure.
  #[error("repository I/O failure: {0}")]
  Io(#[from] io::Error),
  /// A version key was put twice.
  #[error("module version already recorded")]
  DuplicateVersion,
  /// A record offset did not address a record.
  #[error("malformed repository record")]
  MalformedRecord,
}

/// A SHA-256 digest of module source.
pub type SourceDigest = [u8; 32];

/// Identifies a module version: the digest of its source, qualified by
/// whether the module is a package representative.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleVersionKey {
  /// Whether the module is a package representative.
  pub is_package: bool,
  /// The SHA-256 of the source text.
  pub digest: SourceDigest,
}

impl fmt::Debug for ModuleVersionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", if self.is_package { "pkg" } else { "mod" },
      hex::encode(self.digest))
  }
}

/// Identifies a compilation of a version: the compilation timestamps of
/// the module's predecessors, in import order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleCompilationKey {
  /// The predecessors' compilation times, in import order.
  pub predecessor_times: Vec<i64>,
}

/// A compiled artifact's identity inside the indexed file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleCompilation {
  /// When the compilation was produced, in epoch milliseconds.
  pub creation_time: i64,
  /// The record offset of the serialized artifact.
  pub record_offset: u64,
}

/// A bounded least-recently-used map with stable iteration order, oldest
/// first. Small by construction; lookups touch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LruMap<K, V> {
  limit: usize,
  entries: Vec<(K, V)>,
}

impl<K: PartialEq + Clone, V> LruMap<K, V> {
  /// An empty map evicting past `limit` entries.
  #[must_use] pub fn new(limit: usize) -> Self { Self { limit, entries: vec![] } }

  /// Look up and touch.
  pub fn get(&mut self, key: &K) -> Option<&V> {
    let index = self.entries.iter().position(|(k, _)| k == key)?;
    let entry = self.entries.remove(index);
    self.entries.push(entry);
    Some(&self.entries.last().expect("just pushed").1)
  }

  /// Look up without touching.
  #[must_use] pub fn peek(&self, key: &K) -> Option<&V> {
    self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }

  /// Insert or replace, evicting the least recently used entry past the
  /// bound.
  pub fn insert(&mut self, key: K, value: V) {
    self.entries.retain(|(k, _)| *k != key);
    self.entries.push((key, value));
    while self.entries.len() > self.limit { self.entries.remove(0); }
  }

  /// The number of entries.
  #[must_use] pub fn len(&self) -> usize { self.entries.len() }

  /// Whether the map is empty.
  #[must_use] pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// The entries, oldest first.
  pub fn iter(&self) -> impl Iterator<Item = &(K, V)> { self.entries.iter() }
}

/// Everything recorded about one version of a module's source.
#[derive(Clone, Debug)]
pub struct ModuleVersion {
  /// The source size in bytes.
  pub source_size: u64,
  /// The local imports, as they appeared in the header, in order.
  pub local_imports: Vec<String>,
  /// The entry point names, in order.
  pub entry_points: Vec<String>,
  /// The retained compilations.
  pub compilations: LruMap<ModuleCompilationKey, ModuleCompilation>,
  /// The record offset of the serialized module header, if stored.
  pub module_header: Option<u64>,
  /// The record offset of the serialized comment tuple, if stored.
  pub comments: Option<u64>,
}

impl ModuleVersion {
  /// A fresh version record.
  #[must_use] pub fn new(source_size: u64, local_imports: Vec<String>,
      entry_points: Vec<String>) -> Self {
    Self {
      source_size,
      local_imports,
      entry_points,
      compilations: LruMap::new(COMPILATION_CACHE_LIMIT),
      module_header: None,
      comments: None,
    }
  }
}

/// Per-module bookkeeping: digests by modification time, and versions by
/// digest.
#[derive(Debug)]
pub struct ModuleArchive {
  digests: LruMap<i64, SourceDigest>,
  versions: LruMap<ModuleVersionKey, ModuleVersion>,
}

impl ModuleArchive {
  fn new() -> Self {
    Self {
      digests: LruMap::new(DIGEST_CACHE_LIMIT),
      versions: LruMap::new(VERSION_CACHE_LIMIT),
    }
  }
}

struct State {
  file: File,
  /// Where the next record will be appended; also where the metadata tail
  /// goes at commit time.
  end_offset: u64,
  dirty_since: Option<Instant>,
  archives: BTreeMap<String, ModuleArchive>,
}

/// A content-addressed repository over one indexed file. All access is
/// serialised through a single lock; digest computation stays outside it.
pub struct Repository {
  file_name: PathBuf,
  state: Mutex<State>,
}

impl Repository {
  /// Open (or create) the repository at `path`. A magic or version
  /// mismatch discards the existing file.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
    let path = path.as_ref().to_path_buf();
    let state = match Self::reopen(&path) {
      Ok(state) => state,
      Err(err) => {
        debug!(path = %path.display(), %err, "discarding incompatible repository");
        std::fs::remove_file(&path).ok();
        Self::create(&path)?
      }
    };
    Ok(Self { file_name: path, state: Mutex::new(state) })
  }

  fn create(path: &Path) -> Result<State, RepositoryError> {
    let mut file = OpenOptions::new()
      .read(true).write(true).create(true).truncate(true)
      .open(path)?;
    file.write_all(MAGIC)?;
    file.write_u32::<BE>(FORMAT_VERSION)?;
    file.write_u64::<BE>(HEADER_SIZE)?;
    // An empty metadata tail, so an uncommitted file reopens cleanly.
    file.write_i32::<BE>(0)?;
    file.flush()?;
    Ok(State {
      file,
      end_offset: HEADER_SIZE,
      dirty_since: None,
      archives: BTreeMap::new(),
    })
  }

  fn reopen(path: &Path) -> Result<State, RepositoryError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut magic = [0u8; 16];
    file.read_exact(&mut magic)?;
    if magic != *MAGIC { return Err(RepositoryError::MalformedRecord) }
    let version = file.read_u32::<BE>()?;
    if version != FORMAT_VERSION { return Err(RepositoryError::MalformedRecord) }
    let tail_offset = file.read_u64::<BE>()?;
    file.seek(SeekFrom::Start(tail_offset))?;
    let archives = read_metadata(&mut file)?;
    Ok(State {
      file,
      end_offset: tail_offset,
      dirty_since: None,
      archives,
    })
  }

  /// The backing file's path.
  #[must_use] pub fn file_name(&self) -> &Path { &self.file_name }

  /// Whether there are uncommitted changes.
  #[must_use] pub fn is_dirty(&self) -> bool { self.state.lock().dirty_since.is_some() }

  fn mark_dirty(state: &mut State) {
    if state.dirty_since.is_none() { state.dirty_since = Some(Instant::now()) }
  }

  // --- digests ---

  /// The digest of the file at `path`, recorded for the module named
  /// `root_relative_name`. Keyed by the file's modification time: an
  /// unchanged mtime answers from the cache without reading the source.
  pub fn digest_for_file(&self, root_relative_name: &str, path: impl AsRef<Path>)
      -> Result<SourceDigest, RepositoryError> {
    let mtime = mtime_millis(path.as_ref())?;
    {
      let mut state = self.state.lock();
      let archive = state.archives.entry(root_relative_name.to_string())
        .or_insert_with(ModuleArchive::new);
      if let Some(digest) = archive.digests.get(&mtime) { return Ok(*digest) }
    }
    // Hashing happens outside the lock; only the cache write reacquires.
    let mut hasher = Sha256::new();
    let mut file = File::open(path.as_ref())?;
    let mut buf = [0u8; 8192];
    loop {
      let n = file.read(&mut buf)?;
      if n == 0 { break }
      hasher.update(&buf[..n]);
    }
    let digest: SourceDigest = hasher.finalize().into();
    debug!(module = root_relative_name, digest = %hex::encode(digest),
      "computed source digest");
    let mut state = self.state.lock();
    state.archives.entry(root_relative_name.to_string())
      .or_insert_with(ModuleArchive::new)
      .digests.insert(mtime, digest);
    Self::mark_dirty(&mut state);
    Ok(digest)
  }

  // --- versions ---

  /// The version recorded under `key`, if any.
  #[must_use] pub fn get_version(&self, root_relative_name: &str, key: &ModuleVersionKey)
      -> Option<ModuleVersion> {
    let mut state = self.state.lock();
    state.archives.get_mut(root_relative_name)?.versions.get(key).cloned()
  }

  /// Record a version. Two equal source digests share one version record;
  /// a second put under the same key is rejected.
  pub fn put_version(&self, root_relative_name: &str, key: ModuleVersionKey,
      version: ModuleVersion) -> Result<(), RepositoryError> {
    let mut state = self.state.lock();
    let archive = state.archives.entry(root_relative_name.to_string())
      .or_insert_with(ModuleArchive::new);
    if archive.versions.peek(&key).is_some() {
      return Err(RepositoryError::DuplicateVersion)
    }
    archive.versions.insert(key, version);
    Self::mark_dirty(&mut state);
    Ok(())
  }

  // --- compilations ---

  /// Append a compiled artifact and record it under the compilation key.
  /// The oldest compilation past the bound is evicted.
  pub fn put_compilation(
    &self,
    root_relative_name: &str,
    version_key: &ModuleVersionKey,
    compilation_key: ModuleCompilationKey,
    creation_time: i64,
    artifact: &[u8],
  ) -> Result<ModuleCompilation, RepositoryError> {
    let mut state = self.state.lock();
    let record_offset = append_record(&mut state, artifact)?;
    let version = state.archives.get_mut(root_relative_name)
      .and_then(|a| a.versions.get_mut_for_update(version_key))
      .ok_or(RepositoryError::MalformedRecord)?;
    let compilation = ModuleCompilation { creation_time, record_offset };
    version.compilations.insert(compilation_key, compilation);
    Self::mark_dirty(&mut state);
    Ok(compilation)
  }

  /// The compilation recorded under the key, if still retained.
  #[must_use] pub fn get_compilation(
    &self,
    root_relative_name: &str,
    version_key: &ModuleVersionKey,
    compilation_key: &ModuleCompilationKey,
  ) -> Option<ModuleCompilation> {
    let mut state = self.state.lock();
    state.archives.get_mut(root_relative_name)?
      .versions.get_mut_for_update(version_key)?
      .compilations.get(compilation_key)
      .copied()
  }

  /// Append a serialized module header for the version.
  pub fn put_module_header(&self, root_relative_name: &str, key: &ModuleVersionKey,
      bytes: &[u8]) -> Result<(), RepositoryError> {
    self.put_aux_record(root_relative_name, key, bytes, |v, off| v.module_header = Some(off))
  }

  /// The serialized module header, if stored.
  pub fn get_module_header(&self, root_relative_name: &str, key: &ModuleVersionKey)
      -> Result<Option<Vec<u8>>, RepositoryError> {
    self.get_aux_record(root_relative_name, key, |v| v.module_header)
  }

  /// Append the serialized comment tuple for the version.
  pub fn put_comments(&self, root_relative_name: &str, key: &ModuleVersionKey,
      bytes: &[u8]) -> Result<(), RepositoryError> {
    self.put_aux_record(root_relative_name, key, bytes, |v, off| v.comments = Some(off))
  }

  /// The serialized comment tuple, if stored.
  pub fn get_comments(&self, root_relative_name: &str, key: &ModuleVersionKey)
      -> Result<Option<Vec<u8>>, RepositoryError> {
    self.get_aux_record(root_relative_name, key, |v| v.comments)
  }

  fn put_aux_record(
    &self,
    root_relative_name: &str,
    key: &ModuleVersionKey,
    bytes: &[u8],
    store: impl FnOnce(&mut ModuleVersion, u64),
  ) -> Result<(), RepositoryError> {
    let mut state = self.state.lock();
    let offset = append_record(&mut state, bytes)?;
    let version = state.archives.get_mut(root_relative_name)
      .and_then(|a| a.versions.get_mut_for_update(key))
      .ok_or(RepositoryError::MalformedRecord)?;
    store(version, offset);
    Self::mark_dirty(&mut state);
    Ok(())
  }

  fn get_aux_record(
    &self,
    root_relative_name: &str,
    key: &ModuleVersionKey,
    select: impl FnOnce(&ModuleVersion) -> Option<u64>,
  ) -> Result<Option<Vec<u8>>, RepositoryError> {
    let mut state = self.state.lock();
    let Some(offset) = state.archives.get_mut(root_relative_name)
      .and_then(|a| a.versions.get(key))
      .and_then(select)
    else { return Ok(None) };
    read_record(&mut state, offset).map(Some)
  }

  /// The raw bytes of the record at `offset`, e.g. a compiled artifact.
  pub fn fetch_record(&self, offset: u64) -> Result<Vec<u8>, RepositoryError> {
    read_record(&mut self.state.lock(), offset)
  }

  // --- maintenance ---

  /// Serialize the metadata tail and flush, if dirty.
  pub fn commit(&self) -> Result<(), RepositoryError> {
    let mut state = self.state.lock();
    if state.dirty_since.is_none() { return Ok(()) }
    let mut tail = vec![];
    write_metadata(&mut tail, &state.archives)?;
    let tail_offset = state.end_offset;
    state.file.seek(SeekFrom::Start(tail_offset))?;
    state.file.write_all(&tail)?;
    let len = state.file.stream_position()?;
    state.file.set_len(len)?;
    state.file.seek(SeekFrom::Start(20))?;
    state.file.write_u64::<BE>(tail_offset)?;
    state.file.flush()?;
    state.dirty_since = None;
    info!(path = %self.file_name.display(), "committed repository");
    Ok(())
  }

  /// Commit only when changes have been pending longer than `max_age`.
  pub fn commit_if_stale_changes(&self, max_age: Duration) -> Result<(), RepositoryError> {
    let stale = self.state.lock().dirty_since
      .is_some_and(|since| since.elapsed() >= max_age);
    if stale { self.commit() } else { Ok(()) }
  }

  /// Forget every version of each module whose root-relative name is
  /// `path` or lies under `path/`.
  pub fn clean_modules_under(&self, path: &str) {
    let mut state = self.state.lock();
    let prefix = format!("{path}/");
    let mut touched = false;
    for (name, archive) in &mut state.archives {
      if name == path || name.starts_with(&prefix) {
        archive.versions = LruMap::new(VERSION_CACHE_LIMIT);
        archive.digests = LruMap::new(DIGEST_CACHE_LIMIT);
        touched = true;
      }
    }
    if touched { Self::mark_dirty(&mut state) }
  }

  /// Close, delete, recreate, and reopen the backing file.
  pub fn clear(&self) -> Result<(), RepositoryError> {
    let mut state = self.state.lock();
    std::fs::remove_file(&self.file_name).ok();
    *state = Self::create(&self.file_name)?;
    Ok(())
  }
}

impl LruMap<ModuleVersionKey, ModuleVersion> {
  /// Mutable access without reordering; internal use by the repository.
  fn get_mut_for_update(&mut self, key: &ModuleVersionKey) -> Option<&mut ModuleVersion> {
    self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
  }
}

fn mtime_millis(path: &Path) -> Result<i64, RepositoryError> {
  let modified = std::fs::metadata(path)?.modified()?;
  let millis = modified.duration_since(SystemTime::UNIX_EPOCH)
    .map_or(0, |d| d.as_millis() as i64);
  Ok(millis)
}

fn append_record(state: &mut State, bytes: &[u8]) -> Result<u64, RepositoryError> {
  let offset = state.end_offset;
  state.file.seek(SeekFrom::Start(offset))?;
  state.file.write_u32::<BE>(bytes.len() as u32)?;
  state.file.write_all(bytes)?;
  state.end_offset = offset + 4 + bytes.len() as u64;
  Ok(offset)
}

fn read_record(state: &mut State, offset: u64) -> Result<Vec<u8>, RepositoryError> {
  if offset >= state.end_offset { return Err(RepositoryError::MalformedRecord) }
  state.file.seek(SeekFrom::Start(offset))?;
  let len = state.file.read_u32::<BE>()? as usize;
  let mut bytes = vec![0u8; len];
  state.file.read_exact(&mut bytes)?;
  Ok(bytes)
}

fn write_utf8(w: &mut impl Write, s: &str) -> io::Result<()> {
  w.write_u32::<BE>(s.len() as u32)?;
  w.write_all(s.as_bytes())
}

fn read_utf8(r: &mut impl Read) -> Result<String, RepositoryError> {
  let len = r.read_u32::<BE>()? as usize;
  let mut bytes = vec![0u8; len];
  r.read_exact(&mut bytes)?;
  String::from_utf8(bytes).map_err(|_| RepositoryError::MalformedRecord)
}

fn write_metadata(w: &mut impl Write, archives: &BTreeMap<String, ModuleArchive>)
    -> io::Result<()> {
  w.write_i32::<BE>(archives.len() as i32)?;
  for (name, archive) in archives {
    write_utf8(w, name)?;
    w.write_i32::<BE>(archive.digests.len() as i32)?;
    for (mtime, digest) in archive.digests.iter() {
      w.write_i64::<BE>(*mtime)?;
      w.write_all(digest)?;
    }
    w.write_i32::<BE>(archive.versions.len() as i32)?;
    for (key, version) in archive.versions.iter() {
      w.write_u8(u8::from(key.is_package))?;
      w.write_all(&key.digest)?;
      w.write_u64::<BE>(version.source_size)?;
      w.write_i32::<BE>(version.local_imports.len() as i32)?;
      for import in &version.local_imports { write_utf8(w, import)? }
      w.write_i32::<BE>(version.entry_points.len() as i32)?;
      for entry in &version.entry_points { write_utf8(w, entry)? }
      w.write_i32::<BE>(version.compilations.len() as i32)?;
      for (ckey, comp) in version.compilations.iter() {
        w.write_i32::<BE>(ckey.predecessor_times.len() as i32)?;
        for t in &ckey.predecessor_times { w.write_i64::<BE>(*t)? }
        w.write_i64::<BE>(comp.creation_time)?;
        w.write_u64::<BE>(comp.record_offset)?;
      }
      w.write_i64::<BE>(version.module_header.map_or(-1, |o| o as i64))?;
      w.write_i64::<BE>(version.comments.map_or(-1, |o| o as i64))?;
    }
  }
  Ok(())
}

fn read_metadata(r: &mut impl Read) -> Result<BTreeMap<String, ModuleArchive>,
    RepositoryError> {
  let mut archives = BTreeMap::new();
  let archive_count = r.read_i32::<BE>()?;
  for _ in 0..archive_count {
    let name = read_utf8(r)?;
    let mut archive = ModuleArchive::new();
    let digest_count = r.read_i32::<BE>()?;
    for _ in 0..digest_count {
      let mtime = r.read_i64::<BE>()?;
      let mut digest = [0u8; 32];
      r.read_exact(&mut digest)?;
      archive.digests.insert(mtime, digest);
    }
    let version_count = r.read_i32::<BE>()?;
    for _ in 0..version_count {
      let is_package = r.read_u8()? != 0;
      let mut digest = [0u8; 32];
      r.read_exact(&mut digest)?;
      let key = ModuleVersionKey { is_package, digest };
      let source_size = r.read_u64::<BE>()?;
      let import_count = r.read_i32::<BE>()?;
      let local_imports =
        (0..import_count).map(|_| read_utf8(r)).collect::<Result<_, _>>()?;
      let entry_count = r.read_i32::<BE>()?;
      let entry_points =
        (0..entry_count).map(|_| read_utf8(r)).collect::<Result<_, _>>()?;
      let mut version = ModuleVersion::new(source_size, local_imports, entry_points);
      let compilation_count = r.read_i32::<BE>()?;
      for _ in 0..compilation_count {
        let pred_count = r.read_i32::<BE>()?;
        let predecessor_times =
          (0..pred_count).map(|_| r.read_i64::<BE>()).collect::<Result<_, _>>()?;
        let creation_time = r.read_i64::<BE>()?;
        let record_offset = r.read_u64::<BE>()?;
        version.compilations.insert(
          ModuleCompilationKey { predecessor_times },
          ModuleCompilation { creation_time, record_offset });
      }
      let header = r.read_i64::<BE>()?;
      version.module_header = (header >= 0).then_some(header as u64);
      let comments = r.read_i64::<BE>()?;
      version.comments = (comments >= 0).then_some(comments as u64);
      archive.versions.insert(key, version);
    }
    archives.insert(name, archive);
  }
  Ok(archives)
}

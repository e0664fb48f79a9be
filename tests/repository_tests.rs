//! Repository persistence: round-trips across commit/close/reopen, key
//! uniqueness, the mtime-keyed digest cache, compilation-key reuse, and
//! clearing.

use std::fs::File;
use std::io::Write;
use std::time::Duration;

use pretty_assertions::assert_eq;

use availrt::repository::{
  ModuleCompilationKey, ModuleVersion, ModuleVersionKey, Repository, RepositoryError,
};
use availrt::serializer;
use availrt::types::value::Value;

/// Open a repository with engine tracing captured by the test harness.
fn open(path: impl AsRef<std::path::Path>) -> Repository {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
  Repository::open(path).expect("opens")
}

fn version_key(byte: u8) -> ModuleVersionKey {
  ModuleVersionKey { is_package: false, digest: [byte; 32] }
}

fn sample_version() -> ModuleVersion {
  ModuleVersion::new(
    1234,
    vec!["B".to_string(), "C".to_string()],
    vec!["run game".to_string()],
  )
}

#[test]
fn versions_round_trip_across_reopen() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("all.repo");
  {
    let repo = open(&path);
    repo.put_version("root/A", version_key(1), sample_version()).expect("puts");
    repo.put_compilation("root/A", &version_key(1),
        ModuleCompilationKey { predecessor_times: vec![10, 20] }, 99, b"artifact")
      .expect("records");
    repo.put_module_header("root/A", &version_key(1), b"header bytes").expect("stores");
    repo.put_comments("root/A", &version_key(1), b"comment bytes").expect("stores");
    repo.commit().expect("commits");
  }
  let repo = open(&path);
  let version = repo.get_version("root/A", &version_key(1)).expect("recorded");
  assert_eq!(version.source_size, 1234);
  assert_eq!(version.local_imports, vec!["B".to_string(), "C".to_string()]);
  assert_eq!(version.entry_points, vec!["run game".to_string()]);
  let compilation = repo.get_compilation("root/A", &version_key(1),
      &ModuleCompilationKey { predecessor_times: vec![10, 20] })
    .expect("retained");
  assert_eq!(compilation.creation_time, 99);
  assert_eq!(repo.fetch_record(compilation.record_offset).expect("reads"), b"artifact");
  assert_eq!(repo.get_module_header("root/A", &version_key(1)).expect("reads"),
    Some(b"header bytes".to_vec()));
  assert_eq!(repo.get_comments("root/A", &version_key(1)).expect("reads"),
    Some(b"comment bytes".to_vec()));
}

#[test]
fn duplicate_version_keys_are_rejected() {
  let dir = tempfile::tempdir().expect("tempdir");
  let repo = open(dir.path().join("dup.repo"));
  repo.put_version("root/A", version_key(7), sample_version()).expect("first put");
  assert!(matches!(
    repo.put_version("root/A", version_key(7), sample_version()),
    Err(RepositoryError::DuplicateVersion)));
  // The same digest under another module is a different record.
  repo.put_version("root/B", version_key(7), sample_version()).expect("other module");
}

#[test]
fn digests_are_keyed_by_modification_time() {
  let dir = tempfile::tempdir().expect("tempdir");
  let repo = open(dir.path().join("digest.repo"));
  let source = dir.path().join("A.avail");
  std::fs::write(&source, b"Module \"A\"\n").expect("writes");
  let stamp = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
  let file = File::options().write(true).open(&source).expect("opens");
  file.set_modified(stamp).expect("stamps");
  drop(file);
  let first = repo.digest_for_file("root/A", &source).expect("digests");
  // Rewrite the content but restore the timestamp: an unchanged mtime
  // must answer from the cache without rereading the source.
  std::fs::write(&source, b"Module \"A\" (changed)\n").expect("rewrites");
  let file = File::options().write(true).open(&source).expect("opens");
  file.set_modified(stamp).expect("stamps");
  drop(file);
  let cached = repo.digest_for_file("root/A", &source).expect("digests");
  assert_eq!(cached, first, "the cache was bypassed");
  // A new mtime recomputes and sees the new content.
  let file = File::options().write(true).open(&source).expect("opens");
  file.set_modified(stamp + Duration::from_secs(60)).expect("stamps");
  drop(file);
  let recomputed = repo.digest_for_file("root/A", &source).expect("digests");
  assert_ne!(recomputed, first);
}

#[test]
fn rebuilds_reuse_compilations_with_matching_predecessors() {
  // A imports B. The first build records A's compilation under B's
  // compilation time; a rebuild with B unchanged finds it and skips
  // recompiling A.
  let dir = tempfile::tempdir().expect("tempdir");
  let repo = open(dir.path().join("build.repo"));
  let time_b = 111;
  repo.put_version("root/B", version_key(2), ModuleVersion::new(10, vec![], vec![]))
    .expect("puts B");
  repo.put_compilation("root/B", &version_key(2),
      ModuleCompilationKey { predecessor_times: vec![] }, time_b, b"B artifact")
    .expect("records B");
  repo.put_version("root/A", version_key(1),
      ModuleVersion::new(20, vec!["B".into()], vec![]))
    .expect("puts A");
  repo.put_compilation("root/A", &version_key(1),
      ModuleCompilationKey { predecessor_times: vec![time_b] }, 222, b"A artifact")
    .expect("records A");
  // Rebuild without touching B: both keys match, so A is not recompiled.
  assert!(repo.get_version("root/A", &version_key(1)).is_some());
  assert!(repo.get_compilation("root/A", &version_key(1),
    &ModuleCompilationKey { predecessor_times: vec![time_b] }).is_some());
  // B rebuilt at a different time produces a different compilation key,
  // so A must be recompiled; the old artifact stays retained.
  let time_b2 = 333;
  assert!(repo.get_compilation("root/A", &version_key(1),
    &ModuleCompilationKey { predecessor_times: vec![time_b2] }).is_none());
  assert!(repo.get_compilation("root/A", &version_key(1),
    &ModuleCompilationKey { predecessor_times: vec![time_b] }).is_some());
}

#[test]
fn values_round_trip_through_stored_artifacts() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("values.repo");
  let tuple = Value::tuple([
    Value::int(1),
    Value::string("two"),
    Value::tuple([Value::int(3), Value::int(4)]),
  ]);
  let offset = {
    let repo = open(&path);
    repo.put_version("root/A", version_key(9), sample_version()).expect("puts");
    let compilation = repo.put_compilation("root/A", &version_key(9),
        ModuleCompilationKey { predecessor_times: vec![] }, 1,
        &serializer::serialize(&tuple).expect("serializes"))
      .expect("records");
    repo.commit().expect("commits");
    compilation.record_offset
  };
  let repo = open(&path);
  let bytes = repo.fetch_record(offset).expect("reads");
  let back = serializer::deserialize(&bytes).expect("deserializes");
  assert_eq!(back, tuple);
  assert_eq!(back.instance_ty(), tuple.instance_ty());
}

#[test]
fn clean_modules_under_forgets_subtree_versions() {
  let dir = tempfile::tempdir().expect("tempdir");
  let repo = open(dir.path().join("clean.repo"));
  repo.put_version("root/pkg/A", version_key(1), sample_version()).expect("puts");
  repo.put_version("root/pkg", version_key(2), sample_version()).expect("puts");
  repo.put_version("root/other", version_key(3), sample_version()).expect("puts");
  repo.clean_modules_under("root/pkg");
  assert!(repo.get_version("root/pkg/A", &version_key(1)).is_none());
  assert!(repo.get_version("root/pkg", &version_key(2)).is_none());
  assert!(repo.get_version("root/other", &version_key(3)).is_some());
}

#[test]
fn clear_leaves_an_empty_repository() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("clear.repo");
  let repo = open(&path);
  repo.put_version("root/A", version_key(1), sample_version()).expect("puts");
  repo.commit().expect("commits");
  repo.clear().expect("clears");
  assert!(repo.get_version("root/A", &version_key(1)).is_none());
  drop(repo);
  let reopened = open(&path);
  assert!(reopened.get_version("root/A", &version_key(1)).is_none());
}

#[test]
fn stale_commits_only_fire_past_the_age_bound() {
  let dir = tempfile::tempdir().expect("tempdir");
  let repo = open(dir.path().join("stale.repo"));
  repo.put_version("root/A", version_key(1), sample_version()).expect("puts");
  assert!(repo.is_dirty());
  repo.commit_if_stale_changes(Duration::from_secs(3600)).expect("no-op");
  assert!(repo.is_dirty(), "young changes must not commit");
  repo.commit_if_stale_changes(Duration::ZERO).expect("commits");
  assert!(!repo.is_dirty());
}

#[test]
fn incompatible_files_are_discarded() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("bad.repo");
  {
    let mut file = File::create(&path).expect("creates");
    file.write_all(b"not a repository at all").expect("writes");
  }
  let repo = open(&path);
  assert!(repo.get_version("root/A", &version_key(1)).is_none());
  repo.put_version("root/A", version_key(1), sample_version()).expect("usable");
}

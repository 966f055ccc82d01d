//! The persistent concretization cache.
//!
//! Results and solver statistics are serialized to JSON and stored under a
//! root directory, keyed by the sha256 of the generated problem (facts
//! plus rule files). Layout: a manifest file whose first line is
//! `<entry_count> <total_bytes>` followed by one `<hash> <size>` line per
//! entry in insertion order, and a two-level fan-out tree
//! (`<first-2-hex>/<full-hash>`) of JSON documents
//! `{ "results": ..., "statistics": ... }`.
//!
//! Entry creation is write-once: concurrent writers for the same problem
//! degrade to "first writer wins". Manifest rewrites are guarded by a lock
//! file; per-entry writes rely on atomic create-new semantics, so solves
//! for different problems never block each other.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{ConcretizeError, Result};
use crate::solver::result::SolveResult;

const MANIFEST_NAME: &str = ".cache_manifest";
const LOCK_NAME: &str = ".cache_manifest.lock";

pub struct ConcretizationCache {
    root: PathBuf,
    /// Maximum number of entries; zero or below disables the limit.
    entry_limit: i64,
    /// Maximum total bytes; zero or below disables the limit.
    size_limit: i64,
    /// Entries written by this process, pending a manifest flush.
    manifest_queue: Mutex<Vec<(String, u64)>>,
}

impl ConcretizationCache {
    pub fn new(root: &Path, entry_limit: i64, size_limit: i64) -> Result<ConcretizationCache> {
        fs::create_dir_all(root)?;
        Ok(ConcretizationCache {
            root: root.to_path_buf(),
            entry_limit,
            size_limit,
            manifest_queue: Mutex::new(Vec::new()),
        })
    }

    /// The first two characters of, and the full, sha256 of the problem.
    fn prefix_digest(problem: &str) -> (String, String) {
        let digest = format!("{:x}", Sha256::digest(problem.as_bytes()));
        (digest[..2].to_string(), digest)
    }

    fn cache_path_from_problem(&self, problem: &str) -> PathBuf {
        let (prefix, digest) = ConcretizationCache::prefix_digest(problem);
        self.root.join(prefix).join(digest)
    }

    fn cache_path_from_hash(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2.min(hash.len())]).join(hash)
    }

    /// Parse one manifest line into its `(hash, size)` pair.
    fn parse_manifest_entry(line: &str) -> Option<(String, u64)> {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let size = parts.next()?.parse::<u64>().ok()?;
        Some((hash.to_string(), size))
    }

    /// Store an entry for the problem, unless one exists already: the
    /// first writer wins, later writers are no-ops.
    pub fn store(
        &self,
        problem: &str,
        result: &SolveResult,
        statistics: &[(String, i64)],
    ) -> Result<()> {
        let path = self.cache_path_from_problem(problem);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                log::debug!("cache entry {} exists, will not be overwritten", path.display());
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let stats: Value = statistics
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        let document = json!({ "results": result.to_json(), "statistics": stats });
        let payload = serde_json::to_string(&document)?;
        file.write_all(payload.as_bytes())?;

        let hash = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        self.manifest_queue
            .lock()
            .expect("manifest queue lock is never poisoned")
            .push((hash, payload.len() as u64));
        Ok(())
    }

    /// Fetch the cached result and statistics for a problem, if present
    /// and readable.
    pub fn fetch(&self, problem: &str) -> Option<(SolveResult, Vec<(String, i64)>)> {
        let path = self.cache_path_from_problem(problem);
        let content = fs::read_to_string(&path).ok()?;
        let document: Value = match serde_json::from_str(&content) {
            Ok(document) => document,
            Err(err) => {
                log::warn!("unreadable cache entry {}: {err}", path.display());
                return None;
            }
        };
        let result = match document.get("results").map(SolveResult::from_json) {
            Some(Ok(result)) => result,
            _ => {
                log::warn!("invalid cached result at {}", path.display());
                return None;
            }
        };
        let statistics: Vec<(String, i64)> = document
            .get("statistics")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_i64()?)))
                    .collect()
            })
            .unwrap_or_default();
        log::debug!("concretization cache hit at {}", path.display());
        Some((result, statistics))
    }

    /// Append queued entries to the manifest and refresh its header.
    pub fn flush_manifest(&self) -> Result<()> {
        let queued: Vec<(String, u64)> = {
            let mut queue = self
                .manifest_queue
                .lock()
                .expect("manifest queue lock is never poisoned");
            queue.drain(..).collect()
        };
        if queued.is_empty() {
            return Ok(());
        }

        let _lock = self.manifest_lock()?;
        let (_, mut entries) = self.read_manifest();
        entries.extend(queued);
        self.write_manifest(&entries)
    }

    /// Prune the cache according to the configured limits, oldest entries
    /// first. Either limit can be disabled with a value of zero or below.
    pub fn cleanup(&self) -> Result<()> {
        let _lock = self.manifest_lock()?;
        let (header, mut entries) = self.read_manifest();
        if header.is_none() && entries.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        if self.entry_limit > 0 {
            // prune the oldest ~10% of the limit at a time
            let chunk = (self.entry_limit / 10).max(1) as usize;
            while entries.len() as i64 > self.entry_limit {
                let prune = chunk.min(entries.len());
                for (hash, _) in entries.drain(..prune) {
                    self.safe_remove(&self.cache_path_from_hash(&hash));
                }
                changed = true;
            }
        }
        if self.size_limit > 0 {
            let total = |entries: &Vec<(String, u64)>| -> u64 {
                entries.iter().map(|(_, size)| *size).sum()
            };
            while total(&entries) as i64 > self.size_limit && !entries.is_empty() {
                // take ~10% of the limit off, starting from the oldest
                let target = (self.size_limit / 10).max(1) as u64;
                let mut pruned = 0u64;
                while pruned < target && !entries.is_empty() {
                    let (hash, size) = entries.remove(0);
                    self.safe_remove(&self.cache_path_from_hash(&hash));
                    pruned += size;
                }
                changed = true;
            }
        }

        if changed {
            self.write_manifest(&entries)?;
        }

        // remove fan-out directories left empty by pruning
        if let Ok(dir) = fs::read_dir(&self.root) {
            for entry in dir.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if let Ok(mut contents) = fs::read_dir(&path) {
                        if contents.next().is_none() {
                            self.safe_remove(&path);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Current (header, entries) of the manifest. Malformed lines are
    /// logged and skipped, never fatal.
    fn read_manifest(&self) -> (Option<(u64, u64)>, Vec<(String, u64)>) {
        let path = self.root.join(MANIFEST_NAME);
        let Ok(content) = fs::read_to_string(&path) else {
            return (None, Vec::new());
        };
        let mut lines = content.lines();
        let header = lines
            .next()
            .and_then(ConcretizationCache::parse_manifest_entry)
            .map(|(count, bytes)| (count.parse::<u64>().unwrap_or(0), bytes));
        let mut entries = Vec::new();
        for (i, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match ConcretizationCache::parse_manifest_entry(line) {
                Some(entry) => entries.push(entry),
                None => log::warn!("invalid concretization cache entry '{line}' on line {}", i + 2),
            }
        }
        (header, entries)
    }

    fn write_manifest(&self, entries: &[(String, u64)]) -> Result<()> {
        let total_bytes: u64 = entries.iter().map(|(_, size)| *size).sum();
        let mut content = format!("{} {}\n", entries.len(), total_bytes);
        for (hash, size) in entries {
            content.push_str(&format!("{hash} {size}\n"));
        }
        fs::write(self.root.join(MANIFEST_NAME), content)?;
        Ok(())
    }

    fn safe_remove(&self, path: &Path) {
        let result = if path.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => {}
            // removal is idempotent
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::debug!("could not remove {}: {err}", path.display()),
        }
    }

    fn manifest_lock(&self) -> Result<ManifestLock> {
        let path = self.root.join(LOCK_NAME);
        for _ in 0..100 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(ManifestLock { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ConcretizeError::Config(format!(
            "concretization cache manifest at {} is locked",
            self.root.display()
        )))
    }
}

struct ManifestLock {
    path: PathBuf,
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Spec;

    fn result_for(name: &str) -> SolveResult {
        let mut result = SolveResult::new(vec![Spec::parse(name).unwrap()]);
        result.satisfiable = Some(true);
        result
    }

    fn cache_with_limits(entry_limit: i64, size_limit: i64) -> (tempfile::TempDir, ConcretizationCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConcretizationCache::new(dir.path(), entry_limit, size_limit).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_store_and_fetch_round_trip() {
        let (_dir, cache) = cache_with_limits(10, 0);
        cache
            .store("problem text", &result_for("a"), &[("solve_ms".into(), 5)])
            .unwrap();
        let (result, stats) = cache.fetch("problem text").unwrap();
        assert_eq!(result.satisfiable, Some(true));
        assert_eq!(stats, vec![("solve_ms".to_string(), 5)]);
        assert!(cache.fetch("another problem").is_none());
    }

    #[test]
    fn test_store_is_write_once() {
        let (_dir, cache) = cache_with_limits(10, 0);
        cache.store("p", &result_for("a"), &[]).unwrap();
        // second store for the same problem must not overwrite
        cache.store("p", &result_for("b"), &[]).unwrap();
        let (result, _) = cache.fetch("p").unwrap();
        assert_eq!(result.abstract_specs[0].name, "a");
    }

    #[test]
    fn test_cleanup_fifo_entry_limit() {
        let n = 8usize;
        let (_dir, cache) = cache_with_limits((n / 2) as i64, 0);
        let problems: Vec<String> = (0..n).map(|i| format!("problem {i}")).collect();
        for problem in &problems {
            cache.store(problem, &result_for("a"), &[]).unwrap();
        }
        cache.flush_manifest().unwrap();
        cache.cleanup().unwrap();

        // at most N/2 entries survive, and they are the most recent ones
        let survivors: Vec<bool> = problems.iter().map(|p| cache.fetch(p).is_some()).collect();
        assert_eq!(survivors.iter().filter(|s| **s).count(), n / 2);
        assert!(survivors[n / 2..].iter().all(|s| *s));
        assert!(survivors[..n / 2].iter().all(|s| !*s));
    }

    #[test]
    fn test_cleanup_size_limit() {
        let (_dir, cache) = cache_with_limits(0, 600);
        for i in 0..6 {
            cache.store(&format!("problem {i}"), &result_for("a"), &[]).unwrap();
        }
        cache.flush_manifest().unwrap();
        cache.cleanup().unwrap();
        let (_, entries) = cache.read_manifest();
        let total: u64 = entries.iter().map(|(_, s)| *s).sum();
        assert!(total <= 600);
    }

    #[test]
    fn test_corrupt_manifest_line_is_skipped() {
        let (dir, cache) = cache_with_limits(10, 0);
        fs::write(
            dir.path().join(MANIFEST_NAME),
            "2 100\nvalidhash 50\nthis-is-not-valid\n",
        )
        .unwrap();
        // malformed lines must not crash cleanup
        cache.cleanup().unwrap();
        let (_, entries) = cache.read_manifest();
        assert_eq!(entries.len(), 1);
    }
}

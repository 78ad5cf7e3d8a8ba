//! Persistent, content-addressed storage of [`CacheEntry`] records and
//! validation of cached results against current filesystem state.

use std::{
    collections::{BTreeMap, BTreeSet},
    marker::PhantomData,
    time::{SystemTime, UNIX_EPOCH},
};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::Context, eyre::bail};
use itertools::Itertools;
use tracing::{debug, instrument, trace, warn};

use crate::{
    Locked, Unlocked,
    cache::entry::{CacheEntry, UpstreamSignature, sanitize_segment},
    fs,
    hash::ContentHash,
};

/// Resolves the current fingerprint of an upstream producer's outputs,
/// given the output name and optional glob filter an entry was built
/// against.
///
/// Implemented by [`crate::context::Context`]; kept as a trait here so the
/// cache store has no dependency on the pipeline/context machinery.
pub trait UpstreamSignatureLookup {
    fn current_signature(
        &self,
        producer: &str,
        output_key: &str,
        glob: Option<&str>,
    ) -> Result<String>;
}

/// A filesystem-backed cache store, guarded by an exclusive lock over its
/// whole directory for the duration of a pipeline run.
///
/// The lock is held for an entire `Pipeline::run` and exists to reject a
/// second concurrent pipeline run against the same cache directory
/// outright, rather than only serializing narrower local-vs-remote races.
pub struct FsCacheStore<State> {
    state: PhantomData<State>,
    root: Utf8PathBuf,
    lock: fs::LockFile<State>,
}

impl FsCacheStore<Unlocked> {
    /// Open the platform default cache directory (`<user cache dir>/weave`).
    pub async fn open_default() -> Result<Self> {
        let root = fs::user_global_cache_path()
            .await
            .context("determine default cache directory")?;
        Self::open_dir(root).await
    }

    /// Open (creating if necessary) the cache store rooted at `root`.
    #[instrument]
    pub async fn open_dir(root: impl Into<Utf8PathBuf> + std::fmt::Debug) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .context("create cache root")?;
        let lock = fs::LockFile::open(root.join(".weave-cache.lock"))
            .await
            .context("open cache lock file")?;
        Ok(Self {
            state: PhantomData,
            root,
            lock,
        })
    }

    /// Acquire the exclusive lock, rejecting a second concurrent holder
    /// with a clear error rather than blocking forever.
    #[instrument(skip_all, fields(root = %self.root))]
    pub async fn lock(self) -> Result<FsCacheStore<Locked>> {
        let root = self.root;
        match self.lock.try_lock().await.context("try lock cache dir")? {
            Ok(lock) => {
                debug!(%root, "locked cache directory");
                Ok(FsCacheStore {
                    state: PhantomData,
                    root,
                    lock,
                })
            }
            Err(_) => bail!(
                "cache directory {root} is already locked by another pipeline run; \
                 concurrent runs against the same cache directory are not supported"
            ),
        }
    }
}

impl FsCacheStore<Locked> {
    /// Release the lock.
    pub async fn unlock(self) -> Result<FsCacheStore<Unlocked>> {
        let root = self.root;
        let lock = self.lock.unlock().await.context("unlock cache dir")?;
        Ok(FsCacheStore {
            state: PhantomData,
            root,
            lock,
        })
    }

    fn entry_path(&self, content_signature: &str, cache_key: &str) -> Utf8PathBuf {
        self.root
            .join(sanitize_segment(content_signature))
            .join(format!("{}.json", sanitize_segment(cache_key)))
    }

    fn signature_dir(&self, content_signature: &str) -> Utf8PathBuf {
        self.root.join(sanitize_segment(content_signature))
    }

    /// Read the entry stored under `(content_signature, cache_key)`, if any.
    /// Corrupt or unreadable entries are treated as a clean miss.
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        content_signature: &str,
        cache_key: &str,
    ) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(content_signature, cache_key);
        let raw = match fs::read_buffered_utf8(&path).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                trace!(%path, "cache miss: no entry file");
                return Ok(None);
            }
            Err(err) => {
                warn!(%path, %err, "cache entry unreadable, treating as miss");
                return Ok(None);
            }
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => {
                trace!(%path, "cache entry read");
                Ok(Some(entry))
            }
            Err(err) => {
                warn!(%path, %err, "corrupt cache entry, treating as miss");
                Ok(None)
            }
        }
    }

    /// Persist `entry` under `(content_signature, cache_key)`, writing
    /// atomically (write-then-rename).
    #[instrument(skip(self, entry))]
    pub async fn put(
        &self,
        content_signature: &str,
        cache_key: &str,
        entry: &CacheEntry,
    ) -> Result<()> {
        if !entry.outputs_are_contained() {
            bail!(
                "refusing to persist cache entry for {cache_key:?}: an output path escapes {}",
                entry.output_base_dir
            );
        }
        let path = self.entry_path(content_signature, cache_key);
        let json = serde_json::to_vec_pretty(entry).context("serialize cache entry")?;
        fs::write_atomic(&path, json)
            .await
            .context("write cache entry")?;
        trace!(%path, "cache entry written");
        Ok(())
    }

    /// Build a fresh [`CacheEntry`] from the current state of `items` and
    /// their dependencies. Missing optional deps are silently skipped (a
    /// self-correcting choice: the next validation will see them missing
    /// and invalidate).
    #[instrument(skip(self, outputs_by_key, upstream_signatures))]
    pub async fn build(
        &self,
        items: &[Utf8PathBuf],
        outputs_by_key: BTreeMap<String, Vec<Utf8PathBuf>>,
        output_base_dir: Utf8PathBuf,
        cache_key: String,
        discovered_deps: &[Utf8PathBuf],
        config_deps: &[Utf8PathBuf],
        upstream_signatures: BTreeMap<String, UpstreamSignature>,
    ) -> Result<CacheEntry> {
        let mut input_hashes = BTreeMap::new();
        let mut input_timestamps = BTreeMap::new();
        for item in items {
            let hash = self.file_hash(item).await.context("hash item file")?;
            let mtime = mtime_millis(item).await.context("stat item file")?;
            input_hashes.insert(item.clone(), hash);
            input_timestamps.insert(item.clone(), mtime);
        }

        let config_deps = self.hash_existing(config_deps).await;
        let discovered_deps = self.hash_existing(discovered_deps).await;

        let created_at_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let entry = CacheEntry {
            item_files: items.to_vec(),
            input_hashes,
            input_timestamps,
            outputs_by_key,
            output_base_dir,
            config_deps,
            discovered_deps,
            upstream_signatures,
            cache_key,
            created_at_millis,
        };
        if !entry.outputs_are_contained() {
            bail!(
                "node produced an output path outside {}",
                entry.output_base_dir
            );
        }
        Ok(entry)
    }

    /// Hash every path in `paths` that currently exists; paths that don't
    /// are silently dropped, matching the "missing optional dep" policy.
    async fn hash_existing(&self, paths: &[Utf8PathBuf]) -> BTreeMap<Utf8PathBuf, ContentHash> {
        let mut out = BTreeMap::new();
        for path in paths {
            match self.file_hash(path).await {
                Ok(hash) => {
                    out.insert(path.clone(), hash);
                }
                Err(err) => {
                    trace!(%path, %err, "optional dependency missing at build time, skipping");
                }
            }
        }
        out
    }

    /// Two-tier validation: outputs exist, inputs are fresh (mtime fast
    /// path, hash slow path), config/discovered deps are unchanged, and
    /// every upstream reference's current signature still matches.
    #[instrument(skip(self, entry, upstream))]
    pub async fn validate(
        &self,
        entry: &CacheEntry,
        upstream: &impl UpstreamSignatureLookup,
    ) -> Result<bool> {
        for path in entry.outputs_by_key.values().flatten() {
            if fs::metadata(path).await.context("stat output")?.is_none() {
                trace!(%path, "invalid: output missing");
                return Ok(false);
            }
        }

        for (path, expected_hash) in &entry.input_hashes {
            let Some(&expected_mtime) = entry.input_timestamps.get(path) else {
                trace!(%path, "invalid: missing recorded timestamp");
                return Ok(false);
            };
            match mtime_millis(path).await {
                Ok(actual_mtime) if actual_mtime == expected_mtime => continue,
                Ok(_) => {
                    let actual_hash = match self.file_hash(path).await {
                        Ok(hash) => hash,
                        Err(err) => {
                            trace!(%path, %err, "invalid: could not rehash input");
                            return Ok(false);
                        }
                    };
                    if actual_hash != *expected_hash {
                        trace!(%path, "invalid: content changed");
                        return Ok(false);
                    }
                }
                Err(err) => {
                    trace!(%path, %err, "invalid: could not stat input");
                    return Ok(false);
                }
            }
        }

        if !self.deps_unchanged(&entry.config_deps).await {
            return Ok(false);
        }
        if !self.deps_unchanged(&entry.discovered_deps).await {
            return Ok(false);
        }

        for (producer, sig) in &entry.upstream_signatures {
            let current = upstream
                .current_signature(producer, &sig.output_key, sig.glob.as_deref())
                .context("resolve current upstream signature")?;
            if current != sig.signature {
                trace!(%producer, "invalid: upstream signature changed");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn deps_unchanged(&self, deps: &BTreeMap<Utf8PathBuf, ContentHash>) -> bool {
        for (path, expected) in deps {
            match self.file_hash(path).await {
                Ok(actual) if actual == *expected => continue,
                _ => return false,
            }
        }
        true
    }

    /// SHA-256 over a file's contents.
    pub async fn file_hash(&self, path: &Utf8Path) -> Result<ContentHash> {
        crate::hash::hash_file(path).await
    }

    /// Materialize a cached output at `dst`, copying from `src`. Used to
    /// reuse a hit produced by one node under a different node's expected
    /// output path.
    #[instrument(skip(self))]
    pub async fn copy_to(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        fs::copy_file(src, dst).await.context("copy cached output")
    }

    /// A stable fingerprint of a node's emitted output lists, used as an
    /// upstream signature. Stable under identical outputs; changes
    /// whenever the ordered list of paths for any output key changes.
    pub fn compute_output_signature(outputs: &BTreeMap<String, Vec<Utf8PathBuf>>) -> String {
        let canonical = outputs
            .iter()
            .sorted_by_key(|(key, _)| (*key).clone())
            .map(|(key, paths)| format!("{key}=[{}]", paths.iter().join(",")))
            .join(";");
        ContentHash::of(canonical.as_bytes()).to_hex()
    }

    /// Delete entries under `content_signature` whose cache key is not in
    /// `current_keys`. Not invoked automatically by the node runtime
    /// (see DESIGN.md); a node opts in explicitly when it wants the
    /// older, non-concurrent-safe cleanup behavior.
    #[instrument(skip(self, current_keys))]
    pub async fn clean_except(
        &self,
        content_signature: &str,
        current_keys: &BTreeSet<String>,
    ) -> Result<()> {
        let dir = self.signature_dir(content_signature);
        let Some(mut entries) = (match tokio::fs::read_dir(&dir).await {
            Ok(entries) => Some(entries),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).context("read signature directory"),
        }) else {
            return Ok(());
        };

        while let Some(entry) = entries.next_entry().await.context("read dir entry")? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            if !current_keys.contains(key) {
                fs::remove_file(entry.path())
                    .await
                    .context("remove orphaned cache entry")?;
                debug!(key, %content_signature, "removed orphaned cache entry");
            }
        }
        Ok(())
    }
}

async fn mtime_millis(path: &Utf8Path) -> Result<i64> {
    let metadata = tokio::fs::metadata(path.as_std_path())
        .await
        .with_context(|| format!("stat {path}"))?;
    let modified = metadata.modified().context("read mtime")?;
    let millis = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    Ok(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoUpstreams;
    impl UpstreamSignatureLookup for NoUpstreams {
        fn current_signature(&self, _: &str, _: &str, _: Option<&str>) -> Result<String> {
            bail!("no upstreams registered in this test")
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = FsCacheStore::open_dir(root).await.unwrap();
        let store = store.lock().await.unwrap();

        let entry = CacheEntry {
            item_files: vec![],
            input_hashes: BTreeMap::new(),
            input_timestamps: BTreeMap::new(),
            outputs_by_key: BTreeMap::new(),
            output_base_dir: Utf8PathBuf::from("out"),
            config_deps: BTreeMap::new(),
            discovered_deps: BTreeMap::new(),
            upstream_signatures: BTreeMap::new(),
            cache_key: "k".to_string(),
            created_at_millis: 0,
        };
        store.put("Sig-aaaaaaaa", "k", &entry).await.unwrap();
        let read = store.get("Sig-aaaaaaaa", "k").await.unwrap().unwrap();
        assert_eq!(read, entry);
    }

    #[tokio::test]
    async fn get_missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = FsCacheStore::open_dir(root).await.unwrap();
        let store = store.lock().await.unwrap();
        assert!(store.get("Sig-aaaaaaaa", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_lock_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let first = FsCacheStore::open_dir(&root).await.unwrap();
        let _first = first.lock().await.unwrap();

        let second = FsCacheStore::open_dir(&root).await.unwrap();
        assert!(second.lock().await.is_err());
    }

    #[tokio::test]
    async fn validate_rejects_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = FsCacheStore::open_dir(root).await.unwrap();
        let store = store.lock().await.unwrap();

        let entry = CacheEntry {
            item_files: vec![],
            input_hashes: BTreeMap::new(),
            input_timestamps: BTreeMap::new(),
            outputs_by_key: BTreeMap::from([(
                "out".to_string(),
                vec![Utf8PathBuf::from("/nonexistent/path.txt")],
            )]),
            output_base_dir: Utf8PathBuf::from("/nonexistent"),
            config_deps: BTreeMap::new(),
            discovered_deps: BTreeMap::new(),
            upstream_signatures: BTreeMap::new(),
            cache_key: "k".to_string(),
            created_at_millis: 0,
        };
        assert!(!store.validate(&entry, &NoUpstreams).await.unwrap());
    }

    #[test]
    fn compute_output_signature_is_stable_and_order_sensitive() {
        let mut a = BTreeMap::new();
        a.insert("out".to_string(), vec![Utf8PathBuf::from("a"), Utf8PathBuf::from("b")]);
        let mut b = BTreeMap::new();
        b.insert("out".to_string(), vec![Utf8PathBuf::from("b"), Utf8PathBuf::from("a")]);

        let sig_a = FsCacheStore::<Locked>::compute_output_signature(&a);
        let sig_a_again = FsCacheStore::<Locked>::compute_output_signature(&a);
        let sig_b = FsCacheStore::<Locked>::compute_output_signature(&b);

        assert_eq!(sig_a, sig_a_again);
        assert_ne!(sig_a, sig_b);
    }
}

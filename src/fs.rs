//! Filesystem operations tailored to `weave`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.

#![allow(
    clippy::disallowed_methods,
    reason = "The methods are disallowed elsewhere, but we need them here!"
)]

use std::{
    fmt::Debug as StdDebug,
    fs::Metadata,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use camino::Utf8PathBuf;
use color_eyre::{Result, eyre::Context, eyre::OptionExt};
use derive_more::{Debug, Display};
use directories::ProjectDirs;
use filetime::FileTime;
use fslock::LockFile as FsLockFile;
use tap::TapFallible;
use tokio::{
    fs::{File, ReadDir},
    sync::Mutex,
    task::spawn_blocking,
};
use tracing::{instrument, trace};

use crate::{Locked, Unlocked};

/// Shared lock file on the file system.
///
/// Lock the file with [`LockFile::lock`]. Unlock it with [`LockFile::unlock`],
/// or by dropping the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{}", path.display())]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    inner: Arc<Mutex<FsLockFile>>,
}

impl LockFile<Unlocked> {
    /// Create a new instance at the provided path.
    pub async fn open(path: impl AsRef<Path> + StdDebug) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, path) = spawn_blocking(move || FsLockFile::open(&path).map(|file| (file, path)))
            .await
            .context("join task")?
            .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Lock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile can panic if the handle is already locked,
                // but we've set it up (using typestate) such that it's not
                // possible to lock an already locked handle.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked file"))
    }

    /// Try to lock the lockfile without blocking. Returns `Ok(None)` if the
    /// lock is already held by someone else.
    #[instrument(skip_all, fields(%self))]
    pub async fn try_lock(self) -> Result<std::result::Result<LockFile<Locked>, Self>> {
        spawn_blocking(move || {
            let locked = {
                let mut inner = self.inner.blocking_lock();
                inner.try_lock().context("try lock file")?
            };
            if locked {
                Ok(Ok(LockFile {
                    state: PhantomData,
                    inner: self.inner,
                    path: self.path,
                }))
            } else {
                Ok(Err(self))
            }
        })
        .await
        .context("join task")?
    }
}

impl LockFile<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                // fslock::LockFile can panic if the handle is not locked,
                // but we've set it up (using typestate) such that it's not
                // possible to unlock a non-locked handle.
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }

            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked file"))
    }
}

/// Determine the canonical cache directory for the current user, if possible.
///
/// This can fail if the user has no home directory, or if it cannot be
/// accessed. Layout: `<platform user cache dir>/weave`.
#[instrument]
pub async fn user_global_cache_path() -> Result<Utf8PathBuf> {
    let dirs = ProjectDirs::from("", "", "weave").ok_or_eyre("determine user cache directory")?;
    let cache = dirs.cache_dir().to_path_buf();
    let cache = Utf8PathBuf::from_path_buf(cache)
        .map_err(|path| color_eyre::eyre::eyre!("cache directory is not utf8: {path:?}"))?;
    trace!(?cache, "read user global cache path");
    Ok(cache)
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + StdDebug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Copy the file from `src` to `dst`.
///
/// Preserves `mtime`/`atime` from `src` so that downstream mtime-based
/// freshness checks see the original file's timestamp rather than the
/// moment of the copy.
#[instrument]
pub async fn copy_file(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    // Manually opening the source file allows us to access the stat info directly,
    // without an additional syscall to stat directly.
    let mut src = tokio::fs::File::open(src)
        .await
        .context("open source file")?;
    let src_meta = src.metadata().await.context("get source metadata")?;

    // If we can't read the actual times from the stat, default to unix epoch
    // so that we don't break downstream freshness checks.
    let src_mtime = src_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let src_atime = src_meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
    if let Some(parent) = dst.as_ref().parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }

    let mut dst = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dst)
        .await
        .context("open destination file")?;
    let bytes = tokio::io::copy(&mut src, &mut dst)
        .await
        .context("copy file contents")?;

    // Using the `filetime` crate here instead of the stdlib because it's cross platform.
    let mtime = FileTime::from_system_time(src_mtime);
    let atime = FileTime::from_system_time(src_atime);
    trace!(?src, ?dst, ?mtime, ?atime, ?bytes, "copy file");

    let dst = set_file_handle_times(dst, Some(atime), Some(mtime))
        .await
        .context("set destination file times")?;

    dst.sync_all().await.context("sync destination file")
}

/// Update the `atime` and `mtime` of a file handle.
/// Returns the same file handle after the update.
#[instrument]
pub async fn set_file_handle_times(
    file: File,
    mtime: Option<FileTime>,
    atime: Option<FileTime>,
) -> Result<File> {
    match (mtime, atime) {
        (None, None) => Ok(file),
        (mtime, atime) => {
            let file = file.into_std().await;
            spawn_blocking(move || {
                filetime::set_file_handle_times(&file, atime, mtime).map(|_| file)
            })
            .await
            .context("join thread")?
            .context("update handle")
            .map(File::from_std)
        }
    }
}

/// Buffer the file content from disk.
#[instrument]
#[allow(dead_code)]
pub async fn read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8.
#[instrument]
pub async fn read_buffered_utf8(path: impl AsRef<Path> + StdDebug) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk.
///
/// Not atomic. Callers that need atomicity across concurrent readers (the
/// cache store's entry writes) build their own write-then-rename on top of
/// this.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + StdDebug, content: impl AsRef<[u8]>) -> Result<()> {
    let (path, content) = (path.as_ref(), content.as_ref());
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Write the provided file content to disk atomically: write to a sibling
/// temp file, then rename over the destination.
#[instrument(skip(content))]
pub async fn write_atomic(
    path: impl AsRef<Path> + StdDebug,
    content: impl AsRef<[u8]>,
) -> Result<()> {
    let (path, content) = (path.as_ref(), content.as_ref());
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("weave"),
        uuid_like_suffix(),
    );
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, content)
        .await
        .with_context(|| format!("write temp file: {tmp_path:?}"))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename {tmp_path:?} to {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file atomically"))
}

/// A small process-unique suffix for temp file names, avoiding a dependency
/// on a UUID crate for what is purely a collision-avoidance token.
fn uuid_like_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    format!("{pid:x}-{n:x}")
}

/// Open a file for reading.
#[instrument]
pub async fn open_file(path: impl AsRef<Path> + StdDebug) -> Result<File> {
    let path = path.as_ref();
    File::open(path)
        .await
        .with_context(|| format!("open file: {path:?}"))
        .tap_ok(|_| trace!(?path, "open file"))
}

/// Read directory entries.
#[instrument]
#[allow(dead_code)]
pub async fn read_dir(path: impl AsRef<Path> + StdDebug) -> Result<ReadDir> {
    let path = path.as_ref();
    tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("read directory: {path:?}"))
        .tap_ok(|_| trace!(?path, "read directory"))
}

/// Get the metadata for a file.
pub async fn metadata(path: impl AsRef<Path> + StdDebug) -> Result<Option<Metadata>> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            trace!(?path, ?metadata, "read metadata");
            Ok(Some(metadata))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read metadata: {path:?}")),
    }
}

/// Remove the directory and all its contents.
pub async fn remove_dir_all(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Remove a single file, treating "already gone" as success.
pub async fn remove_file(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            trace!(?path, "removed file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

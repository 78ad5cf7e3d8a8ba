use camino::Utf8PathBuf;
use tempfile::TempDir;

pub mod pipeline;

/// A scratch directory nested under the crate root, so paths inside it
/// resolve relative to the process's actual working directory the same
/// way a real pipeline invocation's source files would.
#[track_caller]
pub fn scratch_dir() -> (TempDir, Utf8PathBuf) {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let dir = tempfile::Builder::new()
        .prefix("weave-it-")
        .tempdir_in(manifest_dir)
        .expect("create scratch directory under crate root");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("scratch dir is utf8");
    (dir, path)
}

#[track_caller]
pub fn write(path: &camino::Utf8Path, contents: &str) {
    std::fs::write(path.as_std_path(), contents).unwrap_or_else(|err| panic!("write {path}: {err}"));
}

#[track_caller]
pub fn read(path: &camino::Utf8Path) -> String {
    std::fs::read_to_string(path.as_std_path()).unwrap_or_else(|err| panic!("read {path}: {err}"))
}

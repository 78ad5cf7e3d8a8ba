//! Path types tailored to this crate.
//!
//! ## Rationale
//!
//! A pipeline juggles paths that mean very different things: an absolute
//! path into the build directory, a path relative to an item's original
//! location, a cache-entry path that must be re-based onto a new output
//! directory without ever walking outside it. Mixing these up as bare
//! `PathBuf`s is exactly how the filesystem-escape bug in §4.2.2 happens.
//!
//! So paths here are represented as [`TypedPath<B, T>`], a zero-cost wrapper
//! over [`Utf8PathBuf`] carrying two phantom markers: whether the path is
//! [`Abs`]olute or [`Rel`]ative, and whether it denotes a [`Dir`]ectory or a
//! [`File`]. The markers are about *intent*, not a filesystem guarantee —
//! nothing stops the target from changing type underneath us, but every
//! constructor in this module at least validates the absolute/relative
//! question up front, which is the one that actually causes bugs when
//! rebasing cached output paths.

use std::{
    any::type_name,
    ffi::OsStr,
    marker::PhantomData,
    path::{Path, PathBuf},
    str::FromStr,
};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use color_eyre::{
    Report, Result,
    eyre::{Context, eyre},
};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type RelFilePath = TypedPath<Rel, File>;
pub type RelDirPath = TypedPath<Rel, Dir>;
pub type AbsFilePath = TypedPath<Abs, File>;
pub type AbsDirPath = TypedPath<Abs, Dir>;

/// An absolute path, rooted at the filesystem root.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("Abs")]
pub struct Abs;

/// A relative path, rooted at some base understood by context.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("Rel")]
pub struct Rel;

/// A directory: something that can contain other filesystem entities.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("Dir")]
pub struct Dir;

/// A file: something that contains data.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("File")]
pub struct File;

/// A location on the filesystem, typed by base ([`Abs`]/[`Rel`]) and kind
/// ([`Dir`]/[`File`]).
///
/// This type is about intent within the running program; it does not
/// validate that the path exists or is really a file/directory, since that
/// would be race-prone and would make it impossible to construct paths
/// meant to name things that don't exist yet (e.g. a not-yet-written
/// output file).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{inner}")]
pub struct TypedPath<B, T> {
    base: PhantomData<B>,
    ty: PhantomData<T>,
    inner: Utf8PathBuf,
}

impl<B, T> TypedPath<B, T> {
    fn new_unchecked(inner: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base: PhantomData,
            ty: PhantomData,
            inner: inner.into(),
        }
    }

    /// View the path as a standard library path.
    pub fn as_std_path(&self) -> &Path {
        self.inner.as_std_path()
    }

    /// View the path as a string slice.
    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }

    /// View the path as a UTF-8 path.
    pub fn as_utf8_path(&self) -> &Utf8Path {
        &self.inner
    }

    /// Iterate the path's components.
    pub fn components(&self) -> impl Iterator<Item = Utf8Component<'_>> {
        self.inner.components()
    }

    /// The final component of the path, if there is one.
    pub fn file_name(&self) -> Option<&str> {
        self.inner.file_name()
    }

    /// The parent directory of this path, if there is one.
    pub fn parent(&self) -> Option<TypedPath<B, Dir>> {
        self.inner.parent().map(TypedPath::new_unchecked)
    }
}

impl<T> TypedPath<Abs, T> {
    /// Join a relative path onto this absolute base, producing a path typed
    /// by the joined value's kind.
    pub fn join<T2>(&self, rel: &TypedPath<Rel, T2>) -> TypedPath<Abs, T2> {
        TypedPath::new_unchecked(self.inner.join(&rel.inner))
    }

    /// Join a plain path segment onto this absolute directory.
    pub fn join_str<T2>(&self, segment: impl AsRef<str>) -> TypedPath<Abs, T2> {
        TypedPath::new_unchecked(self.inner.join(segment.as_ref()))
    }

    /// Strip this directory's prefix from an absolute path, yielding the
    /// remainder as a relative path. Errors if `path` does not live under
    /// `self` — the caller-facing guard against filesystem escapes.
    pub fn strip_prefix_of<T2>(&self, path: &TypedPath<Abs, T2>) -> Result<TypedPath<Rel, T2>> {
        path.inner
            .strip_prefix(&self.inner)
            .map(TypedPath::new_unchecked)
            .map_err(|err| eyre!("{path} is not inside {self}: {err}"))
    }
}

impl<B: Clone, T: Clone> TypedPath<B, T> {
    /// Replace the file name component, keeping everything else.
    pub fn with_file_name(&self, name: impl AsRef<str>) -> Self {
        TypedPath::new_unchecked(self.inner.with_file_name(name.as_ref()))
    }

    /// Replace the extension, keeping everything else.
    pub fn with_extension(&self, ext: impl AsRef<str>) -> Self {
        TypedPath::new_unchecked(self.inner.with_extension(ext.as_ref()))
    }
}

impl TypedPath<Abs, Dir> {
    /// The current working directory of the process.
    pub fn current() -> Result<Self> {
        let cwd = std::env::current_dir().context("get current directory")?;
        Self::try_from(cwd)
    }
}

fn is_absolute(path: &Utf8Path) -> bool {
    path.is_absolute()
}

macro_rules! impl_try_from_for_base {
    ($base:ty, $predicate:expr, $name:literal) => {
        impl<T> TryFrom<Utf8PathBuf> for TypedPath<$base, T> {
            type Error = Report;

            fn try_from(value: Utf8PathBuf) -> Result<Self> {
                if !$predicate(value.as_path()) {
                    return Err(eyre!("path {value:?} is not {}", $name));
                }
                Ok(Self::new_unchecked(value))
            }
        }

        impl<T> TryFrom<&Utf8Path> for TypedPath<$base, T> {
            type Error = Report;

            fn try_from(value: &Utf8Path) -> Result<Self> {
                Self::try_from(value.to_path_buf())
            }
        }

        impl<T> TryFrom<PathBuf> for TypedPath<$base, T> {
            type Error = Report;

            fn try_from(value: PathBuf) -> Result<Self> {
                let value = Utf8PathBuf::from_path_buf(value)
                    .map_err(|path| eyre!("path is not utf8: {path:?}"))?;
                Self::try_from(value)
            }
        }

        impl<T> TryFrom<&Path> for TypedPath<$base, T> {
            type Error = Report;

            fn try_from(value: &Path) -> Result<Self> {
                Self::try_from(value.to_path_buf())
            }
        }

        impl<T> TryFrom<&str> for TypedPath<$base, T> {
            type Error = Report;

            fn try_from(value: &str) -> Result<Self> {
                Self::try_from(Utf8PathBuf::from(value))
            }
        }

        impl<T> TryFrom<String> for TypedPath<$base, T> {
            type Error = Report;

            fn try_from(value: String) -> Result<Self> {
                Self::try_from(Utf8PathBuf::from(value))
            }
        }

        impl<T> FromStr for TypedPath<$base, T> {
            type Err = Report;

            fn from_str(value: &str) -> Result<Self> {
                Self::try_from(value)
            }
        }
    };
}

impl_try_from_for_base!(Abs, is_absolute, "absolute");
impl_try_from_for_base!(Rel, |p: &Utf8Path| !is_absolute(p), "relative");

impl<B, T> AsRef<TypedPath<B, T>> for TypedPath<B, T> {
    fn as_ref(&self) -> &TypedPath<B, T> {
        self
    }
}

impl<B, T> AsRef<Path> for TypedPath<B, T> {
    fn as_ref(&self) -> &Path {
        self.inner.as_std_path()
    }
}

impl<B, T> From<TypedPath<B, T>> for PathBuf {
    fn from(value: TypedPath<B, T>) -> Self {
        value.inner.into_std_path_buf()
    }
}

impl<B, T> From<&TypedPath<B, T>> for PathBuf {
    fn from(value: &TypedPath<B, T>) -> Self {
        value.inner.clone().into_std_path_buf()
    }
}

impl<'de, B, T> Deserialize<'de> for TypedPath<B, T>
where
    Self: TryFrom<Utf8PathBuf, Error = Report>,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let path = Utf8PathBuf::deserialize(deserializer)?;
        Self::try_from(path).map_err(serde::de::Error::custom)
    }
}

impl<B, T> Serialize for TypedPath<B, T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.inner.as_str().serialize(serializer)
    }
}

impl<B, T> std::fmt::Debug for TypedPath<B, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TypedPath<{}, {}>({:?})",
            type_name::<B>(),
            type_name::<T>(),
            self.inner
        )
    }
}

/// Convert an OS path/string into a [`Utf8PathBuf`], failing loudly on
/// non-UTF8 input rather than lossily converting.
pub fn utf8_path(path: impl AsRef<OsStr>) -> Result<Utf8PathBuf> {
    let path = PathBuf::from(path.as_ref());
    Utf8PathBuf::from_path_buf(path).map_err(|path| eyre!("path is not utf8: {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_rejects_relative() {
        let err = AbsDirPath::try_from("relative/path").unwrap_err();
        assert!(err.to_string().contains("not absolute"));
    }

    #[test]
    fn relative_rejects_absolute() {
        let err = RelFilePath::try_from("/absolute/path").unwrap_err();
        assert!(err.to_string().contains("not relative"));
    }

    #[test]
    fn strip_prefix_of_roundtrips() {
        let base = AbsDirPath::try_from("/tmp/build").unwrap();
        let full = AbsFilePath::try_from("/tmp/build/node/a.txt").unwrap();
        let rel = base.strip_prefix_of(&full).unwrap();
        assert_eq!(rel.as_str(), "node/a.txt");
        assert_eq!(base.join(&rel).as_str(), full.as_str());
    }

    #[test]
    fn strip_prefix_of_rejects_escape() {
        let base = AbsDirPath::try_from("/tmp/build/out").unwrap();
        let outside = AbsFilePath::try_from("/tmp/other/a.txt").unwrap();
        assert!(base.strip_prefix_of(&outside).is_err());
    }
}

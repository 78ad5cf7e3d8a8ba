//! Resolving an abstract [`Input`] descriptor into a concrete, ordered list
//! of filesystem paths.

use camino::Utf8PathBuf;
use color_eyre::{Result, eyre::bail};
use glob::glob;
use tracing::{instrument, trace};

/// A polymorphic descriptor that resolves to a list of filesystem paths.
///
/// Resolution ([`Input::resolve`]) is pure: no mutation, no disk writes,
/// deterministic given the producer's current output snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// A single glob pattern, expanded on demand. An empty expansion is an
    /// error.
    Glob(String),
    /// An ordered list of descriptors, resolved recursively and
    /// concatenated. Duplicates are not deduplicated.
    List(Vec<Input>),
    /// A reference to another node's previously emitted output, optionally
    /// intersected with a glob filter.
    NodeRef {
        producer: String,
        output: String,
        glob: Option<String>,
    },
    /// A literal path, not globbed: declares a direct file dependency.
    FileRef(Utf8PathBuf),
}

/// What [`Input::resolve`] needs from the pipeline to resolve a
/// [`Input::NodeRef`].
///
/// Implemented by [`crate::context::Context`]; kept as a trait so this
/// module has no dependency on the pipeline/context machinery.
pub trait NodeOutputLookup {
    /// The build directory, used to decide whether a node-output glob
    /// filter should be resolved relative to the build directory or the
    /// process working directory.
    fn build_dir(&self) -> &camino::Utf8Path;

    /// The paths a producer has emitted under a given output name, in the
    /// order they were produced. Empty if the producer hasn't run or
    /// emitted nothing under that name.
    fn node_output(&self, producer: &str, output: &str) -> Option<Vec<Utf8PathBuf>>;
}

impl Input {
    /// Resolve this descriptor into an ordered list of paths.
    #[instrument(skip(lookup))]
    pub fn resolve(&self, lookup: &impl NodeOutputLookup) -> Result<Vec<Utf8PathBuf>> {
        match self {
            Input::Glob(pattern) => resolve_glob(pattern),
            Input::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(item.resolve(lookup)?);
                }
                Ok(out)
            }
            Input::NodeRef {
                producer,
                output,
                glob,
            } => resolve_node_ref(producer, output, glob.as_deref(), lookup),
            Input::FileRef(path) => Ok(vec![path.clone()]),
        }
    }
}

fn resolve_glob(pattern: &str) -> Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    for entry in glob(pattern).with_context_pattern(pattern)? {
        let path = entry.with_context_pattern(pattern)?;
        let path = Utf8PathBuf::from_path_buf(path)
            .map_err(|path| color_eyre::eyre::eyre!("glob match is not utf8: {path:?}"))?;
        out.push(path);
    }
    if out.is_empty() {
        bail!("glob pattern {pattern:?} matched no files");
    }
    trace!(pattern, matches = out.len(), "resolved glob input");
    Ok(out)
}

fn resolve_node_ref(
    producer: &str,
    output: &str,
    glob_filter: Option<&str>,
    lookup: &impl NodeOutputLookup,
) -> Result<Vec<Utf8PathBuf>> {
    let Some(emitted) = lookup.node_output(producer, output) else {
        bail!("node {producer:?} has not run yet, or emitted nothing under output {output:?}");
    };

    let Some(pattern) = glob_filter else {
        return Ok(emitted);
    };

    let build_dir = lookup.build_dir();
    let candidate_pattern = if emitted.iter().any(|p| p.starts_with(build_dir)) {
        format!("{build_dir}/*/{pattern}")
    } else {
        pattern.to_string()
    };

    let allowed = resolve_glob(&candidate_pattern)
        .with_context(|| format!("resolve glob filter {pattern:?} for node ref {producer:?}"))?
        .into_iter()
        .collect::<std::collections::HashSet<_>>();

    let filtered: Vec<_> = emitted.into_iter().filter(|p| allowed.contains(p)).collect();
    if filtered.is_empty() {
        bail!("glob filter {pattern:?} matched none of node {producer:?}'s output {output:?}");
    }
    trace!(producer, output, pattern, matches = filtered.len(), "resolved filtered node ref");
    Ok(filtered)
}

trait WithContextPattern<T> {
    fn with_context_pattern(self, pattern: &str) -> Result<T>;
}

impl<T> WithContextPattern<T> for std::result::Result<T, glob::PatternError> {
    fn with_context_pattern(self, pattern: &str) -> Result<T> {
        self.map_err(|err| color_eyre::eyre::eyre!("invalid glob pattern {pattern:?}: {err}"))
    }
}

impl<T> WithContextPattern<T> for std::result::Result<T, glob::GlobError> {
    fn with_context_pattern(self, pattern: &str) -> Result<T> {
        self.map_err(|err| color_eyre::eyre::eyre!("glob read error for {pattern:?}: {err}"))
    }
}

use color_eyre::eyre::Context;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeLookup {
        build_dir: Utf8PathBuf,
        outputs: HashMap<(String, String), Vec<Utf8PathBuf>>,
    }

    impl NodeOutputLookup for FakeLookup {
        fn build_dir(&self) -> &camino::Utf8Path {
            &self.build_dir
        }

        fn node_output(&self, producer: &str, output: &str) -> Option<Vec<Utf8PathBuf>> {
            self.outputs
                .get(&(producer.to_string(), output.to_string()))
                .cloned()
        }
    }

    #[test]
    fn file_ref_resolves_to_itself() {
        let lookup = FakeLookup {
            build_dir: Utf8PathBuf::from("build"),
            outputs: HashMap::new(),
        };
        let input = Input::FileRef(Utf8PathBuf::from("a.txt"));
        assert_eq!(input.resolve(&lookup).unwrap(), vec![Utf8PathBuf::from("a.txt")]);
    }

    #[test]
    fn list_concatenates_without_dedup() {
        let lookup = FakeLookup {
            build_dir: Utf8PathBuf::from("build"),
            outputs: HashMap::new(),
        };
        let input = Input::List(vec![
            Input::FileRef(Utf8PathBuf::from("a.txt")),
            Input::FileRef(Utf8PathBuf::from("a.txt")),
        ]);
        assert_eq!(input.resolve(&lookup).unwrap().len(), 2);
    }

    #[test]
    fn node_ref_errors_when_producer_has_not_run() {
        let lookup = FakeLookup {
            build_dir: Utf8PathBuf::from("build"),
            outputs: HashMap::new(),
        };
        let input = Input::NodeRef {
            producer: "U".to_string(),
            output: "out".to_string(),
            glob: None,
        };
        assert!(input.resolve(&lookup).is_err());
    }

    #[test]
    fn node_ref_without_filter_returns_full_output() {
        let mut outputs = HashMap::new();
        outputs.insert(
            ("U".to_string(), "out".to_string()),
            vec![Utf8PathBuf::from("build/U/a.txt")],
        );
        let lookup = FakeLookup {
            build_dir: Utf8PathBuf::from("build"),
            outputs,
        };
        let input = Input::NodeRef {
            producer: "U".to_string(),
            output: "out".to_string(),
            glob: None,
        };
        assert_eq!(
            input.resolve(&lookup).unwrap(),
            vec![Utf8PathBuf::from("build/U/a.txt")]
        );
    }
}

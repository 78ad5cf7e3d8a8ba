//! Destination-path shaping for node outputs.
//!
//! `OutputConfig` is deliberately excluded from a node's content
//! signature (see [`crate::config::content_signature`]): moving where
//! output goes should never, by itself, invalidate a cache entry.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;

use crate::config::HookRegistry;

/// Destination-shaping options for a node's output, applied in the order
/// documented on each field.
#[derive(Clone, Debug, Default)]
pub struct OutputConfig {
    /// Base directory override; default is `<buildDir>/<nodeName>`.
    pub output_dir: Option<Utf8PathBuf>,
    /// Use only the file's basename, discarding subdirectories.
    pub flatten_to_basename: bool,
    /// If the cleaned input path begins with this prefix (path-segment-wise),
    /// remove it.
    pub strip_path_prefix: Option<Utf8PathBuf>,
    /// A hook identifier transforming the cleaned input path into a new
    /// relative path.
    pub path_mapping: Option<String>,
    /// Override the final filename outright. `Literal` wins over
    /// `extension`/`filename_suffix`.
    pub output_filename: Option<OutputFilename>,
    /// Replace the final extension.
    pub extension: Option<String>,
    /// Insert a suffix before the extension.
    pub filename_suffix: Option<String>,
}

/// A fixed filename, or a hook identifier computing one from the input
/// path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputFilename {
    Literal(String),
    Hook(String),
}

impl OutputConfig {
    /// Compute the output path for `item`, given the node's default base
    /// directory (`<buildDir>/<nodeName>`) and the "cleaned" input path
    /// (already stripped of its build-dir node segment, or made relative
    /// to the working directory).
    pub fn shape(
        &self,
        default_base_dir: &Utf8Path,
        cleaned_input: &Utf8Path,
        hooks: &HookRegistry,
    ) -> Result<Utf8PathBuf> {
        let base_dir = self.output_dir.as_deref().unwrap_or(default_base_dir);

        let structural = self.apply_structural(cleaned_input);
        let shaped = self.apply_filename(&structural, hooks)?;

        Ok(base_dir.join(shaped))
    }

    /// Structural manipulations are mutually exclusive; the first matching
    /// one (in this order) wins, else the cleaned path is preserved whole.
    fn apply_structural(&self, cleaned_input: &Utf8Path) -> Utf8PathBuf {
        if self.flatten_to_basename {
            return cleaned_input
                .file_name()
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| cleaned_input.to_path_buf());
        }
        if let Some(prefix) = &self.strip_path_prefix
            && let Ok(stripped) = cleaned_input.strip_prefix(prefix)
        {
            return stripped.to_path_buf();
        }
        if self.path_mapping.is_some() {
            // Filename-transform application happens in `apply_filename`;
            // `path_mapping` replaces the whole relative path, which we
            // represent by deferring to the hook there with the full
            // cleaned path as input.
            return cleaned_input.to_path_buf();
        }
        cleaned_input.to_path_buf()
    }

    /// Filename transforms are mutually exclusive; `output_filename` wins
    /// over `extension`/`filename_suffix`. `path_mapping`, if set, is
    /// applied first since it replaces the whole relative path.
    fn apply_filename(&self, structural: &Utf8Path, hooks: &HookRegistry) -> Result<Utf8PathBuf> {
        let mapped = match &self.path_mapping {
            Some(hook_id) => hooks.resolve(hook_id, structural)?,
            None => structural.to_path_buf(),
        };

        if let Some(output_filename) = &self.output_filename {
            let name = match output_filename {
                OutputFilename::Literal(name) => name.clone(),
                OutputFilename::Hook(hook_id) => hooks
                    .resolve(hook_id, structural)?
                    .file_name()
                    .unwrap_or("output")
                    .to_string(),
            };
            return Ok(mapped.with_file_name(name));
        }

        let mut result = mapped;
        if let Some(ext) = &self.extension {
            result = result.with_extension(ext);
        }
        if let Some(suffix) = &self.filename_suffix {
            let stem = result.file_stem().unwrap_or("output").to_string();
            let ext = result.extension().map(str::to_string);
            let new_name = match ext {
                Some(ext) => format!("{stem}{suffix}.{ext}"),
                None => format!("{stem}{suffix}"),
            };
            result = result.with_file_name(new_name);
        }
        Ok(result)
    }
}

/// Shape `item`'s output path the same way a node's default base directory
/// would, given only the pieces a standalone [`crate::worker_pool::Workload`]
/// has on hand (it has no [`crate::context::Context`] of its own). Used by
/// the reference node workloads so their miss-path output location always
/// agrees with [`OutputConfig::shape`]'s hit-path recalculation.
pub fn default_output_path(
    output_config: &OutputConfig,
    node_name: &str,
    build_dir: &Utf8Path,
    cwd: &Utf8Path,
    hooks: &HookRegistry,
    item: &Utf8Path,
) -> Result<Utf8PathBuf> {
    let base_dir = output_config
        .output_dir
        .clone()
        .unwrap_or_else(|| build_dir.join(node_name));
    let cleaned = clean_input_path(item, build_dir, cwd);
    output_config.shape(&base_dir, &cleaned, hooks)
}

/// "Cleaned input path": strip `buildDir/<someNode>/` if `input` lies
/// inside the pipeline's build directory; otherwise make it relative to
/// the process working directory.
pub fn clean_input_path(input: &Utf8Path, build_dir: &Utf8Path, cwd: &Utf8Path) -> Utf8PathBuf {
    if let Ok(under_build) = input.strip_prefix(build_dir) {
        let mut components = under_build.components();
        components.next(); // drop the node-name segment
        return components.as_path().to_path_buf();
    }
    match input.strip_prefix(cwd) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => input.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preserves_cleaned_path_under_default_base() {
        let config = OutputConfig::default();
        let hooks = HookRegistry::new();
        let shaped = config
            .shape(
                Utf8Path::new("build/U"),
                Utf8Path::new("sub/a.txt"),
                &hooks,
            )
            .unwrap();
        assert_eq!(shaped, Utf8PathBuf::from("build/U/sub/a.txt"));
    }

    #[test]
    fn flatten_to_basename_discards_subdirectories() {
        let config = OutputConfig {
            flatten_to_basename: true,
            ..Default::default()
        };
        let hooks = HookRegistry::new();
        let shaped = config
            .shape(Utf8Path::new("build/U"), Utf8Path::new("sub/a.txt"), &hooks)
            .unwrap();
        assert_eq!(shaped, Utf8PathBuf::from("build/U/a.txt"));
    }

    #[test]
    fn strip_path_prefix_removes_matching_prefix() {
        let config = OutputConfig {
            strip_path_prefix: Some(Utf8PathBuf::from("sub")),
            ..Default::default()
        };
        let hooks = HookRegistry::new();
        let shaped = config
            .shape(Utf8Path::new("build/U"), Utf8Path::new("sub/a.txt"), &hooks)
            .unwrap();
        assert_eq!(shaped, Utf8PathBuf::from("build/U/a.txt"));
    }

    #[test]
    fn output_filename_wins_over_extension() {
        let config = OutputConfig {
            output_filename: Some(OutputFilename::Literal("fixed.out".to_string())),
            extension: Some("ignored".to_string()),
            ..Default::default()
        };
        let hooks = HookRegistry::new();
        let shaped = config
            .shape(Utf8Path::new("build/U"), Utf8Path::new("a.txt"), &hooks)
            .unwrap();
        assert_eq!(shaped, Utf8PathBuf::from("build/U/fixed.out"));
    }

    #[test]
    fn extension_and_suffix_compose() {
        let config = OutputConfig {
            extension: Some("html".to_string()),
            filename_suffix: Some(".min".to_string()),
            ..Default::default()
        };
        let hooks = HookRegistry::new();
        let shaped = config
            .shape(Utf8Path::new("build/U"), Utf8Path::new("a.txt"), &hooks)
            .unwrap();
        assert_eq!(shaped, Utf8PathBuf::from("build/U/a.min.html"));
    }

    #[test]
    fn clean_input_path_strips_build_node_segment() {
        let cleaned = clean_input_path(
            Utf8Path::new("build/U/sub/a.txt"),
            Utf8Path::new("build"),
            Utf8Path::new("/cwd"),
        );
        assert_eq!(cleaned, Utf8PathBuf::from("sub/a.txt"));
    }

    #[test]
    fn clean_input_path_falls_back_to_cwd_relative() {
        let cleaned = clean_input_path(
            Utf8Path::new("/cwd/sub/a.txt"),
            Utf8Path::new("build"),
            Utf8Path::new("/cwd"),
        );
        assert_eq!(cleaned, Utf8PathBuf::from("sub/a.txt"));
    }
}

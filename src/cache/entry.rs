//! The on-disk shape of a single cache entry.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// A fingerprint of one upstream producer's emitted outputs, recorded at
/// the time this entry was built, so validation can detect "upstream
/// changed" without re-hashing every file the upstream node touched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSignature {
    /// Fingerprint of the producer's current output paths, see
    /// [`super::store::FsCacheStore::compute_output_signature`].
    pub signature: String,
    /// Which of the producer's named outputs this fingerprint covers.
    pub output_key: String,
    /// The glob filter (if any) applied when resolving the reference.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub glob: Option<String>,
}

/// A persisted cache entry: everything needed to decide, on a later run,
/// whether a node's previous output for one cache key is still valid, and
/// to locate/relocate that output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The input files this entry represents.
    pub item_files: Vec<Utf8PathBuf>,
    /// Content hash per input file, as of when this entry was built.
    pub input_hashes: BTreeMap<Utf8PathBuf, ContentHash>,
    /// Last-modified timestamp (ms since epoch) per input file.
    pub input_timestamps: BTreeMap<Utf8PathBuf, i64>,
    /// Output name to the ordered list of paths produced under that name.
    pub outputs_by_key: BTreeMap<String, Vec<Utf8PathBuf>>,
    /// The base directory outputs were written under when this entry was
    /// built. Every path in `outputs_by_key` lies under this directory.
    pub output_base_dir: Utf8PathBuf,
    /// Paths referenced from config (file refs + resolved upstream-reference
    /// file paths), with their hashes at build time.
    pub config_deps: BTreeMap<Utf8PathBuf, ContentHash>,
    /// Paths discovered at runtime (e.g. transitive imports), with their
    /// hashes at build time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub discovered_deps: BTreeMap<Utf8PathBuf, ContentHash>,
    /// Per-upstream-node fingerprint, keyed by producer name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upstream_signatures: BTreeMap<String, UpstreamSignature>,
    /// The cache key this entry was stored under.
    pub cache_key: String,
    /// When this entry was written, in milliseconds since the Unix epoch.
    pub created_at_millis: i64,
}

impl CacheEntry {
    /// True if every path in `outputs_by_key` lies under `output_base_dir`
    /// (no `..` escape). Checked both when writing and before rebasing a
    /// cache hit onto a new base.
    pub fn outputs_are_contained(&self) -> bool {
        self.outputs_by_key
            .values()
            .flatten()
            .all(|path| path.strip_prefix(&self.output_base_dir).is_ok())
    }
}

/// Sanitize a string for use as a filesystem path segment: replace path
/// separators and control characters, keeping the result stable and
/// collision-resistant enough for cache directory/file names.
pub fn sanitize_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CacheEntry {
        CacheEntry {
            item_files: vec![Utf8PathBuf::from("a.txt")],
            input_hashes: BTreeMap::from([(Utf8PathBuf::from("a.txt"), ContentHash::of(b"hi"))]),
            input_timestamps: BTreeMap::from([(Utf8PathBuf::from("a.txt"), 1_700_000_000_000)]),
            outputs_by_key: BTreeMap::from([(
                "out".to_string(),
                vec![Utf8PathBuf::from("build/node/a.txt")],
            )]),
            output_base_dir: Utf8PathBuf::from("build/node"),
            config_deps: BTreeMap::new(),
            discovered_deps: BTreeMap::new(),
            upstream_signatures: BTreeMap::new(),
            cache_key: "a.txt".to_string(),
            created_at_millis: 1_700_000_000_000,
        }
    }

    #[test]
    fn serialize_then_deserialize_is_identity() {
        let entry = sample_entry();
        let json = serde_json::to_string(&entry).unwrap();
        let round_tripped: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, round_tripped);
    }

    #[test]
    fn outputs_are_contained_detects_escape() {
        let mut entry = sample_entry();
        assert!(entry.outputs_are_contained());
        entry
            .outputs_by_key
            .get_mut("out")
            .unwrap()
            .push(Utf8PathBuf::from("somewhere/else.txt"));
        assert!(!entry.outputs_are_contained());
    }

    #[test]
    fn sanitize_segment_strips_separators() {
        assert_eq!(sanitize_segment("a/b\\c"), "a_b_c");
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn cache_entry_round_trips_through_json(
                file_name in "[a-z]{1,8}\\.txt",
                cache_key in "[a-z0-9/_-]{1,16}",
                created_at_millis in 0i64..4_102_444_800_000,
                hash_seed in proptest::collection::vec(any::<u8>(), 1..32),
            ) {
                let item = Utf8PathBuf::from(file_name);
                let hash = ContentHash::of(&hash_seed);
                let entry = CacheEntry {
                    item_files: vec![item.clone()],
                    input_hashes: BTreeMap::from([(item.clone(), hash)]),
                    input_timestamps: BTreeMap::from([(item.clone(), created_at_millis)]),
                    outputs_by_key: BTreeMap::from([(
                        "out".to_string(),
                        vec![Utf8PathBuf::from("build/node").join(&item)],
                    )]),
                    output_base_dir: Utf8PathBuf::from("build/node"),
                    config_deps: BTreeMap::new(),
                    discovered_deps: BTreeMap::new(),
                    upstream_signatures: BTreeMap::new(),
                    cache_key,
                    created_at_millis,
                };
                let json = serde_json::to_string(&entry).unwrap();
                let round_tripped: CacheEntry = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(entry, round_tripped);
            }
        }
    }
}

//! The shared envelope wrapping any node's per-item work with
//! content-signature computation, cache lookup, output-path
//! recalculation, parallel work dispatch, and cache storage.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::Context as _, eyre::bail};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::{
    cache::{CacheEntry, UpstreamSignature, UpstreamSignatureLookup},
    config::{ConfigValue, content_signature},
    context::Context,
    output_shaping::{OutputConfig, clean_input_path},
    worker_pool::Job,
};

/// One item's result: the item path and the outputs produced or reused
/// for it, in the order the envelope recalculated them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemResult {
    pub item: Utf8PathBuf,
    pub outputs: Vec<(String, Utf8PathBuf)>,
}

/// Everything [`run_items`] needs to process one node's items.
pub struct RunItemsRequest<'a> {
    /// The node implementation's stable type tag (content-signature prefix).
    pub node_type_tag: &'a str,
    /// This node instance's name (used for the default output base dir).
    pub node_name: &'a str,
    pub config: &'a ConfigValue,
    pub output_config: &'a OutputConfig,
    /// The workload tag dispatched to the worker pool for cache misses.
    pub workload_tag: &'a str,
    /// The output name this node's items are shaped under deterministically
    /// (see [`OutputConfig::shape`]). Any other output name found in a
    /// cached entry is treated as a secondary, structure-only output and
    /// is instead rebased from the cached path.
    pub primary_output_key: &'a str,
    pub items: Vec<Utf8PathBuf>,
}

/// Derive a cache key from an item: the item's path relative to the
/// pipeline's build directory (or cwd), which is deterministic and
/// filesystem-safe once sanitized by the cache store.
fn default_cache_key(ctx: &Context, item: &Utf8Path) -> String {
    ctx.strip_build_prefix(item).to_string()
}

/// Wrap a node's per-item work with caching. See module docs.
#[instrument(skip(ctx, request), fields(node = request.node_name))]
pub async fn run_items(ctx: &Context, request: RunItemsRequest<'_>) -> Result<Vec<ItemResult>> {
    let signature = content_signature(request.node_type_tag, request.config);

    let mut config_dep_paths = Vec::new();
    request.config.walk_file_refs(&mut |p| config_dep_paths.push(p.to_path_buf()));

    let mut upstream_signatures = BTreeMap::new();
    request.config.walk_node_refs(&mut |producer, output, glob| {
        if let Ok(current) = ctx.current_signature(producer, output, glob) {
            upstream_signatures.insert(
                producer.to_string(),
                UpstreamSignature {
                    signature: current,
                    output_key: output.to_string(),
                    glob: glob.map(str::to_string),
                },
            );
        }
    });

    let default_base_dir = ctx.build_dir().join(request.node_name);
    let base_dir = request
        .output_config
        .output_dir
        .clone()
        .unwrap_or(default_base_dir);

    let mut slots: Vec<Option<ItemResult>> = vec![None; request.items.len()];
    let mut misses = Vec::new();

    for (index, item) in request.items.iter().enumerate() {
        let cache_key = default_cache_key(ctx, item);
        let Some(entry) = ctx
            .cache()
            .get(&signature, &cache_key)
            .await
            .context("read cache entry")?
        else {
            misses.push(index);
            continue;
        };

        let primary = match recalculate_primary_output(ctx, &request, &entry, item, &base_dir) {
            Ok(primary) => primary,
            Err(err) => {
                warn!(%item, %err, "cache entry primary output path could not be recalculated, treating as miss");
                misses.push(index);
                continue;
            }
        };
        let secondary = rebase_secondary_outputs(&request, &entry, &base_dir)
            .context("rebase cached secondary outputs")?;
        let mut rebased = Vec::with_capacity(secondary.len() + 1);
        rebased.extend(primary);
        rebased.extend(secondary);

        if !ctx.cache().validate(&entry, ctx).await.context("validate cache entry")? {
            misses.push(index);
            continue;
        }

        for (_, expected, cached) in &rebased {
            if expected != cached {
                ctx.cache().copy_to(cached, expected).await.context("reuse cached output")?;
            }
        }

        debug!(%item, cache_key, "cache hit");
        slots[index] = Some(ItemResult {
            item: item.clone(),
            outputs: rebased.into_iter().map(|(name, expected, _)| (name, expected)).collect(),
        });
    }

    if !misses.is_empty() {
        debug!(count = misses.len(), "dispatching cache misses to worker pool");
        let jobs = misses.iter().map(|&index| {
            let item = request.items[index].clone();
            let job = Job {
                workload_tag: request.workload_tag.to_string(),
                item: item.clone(),
            };
            async move { (index, item, ctx.worker_pool().execute(job).await) }
        });
        let outcomes = join_all(jobs).await;

        let mut writes = Vec::new();
        for (index, item, outcome) in outcomes {
            let outcome = outcome.with_context(|| format!("run workload for {item}"))?;
            let cache_key = default_cache_key(ctx, &item);

            let mut outputs_by_key: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
            for (name, path) in &outcome.outputs {
                outputs_by_key.entry(name.clone()).or_default().push(path.clone());
            }

            let entry = ctx
                .cache()
                .build(
                    &[item.clone()],
                    outputs_by_key,
                    base_dir.clone(),
                    cache_key.clone(),
                    &outcome.discovered_deps,
                    &config_dep_paths,
                    upstream_signatures.clone(),
                )
                .await
                .context("build cache entry")?;

            slots[index] = Some(ItemResult {
                item,
                outputs: outcome.outputs,
            });
            writes.push((signature.clone(), cache_key, entry));
        }

        let write_futures = writes
            .iter()
            .map(|(sig, key, entry)| ctx.cache().put(sig, key, entry));
        for result in join_all(write_futures).await {
            result.context("write cache entry")?;
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.ok_or_else(|| color_eyre::eyre::eyre!("item {index} has no result; this is a bug")))
        .collect()
}

/// Recompute the primary output's path for `item` under the *current*
/// `base_dir`, paired with the path the entry actually recorded for it (so
/// the caller can diff and copy). `Ok(None)` means the entry recorded no
/// primary output at all, which the caller leaves out of the rebased set
/// rather than treating as a miss. A hook failure while reshaping the path
/// is item-specific and indistinguishable from any other reason this item
/// might need recomputing, so it's surfaced as an `Err` for the caller to
/// demote to an ordinary miss.
fn recalculate_primary_output(
    ctx: &Context,
    request: &RunItemsRequest<'_>,
    entry: &CacheEntry,
    item: &Utf8Path,
    base_dir: &Utf8Path,
) -> Result<Option<(String, Utf8PathBuf, Utf8PathBuf)>> {
    let Some(cached_paths) = entry.outputs_by_key.get(request.primary_output_key) else {
        return Ok(None);
    };
    let Some(cached_path) = cached_paths.first() else {
        return Ok(None);
    };
    let cleaned = ctx.strip_build_prefix(item);
    let expected = request.output_config.shape(base_dir, &cleaned, ctx.hooks())?;
    Ok(Some((request.primary_output_key.to_string(), expected, cached_path.clone())))
}

/// Replay every non-primary cached output's position relative to the
/// entry's recorded base onto the *current* `base_dir`. A cached path that
/// doesn't sit under its own recorded base, or whose rebased form would
/// require a `..` segment, means the entry's own invariant — every output
/// lives under `output_base_dir` — has been violated. That's a filesystem
/// escape, not an ordinary miss, so it's never caught and demoted; it
/// propagates out of `run_items` and aborts the node.
fn rebase_secondary_outputs(
    request: &RunItemsRequest<'_>,
    entry: &CacheEntry,
    base_dir: &Utf8Path,
) -> Result<Vec<(String, Utf8PathBuf, Utf8PathBuf)>> {
    let mut outputs = Vec::new();
    for (name, cached_paths) in &entry.outputs_by_key {
        if name == request.primary_output_key {
            continue;
        }
        for cached_path in cached_paths {
            let relative = cached_path
                .strip_prefix(&entry.output_base_dir)
                .map_err(|_| color_eyre::eyre::eyre!("{cached_path} is not under recorded base {}", entry.output_base_dir))?;
            if relative.components().any(|c| c.as_str() == "..") {
                bail!("rebasing {cached_path} onto {base_dir} would escape its base directory");
            }
            outputs.push((name.clone(), base_dir.join(relative), cached_path.clone()));
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_key_uses_build_relative_path() {
        // Exercised end-to-end in `tests/it/runtime.rs`; this is a smoke
        // test for the path-cleaning helper runtime relies on.
        let cleaned = clean_input_path(
            Utf8Path::new("build/U/a.txt"),
            Utf8Path::new("build"),
            Utf8Path::new("/cwd"),
        );
        assert_eq!(cleaned, Utf8PathBuf::from("a.txt"));
    }
}

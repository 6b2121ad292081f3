//! Funnel learning.
//!
//! Recent sessions' screen paths are folded into a prefix trie. The most common first
//! screens become entry screens, and a greedy walk down the heaviest branches gives the
//! dominant path. Both are advisory: they inform promotion rules but never reject data.

use crate::config::FunnelConfig;
use crate::errors::PromotionError;
use crate::metrics_defs::{
    FUNNEL_PROFILE_CACHE_HIT, FUNNEL_PROFILE_CACHE_MISS, FUNNEL_PROFILE_SAMPLE_SIZE,
};
use crate::store::{SessionStore, bounded_query};
use crate::types::FunnelProfile;
use indexmap::IndexMap;
use moka::sync::Cache;
use shared::{counter, histogram};
use std::sync::Arc;

/// Collapses adjacent repeats and truncates to `max_len` screens.
pub fn normalize_path(screens: &[String], max_len: usize) -> Vec<String> {
    let mut path: Vec<String> = Vec::with_capacity(screens.len().min(max_len));
    for screen in screens {
        if path.len() == max_len {
            break;
        }
        if path.last() != Some(screen) {
            path.push(screen.clone());
        }
    }
    path
}

#[derive(Debug, Default)]
struct TrieNode {
    count: u64,
    // Insertion order breaks ties between equally common children.
    children: IndexMap<String, TrieNode>,
}

impl TrieNode {
    fn heaviest_child(&self) -> Option<(&String, &TrieNode)> {
        let mut best: Option<(&String, &TrieNode)> = None;
        for (screen, child) in &self.children {
            if best.is_none_or(|(_, b)| child.count > b.count) {
                best = Some((screen, child));
            }
        }
        best
    }
}

/// Counts how many paths pass through each screen at each depth.
#[derive(Debug, Default)]
pub struct ScreenTrie {
    root: TrieNode,
}

impl ScreenTrie {
    pub fn build<P: AsRef<[String]>>(paths: &[P]) -> Self {
        let mut trie = ScreenTrie::default();
        for path in paths {
            trie.insert(path.as_ref());
        }
        trie
    }

    pub fn insert(&mut self, path: &[String]) {
        self.root.count += 1;
        let mut node = &mut self.root;
        for screen in path {
            node = node.children.entry(screen.clone()).or_default();
            node.count += 1;
        }
    }

    pub fn sample_size(&self) -> u64 {
        self.root.count
    }

    /// How many paths start at each screen, in first-seen order.
    pub fn first_screen_counts(&self) -> IndexMap<String, u64> {
        self.root
            .children
            .iter()
            .map(|(screen, node)| (screen.clone(), node.count))
            .collect()
    }

    /// Greedy walk along the heaviest children. The first step is always taken; after
    /// that the walk stops at `max_depth`, at a leaf, or when the next child keeps less
    /// than `drop_off_ratio` of the current node's paths. Returns the path and the count of
    /// its terminal node.
    pub fn dominant_path(&self, max_depth: usize, drop_off_ratio: f64) -> (Vec<String>, u64) {
        let mut path = Vec::new();
        let mut node = &self.root;

        while path.len() < max_depth {
            let Some((screen, child)) = node.heaviest_child() else {
                break;
            };
            if !path.is_empty() && (child.count as f64) < node.count as f64 * drop_off_ratio {
                break;
            }
            path.push(screen.clone());
            node = child;
        }

        let terminal = if path.is_empty() { 0 } else { node.count };
        (path, terminal)
    }
}

/// Builds a profile from raw screen paths, or `None` when too few qualify.
pub fn build_profile(raw_paths: &[Vec<String>], config: &FunnelConfig) -> Option<FunnelProfile> {
    let paths: Vec<Vec<String>> = raw_paths
        .iter()
        .map(|p| normalize_path(p, config.max_path_len))
        .filter(|p| p.len() >= config.min_path_len)
        .collect();

    histogram!(FUNNEL_PROFILE_SAMPLE_SIZE).record(paths.len() as f64);
    if paths.is_empty() || paths.len() < config.min_sample_size {
        return None;
    }

    let trie = ScreenTrie::build(&paths);
    let sample_size = trie.sample_size();
    let total = sample_size as f64;

    let mut candidates: Vec<(String, u64)> = trie.first_screen_counts().into_iter().collect();
    // Stable sort keeps first-seen order among equal counts.
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    let fallback = candidates.first().cloned();

    let mut entries: Vec<(String, u64)> = candidates
        .into_iter()
        .filter(|(_, count)| {
            *count >= config.min_entry_count && *count as f64 / total >= config.min_entry_share
        })
        .take(config.max_entry_screens)
        .collect();
    if entries.is_empty() {
        entries.extend(fallback);
    }

    let entry_total: u64 = entries.iter().map(|(_, count)| count).sum();
    let (dominant_path, terminal) = trie.dominant_path(config.max_depth, config.drop_off_ratio);

    Some(FunnelProfile {
        entry_screens: entries.iter().map(|(screen, _)| screen.clone()).collect(),
        entry_screen_counts: entries.into_iter().collect(),
        entry_confidence: entry_total as f64 / total,
        dominant_path,
        path_confidence: terminal as f64 / total,
        sample_size: sample_size as usize,
    })
}

/// Cached per-project funnel profiles.
pub struct FunnelLearner {
    store: Arc<dyn SessionStore>,
    // `None` is cached too, so thin projects are not resampled on every call.
    cache: Cache<String, Option<FunnelProfile>>,
    config: FunnelConfig,
}

impl FunnelLearner {
    pub fn new(store: Arc<dyn SessionStore>, config: FunnelConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl())
            .build();
        FunnelLearner {
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &FunnelConfig {
        &self.config
    }

    pub async fn get_profile(&self, project_id: &str) -> Result<Option<FunnelProfile>, PromotionError> {
        if let Some(profile) = self.cache.get(project_id) {
            counter!(FUNNEL_PROFILE_CACHE_HIT).increment(1);
            return Ok(profile);
        }
        counter!(FUNNEL_PROFILE_CACHE_MISS).increment(1);

        let profile = self.compute_profile(project_id).await?;
        self.cache.insert(project_id.to_string(), profile.clone());
        Ok(profile)
    }

    /// Samples and builds a profile, bypassing the cache.
    pub async fn compute_profile(
        &self,
        project_id: &str,
    ) -> Result<Option<FunnelProfile>, PromotionError> {
        let paths = bounded_query(
            self.config.query_timeout(),
            self.store.recent_screen_paths(
                project_id,
                self.config.min_session_duration_secs,
                self.config.min_path_len,
                self.config.sample_limit,
            ),
        )
        .await?;

        let profile = build_profile(&paths, &self.config);
        tracing::debug!(
            project_id,
            sampled = paths.len(),
            found = profile.is_some(),
            "built funnel profile"
        );
        Ok(profile)
    }

    pub fn invalidate(&self, project_id: &str) {
        self.cache.invalidate(project_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

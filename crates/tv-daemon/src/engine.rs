//! The channel engine: scans the configured directories, merges per-filename
//! overrides, orders the result according to the channel mode, and publishes
//! the table atomically.
//!
//! The published [`ChannelTable`] is immutable; a rebuild swaps in a fresh
//! `Arc` under a short write lock, so readers always see either the previous
//! complete table or the new one.  Rebuild requests collapse: however many
//! arrive while one is pending or running, at most one further rebuild runs.

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tv_proto::config::{normalize_filename, ChannelMode, ConfigSnapshot, SubtitleSpec};
use tv_proto::protocol::{Broadcast, VideoInfo};
use walkdir::WalkDir;

/// Seed for the deterministic shuffle modes.  Candidates are path-sorted
/// before shuffling, so the resulting permutation depends only on the input
/// set and survives rebuilds and restarts.
const DETERMINISTIC_SEED: u64 = 0x1a2b_3c4d;

/// One channel entry.  Immutable once published; rebuilds replace the whole
/// table rather than mutating entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Video {
    pub path: PathBuf,
    pub name: String,
    pub rating: Option<String>,
    pub subtitles: SubtitleSpec,
    /// 0-based channel index, contiguous within the published table.
    pub channel: usize,
    /// Whether a `[[video]]` override declared this file.
    pub from_config: bool,
}

impl Video {
    /// Subscriber-facing shape; channel numbers are 1-based for display.
    pub fn info(&self) -> VideoInfo {
        VideoInfo {
            path: self.path.clone(),
            channel: self.channel + 1,
            name: self.name.clone(),
            rating: self.rating.clone(),
        }
    }

    /// Display name derived from the filename stem: separators become
    /// spaces, words are title-cased.
    fn automatic_name(path: &Path) -> String {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        stem.replace(['-', '_'], " ")
            .split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// An ordered video list plus a reverse path index.  Indices are always a
/// contiguous `0..len` permutation matching list order.
#[derive(Debug, Default)]
pub struct ChannelTable {
    videos: Vec<Arc<Video>>,
    by_path: HashMap<PathBuf, usize>,
}

impl ChannelTable {
    fn new(videos: Vec<Arc<Video>>) -> Self {
        let by_path = videos
            .iter()
            .map(|v| (v.path.clone(), v.channel))
            .collect();
        Self { videos, by_path }
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    pub fn videos(&self) -> &[Arc<Video>] {
        &self.videos
    }

    pub fn get(&self, channel: usize) -> Option<&Arc<Video>> {
        self.videos.get(channel)
    }

    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    pub fn infos(&self) -> Vec<VideoInfo> {
        self.videos.iter().map(|v| v.info()).collect()
    }
}

/// A discovered file after the override merge, before ordering.  `declared`
/// is the `[[video]]` declaration index, used by the config-first modes.
struct Candidate {
    video: Video,
    declared: Option<usize>,
}

pub struct ChannelEngine {
    config: Arc<ConfigSnapshot>,
    table: RwLock<Arc<ChannelTable>>,
    bad_videos: Mutex<HashSet<PathBuf>>,
    rebuild_requested: Notify,
    has_videos_tx: watch::Sender<bool>,
    broadcast_tx: broadcast::Sender<Broadcast>,
}

impl ChannelEngine {
    pub fn new(
        config: Arc<ConfigSnapshot>,
        broadcast_tx: broadcast::Sender<Broadcast>,
    ) -> anyhow::Result<Arc<Self>> {
        let any_root = config
            .search_dirs
            .iter()
            .any(|d| !d.ignore && d.path.is_dir());
        if !any_root {
            anyhow::bail!(
                "no valid search directories: none of the configured 'search-dirs' paths exist"
            );
        }
        let (has_videos_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            table: RwLock::new(Arc::new(ChannelTable::default())),
            bad_videos: Mutex::new(HashSet::new()),
            rebuild_requested: Notify::new(),
            has_videos_tx,
            broadcast_tx,
        }))
    }

    /// Snapshot of the current published table.
    pub fn table(&self) -> Arc<ChannelTable> {
        self.table.read().clone()
    }

    /// Condition that is true while the published table is non-empty.
    pub fn subscribe_has_videos(&self) -> watch::Receiver<bool> {
        self.has_videos_tx.subscribe()
    }

    /// Ask the rebuild loop to run.  Requests collapse while one is pending.
    pub fn request_rebuild(&self) {
        self.rebuild_requested.notify_one();
    }

    /// Quarantine a video after a playback failure and schedule a rebuild.
    /// The quarantine only clears on process restart.
    pub fn mark_bad_video(&self, path: &Path) {
        if self.bad_videos.lock().insert(path.to_path_buf()) {
            warn!(path = ?path, "quarantining video after playback failure");
        }
        self.request_rebuild();
    }

    pub fn is_quarantined(&self, path: &Path) -> bool {
        self.bad_videos.lock().contains(path)
    }

    /// Re-scan, recompute, and atomically publish the channel table.
    /// Per-entry problems are logged and skipped; this never fails.
    pub fn rebuild(&self) {
        let discovered = self.discover();
        let merged = self.merge(discovered);
        let ordered = self.order(merged);

        let videos: Vec<Arc<Video>> = ordered
            .into_iter()
            .enumerate()
            .map(|(channel, mut video)| {
                video.channel = channel;
                Arc::new(video)
            })
            .collect();
        let table = Arc::new(ChannelTable::new(videos));

        info!(channels = table.len(), "published channel table");
        *self.table.write() = table.clone();
        self.has_videos_tx.send_replace(!table.is_empty());
        let _ = self.broadcast_tx.send(Broadcast::Videos(table.infos()));
    }

    /// Uniformly random viewable video, or `None` if nothing qualifies.
    pub fn get_random_video(&self, rating_filter: Option<&str>) -> Option<Arc<Video>> {
        let table = self.table();
        let viewable: Vec<&Arc<Video>> = table
            .videos()
            .iter()
            .filter(|v| {
                self.config
                    .ratings
                    .viewable(v.rating.as_deref(), rating_filter)
            })
            .collect();
        viewable
            .choose(&mut rand::thread_rng())
            .map(|&v| Arc::clone(v))
    }

    /// Next/previous viewable video in channel order, wrapping and skipping
    /// non-viewable entries.  Gives up after one full wrap.
    pub fn get_video_for_channel_change(
        &self,
        current: Option<&Path>,
        rating_filter: Option<&str>,
        direction: i64,
    ) -> Option<Arc<Video>> {
        let table = self.table();
        let len = table.len();
        if len == 0 {
            return None;
        }
        let start = current.and_then(|p| table.index_of(p)).unwrap_or(0);
        for step in 1..=len {
            let idx = (start as i64 + direction * step as i64).rem_euclid(len as i64) as usize;
            let video = table.get(idx)?;
            if self
                .config
                .ratings
                .viewable(video.rating.as_deref(), rating_filter)
            {
                return Some(Arc::clone(video));
            }
        }
        None
    }

    /// Blocks on rebuild requests and runs each rebuild off the async
    /// executor.  Runs forever under the supervisor; exits cleanly on
    /// shutdown.
    pub async fn run_rebuild_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.rebuild_requested.notified() => {}
            }
            let engine = Arc::clone(&self);
            tokio::task::spawn_blocking(move || engine.rebuild()).await?;
        }
    }

    // ── rebuild stages ────────────────────────────────────────────────────

    fn discover(&self) -> Vec<PathBuf> {
        let include: Vec<_> = self
            .config
            .search_dirs
            .iter()
            .filter(|d| !d.ignore)
            .filter(|d| {
                if d.path.is_dir() {
                    true
                } else {
                    debug!(path = ?d.path, "search dir missing, skipping");
                    false
                }
            })
            .collect();
        let include_roots: Vec<PathBuf> = include.iter().map(|d| d.path.clone()).collect();
        let ignore_roots: Vec<PathBuf> = self
            .config
            .search_dirs
            .iter()
            .filter(|d| d.ignore)
            .map(|d| d.path.clone())
            .collect();

        let mut found = Vec::new();
        for dir in include {
            let mut walker = WalkDir::new(&dir.path).follow_links(false);
            if !dir.recurse {
                walker = walker.max_depth(1);
            }
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!(error = %e, "unreadable entry during scan");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.into_path();
                if !self.config.is_valid_extension(&path) {
                    continue;
                }
                if excluded_by_nearest_root(&path, &include_roots, &ignore_roots) {
                    debug!(path = ?path, "excluded by ignore root");
                    continue;
                }
                found.push(path);
            }
        }
        found.sort();
        found.dedup();
        found
    }

    fn merge(&self, paths: Vec<PathBuf>) -> Vec<Candidate> {
        let bad = self.bad_videos.lock().clone();
        let ratings = &self.config.ratings;
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for path in paths {
            if bad.contains(&path) {
                debug!(path = ?path, "skipping quarantined video");
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !seen.insert(normalize_filename(filename)) {
                debug!(path = ?path, "duplicate filename, keeping the first");
                continue;
            }

            let entry = self.config.override_for(filename);
            if let Some((_, o)) = entry {
                if !o.enabled {
                    debug!(path = ?path, "disabled by [[video]] override");
                    continue;
                }
            }

            let name = entry
                .and_then(|(_, o)| o.name.clone())
                .unwrap_or_else(|| Video::automatic_name(&path));

            let rating = if ratings.is_enabled() {
                match entry.and_then(|(_, o)| o.rating.clone()) {
                    Some(r) if ratings.rank(&r).is_some() => Some(r),
                    Some(r) => {
                        warn!(path = ?path, rating = %r, "unknown rating, using default");
                        ratings.default_rating().map(str::to_string)
                    }
                    None => ratings.default_rating().map(str::to_string),
                }
            } else {
                None
            };

            let subtitles = entry
                .and_then(|(_, o)| o.subtitles.clone())
                .unwrap_or(if self.config.subtitles_default_on {
                    SubtitleSpec::On
                } else {
                    SubtitleSpec::Off
                });

            let declared = entry.map(|(n, _)| n);
            out.push(Candidate {
                video: Video {
                    path,
                    name,
                    rating,
                    subtitles,
                    channel: 0,
                    from_config: declared.is_some(),
                },
                declared,
            });
        }
        out
    }

    fn order(&self, candidates: Vec<Candidate>) -> Vec<Video> {
        let mode = self.config.channel_mode;
        if !mode.is_config_first() {
            let mut videos: Vec<Video> = candidates.into_iter().map(|c| c.video).collect();
            order_tail(&mut videos, mode);
            return videos;
        }

        let mut declared: Vec<Candidate> = Vec::new();
        let mut rest: Vec<Video> = Vec::new();
        for c in candidates {
            if c.declared.is_some() {
                declared.push(c);
            } else {
                rest.push(c.video);
            }
        }
        declared.sort_by_key(|c| c.declared);
        let mut videos: Vec<Video> = declared.into_iter().map(|c| c.video).collect();

        match mode {
            ChannelMode::ConfigOnly => {}
            ChannelMode::ConfigFirstRandom => {
                order_tail(&mut rest, ChannelMode::Random);
                videos.append(&mut rest);
            }
            ChannelMode::ConfigFirstRandomDeterministic => {
                order_tail(&mut rest, ChannelMode::RandomDeterministic);
                videos.append(&mut rest);
            }
            ChannelMode::ConfigFirstAlphabetical => {
                order_tail(&mut rest, ChannelMode::Alphabetical);
                videos.append(&mut rest);
            }
            _ => unreachable!("non-config-first mode handled above"),
        }
        videos
    }
}

fn order_tail(videos: &mut [Video], mode: ChannelMode) {
    match mode {
        ChannelMode::Random => videos.shuffle(&mut rand::thread_rng()),
        ChannelMode::RandomDeterministic => {
            // Input is path-sorted by discover(), so this permutation is a
            // pure function of the file set.
            let mut rng = StdRng::seed_from_u64(DETERMINISTIC_SEED);
            videos.shuffle(&mut rng);
        }
        ChannelMode::Alphabetical => {
            videos.sort_by(|a, b| (&a.name, &a.path).cmp(&(&b.name, &b.path)));
        }
        _ => unreachable!("not a tail ordering mode"),
    }
}

/// Exclusion check with nearest-root-wins semantics: the deepest include or
/// ignore root that is an ancestor of `path` governs it, so a more specific
/// include re-admits files under a shallower ignore root.
fn excluded_by_nearest_root(path: &Path, include_roots: &[PathBuf], ignore_roots: &[PathBuf]) -> bool {
    let deepest = |roots: &[PathBuf]| {
        roots
            .iter()
            .filter(|root| path.starts_with(root))
            .map(|root| root.components().count())
            .max()
    };
    match (deepest(ignore_roots), deepest(include_roots)) {
        (Some(ignore), Some(include)) => ignore > include,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tv_proto::config::Config;

    fn snapshot(toml_str: &str) -> Arc<ConfigSnapshot> {
        Arc::new(
            toml::from_str::<Config>(toml_str)
                .expect("config parses")
                .snapshot()
                .expect("config validates"),
        )
    }

    fn engine_with(toml_str: &str) -> Arc<ChannelEngine> {
        let (broadcast_tx, _) = broadcast::channel(16);
        ChannelEngine::new(snapshot(toml_str), broadcast_tx).expect("engine builds")
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    fn names(table: &ChannelTable) -> Vec<String> {
        table.videos().iter().map(|v| v.name.clone()).collect()
    }

    #[test]
    fn test_new_fails_without_any_existing_search_dir() {
        let snap = snapshot(r#"search-dirs = ["/does/not/exist/anywhere"]"#);
        let (broadcast_tx, _) = broadcast::channel(16);
        assert!(ChannelEngine::new(snap, broadcast_tx).is_err());
    }

    #[test]
    fn test_alphabetical_order_and_contiguous_channels() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "b.mp4");
        touch(dir.path(), "a.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "alphabetical"
            "#,
            dir.path().display()
        ));
        engine.rebuild();

        let table = engine.table();
        assert_eq!(names(&table), vec!["A", "B"]);
        for (n, video) in table.videos().iter().enumerate() {
            assert_eq!(video.channel, n);
        }
        assert_eq!(table.index_of(&dir.path().join("a.mp4")), Some(0));
        assert_eq!(table.index_of(&dir.path().join("b.mp4")), Some(1));
    }

    #[test]
    fn test_automatic_name_humanizes_stem() {
        assert_eq!(
            Video::automatic_name(Path::new("/x/my-old_home MOVIES.mp4")),
            "My Old Home Movies"
        );
        assert_eq!(Video::automatic_name(Path::new("/x/a.mp4")), "A");
    }

    #[test]
    fn test_channel_count_matches_eligible_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "one.mp4");
        touch(dir.path(), "two.mkv");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "disabled.mp4");
        let quarantined = touch(dir.path(), "broken.mp4");

        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "alphabetical"

            [[video]]
            filename = "disabled.mp4"
            enabled = false
            "#,
            dir.path().display()
        ));
        engine.mark_bad_video(&quarantined);
        engine.rebuild();

        // 5 files, minus a .txt, a disabled override, and a quarantined one.
        assert_eq!(engine.table().len(), 2);
    }

    #[test]
    fn test_quarantine_removes_exactly_one_channel() {
        let dir = TempDir::new().unwrap();
        let a = touch(dir.path(), "a.mp4");
        touch(dir.path(), "b.mp4");
        touch(dir.path(), "c.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "alphabetical"
            "#,
            dir.path().display()
        ));
        engine.rebuild();
        assert_eq!(engine.table().len(), 3);

        engine.mark_bad_video(&a);
        assert!(engine.is_quarantined(&a));
        engine.rebuild();

        let table = engine.table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.index_of(&a), None);
    }

    #[test]
    fn test_deterministic_mode_is_stable_across_rebuilds_and_engines() {
        let dir = TempDir::new().unwrap();
        for n in 0..12 {
            touch(dir.path(), &format!("video-{n:02}.mp4"));
        }
        let config = format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "random-deterministic"
            "#,
            dir.path().display()
        );

        let engine = engine_with(&config);
        engine.rebuild();
        let first = names(&engine.table());
        engine.rebuild();
        assert_eq!(names(&engine.table()), first);

        // A fresh engine (simulating a restart) sees the same ordering.
        let other = engine_with(&config);
        other.rebuild();
        assert_eq!(names(&other.table()), first);
    }

    #[test]
    fn test_specific_include_wins_over_shallower_ignore() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        touch(dir.path(), "top.mp4");
        touch(&sub, "nested.mp4");

        // `dir` is ignored, but the deeper `dir/sub` is explicitly included.
        let engine = engine_with(&format!(
            r#"
            channel-mode = "alphabetical"
            search-dirs = [
                {{ path = "{0}", ignore = true }},
                {{ path = "{1}" }},
            ]
            "#,
            dir.path().display(),
            sub.display()
        ));
        engine.rebuild();

        let table = engine.table();
        assert_eq!(table.len(), 1);
        assert_eq!(table.index_of(&sub.join("nested.mp4")), Some(0));
    }

    #[test]
    fn test_deeper_ignore_excludes_within_recursive_include() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        touch(dir.path(), "top.mp4");
        touch(&sub, "nested.mp4");

        let engine = engine_with(&format!(
            r#"
            channel-mode = "alphabetical"
            search-dirs = [
                {{ path = "{0}", recurse = true }},
                {{ path = "{1}", ignore = true }},
            ]
            "#,
            dir.path().display(),
            sub.display()
        ));
        engine.rebuild();

        let table = engine.table();
        assert_eq!(table.len(), 1);
        assert_eq!(table.index_of(&dir.path().join("top.mp4")), Some(0));
    }

    #[test]
    fn test_non_recursive_root_ignores_subdirectories() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        touch(dir.path(), "top.mp4");
        touch(&sub, "nested.mp4");

        let engine = engine_with(&format!(
            r#"
            channel-mode = "alphabetical"
            search-dirs = ["{}"]
            "#,
            dir.path().display()
        ));
        engine.rebuild();
        assert_eq!(engine.table().len(), 1);
    }

    #[test]
    fn test_override_merge_applies_name_and_rating() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "some_file.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "alphabetical"

            [[video]]
            filename = "SOME_FILE.mp4"
            name = "A Proper Title"
            rating = "r"
            subtitles = 2
            "#,
            dir.path().display()
        ));
        engine.rebuild();

        let table = engine.table();
        let video = table.get(0).unwrap();
        assert_eq!(video.name, "A Proper Title");
        assert_eq!(video.rating.as_deref(), Some("R"));
        assert_eq!(video.subtitles, SubtitleSpec::Track(2));
        assert!(video.from_config);
    }

    #[test]
    fn test_unknown_override_rating_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]

            [[video]]
            filename = "a.mp4"
            rating = "NC-17"
            "#,
            dir.path().display()
        ));
        engine.rebuild();
        assert_eq!(engine.table().get(0).unwrap().rating.as_deref(), Some("G"));
    }

    #[test]
    fn test_config_only_keeps_declared_order() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.mp4");
        touch(dir.path(), "b.mp4");
        touch(dir.path(), "c.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "config-only"

            [[video]]
            filename = "c.mp4"

            [[video]]
            filename = "a.mp4"
            "#,
            dir.path().display()
        ));
        engine.rebuild();

        let table = engine.table();
        assert_eq!(table.len(), 2);
        assert_eq!(names(&table), vec!["C", "A"]);
    }

    #[test]
    fn test_config_first_alphabetical_orders_tail() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.mp4");
        touch(dir.path(), "b.mp4");
        touch(dir.path(), "z.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "config-first-alphabetical"

            [[video]]
            filename = "z.mp4"
            "#,
            dir.path().display()
        ));
        engine.rebuild();
        assert_eq!(names(&engine.table()), vec!["Z", "A", "B"]);
    }

    #[test]
    fn test_random_pick_honors_rating_filter() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "gentle.mp4");
        touch(dir.path(), "rough.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "alphabetical"

            [[video]]
            filename = "rough.mp4"
            rating = "R"
            "#,
            dir.path().display()
        ));
        engine.rebuild();

        for _ in 0..20 {
            let video = engine.get_random_video(Some("G")).unwrap();
            assert_eq!(video.rating.as_deref(), Some("G"));
        }
        // Nothing viewable at all: every video is R, filter is G.
        engine.mark_bad_video(&dir.path().join("gentle.mp4"));
        engine.rebuild();
        assert!(engine.get_random_video(Some("G")).is_none());
        assert!(engine.get_random_video(None).is_some());
    }

    #[test]
    fn test_channel_change_skips_non_viewable_and_wraps() {
        let dir = TempDir::new().unwrap();
        let video_g = touch(dir.path(), "video-g.mp4");
        touch(dir.path(), "video-r.mp4");
        let video_pg = touch(dir.path(), "video-pg.mp4");
        // Declared order fixes the channels: [G, R, PG].
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "config-only"

            [[video]]
            filename = "video-g.mp4"
            rating = "G"

            [[video]]
            filename = "video-r.mp4"
            rating = "R"

            [[video]]
            filename = "video-pg.mp4"
            rating = "PG"
            "#,
            dir.path().display()
        ));
        engine.rebuild();
        assert_eq!(engine.table().len(), 3);

        // Stepping up from the G video at filter PG skips the R video.
        let next = engine
            .get_video_for_channel_change(Some(&video_g), Some("PG"), 1)
            .unwrap();
        assert_eq!(next.path, video_pg);

        // Stepping down wraps backwards to the same PG video.
        let prev = engine
            .get_video_for_channel_change(Some(&video_g), Some("PG"), -1)
            .unwrap();
        assert_eq!(prev.path, video_pg);

        // Never returns a video above the filter.
        for direction in [1, -1] {
            let found = engine
                .get_video_for_channel_change(Some(&video_g), Some("G"), direction)
                .unwrap();
            assert_eq!(found.rating.as_deref(), Some("G"));
        }
    }

    #[test]
    fn test_channel_change_gives_up_after_full_wrap() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.mp4");
        touch(dir.path(), "b.mp4");
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "alphabetical"

            [[video]]
            filename = "a.mp4"
            rating = "X"

            [[video]]
            filename = "b.mp4"
            rating = "X"
            "#,
            dir.path().display()
        ));
        engine.rebuild();
        assert!(engine
            .get_video_for_channel_change(None, Some("G"), 1)
            .is_none());
    }

    #[test]
    fn test_has_videos_condition_tracks_table() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&format!(
            r#"search-dirs = ["{}"]"#,
            dir.path().display()
        ));
        let rx = engine.subscribe_has_videos();
        engine.rebuild();
        assert!(!*rx.borrow());

        touch(dir.path(), "a.mp4");
        engine.rebuild();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_rebuild_publishes_atomically_under_concurrent_reads() {
        let dir = TempDir::new().unwrap();
        for n in 0..8 {
            touch(dir.path(), &format!("v{n}.mp4"));
        }
        let engine = engine_with(&format!(
            r#"
            search-dirs = ["{}"]
            channel-mode = "random"
            "#,
            dir.path().display()
        ));
        engine.rebuild();

        let reader = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let table = engine.table();
                    // Every observed table is a complete contiguous permutation.
                    assert_eq!(table.len(), 8);
                    let mut seen = vec![false; table.len()];
                    for (n, video) in table.videos().iter().enumerate() {
                        assert_eq!(video.channel, n);
                        assert!(!seen[video.channel]);
                        seen[video.channel] = true;
                    }
                }
            })
        };
        for _ in 0..50 {
            engine.rebuild();
        }
        reader.join().unwrap();
    }
}

//! Startup configuration.
//!
//! The TOML file is parsed strictly into [`Config`]: a bad value anywhere
//! outside the `[[video]]` override list is fatal at startup.  The override
//! list is the one place the appliance recovers locally: each entry is
//! validated on its own, and a malformed entry is logged and skipped so the
//! file it names simply falls back to defaults.
//!
//! [`Config::snapshot`] produces the immutable [`ConfigSnapshot`] that is
//! handed to every component constructor.  Nothing re-reads the file after
//! startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Paths tried in order when no config file is given on the command line.
/// The first two match where a USB stick or the boot partition would mount
/// on the appliance.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/media/TvConfig/config.toml",
    "/boot/firmware/tv-config.toml",
    "./config.toml",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    #[error("'search-dirs' must contain at least one entry")]
    NoSearchDirs,
    #[error("'search-dirs' entry {path:?}: 'recurse' and 'ignore' cannot both be true")]
    RecurseAndIgnore { path: PathBuf },
    #[error("'starting-volume' must be between 0 and 100, got {0}")]
    VolumeOutOfRange(i64),
}

// ── channel modes ─────────────────────────────────────────────────────────────

/// Ordering policy applied on every channel rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    Random,
    #[default]
    RandomDeterministic,
    Alphabetical,
    ConfigOnly,
    ConfigFirstRandom,
    ConfigFirstRandomDeterministic,
    ConfigFirstAlphabetical,
}

impl ChannelMode {
    /// Modes that put override-declared entries ahead of discovered ones.
    pub fn is_config_first(self) -> bool {
        matches!(
            self,
            ChannelMode::ConfigOnly
                | ChannelMode::ConfigFirstRandom
                | ChannelMode::ConfigFirstRandomDeterministic
                | ChannelMode::ConfigFirstAlphabetical
        )
    }
}

// ── ratings ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rating {
    pub rating: String,
    pub description: String,
    #[serde(default = "default_rating_color")]
    pub color: String,
}

fn default_rating_color() -> String {
    "#FFFFFF".to_string()
}

/// Ordered rating identifiers; rank is position in the list.  An empty list
/// disables the rating system and makes everything viewable.
#[derive(Debug, Clone, Default)]
pub struct RatingList {
    ratings: Vec<Rating>,
    ranks: HashMap<String, usize>,
}

impl RatingList {
    pub fn new(ratings: Vec<Rating>) -> Self {
        let ranks = ratings
            .iter()
            .enumerate()
            .map(|(n, r)| (r.rating.clone(), n))
            .collect();
        Self { ratings, ranks }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ratings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rating> {
        self.ratings.iter()
    }

    pub fn rank(&self, rating: &str) -> Option<usize> {
        self.ranks.get(rating).copied()
    }

    pub fn get(&self, rating: &str) -> Option<&Rating> {
        self.rank(rating).map(|n| &self.ratings[n])
    }

    /// The lowest-ranked rating, assigned to videos that declare none.
    pub fn default_rating(&self) -> Option<&str> {
        self.ratings.first().map(|r| r.rating.as_str())
    }

    /// The most permissive rating (last in the list).
    pub fn most_permissive(&self) -> Option<&str> {
        self.ratings.last().map(|r| r.rating.as_str())
    }

    /// A video is viewable at `filter` iff its rank does not exceed the
    /// filter's rank.  No filter, an unknown filter, or a disabled rating
    /// system admits everything; a video with no (or an unknown) rating
    /// counts as the lowest rank.
    pub fn viewable(&self, video_rating: Option<&str>, filter: Option<&str>) -> bool {
        let Some(filter) = filter else { return true };
        let Some(filter_rank) = self.rank(filter) else {
            return true;
        };
        let video_rank = video_rating.and_then(|r| self.rank(r)).unwrap_or(0);
        video_rank <= filter_rank
    }

    /// Step one rating down the list, wrapping (the `ratings` key cycles
    /// through filters in this order).
    pub fn cycle(&self, current: &str) -> Option<&str> {
        if self.ratings.is_empty() {
            return None;
        }
        let n = self.rank(current).unwrap_or(0);
        let n = (n + self.ratings.len() - 1) % self.ratings.len();
        Some(self.ratings[n].rating.as_str())
    }
}

fn default_ratings() -> Vec<Rating> {
    [
        ("G", "General"),
        ("PG", "Parental Guidance"),
        ("R", "Restricted"),
        ("X", "Adult"),
    ]
    .into_iter()
    .map(|(rating, description)| Rating {
        rating: rating.to_string(),
        description: description.to_string(),
        color: default_rating_color(),
    })
    .collect()
}

// ── search dirs ───────────────────────────────────────────────────────────────

/// Raw `search-dirs` entry: either a bare path or the full table form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SearchDirEntry {
    Plain(PathBuf),
    Full {
        path: PathBuf,
        #[serde(default)]
        recurse: bool,
        #[serde(default)]
        ignore: bool,
    },
}

/// Validated search root.  `recurse` and `ignore` are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDir {
    pub path: PathBuf,
    pub recurse: bool,
    pub ignore: bool,
}

// ── subtitles ─────────────────────────────────────────────────────────────────

/// Per-video subtitle selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubtitleSpec {
    /// No subtitles.
    Off,
    /// Pick the first embedded track.
    On,
    /// A specific embedded track id (1-based).
    Track(i64),
    /// An external subtitle file.
    File(PathBuf),
}

// ── per-filename overrides ────────────────────────────────────────────────────

/// A `[[video]]` override entry after lenient per-entry validation.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoOverride {
    /// Normalized (trimmed, lowercased) filename this entry applies to.
    pub filename: String,
    pub name: Option<String>,
    pub rating: Option<String>,
    pub subtitles: Option<SubtitleSpec>,
    pub enabled: bool,
}

/// Filename normalization used everywhere overrides are matched.
pub fn normalize_filename(name: &str) -> String {
    name.trim().to_lowercase()
}

fn parse_override(value: &toml::Value) -> Result<VideoOverride, String> {
    let table = value.as_table().ok_or("entry is not a table")?;
    let filename = table
        .get("filename")
        .and_then(|v| v.as_str())
        .ok_or("missing or non-string 'filename'")?;
    let filename = normalize_filename(filename);
    if filename.is_empty() {
        return Err("'filename' is empty".to_string());
    }

    let mut out = VideoOverride {
        filename,
        name: None,
        rating: None,
        subtitles: None,
        enabled: true,
    };

    for (key, v) in table {
        match key.as_str() {
            "filename" => {}
            "name" => {
                let name = v.as_str().ok_or("'name' must be a string")?.trim();
                if !name.is_empty() {
                    out.name = Some(name.to_string());
                }
            }
            "rating" => {
                let rating = v.as_str().ok_or("'rating' must be a string")?;
                out.rating = Some(rating.trim().to_uppercase());
            }
            "enabled" => {
                out.enabled = v.as_bool().ok_or("'enabled' must be a boolean")?;
            }
            "subtitles" => {
                out.subtitles = Some(parse_subtitles(v)?);
            }
            other => return Err(format!("unknown key '{other}'")),
        }
    }
    Ok(out)
}

fn parse_subtitles(value: &toml::Value) -> Result<SubtitleSpec, String> {
    match value {
        toml::Value::Boolean(true) => Ok(SubtitleSpec::On),
        toml::Value::Boolean(false) => Ok(SubtitleSpec::Off),
        toml::Value::Integer(n) if *n >= 1 => Ok(SubtitleSpec::Track(*n)),
        toml::Value::Integer(n) => Err(format!("subtitle track id must be >= 1, got {n}")),
        toml::Value::String(s) if !s.trim().is_empty() => {
            Ok(SubtitleSpec::File(PathBuf::from(s.trim())))
        }
        _ => Err("'subtitles' must be a boolean, a track id, or a file path".to_string()),
    }
}

// ── raw config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub search_dirs: Vec<SearchDirEntry>,
    #[serde(default)]
    pub channel_mode: ChannelMode,
    #[serde(default = "default_ratings")]
    pub ratings: Vec<Rating>,
    #[serde(default)]
    pub starting_rating: Option<String>,
    #[serde(default = "default_extensions")]
    pub valid_file_extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub save_place_while_browsing: bool,
    #[serde(default = "default_volume")]
    pub starting_volume: i64,
    #[serde(default)]
    pub subtitles_default_on: bool,
    #[serde(default = "default_mpv_options")]
    pub mpv_options: BTreeMap<String, String>,
    /// Raw `[[video]]` entries; validated one-by-one in `snapshot()`.
    #[serde(default, rename = "video")]
    pub videos: Vec<toml::Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_volume() -> i64 {
    100
}

fn default_extensions() -> Vec<String> {
    [
        "mp4", "avi", "mkv", "mov", "wmv", "flv", "3gp", "mpeg", "mpg", "webm", "m4v", "ogv",
        "ts", "vob",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_mpv_options() -> BTreeMap<String, String> {
    [
        ("ao", "alsa,pipewire,pulse"),
        ("fullscreen", "yes"),
        ("hwdec", "auto-safe"),
        ("profile", "sw-fast"),
        ("vo", "gpu"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// Validate into the immutable snapshot every component receives.
    pub fn snapshot(self) -> Result<ConfigSnapshot, ConfigError> {
        if self.search_dirs.is_empty() {
            return Err(ConfigError::NoSearchDirs);
        }
        let mut search_dirs = Vec::with_capacity(self.search_dirs.len());
        for entry in self.search_dirs {
            let dir = match entry {
                SearchDirEntry::Plain(path) => SearchDir {
                    path,
                    recurse: false,
                    ignore: false,
                },
                SearchDirEntry::Full {
                    path,
                    recurse,
                    ignore,
                } => {
                    if recurse && ignore {
                        return Err(ConfigError::RecurseAndIgnore { path });
                    }
                    SearchDir {
                        path,
                        recurse,
                        ignore,
                    }
                }
            };
            search_dirs.push(dir);
        }

        if !(0..=100).contains(&self.starting_volume) {
            return Err(ConfigError::VolumeOutOfRange(self.starting_volume));
        }

        let ratings = RatingList::new(
            self.ratings
                .into_iter()
                .map(|mut r| {
                    r.rating = r.rating.trim().to_uppercase();
                    r
                })
                .collect(),
        );

        let starting_rating = if ratings.is_enabled() {
            self.starting_rating
                .as_deref()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| ratings.rank(s).is_some())
                .or_else(|| ratings.most_permissive().map(str::to_string))
        } else {
            None
        };

        let mut valid_extensions: Vec<String> = self
            .valid_file_extensions
            .iter()
            .map(|ext| format!(".{}", ext.trim_start_matches('.').to_lowercase()))
            .collect();
        valid_extensions.sort();
        valid_extensions.dedup();

        let mut overrides: Vec<VideoOverride> = Vec::new();
        let mut override_index: HashMap<String, usize> = HashMap::new();
        for value in &self.videos {
            match parse_override(value) {
                Ok(entry) => {
                    if override_index.contains_key(&entry.filename) {
                        warn!(
                            filename = %entry.filename,
                            "duplicate [[video]] entry, keeping the first"
                        );
                        continue;
                    }
                    override_index.insert(entry.filename.clone(), overrides.len());
                    overrides.push(entry);
                }
                Err(reason) => {
                    warn!(%reason, "skipping malformed [[video]] entry, file will use defaults");
                }
            }
        }

        Ok(ConfigSnapshot {
            log_level: self.log_level,
            search_dirs,
            channel_mode: self.channel_mode,
            ratings,
            starting_rating,
            valid_extensions,
            overrides,
            override_index,
            save_place_while_browsing: self.save_place_while_browsing,
            starting_volume: self.starting_volume,
            subtitles_default_on: self.subtitles_default_on,
            mpv_options: self.mpv_options,
        })
    }
}

// ── snapshot ──────────────────────────────────────────────────────────────────

/// Immutable, validated view of the configuration.  Built once at startup
/// and shared read-only with every component.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub log_level: String,
    pub search_dirs: Vec<SearchDir>,
    pub channel_mode: ChannelMode,
    pub ratings: RatingList,
    pub starting_rating: Option<String>,
    /// Lowercased `.ext` suffixes.
    pub valid_extensions: Vec<String>,
    /// `[[video]]` overrides in declared order.
    pub overrides: Vec<VideoOverride>,
    override_index: HashMap<String, usize>,
    pub save_place_while_browsing: bool,
    pub starting_volume: i64,
    pub subtitles_default_on: bool,
    pub mpv_options: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    /// Look up the override for a filename.  Returns the declaration index
    /// (used by the config-first channel modes) alongside the entry.
    pub fn override_for(&self, filename: &str) -> Option<(usize, &VideoOverride)> {
        let key = normalize_filename(filename);
        self.override_index
            .get(&key)
            .map(|&n| (n, &self.overrides[n]))
    }

    /// Extension allowlist check, case-insensitive on the filename.
    pub fn is_valid_extension(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.to_lowercase();
        self.valid_extensions.iter().any(|ext| name.ends_with(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_from(toml_str: &str) -> ConfigSnapshot {
        toml::from_str::<Config>(toml_str)
            .expect("config parses")
            .snapshot()
            .expect("config validates")
    }

    #[test]
    fn test_minimal_config_defaults() {
        let snap = snapshot_from(r#"search-dirs = ["/videos"]"#);
        assert_eq!(snap.channel_mode, ChannelMode::RandomDeterministic);
        assert_eq!(snap.ratings.len(), 4);
        assert_eq!(snap.starting_rating.as_deref(), Some("X"));
        assert_eq!(snap.ratings.default_rating(), Some("G"));
        assert!(snap.save_place_while_browsing);
        assert_eq!(snap.starting_volume, 100);
        assert!(snap.valid_extensions.contains(&".mp4".to_string()));
        assert_eq!(
            snap.search_dirs,
            vec![SearchDir {
                path: PathBuf::from("/videos"),
                recurse: false,
                ignore: false,
            }]
        );
    }

    #[test]
    fn test_search_dir_table_form() {
        let snap = snapshot_from(
            r#"
            search-dirs = [
                "/plain",
                { path = "/deep", recurse = true },
                { path = "/skip", ignore = true },
            ]
            "#,
        );
        assert!(!snap.search_dirs[0].recurse);
        assert!(snap.search_dirs[1].recurse);
        assert!(snap.search_dirs[2].ignore);
    }

    #[test]
    fn test_recurse_and_ignore_is_fatal() {
        let config: Config = toml::from_str(
            r#"search-dirs = [{ path = "/x", recurse = true, ignore = true }]"#,
        )
        .unwrap();
        assert!(matches!(
            config.snapshot(),
            Err(ConfigError::RecurseAndIgnore { .. })
        ));
    }

    #[test]
    fn test_empty_search_dirs_is_fatal() {
        let config: Config = toml::from_str("search-dirs = []").unwrap();
        assert!(matches!(config.snapshot(), Err(ConfigError::NoSearchDirs)));
    }

    #[test]
    fn test_malformed_override_is_skipped_not_fatal() {
        let snap = snapshot_from(
            r#"
            search-dirs = ["/videos"]

            [[video]]
            filename = "Good.mp4"
            rating = "pg"

            [[video]]
            name = "no filename here"

            [[video]]
            filename = "bad.mp4"
            enabled = "yes"
            "#,
        );
        assert_eq!(snap.overrides.len(), 1);
        let (idx, entry) = snap.override_for("good.MP4").unwrap();
        assert_eq!(idx, 0);
        assert_eq!(entry.rating.as_deref(), Some("PG"));
        assert!(entry.enabled);
        assert!(snap.override_for("bad.mp4").is_none());
    }

    #[test]
    fn test_duplicate_override_keeps_first() {
        let snap = snapshot_from(
            r#"
            search-dirs = ["/videos"]

            [[video]]
            filename = "a.mp4"
            name = "First"

            [[video]]
            filename = "A.mp4"
            name = "Second"
            "#,
        );
        assert_eq!(snap.overrides.len(), 1);
        let (_, entry) = snap.override_for("a.mp4").unwrap();
        assert_eq!(entry.name.as_deref(), Some("First"));
    }

    #[test]
    fn test_subtitle_spec_forms() {
        let snap = snapshot_from(
            r#"
            search-dirs = ["/videos"]

            [[video]]
            filename = "a.mp4"
            subtitles = true

            [[video]]
            filename = "b.mp4"
            subtitles = 2

            [[video]]
            filename = "c.mp4"
            subtitles = "subs/c.srt"

            [[video]]
            filename = "d.mp4"
            subtitles = 0
            "#,
        );
        // The track-id-0 entry is malformed and skipped.
        assert_eq!(snap.overrides.len(), 3);
        assert_eq!(
            snap.override_for("a.mp4").unwrap().1.subtitles,
            Some(SubtitleSpec::On)
        );
        assert_eq!(
            snap.override_for("b.mp4").unwrap().1.subtitles,
            Some(SubtitleSpec::Track(2))
        );
        assert_eq!(
            snap.override_for("c.mp4").unwrap().1.subtitles,
            Some(SubtitleSpec::File(PathBuf::from("subs/c.srt")))
        );
        assert!(snap.override_for("d.mp4").is_none());
    }

    #[test]
    fn test_rating_viewability() {
        let ratings = RatingList::new(default_ratings());
        assert!(ratings.viewable(Some("G"), Some("PG")));
        assert!(ratings.viewable(Some("PG"), Some("PG")));
        assert!(!ratings.viewable(Some("R"), Some("PG")));
        // Unrated counts as lowest rank.
        assert!(ratings.viewable(None, Some("G")));
        // No filter admits everything.
        assert!(ratings.viewable(Some("X"), None));
        // Disabled rating system admits everything.
        let disabled = RatingList::new(Vec::new());
        assert!(disabled.viewable(Some("R"), Some("G")));
    }

    #[test]
    fn test_rating_cycle_wraps() {
        let ratings = RatingList::new(default_ratings());
        assert_eq!(ratings.cycle("X"), Some("R"));
        assert_eq!(ratings.cycle("PG"), Some("G"));
        assert_eq!(ratings.cycle("G"), Some("X"));
    }

    #[test]
    fn test_starting_rating_falls_back_to_most_permissive() {
        let snap = snapshot_from(
            r#"
            search-dirs = ["/videos"]
            starting-rating = "NOPE"
            "#,
        );
        assert_eq!(snap.starting_rating.as_deref(), Some("X"));

        let snap = snapshot_from(
            r#"
            search-dirs = ["/videos"]
            starting-rating = "pg"
            "#,
        );
        assert_eq!(snap.starting_rating.as_deref(), Some("PG"));
    }

    #[test]
    fn test_ratings_disabled_by_empty_list() {
        let snap = snapshot_from(
            r#"
            search-dirs = ["/videos"]
            ratings = []
            "#,
        );
        assert!(!snap.ratings.is_enabled());
        assert_eq!(snap.starting_rating, None);
    }

    #[test]
    fn test_extension_check() {
        let snap = snapshot_from(r#"search-dirs = ["/videos"]"#);
        assert!(snap.is_valid_extension(Path::new("/a/Movie.MP4")));
        assert!(snap.is_valid_extension(Path::new("show.mkv")));
        assert!(!snap.is_valid_extension(Path::new("notes.txt")));
        assert!(!snap.is_valid_extension(Path::new("mp4")));
    }
}

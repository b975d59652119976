//! Archive discovery and JSON record loading.
//!
//! The export folder holds `memories.json`, `posts.json`, `realmojis.json` and
//! a `conversations/<id>/` tree. Records are decoded with `serde` and
//! normalized into [`ImageRecord`] before they reach the exporter.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{ExportError, Result};
use crate::time::{self, Location};

/// Entries whose presence marks a folder as an archive export.
const ARCHIVE_MARKERS: &[&str] = &["memories.json", "posts.json", "realmojis.json", "conversations"];

/// A timestamp as stored in the archive: text or a numeric epoch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Text(String),
    Epoch(f64),
}

impl RawTimestamp {
    pub fn parse(&self) -> Result<DateTime<Utc>> {
        match self {
            Self::Text(s) => time::parse_timestamp(s),
            Self::Epoch(secs) => time::parse_timestamp(&secs.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaRef {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub taken_time: RawTimestamp,
    pub front_image: MediaRef,
    pub back_image: MediaRef,
    #[serde(default)]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub taken_at: RawTimestamp,
    pub primary: MediaRef,
    pub secondary: MediaRef,
    #[serde(default)]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Realmoji {
    pub posted_at: RawTimestamp,
    pub media: MediaRef,
}

/// One exportable pair of images, whatever record type it came from.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Wide shot, the composite background.
    pub primary: String,
    /// Inset shot, the composite overlay.
    pub secondary: String,
    pub taken_at: RawTimestamp,
    pub location: Option<Location>,
}

impl From<Memory> for ImageRecord {
    fn from(m: Memory) -> Self {
        Self {
            primary: m.back_image.path,
            secondary: m.front_image.path,
            taken_at: m.taken_time,
            location: m.location,
        }
    }
}

impl From<Post> for ImageRecord {
    fn from(p: Post) -> Self {
        Self {
            primary: p.primary.path,
            secondary: p.secondary.path,
            taken_at: p.taken_at,
            location: p.location,
        }
    }
}

// ── Chat logs ───────────────────────────────────────────────────────

/// One chat-log message; only the fields used for naming and timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<RawTimestamp>,
}

impl ChatMessage {
    /// `_user_<first 8 chars>` or empty when the author is unknown.
    pub fn user_suffix(&self) -> String {
        match self.user_id.as_deref() {
            Some(id) if !id.is_empty() && id != "unknown" => {
                format!("_user_{}", id.chars().take(8).collect::<String>())
            }
            _ => String::new(),
        }
    }
}

fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChatLogFile {
    Wrapped { messages: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

/// Chat-log messages keyed by message id.
pub type ChatLog = HashMap<String, ChatMessage>;

/// Parse `chat_log.json` content. Entries that are not messages are ignored.
pub fn parse_chat_log(json: &str) -> std::result::Result<ChatLog, serde_json::Error> {
    let entries = match serde_json::from_str::<ChatLogFile>(json)? {
        ChatLogFile::Wrapped { messages } => messages,
        ChatLogFile::Bare(entries) => entries,
    };
    Ok(entries
        .into_iter()
        .filter_map(|v| serde_json::from_value::<ChatMessage>(v).ok())
        .map(|m| (m.id.clone(), m))
        .collect())
}

// ── Conversations ───────────────────────────────────────────────────

/// Images of one chat message, sorted by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGroup {
    pub file_id: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub dir: PathBuf,
}

impl Conversation {
    /// Load `chat_log.json`; a missing or unreadable log yields an empty map.
    pub fn chat_log(&self) -> ChatLog {
        let path = self.dir.join("chat_log.json");
        if !path.is_file() {
            return ChatLog::new();
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| parse_chat_log(&s).map_err(|e| e.to_string()));
        match parsed {
            Ok(log) => {
                log::debug!("Loaded {} chat log entries for {}", log.len(), self.id);
                log
            }
            Err(e) => {
                log::debug!("Could not read chat log {}: {e}", path.display());
                ChatLog::new()
            }
        }
    }

    /// `*.webp` files grouped by the file-name prefix before the first `-`.
    pub fn image_groups(&self) -> Vec<ImageGroup> {
        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let is_webp = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("webp"));
            if !path.is_file() || !is_webp {
                continue;
            }
            groups
                .entry(file_id(path))
                .or_default()
                .push(path.to_path_buf());
        }
        groups
            .into_iter()
            .map(|(file_id, mut files)| {
                files.sort();
                ImageGroup { file_id, files }
            })
            .collect()
    }
}

/// Message id encoded in a conversation image name (`7-abc.webp` → `7`).
pub fn file_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.split_once('-') {
        Some((id, _)) => id.to_string(),
        None => stem,
    }
}

// ── Archive ─────────────────────────────────────────────────────────

/// A located archive export folder.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    /// Use `input` if it is an export folder, otherwise its first sub-folder
    /// (by name) that is one.
    pub fn discover(input: &Path) -> Result<Self> {
        if is_export_folder(input) {
            return Ok(Self::at(input));
        }
        if input.is_dir() {
            let found = WalkDir::new(input)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .find(|e| e.file_type().is_dir() && is_export_folder(e.path()));
            if let Some(entry) = found {
                return Ok(Self::at(entry.path()));
            }
        }
        Err(ExportError::ArchiveNotFound(input.to_path_buf()))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_memories(&self) -> Result<Option<Vec<ImageRecord>>> {
        Ok(self
            .load_json::<Memory>("memories.json")?
            .map(|v| v.into_iter().map(ImageRecord::from).collect()))
    }

    pub fn load_posts(&self) -> Result<Option<Vec<ImageRecord>>> {
        Ok(self
            .load_json::<Post>("posts.json")?
            .map(|v| v.into_iter().map(ImageRecord::from).collect()))
    }

    pub fn load_realmojis(&self) -> Result<Option<Vec<Realmoji>>> {
        self.load_json("realmojis.json")
    }

    /// Conversation folders sorted by id; empty when there are none.
    pub fn conversations(&self) -> Vec<Conversation> {
        let dir = self.root.join("conversations");
        if !dir.is_dir() {
            log::info!("No conversations folder found");
            return Vec::new();
        }
        WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| Conversation {
                id: e.file_name().to_string_lossy().into_owned(),
                dir: e.into_path(),
            })
            .collect()
    }

    /// `Ok(None)` when the file is absent, `Decode` when it is malformed.
    fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<Vec<T>>> {
        let path = self.root.join(name);
        if !path.is_file() {
            log::info!("{name} file not found, skipping");
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| ExportError::Decode {
                file: name.to_string(),
                source,
            })
    }
}

fn is_export_folder(path: &Path) -> bool {
    path.is_dir() && ARCHIVE_MARKERS.iter().any(|m| path.join(m).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── records ──────────────────────────────────────────────────────

    #[test]
    fn memory_normalizes_back_as_primary() {
        let json = r#"[{
            "takenTime": "2023-06-15T12:00:00.000Z",
            "berealMoment": "2023-06-15T11:58:00.000Z",
            "frontImage": {"path": "/Photos/u/bereal/front.webp", "width": 1500},
            "backImage": {"path": "/Photos/u/bereal/back.webp"},
            "location": {"latitude": 40.7, "longitude": -74.0}
        }]"#;
        let memories: Vec<Memory> = serde_json::from_str(json).unwrap();
        let record = ImageRecord::from(memories[0].clone());

        assert_eq!(record.primary, "/Photos/u/bereal/back.webp");
        assert_eq!(record.secondary, "/Photos/u/bereal/front.webp");
        assert_eq!(record.location, Some(Location::new(40.7, -74.0)));
        assert!(record.taken_at.parse().is_ok());
    }

    #[test]
    fn post_without_location() {
        let json = r#"[{"takenAt": 1686830400, "primary": {"path": "a"}, "secondary": {"path": "b"}}]"#;
        let posts: Vec<Post> = serde_json::from_str(json).unwrap();
        let record = ImageRecord::from(posts[0].clone());

        assert_eq!(record.primary, "a");
        assert!(record.location.is_none());
        assert_eq!(record.taken_at, RawTimestamp::Epoch(1686830400.0));
        assert_eq!(
            record.taken_at.parse().unwrap(),
            "2023-06-15T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    // ── chat logs ────────────────────────────────────────────────────

    #[test]
    fn chat_log_wrapped_form() {
        let log = parse_chat_log(
            r#"{"conversationId": "c1", "messages": [
                {"id": "7", "userId": "abcdefghijk", "createdAt": "2023-06-15T12:00:00.000Z"},
                {"id": 8, "createdAt": "2023-06-15T13:00:00Z"},
                "junk"
            ]}"#,
        )
        .unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log["7"].user_suffix(), "_user_abcdefgh");
        assert_eq!(log["8"].user_suffix(), "");
    }

    #[test]
    fn chat_log_bare_array() {
        let log = parse_chat_log(r#"[{"id": 3, "userId": "unknown"}]"#).unwrap();
        assert_eq!(log["3"].user_suffix(), "");
        assert!(log["3"].created_at.is_none());
    }

    #[test]
    fn chat_log_rejects_other_shapes() {
        assert!(parse_chat_log(r#"{"foo": 1}"#).is_err());
    }

    // ── conversations ────────────────────────────────────────────────

    #[test]
    fn file_id_from_name() {
        assert_eq!(file_id(Path::new("7-gchAVq_kc0wAbj.webp")), "7");
        assert_eq!(file_id(Path::new("12-secondary-x.webp")), "12");
        assert_eq!(file_id(Path::new("misc.webp")), "misc");
    }

    #[test]
    fn images_grouped_by_message() {
        let dir = TempDir::new().unwrap();
        for name in ["7-b.webp", "7-a.webp", "8-x.webp", "chat_log.json", "9-y.png"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let convo = Conversation {
            id: "c1".into(),
            dir: dir.path().to_path_buf(),
        };

        let groups = convo.image_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file_id, "7");
        assert_eq!(
            groups[0].files,
            vec![dir.path().join("7-a.webp"), dir.path().join("7-b.webp")]
        );
        assert_eq!(groups[1].files.len(), 1);
    }

    #[test]
    fn unreadable_chat_log_is_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("chat_log.json"), b"{not json").unwrap();
        let convo = Conversation {
            id: "c1".into(),
            dir: dir.path().to_path_buf(),
        };
        assert!(convo.chat_log().is_empty());
    }

    // ── discovery & loading ──────────────────────────────────────────

    #[test]
    fn discover_input_itself() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("posts.json"), b"[]").unwrap();
        let archive = Archive::discover(dir.path()).unwrap();
        assert_eq!(archive.root(), dir.path());
    }

    #[test]
    fn discover_first_subfolder() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a-unrelated")).unwrap();
        fs::create_dir_all(dir.path().join("b-export/conversations")).unwrap();
        fs::create_dir_all(dir.path().join("c-export/conversations")).unwrap();

        let archive = Archive::discover(dir.path()).unwrap();
        assert_eq!(archive.root(), dir.path().join("b-export"));
    }

    #[test]
    fn discover_nothing_is_fatal() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Archive::discover(dir.path()),
            Err(ExportError::ArchiveNotFound(_))
        ));
        assert!(Archive::discover(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn missing_json_is_none_and_malformed_is_decode_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("posts.json"), b"[{\"takenAt\": ").unwrap();
        let archive = Archive::at(dir.path());

        assert!(archive.load_memories().unwrap().is_none());
        assert!(matches!(
            archive.load_posts(),
            Err(ExportError::Decode { ref file, .. }) if file == "posts.json"
        ));
    }

    #[test]
    fn conversations_sorted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("conversations/zz")).unwrap();
        fs::create_dir_all(dir.path().join("conversations/aa")).unwrap();
        fs::write(dir.path().join("conversations/stray.txt"), b"x").unwrap();

        let ids: Vec<_> = Archive::at(dir.path())
            .conversations()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["aa", "zz"]);
    }
}

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::clip::ClipId;
use crate::frame::{AssembledFrame, FrameKey};
use crate::transport::MediaKind;

/// Where assembled frames go.
pub trait FrameStore: Send {
    /// Persist one frame and return where it landed.
    fn save(&mut self, frame: &AssembledFrame) -> Result<PathBuf>;

    /// Delete the saved JPEG frames of a clip. Returns how many were removed.
    fn purge_clip(&mut self, clip: &ClipId) -> Result<usize>;
}

/// Directory holding a clip's frames.
pub fn frame_dir(root: &Path, clip: &ClipId) -> PathBuf {
    match clip {
        ClipId::Numeric(_) => root.to_path_buf(),
        ClipId::Named { serial, timestamp } => root.join(serial).join(timestamp),
    }
}

pub fn frame_path(root: &Path, key: &FrameKey, media: MediaKind) -> PathBuf {
    let ext = media.extension();
    match &key.clip {
        ClipId::Numeric(clip_id) => {
            root.join(format!("clip{}_frame{}.{}", clip_id, key.frame_id, ext))
        }
        named => frame_dir(root, named).join(format!("frame{:06}.{}", key.frame_id, ext)),
    }
}

/// Output video location for a clip.
pub fn video_path(root: &Path, clip: &ClipId) -> PathBuf {
    match clip {
        ClipId::Numeric(clip_id) => root.join(format!("clip{}.mp4", clip_id)),
        ClipId::Named { serial, timestamp } => root.join(serial).join(format!("{}.mp4", timestamp)),
    }
}

/// printf-style input pattern of a clip's JPEG frames, as the encoder expects it.
pub fn frame_pattern(root: &Path, clip: &ClipId) -> PathBuf {
    match clip {
        ClipId::Numeric(clip_id) => root.join(format!("clip{}_frame%d.jpg", clip_id)),
        named => frame_dir(root, named).join("frame%06d.jpg"),
    }
}

fn numeric_frame_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^clip(\d+)_frame(\d+)\.jpg$").unwrap())
}

fn named_frame_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^frame(\d+)\.jpg$").unwrap())
}

/// Frame id encoded in a JPEG file name, when the name belongs to `clip`.
fn frame_id_from_name(name: &str, clip: &ClipId) -> Option<u32> {
    match clip {
        ClipId::Numeric(clip_id) => {
            let caps = numeric_frame_re().captures(name)?;
            let owner: u32 = caps.get(1)?.as_str().parse().ok()?;
            if owner != *clip_id {
                return None;
            }
            caps.get(2)?.as_str().parse().ok()
        }
        ClipId::Named { .. } => named_frame_re()
            .captures(name)?
            .get(1)?
            .as_str()
            .parse()
            .ok(),
    }
}

/// Saved JPEG frame ids of a clip, ascending. A missing directory yields none.
pub fn scan_frame_ids(root: &Path, clip: &ClipId) -> Result<Vec<u32>> {
    let dir = frame_dir(root, clip);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(anyhow!("failed to list {}: {}", dir.display(), e)),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(|name| frame_id_from_name(name, clip)) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Frames written as files under an output directory.
#[derive(Debug, Clone)]
pub struct FsFrameStore {
    root: PathBuf,
}

impl FsFrameStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create output directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FrameStore for FsFrameStore {
    fn save(&mut self, frame: &AssembledFrame) -> Result<PathBuf> {
        let path = frame_path(&self.root, &frame.key, frame.info.media);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create frame directory {}", parent.display()))?;
        }
        std::fs::write(&path, &frame.data)
            .with_context(|| format!("write frame {}", path.display()))?;
        Ok(path)
    }

    fn purge_clip(&mut self, clip: &ClipId) -> Result<usize> {
        let dir = frame_dir(&self.root, clip);
        let mut removed = 0;
        for id in scan_frame_ids(&self.root, clip)? {
            let key = FrameKey {
                clip: clip.clone(),
                frame_id: id,
            };
            let path = frame_path(&self.root, &key, MediaKind::Jpeg);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Could not delete {}: {}", path.display(), e),
            }
        }
        log::debug!("Purged {} frame(s) of {} from {}", removed, clip, dir.display());
        Ok(removed)
    }
}

#[derive(Debug, Default)]
struct MemoryFrames {
    files: BTreeMap<PathBuf, Vec<u8>>,
    failing: bool,
}

/// Frames kept in memory, keyed by the path a filesystem store would use.
///
/// Clones share the same contents, so a test can keep a handle after giving
/// the store to an engine.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFrameStore {
    root: PathBuf,
    inner: Arc<Mutex<MemoryFrames>>,
}

impl InMemoryFrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFrames> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent save fail.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().files.is_empty()
    }
}

impl FrameStore for InMemoryFrameStore {
    fn save(&mut self, frame: &AssembledFrame) -> Result<PathBuf> {
        let path = frame_path(&self.root, &frame.key, frame.info.media);
        let mut inner = self.lock();
        if inner.failing {
            return Err(anyhow!("in-memory store rejected {}", path.display()));
        }
        inner.files.insert(path.clone(), frame.data.clone());
        Ok(path)
    }

    fn purge_clip(&mut self, clip: &ClipId) -> Result<usize> {
        let dir = frame_dir(&self.root, clip);
        let mut inner = self.lock();
        let before = inner.files.len();
        inner.files.retain(|path, _| {
            let owned = path.parent() == Some(dir.as_path())
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| frame_id_from_name(name, clip))
                    .is_some();
            !owned
        });
        Ok(before - inner.files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameInfo;
    use tempfile::tempdir;

    fn frame(clip: ClipId, frame_id: u32, media: MediaKind) -> AssembledFrame {
        AssembledFrame {
            key: FrameKey { clip, frame_id },
            info: FrameInfo {
                media,
                ..FrameInfo::default()
            },
            data: vec![0xff, 0xd8, frame_id as u8],
        }
    }

    fn named() -> ClipId {
        ClipId::Named {
            serial: "cam01".to_string(),
            timestamp: "20240101_120000".to_string(),
        }
    }

    #[test]
    fn paths_follow_layout() {
        let root = Path::new("out");
        let key = FrameKey {
            clip: ClipId::Numeric(7),
            frame_id: 12,
        };
        assert_eq!(
            frame_path(root, &key, MediaKind::Jpeg),
            Path::new("out/clip7_frame12.jpg")
        );
        assert_eq!(
            frame_path(root, &key, MediaKind::Opaque),
            Path::new("out/clip7_frame12.bin")
        );
        assert_eq!(video_path(root, &ClipId::Numeric(7)), Path::new("out/clip7.mp4"));
        assert_eq!(
            frame_pattern(root, &ClipId::Numeric(7)),
            Path::new("out/clip7_frame%d.jpg")
        );

        let key = FrameKey {
            clip: named(),
            frame_id: 3,
        };
        assert_eq!(
            frame_path(root, &key, MediaKind::Jpeg),
            Path::new("out/cam01/20240101_120000/frame000003.jpg")
        );
        assert_eq!(
            video_path(root, &named()),
            Path::new("out/cam01/20240101_120000.mp4")
        );
    }

    #[test]
    fn fs_store_saves_scans_and_purges() {
        let dir = tempdir().unwrap();
        let mut store = FsFrameStore::open(dir.path().join("clips")).unwrap();
        assert!(store.root().is_dir());
        for id in [4, 2, 9] {
            store.save(&frame(ClipId::Numeric(1), id, MediaKind::Jpeg)).unwrap();
        }
        store.save(&frame(ClipId::Numeric(2), 0, MediaKind::Jpeg)).unwrap();
        store.save(&frame(ClipId::Numeric(1), 5, MediaKind::Opaque)).unwrap();

        assert_eq!(
            scan_frame_ids(store.root(), &ClipId::Numeric(1)).unwrap(),
            vec![2, 4, 9]
        );
        assert_eq!(store.purge_clip(&ClipId::Numeric(1)).unwrap(), 3);
        assert!(scan_frame_ids(store.root(), &ClipId::Numeric(1)).unwrap().is_empty());
        assert_eq!(scan_frame_ids(store.root(), &ClipId::Numeric(2)).unwrap(), vec![0]);
        assert!(store.root().join("clip1_frame5.bin").exists());
    }

    #[test]
    fn fs_store_creates_named_directories() {
        let dir = tempdir().unwrap();
        let mut store = FsFrameStore::open(dir.path()).unwrap();
        let path = store.save(&frame(named(), 1, MediaKind::Jpeg)).unwrap();

        assert!(path.ends_with("cam01/20240101_120000/frame000001.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, 0xd8, 1]);
        assert_eq!(scan_frame_ids(dir.path(), &named()).unwrap(), vec![1]);
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(scan_frame_ids(dir.path(), &named()).unwrap().is_empty());
    }

    #[test]
    fn memory_store_shares_contents_between_clones() {
        let store = InMemoryFrameStore::new("out");
        let mut handle = store.clone();
        handle.save(&frame(ClipId::Numeric(3), 0, MediaKind::Jpeg)).unwrap();
        handle.save(&frame(ClipId::Numeric(3), 1, MediaKind::Jpeg)).unwrap();
        handle.save(&frame(ClipId::Numeric(30), 1, MediaKind::Jpeg)).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(handle.purge_clip(&ClipId::Numeric(3)).unwrap(), 2);
        assert_eq!(store.paths(), vec![PathBuf::from("out/clip30_frame1.jpg")]);

        store.set_failing(true);
        assert!(handle.save(&frame(ClipId::Numeric(3), 2, MediaKind::Jpeg)).is_err());
    }
}

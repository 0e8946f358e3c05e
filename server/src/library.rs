//! The sounds directory: listing, uploads and name resolution.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Extensions offered for playback.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a"];

/// Playable files stored in one flat directory.
#[derive(Debug, Clone)]
pub struct SoundLibrary {
    dir: PathBuf,
}

impl SoundLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if it does not exist.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Names of audio files, sorted.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_audio_file(&name) && entry.file_type().await?.is_file() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    /// Path of an existing file called `name`, if `name` is a plain file name.
    pub async fn resolve(&self, name: &str) -> Option<PathBuf> {
        if !is_plain_name(name) {
            return None;
        }

        let path = self.dir.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }

    /// Write `data` as `name`, replacing any existing file.
    ///
    /// The data lands in a hidden temporary first, so playback never sees a
    /// partial file.
    pub async fn store(&self, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        let target = self.dir.join(name);
        let partial = self.dir.join(format!(".{name}.part"));

        tokio::fs::write(&partial, data).await?;
        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        debug!(file = %target.display(), bytes = data.len(), "Stored upload");
        Ok(target)
    }
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
///
/// Returns `None` when nothing usable is left (empty, `.` or `..`).
pub fn sanitize_file_name(original: &str) -> Option<String> {
    let name: String = original
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    is_plain_name(&name).then_some(name)
}

/// True for names with a playable extension (case-insensitive).
pub fn is_audio_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)))
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

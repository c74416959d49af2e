//! Upload session values.

use serde::{Deserialize, Serialize};

use crate::id::UploadId;

/// Kind of upload; decides the store key prefix and the final location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    /// The primary media file (audio).
    #[default]
    Media,
    /// Optional cover image attached to the same upload id.
    Cover,
}

impl UploadKind {
    pub const ALL: [UploadKind; 2] = [UploadKind::Media, UploadKind::Cover];

    /// Prefix of every ephemeral store key for this kind.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            UploadKind::Media => "file",
            UploadKind::Cover => "image",
        }
    }

    /// Directory (below the upload root) final files are written to.
    pub fn directory(&self) -> &'static str {
        match self {
            UploadKind::Media => "music_files",
            UploadKind::Cover => "cover_files",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            UploadKind::Media => "mp3",
            UploadKind::Cover => "jpg",
        }
    }

    /// Deterministic relative path of the saved file:
    /// `{directory}/{id}/{id}.{extension}`.
    pub fn relative_path(&self, id: &UploadId) -> String {
        format!("{}/{}/{}.{}", self.directory(), id, id, self.extension())
    }
}

impl core::str::FromStr for UploadKind {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "media" => Ok(UploadKind::Media),
            "cover" => Ok(UploadKind::Cover),
            other => Err(crate::error::DomainError::validation(format!(
                "unknown upload kind: {other}"
            ))),
        }
    }
}

/// Chunk progress of one upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub uploaded: u32,
    pub total: u32,
}

impl Progress {
    pub fn new(uploaded: u32, total: u32) -> Self {
        Self { uploaded, total }
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.uploaded >= self.total
    }

    /// Whole-number percentage, 0 when nothing is known.
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((u64::from(self.uploaded) * 100) / u64::from(self.total)) as u32
    }
}

/// Detailed view of which chunks have arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStatus {
    pub upload_id: UploadId,
    pub kind: UploadKind,
    /// Indices present, ascending.
    pub chunks: Vec<u32>,
    pub total: u32,
    pub is_complete: bool,
    pub merged: bool,
}

/// Result of a successful confirm-and-save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedUpload {
    pub upload_id: UploadId,
    /// Relative path of the media file, e.g. `/music_files/{id}/{id}.mp3`.
    pub media_path: String,
    /// Relative path of the cover image, when one was uploaded.
    pub cover_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_and_completion() {
        assert_eq!(Progress::default().percent(), 0);
        assert!(!Progress::default().is_complete());
        assert_eq!(Progress::new(1, 3).percent(), 33);
        assert!(Progress::new(3, 3).is_complete());
    }

    #[test]
    fn relative_paths_are_keyed_by_upload_id() {
        let id = UploadId::parse("abc").unwrap();
        assert_eq!(UploadKind::Media.relative_path(&id), "music_files/abc/abc.mp3");
        assert_eq!(UploadKind::Cover.relative_path(&id), "cover_files/abc/abc.jpg");
    }
}

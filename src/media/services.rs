use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::AppState;

/// A file received from a client and written to the local upload directory,
/// waiting to be moved to object storage.
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub content_type: String,
}

/// An object now living in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
}

/// Outcome of the best-effort cover image upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverImage {
    Uploaded(StoredObject),
    Skipped,
}

impl CoverImage {
    pub fn url(&self) -> Option<String> {
        match self {
            CoverImage::Uploaded(obj) => Some(obj.url.clone()),
            CoverImage::Skipped => None,
        }
    }

    pub fn into_object(self) -> Option<StoredObject> {
        match self {
            CoverImage::Uploaded(obj) => Some(obj),
            CoverImage::Skipped => None,
        }
    }
}

impl StagedFile {
    /// Remove the local copy. Missing files are not an error.
    pub async fn discard(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, path = %self.path.display(), "failed to remove staged file");
            }
        }
    }
}

pub async fn stage_file(dir: &Path, body: Bytes, content_type: &str) -> anyhow::Result<StagedFile> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create upload dir {}", dir.display()))?;

    let ext = ext_from_mime(content_type).unwrap_or("bin");
    let path = dir.join(format!("{}.{}", Uuid::new_v4(), ext));
    tokio::fs::write(&path, &body)
        .await
        .with_context(|| format!("write staged file {}", path.display()))?;

    debug!(path = %path.display(), bytes = body.len(), "file staged");
    Ok(StagedFile {
        path,
        content_type: content_type.to_string(),
    })
}

/// Move a staged file into object storage under `folder`.
/// The local file is removed whether or not the upload succeeds.
pub async fn upload_staged(
    st: &AppState,
    folder: &str,
    file: StagedFile,
) -> anyhow::Result<StoredObject> {
    let result = put_staged(st, folder, &file).await;
    file.discard().await;
    result
}

async fn put_staged(st: &AppState, folder: &str, file: &StagedFile) -> anyhow::Result<StoredObject> {
    let body = tokio::fs::read(&file.path)
        .await
        .with_context(|| format!("read staged file {}", file.path.display()))?;

    let ext = ext_from_mime(&file.content_type).unwrap_or("bin");
    let key = format!("{}/{}.{}", folder, Uuid::new_v4(), ext);
    st.storage
        .put_object(&key, Bytes::from(body), &file.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;

    let url = st.storage.public_url(&key);
    Ok(StoredObject { key, url })
}

/// Best-effort removal of objects that ended up unreferenced.
pub async fn remove_stored(st: &AppState, objects: impl IntoIterator<Item = StoredObject>) {
    for obj in objects {
        match st.storage.delete_object(&obj.key).await {
            Ok(()) => debug!(key = %obj.key, "orphaned object removed"),
            Err(e) => warn!(error = ?e, key = %obj.key, "failed to remove orphaned object"),
        }
    }
}

/// Best-effort upload: any failure is logged and degrades to [`CoverImage::Skipped`].
pub async fn upload_optional(st: &AppState, folder: &str, file: Option<StagedFile>) -> CoverImage {
    let Some(file) = file else {
        return CoverImage::Skipped;
    };
    match upload_staged(st, folder, file).await {
        Ok(obj) => CoverImage::Uploaded(obj),
        Err(e) => {
            warn!(error = ?e, "optional upload failed; continuing without it");
            CoverImage::Skipped
        }
    }
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

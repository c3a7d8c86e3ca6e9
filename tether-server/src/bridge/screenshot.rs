//! Screenshot file placement and payload decoding

use std::path::{Component, Path, PathBuf};

use base64::Engine;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::BridgeError;

/// Resolve a caller-supplied file name under the results directory
///
/// Absolute names and `..` components are rejected so output never escapes
/// the results directory.
pub fn resolve_target(results_dir: &Path, filename: &str) -> Result<PathBuf, BridgeError> {
    let invalid = |reason: &str| BridgeError::InvalidPath {
        path: filename.to_string(),
        reason: reason.to_string(),
    };

    if filename.trim().is_empty() {
        return Err(invalid("file name is empty"));
    }

    let relative = Path::new(filename);
    let mut named = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("must be relative to the results directory"))
            }
        }
    }
    if !named {
        return Err(invalid("must name a file"));
    }

    let base = if results_dir.is_absolute() {
        results_dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(results_dir)
    };
    Ok(base.join(relative))
}

/// `x.png` -> `x-<n>.png`
pub fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}-{}", stem, n),
    };
    path.with_file_name(name)
}

/// Write `bytes` at `target`, or at the first free numbered variant
///
/// Uses `create_new` so two concurrent writers never pick the same file.
pub async fn write_unique(target: &Path, bytes: &[u8]) -> Result<PathBuf, BridgeError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut candidate = target.to_path_buf();
    let mut n = 0;
    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => {
                write_or_remove(file, &candidate, bytes).await?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                n += 1;
                candidate = numbered(target, n);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Fill a freshly created file, removing it again if the write fails
async fn write_or_remove<W>(mut file: W, path: &Path, bytes: &[u8]) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = written {
        drop(file);
        if let Err(remove_err) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %remove_err, "Failed to remove partial screenshot");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Decode the application's screenshot payload
///
/// Accepts a base64 string, a `data:` URL, or an object with a `data` field
/// holding either.
pub fn decode_payload(payload: &Value) -> Result<Vec<u8>, BridgeError> {
    let text = match payload {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("data").and_then(Value::as_str).ok_or_else(|| {
            BridgeError::Internal("screenshot reply has no data field".into())
        })?,
        other => {
            return Err(BridgeError::Internal(format!(
                "unexpected screenshot reply: {}",
                other
            )))
        }
    };

    let encoded = match text.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| BridgeError::Internal("malformed data URL".into()))?,
        None => text,
    };

    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| BridgeError::Internal(format!("screenshot data is not base64: {}", e)))
}

//! Input validation for presentation files.
//!
//! ## Why validate before queueing?
//!
//! A job that is doomed from the start (missing file, wrong extension,
//! unreadable) should fail at submission with a precise error, not minutes
//! later when it reaches the head of the queue. Uploaded file names are also
//! reduced to their last path component here, so a client-supplied name can
//! never place the stored file outside the job's working directory.

use crate::deck::DeckReader;
use crate::error::ScriptDeckError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Comma-separated list of accepted extensions, for error messages.
pub fn accepted_extensions(reader: &dyn DeckReader) -> String {
    reader
        .extensions()
        .iter()
        .map(|e| format!(".{e}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate a client-supplied file name and return the safe bare name.
pub fn sanitize_upload_name(
    file_name: &str,
    reader: &dyn DeckReader,
) -> Result<String, ScriptDeckError> {
    let bare = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if bare.is_empty() || bare == "." || bare == ".." || !reader.accepts(bare) {
        return Err(ScriptDeckError::UnsupportedFile {
            name: file_name.to_string(),
            accepted: accepted_extensions(reader),
        });
    }
    Ok(bare.to_string())
}

/// Validate a local presentation path: it must exist, be readable, and carry
/// an extension `reader` accepts.
pub fn resolve_local(path: &Path, reader: &dyn DeckReader) -> Result<PathBuf, ScriptDeckError> {
    if !path.exists() {
        return Err(ScriptDeckError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !reader.accepts(&name) {
        return Err(ScriptDeckError::UnsupportedFile {
            name,
            accepted: accepted_extensions(reader),
        });
    }

    // Check read permission by attempting to open
    match std::fs::File::open(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ScriptDeckError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(ScriptDeckError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    }

    debug!("Resolved local presentation: {}", path.display());
    Ok(path.to_path_buf())
}

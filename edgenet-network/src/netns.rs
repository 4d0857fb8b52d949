//! Named network namespace helpers.

use std::path::{Path, PathBuf};

use crate::error::{NetworkError, Result};

/// Path of the named namespace of `instance_id` under `netns_dir`.
pub fn netns_path(netns_dir: &Path, instance_id: &str) -> PathBuf {
    netns_dir.join(instance_id)
}

/// Check that `instance_id` can be used as a namespace name.
///
/// The name becomes a file under the namespace directory, so it must be a
/// single non-empty path component.
pub fn validate_name(instance_id: &str) -> Result<()> {
    let invalid = instance_id.is_empty()
        || instance_id == "."
        || instance_id == ".."
        || instance_id.contains('/')
        || instance_id.contains('\0');

    if invalid {
        return Err(NetworkError::Namespace {
            instance_id: instance_id.to_string(),
            reason: "invalid namespace name".to_string(),
        });
    }

    Ok(())
}

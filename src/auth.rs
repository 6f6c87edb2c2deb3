//! Stored session credential.
//!
//! The engine reuses a previously stored opaque token to connect without the
//! sign-in flow (which lives outside this crate). The token sits in a JSON
//! file under the platform config directory, 0600 on Unix.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Session credentials stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    /// Bearer token, also passed in the WebSocket connect query.
    pub token: String,
    /// API base URL (e.g. "http://localhost:8081")
    pub api_base: String,
    /// Display name, when the sign-in flow recorded one.
    #[serde(default)]
    pub user_name: Option<String>,
}

impl StoredCredentials {
    pub fn new(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: api_base.into(),
            user_name: None,
        }
    }
}

/// Returns the path to the session credentials file.
pub fn session_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|c| c.join("plaza/session.json"))
}

/// Load saved credentials from the default location.
/// Returns None if nothing is saved or the file is invalid.
pub fn load_credentials() -> Option<StoredCredentials> {
    load_credentials_from(&session_file_path()?)
}

pub fn load_credentials_from(path: &Path) -> Option<StoredCredentials> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Save credentials to the default location, creating the parent directory
/// and restricting permissions to 0600 on Unix.
pub fn save_credentials(creds: &StoredCredentials) -> Result<(), String> {
    let path = session_file_path().ok_or("Could not determine config directory")?;
    save_credentials_to(&path, creds)
}

pub fn save_credentials_to(path: &Path, creds: &StoredCredentials) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {e}"))?;
    }

    let contents = serde_json::to_string_pretty(creds)
        .map_err(|e| format!("Failed to serialize credentials: {e}"))?;
    std::fs::write(path, &contents).map_err(|e| format!("Failed to write session file: {e}"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, permissions)
            .map_err(|e| format!("Failed to set file permissions: {e}"))?;
    }

    Ok(())
}

/// Delete saved credentials (sign-out).
pub fn delete_credentials() -> Result<(), String> {
    let Some(path) = session_file_path() else {
        return Ok(());
    };
    if path.exists() {
        std::fs::remove_file(&path).map_err(|e| format!("Failed to delete session file: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let mut creds = StoredCredentials::new("tok-123", "http://localhost:8081");
        creds.user_name = Some("alice".into());
        save_credentials_to(&path, &creds).unwrap();

        let loaded = load_credentials_from(&path).unwrap();
        assert_eq!(loaded.token, "tok-123");
        assert_eq!(loaded.api_base, "http://localhost:8081");
        assert_eq!(loaded.user_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_missing_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"token":"t","api_base":"http://x"}"#).unwrap();

        let loaded = load_credentials_from(&path).unwrap();
        assert_eq!(loaded.token, "t");
        assert!(loaded.user_name.is_none());
    }

    #[test]
    fn test_missing_or_invalid_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_credentials_from(&dir.path().join("absent.json")).is_none());

        let path = dir.path().join("garbage.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_credentials_from(&path).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions_restricted() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        save_credentials_to(&path, &StoredCredentials::new("t", "http://x")).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_session_file_path_shape() {
        let path = session_file_path().unwrap();
        let s = path.to_string_lossy();
        assert!(s.contains("plaza"));
        assert!(s.ends_with("session.json"));
    }
}

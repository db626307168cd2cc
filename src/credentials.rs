//! Secret storage for account passwords and OAuth2 refresh tokens.
//!
//! Lookup order: environment variable (passwords only), OS keyring, then a
//! per-account file in the config directory created with mode 0600.

use anyhow::Result;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const KEYRING_SERVICE: &str = "mailsync";
const ENV_PASSWORD: &str = "MAILSYNC_PASSWORD";

pub struct CredentialStore {
    email: String,
    config_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(email: &str) -> Self {
        let config_dir = crate::config::Config::config_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_dir(email, config_dir)
    }

    pub fn with_dir(email: &str, config_dir: PathBuf) -> Self {
        Self {
            email: email.to_string(),
            config_dir,
        }
    }

    fn safe_email(&self) -> String {
        self.email.replace(['@', '.', '/', '\\', ':'], "_")
    }

    fn password_file(&self) -> PathBuf {
        self.config_dir.join(format!(".password_{}", self.safe_email()))
    }

    fn oauth2_token_file(&self) -> PathBuf {
        self.config_dir.join(format!(".oauth2_{}", self.safe_email()))
    }

    fn keyring_get(&self, key: &str) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key).ok()?;
        entry.get_password().ok()
    }

    /// Store in the keyring and read it back. Returns false if the keyring is unusable.
    fn keyring_set(&self, key: &str, secret: &str) -> bool {
        let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, key) else {
            return false;
        };
        entry.set_password(secret).is_ok() && self.keyring_get(key).is_some()
    }

    pub fn get_password(&self) -> Result<String> {
        if let Ok(pwd) = env::var(ENV_PASSWORD) {
            return Ok(pwd);
        }
        if let Some(pwd) = self.keyring_get(&format!("password:{}", self.email)) {
            return Ok(pwd);
        }
        if let Some(pwd) = read_secret_file(&self.password_file()) {
            return Ok(pwd);
        }
        anyhow::bail!(
            "Password for {} not found. Set {} or store it in the keyring.",
            self.email,
            ENV_PASSWORD
        )
    }

    pub fn set_password(&self, password: &str) -> Result<()> {
        if self.keyring_set(&format!("password:{}", self.email), password) {
            return Ok(());
        }
        tracing::warn!("Keyring unavailable, storing password for {} in a file", self.email);
        write_secret_file(&self.password_file(), password)
    }

    pub fn get_oauth2_refresh_token(&self) -> Result<String> {
        if let Some(token) = self.keyring_get(&format!("oauth2:{}", self.email)) {
            return Ok(token);
        }
        if let Some(token) = read_secret_file(&self.oauth2_token_file()) {
            return Ok(token);
        }
        anyhow::bail!("OAuth2 refresh token not found for {}", self.email)
    }

    /// Providers may rotate refresh tokens on every exchange.
    pub fn set_oauth2_refresh_token(&self, refresh_token: &str) -> Result<()> {
        if self.keyring_set(&format!("oauth2:{}", self.email), refresh_token) {
            return Ok(());
        }
        write_secret_file(&self.oauth2_token_file(), refresh_token)
    }

    pub fn has_credentials(&self) -> bool {
        env::var(ENV_PASSWORD).is_ok()
            || self.keyring_get(&format!("password:{}", self.email)).is_some()
            || self.keyring_get(&format!("oauth2:{}", self.email)).is_some()
            || read_secret_file(&self.password_file()).is_some()
            || read_secret_file(&self.oauth2_token_file()).is_some()
    }
}

fn read_secret_file(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Create the file with restricted permissions atomically to avoid TOCTOU.
fn write_secret_file(path: &Path, secret: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(secret.as_bytes())?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, secret)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to prevent parallel test interference with env vars
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn temp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("mailsync-cred-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_env_password_wins() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe { env::set_var(ENV_PASSWORD, "test123") };
        let store = CredentialStore::with_dir("test@example.com", temp_dir("env"));
        assert!(store.has_credentials());
        assert_eq!(store.get_password().unwrap(), "test123");
        unsafe { env::remove_var(ENV_PASSWORD) };
    }

    #[test]
    fn test_secret_file_round_trip() {
        let dir = temp_dir("file");
        let path = dir.join(".oauth2_me_example_com");
        write_secret_file(&path, "refresh-token\n").unwrap();
        assert_eq!(read_secret_file(&path).as_deref(), Some("refresh-token"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_email_specific_files() {
        let a = CredentialStore::with_dir("user1@example.com", PathBuf::from("/tmp"));
        let b = CredentialStore::with_dir("user2@example.com", PathBuf::from("/tmp"));
        assert_ne!(a.password_file(), b.password_file());
        assert_ne!(a.password_file(), a.oauth2_token_file());
    }
}

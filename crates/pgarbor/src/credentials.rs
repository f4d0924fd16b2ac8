//! Password storage via the OS keychain.
//!
//! Passwords are keyed by `user@host:port`, so every database on the same
//! server shares one stored credential.

use anyhow::{anyhow, Context, Result};

/// Default service name for keyring storage
pub const KEYRING_SERVICE: &str = "pgarbor";

/// A source of passwords for the connection registry.
///
/// The registry only ever reads; writing and deleting stay on the concrete
/// store. Implemented by [`CredentialStore`] for the OS keychain and by
/// in-memory maps in tests.
pub trait Credentials: Send + Sync {
    /// Look up the password for a `user@host:port` identifier.
    ///
    /// Returns `Ok(None)` when no password is stored; `Err` means the
    /// backend itself failed.
    fn get(&self, identifier: &str) -> Result<Option<String>>;
}

/// Access to the OS keychain, scoped to one service name.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    service: String,
}

impl CredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, identifier: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, identifier).context("Failed to create keyring entry")
    }

    /// Store the password for an identifier, replacing any previous one.
    pub fn set(&self, identifier: &str, password: &str) -> Result<()> {
        self.entry(identifier)?
            .set_password(password)
            .context("Failed to store password in keychain")?;

        Ok(())
    }

    /// Delete the stored password. An absent entry is not an error.
    pub fn delete(&self, identifier: &str) -> Result<()> {
        match self.entry(identifier)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow!("Failed to delete password from keychain: {}", e)),
        }
    }

    /// Get the password with a timeout.
    ///
    /// On macOS, keychain access can block indefinitely if the system shows
    /// a permission dialog. This spawns the keychain access in a separate
    /// thread with a short timeout so a caller never hangs on it; a timeout
    /// reads as "no password available".
    pub fn get_with_timeout(&self, identifier: &str, timeout_ms: u64) -> Result<Option<String>> {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let service = self.service.clone();
        let identifier = identifier.to_string();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let result = (|| -> Result<Option<String>> {
                let entry = keyring::Entry::new(&service, &identifier)
                    .context("Failed to create keyring entry")?;

                match entry.get_password() {
                    Ok(password) => Ok(Some(password)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => Err(anyhow!("Failed to get password from keychain: {}", e)),
                }
            })();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl Credentials for CredentialStore {
    fn get(&self, identifier: &str) -> Result<Option<String>> {
        match self.entry(identifier)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow!("Failed to get password from keychain: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service() {
        let store = CredentialStore::default();
        assert_eq!(store.service, KEYRING_SERVICE);
    }

    /// Keychain round-trip - run with --ignored flag.
    /// This test actually writes to the system keychain.
    #[test]
    #[ignore] // Ignored by default because it modifies system keychain
    fn test_keychain_set_get_delete() {
        let store = CredentialStore::new("pgarbor-keychain-test");
        let identifier = "testuser@localhost:5432";
        let password = "test-secret-password-123";

        store.set(identifier, password).unwrap();
        assert_eq!(store.get(identifier).unwrap().as_deref(), Some(password));

        store.delete(identifier).unwrap();
        assert!(store.get(identifier).unwrap().is_none());

        // Deleting again must stay quiet.
        store.delete(identifier).unwrap();
    }

    /// Timeout-guarded read against the real keychain - run with --ignored.
    #[test]
    #[ignore]
    fn test_keychain_get_with_timeout() {
        let store = CredentialStore::new("pgarbor-keychain-test");
        let identifier = "timeout-user@localhost:5432";

        store.set(identifier, "pw").unwrap();
        let found = store.get_with_timeout(identifier, 2000).unwrap();
        assert_eq!(found.as_deref(), Some("pw"));

        let _ = store.delete(identifier);
    }
}

//! Keystore Facade: append-and-lookup of *(tag -> host, port, public key)*
//! entries used to resolve outbound connections. The encryption of the
//! on-disk format is out of scope; this only covers the consumed
//! append/lookup shape, backed by a directory descriptor per SPEC_FULL
//! §4.8, owner-only permissions. Only one call site (`netbridge::main`'s
//! `keystore` subcommand and the outbound-resolve path) ever opens one per
//! process; the type itself carries no `Clone`, so a second handle can
//! only exist by calling `open` again against the same directory, which is
//! a harmless, idempotent filesystem operation.
//!
//! Shaped after a `SecureStorage`-style trait (`set`/`get`/`delete`/`has`),
//! adapted here from an OS-keychain backend to a plain directory-of-files
//! backend: one JSON file per tag under the keystore root.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KeystoreError, KeystoreResult};

/// One registered outbound target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeystoreEntry {
    pub host: String,
    pub port: u16,
    /// Public key material; opaque here, the wire-protocol layer
    /// interprets it.
    pub pubkey: Vec<u8>,
}

/// Directory-descriptor-backed keystore.
pub struct Keystore {
    root: PathBuf,
}

impl Keystore {
    /// Open (creating if missing) the keystore rooted at `root`, with
    /// owner-only permissions.
    pub fn open(root: &Path) -> KeystoreResult<Self> {
        fs::create_dir_all(root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn entry_path(&self, tag: &str) -> PathBuf {
        self.root.join(format!("{tag}.json"))
    }

    /// `lookup(tag) -> (host, port, pubkey)?`
    pub fn lookup(&self, tag: &str) -> KeystoreResult<Option<KeystoreEntry>> {
        let path = self.entry_path(tag);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let entry: KeystoreEntry = serde_json::from_str(&content)
            .map_err(|e| KeystoreError::InvalidEntry(tag.to_string(), e.to_string()))?;
        Ok(Some(entry))
    }

    /// `register(tag, host, port)`. A registration failure here must
    /// propagate as a hard error to the caller (resolves the "silently
    /// ignored return value" open question in SPEC_FULL §9): callers are
    /// expected to turn `Err` into a non-zero process exit with a
    /// diagnostic, never to swallow it.
    pub fn register(&self, tag: &str, host: &str, port: u16, pubkey: Vec<u8>) -> KeystoreResult<()> {
        let entry = KeystoreEntry {
            host: host.to_string(),
            port,
            pubkey,
        };
        let content = serde_json::to_string_pretty(&entry)?;
        let path = self.entry_path(tag);
        fs::write(&path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// Split `[tag@]host` into an optional keystore tag and the remaining
/// host string, per the outbound positional CLI form (SPEC_FULL §6).
pub fn split_tag(target: &str) -> (Option<&str>, &str) {
    match target.split_once('@') {
        Some((tag, host)) => (Some(tag), host),
        None => (None, target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tag_extracts_tag_before_at() {
        assert_eq!(split_tag("alice@example.com"), (Some("alice"), "example.com"));
        assert_eq!(split_tag("example.com"), (None, "example.com"));
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path()).unwrap();
        ks.register("alice", "example.com", 6680, vec![1, 2, 3]).unwrap();

        let entry = ks.lookup("alice").unwrap().unwrap();
        assert_eq!(entry.host, "example.com");
        assert_eq!(entry.port, 6680);
        assert_eq!(entry.pubkey, vec![1, 2, 3]);
    }

    #[test]
    fn lookup_missing_tag_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path()).unwrap();
        assert!(ks.lookup("nobody").unwrap().is_none());
    }

    #[test]
    fn open_creates_owner_only_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("keystore");
        let _ks = Keystore::open(&root).unwrap();
        assert!(root.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&root).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn register_overwrites_existing_entry_for_same_tag() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path()).unwrap();
        ks.register("alice", "first.example.com", 1, vec![]).unwrap();
        ks.register("alice", "second.example.com", 2, vec![9]).unwrap();

        let entry = ks.lookup("alice").unwrap().unwrap();
        assert_eq!(entry.host, "second.example.com");
        assert_eq!(entry.port, 2);
    }
}

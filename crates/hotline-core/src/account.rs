//! Persistent accounts.
//!
//! Each account lives in its own `Users/<login>.yaml` file and is
//! written back eagerly on every mutation. Passwords are stored as
//! bcrypt hashes; the wire carries the plaintext bitwise-complemented.

use crate::access::{perm, AccessBitmap};
use crate::error::{Error, Result};
use crate::protocol::negate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A persistent identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Login name; doubles as the file stem under `Users/`.
    pub login: String,
    /// Display name.
    pub name: String,
    /// bcrypt hash of the password.
    pub password: String,
    /// Permission set.
    pub access: AccessBitmap,
}

impl Account {
    /// Create an account, hashing `password` with bcrypt.
    pub fn new(login: &str, name: &str, password: &str, access: AccessBitmap) -> Result<Self> {
        Ok(Self {
            login: login.to_string(),
            name: name.to_string(),
            password: hash_password(password)?,
            access,
        })
    }

    /// Verify wire-obfuscated credentials: the bytes are complemented
    /// back to plaintext and checked against the stored bcrypt hash.
    pub fn verify_wire_password(&self, wire: &[u8]) -> bool {
        let plain = negate(wire);
        bcrypt::verify(plain, &self.password).unwrap_or(false)
    }
}

/// Hash a plaintext password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| Error::Storage(e.to_string()))
}

/// Directory-backed account store.
pub struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The backing file for `login`.
    pub fn path_for(&self, login: &str) -> PathBuf {
        // Logins become file stems; path metacharacters are stripped so
        // a hostile login cannot escape the directory.
        let safe: String = login
            .chars()
            .filter(|c| !matches!(c, '/' | '\\' | '.' | '\0'))
            .collect();
        self.dir.join(format!("{}.yaml", safe))
    }

    /// Load every account file in the directory. Unreadable files are
    /// logged and skipped.
    pub fn load_all(&self) -> Result<HashMap<String, Account>> {
        let mut accounts = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != "yaml").unwrap_or(true) {
                continue;
            }
            match read_account(&path) {
                Ok(account) => {
                    accounts.insert(account.login.clone(), account);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable account file");
                }
            }
        }
        Ok(accounts)
    }

    /// Write `account` to its file.
    pub fn save(&self, account: &Account) -> Result<()> {
        let yaml = serde_yaml::to_string(account)?;
        fs::write(self.path_for(&account.login), yaml)?;
        Ok(())
    }

    /// Remove the backing file for `login`.
    pub fn delete(&self, login: &str) -> Result<()> {
        fs::remove_file(self.path_for(login))?;
        Ok(())
    }
}

fn read_account(path: &Path) -> Result<Account> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

/// Seed a fresh store with the stock `admin` and `guest` accounts.
pub fn seed_defaults(store: &AccountStore) -> Result<HashMap<String, Account>> {
    let admin = Account::new("admin", "Administrator", "admin", AccessBitmap::all())?;
    let guest = Account::new(
        "guest",
        "Guest",
        "",
        AccessBitmap::with_bits(&[
            perm::READ_CHAT,
            perm::SEND_CHAT,
            perm::NEWS_READ_ART,
            perm::DOWNLOAD_FILE,
        ]),
    )?;
    store.save(&admin)?;
    store.save(&guest)?;
    let mut map = HashMap::new();
    map.insert(admin.login.clone(), admin);
    map.insert(guest.login.clone(), guest);
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(dir.path()).expect("open");
        let account =
            Account::new("guest", "Guest", "password", AccessBitmap::with_bits(&[perm::READ_CHAT]))
                .expect("account");
        store.save(&account).expect("save");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["guest"], account);
    }

    #[test]
    fn test_wire_password_verification() {
        let account =
            Account::new("guest", "Guest", "password", AccessBitmap::none()).expect("account");
        assert!(account.verify_wire_password(&negate(b"password")));
        assert!(!account.verify_wire_password(&negate(b"wrong")));
        // Raw plaintext on the wire must fail: the server complements
        // whatever it receives before verifying.
        assert!(!account.verify_wire_password(b"password"));
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(dir.path()).expect("open");
        let account = Account::new("temp", "Temp", "x", AccessBitmap::none()).expect("account");
        store.save(&account).expect("save");
        assert!(store.path_for("temp").exists());
        store.delete("temp").expect("delete");
        assert!(!store.path_for("temp").exists());
    }

    #[test]
    fn test_login_cannot_escape_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(dir.path()).expect("open");
        let path = store.path_for("../../etc/passwd");
        assert!(path.starts_with(dir.path()));
    }

    #[test]
    fn test_seed_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(dir.path()).expect("open");
        let accounts = seed_defaults(&store).expect("seed");
        assert!(accounts["admin"].access.has(perm::DISCON_USER));
        assert!(accounts["guest"].access.has(perm::READ_CHAT));
        assert!(!accounts["guest"].access.has(perm::DELETE_USER));
    }
}

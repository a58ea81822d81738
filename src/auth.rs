//! The two-tier authentication cache.
//!
//! The slow KDF (bcrypt) of a password is the only form in which a secret is
//! ever stored in the metadata document. Verifying it on every request is
//! expensive, so each client keeps an in-memory cache per username: a fresh
//! random salt and SHA-256(salt || password), together with the bcrypt hash
//! the entry was derived from. The fast hash is never persisted, and an
//! entry is only trusted while the user's stored bcrypt hash still matches
//! the one recorded in it.

use crate::data::UserInfo;

use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;

/// The number of bytes used for cache salts.
pub const SALT_LENGTH: usize = 32;

/// The bcrypt work factor for new password hashes. Lowered under test to
/// keep the suite fast.
#[cfg(not(test))]
pub const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
pub const BCRYPT_COST: u32 = 4;

/// A cached fast-hash entry for one user.
#[derive(Clone)]
struct AuthUser {
    /// The bcrypt hash the entry was derived from.
    bhash: String,
    /// The per-entry random salt.
    salt: [u8; SALT_LENGTH],
    /// SHA-256(salt || password).
    hash: Vec<u8>,
}

/// A per-username cache of fast password hashes.
#[derive(Default)]
pub struct AuthCache {
    users: HashMap<String, AuthUser>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the cached fast hash verifies the password. A miss
    /// says nothing about the password; the caller falls through to the
    /// slow KDF.
    pub fn verify(&self, name: &str, password: &str) -> bool {
        match self.users.get(name) {
            Some(entry) => hash_with_salt(&entry.salt, password) == entry.hash,
            None => false,
        }
    }

    /// Caches a fast hash for a password that was just verified against the
    /// given bcrypt hash, under a fresh salt.
    pub fn store(&mut self, name: &str, password: &str, bhash: &str) {
        let mut salt = [0u8; SALT_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let hash = hash_with_salt(&salt, password);
        self.users.insert(name.into(), AuthUser { bhash: bhash.into(), salt, hash });
    }

    /// Evicts a user's entry, e.g. on password change or user removal.
    pub fn evict(&mut self, name: &str) {
        self.users.remove(name);
    }

    /// Drops entries for users that no longer exist or whose stored bcrypt
    /// hash has changed. Called after installing a new snapshot.
    pub fn retain_current(&mut self, users: &[UserInfo]) {
        self.users.retain(|name, entry| {
            users.iter().any(|u| &u.name == name && u.hash == entry.bhash)
        });
    }
}

/// Returns SHA-256(salt || password).
fn hash_with_salt(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

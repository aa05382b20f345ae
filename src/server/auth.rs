//! Remote console authentication
//!
//! Keys are named credentials carrying an access level. Passwords are kept
//! as salted SHA-256 digests. Key slots are never reused, so a [`KeyId`]
//! held by a logged-in client stays valid until that client is logged out.

use rand::Rng;
use ring::digest::{Context, SHA256};

pub const DEFAULT_ADMIN: &str = "default_admin";
pub const DEFAULT_MODERATOR: &str = "default_mod";
pub const DEFAULT_HELPER: &str = "default_helper";

pub type KeyId = usize;

/// Console access level, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthLevel {
    None,
    Helper,
    Moderator,
    Admin,
}

impl AuthLevel {
    pub fn name(&self) -> &'static str {
        match self {
            AuthLevel::None => "none",
            AuthLevel::Helper => "helper",
            AuthLevel::Moderator => "moderator",
            AuthLevel::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" | "3" => Some(AuthLevel::Admin),
            "mod" | "moderator" | "2" => Some(AuthLevel::Moderator),
            "helper" | "1" => Some(AuthLevel::Helper),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("ident already exists: {0}")]
    DuplicateIdent(String),
    #[error("ident does not exist: {0}")]
    UnknownIdent(String),
    #[error("invalid ident: '{0}'")]
    InvalidIdent(String),
    #[error("invalid level")]
    InvalidLevel,
}

#[derive(Debug, Clone)]
struct AuthKey {
    ident: String,
    salt: [u8; 16],
    digest: [u8; 32],
    level: AuthLevel,
}

impl AuthKey {
    fn new(ident: &str, password: &str, level: AuthLevel) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill(&mut salt);
        Self {
            ident: ident.to_string(),
            salt,
            digest: hash_password(&salt, password),
            level,
        }
    }

    fn matches(&self, password: &str) -> bool {
        hash_password(&self.salt, password) == self.digest
    }
}

fn hash_password(salt: &[u8; 16], password: &str) -> [u8; 32] {
    let mut ctx = Context::new(&SHA256);
    ctx.update(salt);
    ctx.update(password.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

fn is_default_ident(ident: &str) -> bool {
    matches!(ident, DEFAULT_ADMIN | DEFAULT_MODERATOR | DEFAULT_HELPER)
}

/// In-memory key store
#[derive(Debug, Default)]
pub struct AuthManager {
    keys: Vec<Option<AuthKey>>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the default keys for every non-empty password
    pub fn with_default_passwords(admin: &str, moderator: &str, helper: &str) -> Self {
        let mut manager = Self::new();
        for (ident, password, level) in [
            (DEFAULT_ADMIN, admin, AuthLevel::Admin),
            (DEFAULT_MODERATOR, moderator, AuthLevel::Moderator),
            (DEFAULT_HELPER, helper, AuthLevel::Helper),
        ] {
            if !password.is_empty() {
                manager.keys.push(Some(AuthKey::new(ident, password, level)));
            }
        }
        manager
    }

    pub fn add_key(&mut self, ident: &str, password: &str, level: AuthLevel) -> Result<KeyId, AuthError> {
        if ident.is_empty() || ident.chars().any(char::is_whitespace) {
            return Err(AuthError::InvalidIdent(ident.to_string()));
        }
        if level == AuthLevel::None {
            return Err(AuthError::InvalidLevel);
        }
        if self.find_key(ident).is_some() {
            return Err(AuthError::DuplicateIdent(ident.to_string()));
        }
        self.keys.push(Some(AuthKey::new(ident, password, level)));
        Ok(self.keys.len() - 1)
    }

    pub fn update_key(&mut self, ident: &str, password: &str, level: AuthLevel) -> Result<KeyId, AuthError> {
        if level == AuthLevel::None {
            return Err(AuthError::InvalidLevel);
        }
        let id = self
            .find_key(ident)
            .ok_or_else(|| AuthError::UnknownIdent(ident.to_string()))?;
        self.keys[id] = Some(AuthKey::new(ident, password, level));
        Ok(id)
    }

    pub fn remove_key(&mut self, ident: &str) -> Result<KeyId, AuthError> {
        let id = self
            .find_key(ident)
            .ok_or_else(|| AuthError::UnknownIdent(ident.to_string()))?;
        self.keys[id] = None;
        Ok(id)
    }

    pub fn find_key(&self, ident: &str) -> Option<KeyId> {
        self.keys
            .iter()
            .position(|key| key.as_ref().is_some_and(|key| key.ident == ident))
    }

    pub fn check_key(&self, id: KeyId, password: &str) -> bool {
        self.key(id).is_some_and(|key| key.matches(password))
    }

    pub fn default_key(&self, level: AuthLevel) -> Option<KeyId> {
        let ident = match level {
            AuthLevel::Admin => DEFAULT_ADMIN,
            AuthLevel::Moderator => DEFAULT_MODERATOR,
            AuthLevel::Helper => DEFAULT_HELPER,
            AuthLevel::None => return None,
        };
        self.find_key(ident)
    }

    pub fn key_level(&self, id: KeyId) -> AuthLevel {
        self.key(id).map_or(AuthLevel::None, |key| key.level)
    }

    pub fn key_ident(&self, id: KeyId) -> Option<&str> {
        self.key(id).map(|key| key.ident.as_str())
    }

    /// Clients must send a username when named keys exist
    pub fn username_required(&self) -> bool {
        self.keys
            .iter()
            .flatten()
            .any(|key| !is_default_ident(&key.ident))
    }

    /// `(ident, level)` of every key
    pub fn list(&self) -> Vec<(String, AuthLevel)> {
        self.keys
            .iter()
            .flatten()
            .map(|key| (key.ident.clone(), key.level))
            .collect()
    }

    fn key(&self, id: KeyId) -> Option<&AuthKey> {
        self.keys.get(id).and_then(Option::as_ref)
    }
}

//! Whitelist-based authorization for booting the backend

use crate::config::WhitelistConfig;
use crate::error::{GateError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;
use uuid::Uuid;

/// A player as identified by the login start packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub name: String,
    pub uuid: Option<Uuid>,
}

impl PlayerIdentity {
    pub fn new(name: &str, uuid: Option<Uuid>) -> Self {
        Self {
            name: name.to_string(),
            uuid,
        }
    }
}

impl std::fmt::Display for PlayerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.uuid {
            Some(uuid) => write!(f, "{} ({})", self.name, uuid),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One entry of a server `whitelist.json`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MembershipEntry {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl MembershipEntry {
    /// Entries carrying a uuid match on uuid when the player sent one;
    /// everything else falls back to a case-insensitive name match.
    pub fn matches(&self, identity: &PlayerIdentity) -> bool {
        if let (Some(player_uuid), Some(entry_uuid)) = (identity.uuid, self.uuid.as_deref()) {
            return Uuid::parse_str(entry_uuid.trim())
                .map(|u| u == player_uuid)
                .unwrap_or(false);
        }
        self.name
            .as_deref()
            .map(|name| name.eq_ignore_ascii_case(&identity.name))
            .unwrap_or(false)
    }
}

/// The membership file on disk
#[derive(Debug, Clone)]
pub struct Whitelist {
    path: PathBuf,
}

impl Whitelist {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the current contents
    pub async fn load(&self) -> Result<Vec<MembershipEntry>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| GateError::WhitelistUnreadable {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_str(&content).map_err(|source| GateError::WhitelistInvalid {
            path: self.path.clone(),
            source,
        })
    }
}

/// Decides whether a player may trigger a backend start
#[derive(Debug, Clone)]
pub struct Authorizer {
    /// `None` when whitelisting is disabled
    whitelist: Option<Whitelist>,
}

impl Authorizer {
    /// Authorizer that lets everyone boot the backend
    pub fn open() -> Self {
        Self { whitelist: None }
    }

    pub fn with_whitelist(whitelist: Whitelist) -> Self {
        Self {
            whitelist: Some(whitelist),
        }
    }

    pub fn from_config(config: &WhitelistConfig) -> Self {
        if config.enabled {
            Self::with_whitelist(Whitelist::new(&config.path))
        } else {
            Self::open()
        }
    }

    pub fn enabled(&self) -> bool {
        self.whitelist.is_some()
    }

    /// Pure decision over the given membership list
    pub fn is_authorized(&self, identity: &PlayerIdentity, members: &[MembershipEntry]) -> bool {
        if !self.enabled() {
            return true;
        }
        members.iter().any(|entry| entry.matches(identity))
    }

    /// Decision against the membership file as it is right now. An unreadable
    /// file denies.
    pub async fn authorize(&self, identity: &PlayerIdentity) -> bool {
        let Some(whitelist) = &self.whitelist else {
            return true;
        };
        match whitelist.load().await {
            Ok(members) => self.is_authorized(identity, &members),
            Err(e) => {
                error!(player = %identity, error = %e, "Failed to read whitelist, denying");
                false
            }
        }
    }
}

use std::fmt;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::model::{Identity, Role};

/// A known user: identity plus the details notifications need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub role: Role,
    pub name: String,
    pub email: String,
    /// Charged per completed booking; providers only.
    #[serde(default)]
    pub consultation_fee: Option<u32>,
}

impl Member {
    pub fn identity(&self) -> Identity {
        Identity::new(self.id, self.role)
    }
}

/// Read side of the identity context: who exists and in what role.
pub trait Directory: Send + Sync {
    fn lookup(&self, id: &Ulid) -> Option<Member>;

    /// All members holding `role`, in no particular order.
    fn members(&self, role: Role) -> Vec<Member>;

    fn is_provider(&self, id: &Ulid) -> bool {
        self.lookup(id).is_some_and(|m| m.role == Role::Provider)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingCredential,
    UnknownCredential,
    /// The credential maps to a member that no longer exists.
    Revoked(Ulid),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingCredential => write!(f, "missing credential"),
            AuthError::UnknownCredential => write!(f, "unknown credential"),
            AuthError::Revoked(id) => write!(f, "credential revoked for member {id}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Credential verification. Issuing credentials happens elsewhere.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Entry of the JSON member file.
#[derive(Debug, Clone, Deserialize)]
struct MemberRecord {
    #[serde(flatten)]
    member: Member,
    #[serde(default)]
    credential: Option<String>,
}

/// In-memory directory and bearer-credential authenticator.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    members: DashMap<Ulid, Member>,
    credentials: DashMap<String, Ulid>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load members from a JSON array of
    /// `{id, role, name, email, consultation_fee?, credential?}`.
    pub fn load_json(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<MemberRecord> = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let registry = Self::new();
        for record in records {
            registry.register(record.member, record.credential);
        }
        info!("loaded {} members from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn register(&self, member: Member, credential: Option<String>) {
        if let Some(credential) = credential {
            self.credentials.insert(credential, member.id);
        }
        self.members.insert(member.id, member);
    }

    pub fn remove(&self, id: &Ulid) -> Option<Member> {
        self.members.remove(id).map(|(_, m)| m)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Directory for MemberRegistry {
    fn lookup(&self, id: &Ulid) -> Option<Member> {
        self.members.get(id).map(|e| e.value().clone())
    }

    fn members(&self, role: Role) -> Vec<Member> {
        self.members
            .iter()
            .filter(|e| e.value().role == role)
            .map(|e| e.value().clone())
            .collect()
    }
}

#[async_trait]
impl Authenticator for MemberRegistry {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        let id = self
            .credentials
            .get(credential)
            .map(|e| *e.value())
            .ok_or(AuthError::UnknownCredential)?;
        self.lookup(&id)
            .map(|m| m.identity())
            .ok_or(AuthError::Revoked(id))
    }
}

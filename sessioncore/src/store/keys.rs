//! Storage key layout.
//!
//! Credentials live under `creds/{session}/{category}/{id}`, liveness records
//! under `liveness/{identity}`. The two trees never overlap, so rotating or
//! clearing credentials cannot touch heartbeat bookkeeping.

use std::fmt;

pub const ROOT_CATEGORY: &str = "creds";
pub const ROOT_ID: &str = "root";

const CREDENTIALS_TREE: &str = "creds";
const LIVENESS_TREE: &str = "liveness";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub session_id: String,
    pub category: String,
    pub id: String,
}

impl CredentialKey {
    pub fn new(
        session_id: impl Into<String>,
        category: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            category: category.into(),
            id: id.into(),
        }
    }

    /// The key holding the root credential blob of a session.
    pub fn root(session_id: impl Into<String>) -> Self {
        Self::new(session_id, ROOT_CATEGORY, ROOT_ID)
    }

    pub fn storage_key(&self) -> String {
        format!(
            "{}{}/{}",
            session_prefix(&self.session_id),
            escape(&self.category),
            escape(&self.id)
        )
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Prefix shared by every credential key of `session_id`.
pub fn session_prefix(session_id: &str) -> String {
    format!("{CREDENTIALS_TREE}/{}/", escape(session_id))
}

pub fn liveness_key(identity: &str) -> String {
    format!("{LIVENESS_TREE}/{}", escape(identity))
}

fn escape(component: &str) -> String {
    component.replace('%', "%25").replace('/', "%2F")
}

use crate::store::error::{Result, StoreError};
use crate::types::Identity;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Root credential blob of a session: key material plus whatever opaque
/// fields the transport library chooses to store alongside it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    pub registration_id: u32,
    #[serde(with = "hex_key")]
    pub noise_key: [u8; 32],
    #[serde(with = "hex_key")]
    pub identity_key: [u8; 32],
    #[serde(with = "hex_key")]
    pub adv_secret_key: [u8; 32],
    #[serde(default)]
    pub me: Option<Identity>,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("registration_id", &self.registration_id)
            .field("me", &self.me)
            .field("registered", &self.registered)
            .field("version", &self.version)
            .field("extra_fields", &self.extra.len())
            .finish_non_exhaustive()
    }
}

impl SessionCredentials {
    /// Fresh, unregistered identity material.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut noise_key = [0u8; 32];
        let mut identity_key = [0u8; 32];
        let mut adv_secret_key = [0u8; 32];
        rng.fill_bytes(&mut noise_key);
        rng.fill_bytes(&mut identity_key);
        rng.fill_bytes(&mut adv_secret_key);

        Self {
            registration_id: (rng.next_u32() & 0x3fff) + 1,
            noise_key,
            identity_key,
            adv_secret_key,
            me: None,
            registered: false,
            version: 0,
            extra: Map::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Merges a partial update into the blob. Fields present in `patch`
    /// overwrite the current value; the result is validated by
    /// re-deserializing, so a malformed patch leaves `self` untouched.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let mut value = serde_json::to_value(&*self)?;
        let Value::Object(fields) = &mut value else {
            return Err(StoreError::Serialization(
                "credentials did not serialize to an object".to_string(),
            ));
        };
        for (key, field) in patch {
            fields.insert(key.clone(), field.clone());
        }
        let mut updated: SessionCredentials = serde_json::from_value(value)?;
        updated.version = self.version + 1;
        *self = updated;
        Ok(())
    }
}

/// A change to one versioned sub-record, addressed by `(category, id)`.
/// `value: None` deletes the record.
#[derive(Clone, PartialEq)]
pub struct KeyMutation {
    pub category: String,
    pub id: String,
    pub value: Option<Vec<u8>>,
}

impl fmt::Debug for KeyMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMutation")
            .field("category", &self.category)
            .field("id", &self.id)
            .field("len", &self.value.as_ref().map(Vec::len))
            .finish()
    }
}

/// Credential rotation reported by the transport. `revision` is echoed back
/// to the transport once the change is durable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialUpdate {
    pub revision: u64,
    pub root: Option<Map<String, Value>>,
    pub keys: Vec<KeyMutation>,
}

impl CredentialUpdate {
    pub fn is_empty(&self) -> bool {
        self.root.as_ref().is_none_or(Map::is_empty) && self.keys.is_empty()
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut key = [0u8; 32];
        hex::decode_to_slice(&s, &mut key).map_err(D::Error::custom)?;
        Ok(key)
    }
}

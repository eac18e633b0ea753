//! API keys for agents and scripts. Only a SHA-256 of the key is stored; the
//! plaintext is returned once, at creation.

use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::data::{unix_secs, ApiKeyRow, Storage};

pub const HEADER: &str = "x-api-key";

const PREFIX: &str = "cg_";

#[derive(Debug, Clone)]
pub struct NewKey<'a> {
    pub uid: &'a str,
    pub name: &'a str,
    pub allowed_tools: &'a [String],
    pub credit_limit: Option<i64>,
}

#[must_use]
pub fn hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn generate() -> String {
    format!("{PREFIX}{}{}", cuid2::create_id(), cuid2::create_id())
}

/// Creates a key. Returns the stored row and the plaintext key.
pub async fn create(
    storage: &Storage,
    new: &NewKey<'_>,
) -> anyhow::Result<(ApiKeyRow, String)> {
    anyhow::ensure!(!new.name.trim().is_empty(), "Key name must not be empty.");
    if let Some(limit) = new.credit_limit {
        anyhow::ensure!(limit > 0, "Credit limit must be positive: {limit}");
    }
    let plaintext = generate();
    let row = ApiKeyRow {
        id: cuid2::create_id(),
        uid: new.uid.to_string(),
        name: new.name.trim().to_string(),
        key_hash: hash(&plaintext),
        prefix: plaintext.chars().take(PREFIX.len() + 6).collect(),
        allowed_tools: serde_json::to_string(new.allowed_tools)?,
        credit_limit: new.credit_limit,
        credits_spent: 0,
        revoked: false,
        created_at: unix_secs(SystemTime::now())?,
        last_used_at: None,
    };
    storage.insert_api_key(&row).await?;
    tracing::info!(uid = row.uid, key_id = row.id, "API key created.");
    Ok((row, plaintext))
}

/// Looks up a live key by its plaintext.
pub async fn authenticate(
    storage: &Storage,
    plaintext: &str,
) -> anyhow::Result<Option<ApiKeyRow>> {
    if !plaintext.starts_with(PREFIX) {
        return Ok(None);
    }
    storage.api_key_by_hash(&hash(plaintext)).await
}

#[cfg(test)]
mod tests {
    use crate::data::tests::storage;

    use super::*;

    #[test]
    fn keys_are_distinct_and_prefixed() {
        let a = generate();
        let b = generate();
        assert!(a.starts_with(PREFIX));
        assert_ne!(a, b);
        assert_ne!(hash(&a), hash(&b));
        assert_eq!(hash(&a).len(), 64);
    }

    #[tokio::test]
    async fn create_authenticate_revoke() {
        let (_dir, storage) = storage().await;
        let tools = vec!["flux-schnell".to_string()];
        let (row, plaintext) = create(
            &storage,
            &NewKey {
                uid: "alice",
                name: " agent ",
                allowed_tools: &tools,
                credit_limit: Some(50),
            },
        )
        .await
        .unwrap();
        assert_eq!(row.name, "agent");
        assert!(plaintext.starts_with(&row.prefix));
        assert_ne!(row.key_hash, plaintext);

        let found = authenticate(&storage, &plaintext).await.unwrap().unwrap();
        assert_eq!(found.id, row.id);
        assert_eq!(found.allowed_tools().unwrap(), tools);
        assert!(found.last_used_at.is_some());

        assert!(authenticate(&storage, "cg_nope").await.unwrap().is_none());
        assert!(authenticate(&storage, "nope").await.unwrap().is_none());

        assert!(!storage.revoke_api_key("mallory", &row.id).await.unwrap());
        assert!(storage.revoke_api_key("alice", &row.id).await.unwrap());
        assert!(!storage.revoke_api_key("alice", &row.id).await.unwrap());
        assert!(authenticate(&storage, &plaintext).await.unwrap().is_none());

        let listed = storage.api_keys("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].revoked);
    }

    #[tokio::test]
    async fn bad_parameters_are_refused() {
        let (_dir, storage) = storage().await;
        let blank = NewKey {
            uid: "alice",
            name: "  ",
            allowed_tools: &[],
            credit_limit: None,
        };
        assert!(create(&storage, &blank).await.is_err());
        let negative = NewKey {
            name: "x",
            credit_limit: Some(-1),
            ..blank
        };
        assert!(create(&storage, &negative).await.is_err());
        assert!(storage.api_keys("alice").await.unwrap().is_empty());
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tamper-evident event signing.
//!
//! Every event hash is `HMAC-SHA256(secret[kid], prev_hash | "|" |
//! canonical)` under the currently active audit key. Rotation adds a new
//! active key and retains every prior key: historical chains verify with
//! the key id recorded on each event. Dropping a key that any event still
//! references is data loss, so the registry has no removal operation and
//! verification fails loudly on an unknown kid instead of guessing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::domain::event::{ChainVerification, Event};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no active audit key")]
    NoActiveKey,
    #[error("unknown audit key id '{0}' (retained keys must never be dropped)")]
    UnknownKeyId(String),
    #[error("audit key '{0}' has an unusable secret")]
    InvalidKey(String),
}

/// One audit key. Secrets are opaque bytes; exactly one key is active at a
/// time, inactive keys are retained for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditKey {
    pub kid: String,
    pub secret: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// In-memory audit keyring. Updates publish a whole new snapshot under the
/// chain's lock; readers never observe a partially rotated ring.
#[derive(Debug, Clone)]
pub struct KeyRegistry {
    keys: Vec<AuditKey>,
}

impl KeyRegistry {
    /// Build a keyring, normalizing activation: if no key is flagged
    /// active the first one becomes active; extra active flags are demoted
    /// in favor of the first.
    pub fn new(mut keys: Vec<AuditKey>) -> Result<Self, ChainError> {
        if keys.is_empty() {
            return Err(ChainError::NoActiveKey);
        }
        let active_idx = keys.iter().position(|k| k.active).unwrap_or(0);
        for (i, key) in keys.iter_mut().enumerate() {
            key.active = i == active_idx;
        }
        Ok(Self { keys })
    }

    /// Single-key ring for the `AUDIT_SECRET` fallback.
    pub fn single(secret: impl Into<String>) -> Self {
        Self {
            keys: vec![AuditKey {
                kid: "k0".into(),
                secret: secret.into(),
                active: true,
                created_at: Utc::now(),
            }],
        }
    }

    pub fn active(&self) -> Result<&AuditKey, ChainError> {
        self.keys.iter().find(|k| k.active).ok_or(ChainError::NoActiveKey)
    }

    pub fn get(&self, kid: &str) -> Option<&AuditKey> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    pub fn keys(&self) -> &[AuditKey] {
        &self.keys
    }

    /// Add (or re-key) `kid` and make it the active key; the previously
    /// active key is retained inactive.
    pub fn rotate(&mut self, kid: impl Into<String>, secret: impl Into<String>) {
        let kid = kid.into();
        let secret = secret.into();
        for key in &mut self.keys {
            key.active = false;
        }
        if let Some(existing) = self.keys.iter_mut().find(|k| k.kid == kid) {
            existing.secret = secret;
            existing.active = true;
        } else {
            self.keys.push(AuditKey { kid, secret, active: true, created_at: Utc::now() });
        }
    }
}

/// Stateless signer/verifier over an injected keyring.
pub struct HashChain {
    registry: std::sync::RwLock<KeyRegistry>,
}

impl HashChain {
    pub fn new(registry: KeyRegistry) -> Self {
        Self { registry: std::sync::RwLock::new(registry) }
    }

    fn mac(secret: &str, prev_hash: &str, canonical: &str) -> Result<String, ChainError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ChainError::InvalidKey(secret.len().to_string()))?;
        mac.update(prev_hash.as_bytes());
        mac.update(b"|");
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign with the active key; returns `(hash, kid)`.
    pub fn sign(&self, prev_hash: &str, canonical: &str) -> Result<(String, String), ChainError> {
        let registry = self.registry.read().expect("keyring lock poisoned");
        let key = registry.active()?;
        Ok((Self::mac(&key.secret, prev_hash, canonical)?, key.kid.clone()))
    }

    /// Recompute with the recorded key (active or retired).
    pub fn verify(
        &self,
        prev_hash: &str,
        canonical: &str,
        hash: &str,
        kid: &str,
    ) -> Result<bool, ChainError> {
        let registry = self.registry.read().expect("keyring lock poisoned");
        let key = registry.get(kid).ok_or_else(|| ChainError::UnknownKeyId(kid.to_string()))?;
        Ok(Self::mac(&key.secret, prev_hash, canonical)? == hash)
    }

    /// Rotate the active key; prior keys stay available for verification.
    pub fn rotate(&self, kid: impl Into<String>, secret: impl Into<String>) {
        let mut registry = self.registry.write().expect("keyring lock poisoned");
        registry.rotate(kid, secret);
    }

    pub fn keyring(&self) -> KeyRegistry {
        self.registry.read().expect("keyring lock poisoned").clone()
    }
}

/// Walk a run's events in order, recomputing linkage and hashes; reports
/// the earliest divergence.
pub fn verify_events(chain: &HashChain, events: &[Event]) -> Result<ChainVerification, ChainError> {
    let mut prev = String::new();
    let mut expected_seq = 1u64;
    for event in events {
        if event.seq != expected_seq
            || event.prev_hash != prev
            || !chain.verify(&event.prev_hash, &event.canonical, &event.hash, &event.key_id)?
        {
            return Ok(ChainVerification::broken(event.seq, events.len() as u64));
        }
        prev = event.hash.clone();
        expected_seq += 1;
    }
    Ok(ChainVerification::intact(events.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventPayload;
    use crate::domain::run::{RunId, RunState, TaskId};
    use crate::infrastructure::canonical::canonical_json;

    fn chain() -> HashChain {
        HashChain::new(KeyRegistry::single("test_secret"))
    }

    fn signed_events(chain: &HashChain, n: u64) -> Vec<Event> {
        let task_id = TaskId("t1".into());
        let run_id = RunId("run_t1".into());
        let mut prev = String::new();
        (1..=n)
            .map(|seq| {
                let payload =
                    EventPayload::status(&task_id, &run_id, RunState::Working, format!("step {seq}"));
                let mut value = serde_json::to_value(&payload).unwrap();
                value["_seq"] = serde_json::json!(seq);
                let canonical = canonical_json(&value);
                let (hash, key_id) = chain.sign(&prev, &canonical).unwrap();
                let event = Event {
                    seq,
                    ts: Utc::now(),
                    canonical,
                    prev_hash: std::mem::take(&mut prev),
                    hash: hash.clone(),
                    key_id,
                    payload,
                };
                prev = hash;
                event
            })
            .collect()
    }

    #[test]
    fn intact_chain_verifies() {
        let chain = chain();
        let events = signed_events(&chain, 5);
        let verdict = verify_events(&chain, &events).unwrap();
        assert!(verdict.ok);
        assert_eq!(verdict.checked, 5);
    }

    #[test]
    fn tampered_canonical_reports_earliest_divergence() {
        let chain = chain();
        let mut events = signed_events(&chain, 5);
        events[2].canonical = events[2].canonical.replace("step 3", "step 99");
        let verdict = verify_events(&chain, &events).unwrap();
        assert!(!verdict.ok);
        assert_eq!(verdict.broken_at, Some(3));
    }

    #[test]
    fn tampered_hash_breaks_its_own_link_first() {
        let chain = chain();
        let mut events = signed_events(&chain, 4);
        events[1].hash = format!("{:0<64}", "f");
        let verdict = verify_events(&chain, &events).unwrap();
        assert_eq!(verdict.broken_at, Some(2));
    }

    #[test]
    fn rotation_signs_with_new_key_and_still_verifies_old_events() {
        let chain = chain();
        let old = signed_events(&chain, 3);
        chain.rotate("k1", "fresh_secret");

        let (_, kid) = chain.sign("", "{}").unwrap();
        assert_eq!(kid, "k1");

        // events signed before rotation verify with the retained key
        let verdict = verify_events(&chain, &old).unwrap();
        assert!(verdict.ok);
        assert!(old.iter().all(|e| e.key_id == "k0"));
    }

    #[test]
    fn unknown_kid_is_an_error_not_a_false() {
        let chain = chain();
        let err = chain.verify("", "{}", "00", "ghost").unwrap_err();
        assert!(matches!(err, ChainError::UnknownKeyId(_)));
    }

    #[test]
    fn keyring_keeps_exactly_one_active_key() {
        let mut ring = KeyRegistry::single("a");
        ring.rotate("k1", "b");
        ring.rotate("k2", "c");
        assert_eq!(ring.keys().iter().filter(|k| k.active).count(), 1);
        assert_eq!(ring.active().unwrap().kid, "k2");
        assert!(ring.get("k0").is_some());
    }
}

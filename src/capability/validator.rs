use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use tracing::{debug, warn};

use super::token::CapabilityToken;
use crate::error::WardenError;

pub type ValidityResult = Result<(), WardenError>;

/// Public keys of the token-issuing authorities, by key id.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Build from `key id -> base64 public key`, as found in the `[trust]`
    /// config section.
    pub fn from_base64(issuers: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut store = Self::new();
        for (key_id, encoded) in issuers {
            let bytes = Base64
                .decode(encoded.trim())
                .map_err(|e| anyhow::anyhow!("Issuer '{key_id}': invalid base64 key: {e}"))?;
            let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("Issuer '{key_id}': ed25519 keys are 32 bytes, got {}", bytes.len())
            })?;
            let key = VerifyingKey::from_bytes(&bytes)
                .map_err(|e| anyhow::anyhow!("Issuer '{key_id}': invalid ed25519 key: {e}"))?;
            store.insert(key_id.clone(), key);
        }
        Ok(store)
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Checks token signatures and expiry, and answers scope questions.
///
/// Verification is a pure function of the token, the trust store and the
/// clock reading, so repeating it at the same instant gives the same answer.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    trust: Arc<TrustStore>,
}

impl TokenValidator {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    pub fn verify(&self, token: &CapabilityToken) -> ValidityResult {
        self.verify_at(token, Utc::now())
    }

    /// Signature first, then expiry: a forged token is reported as forged
    /// even when it is also stale.
    pub fn verify_at(&self, token: &CapabilityToken, now: DateTime<Utc>) -> ValidityResult {
        let invalid = |reason: String| WardenError::InvalidSignature {
            token: token.id.clone(),
            reason,
        };

        let key = self
            .trust
            .get(&token.issuer)
            .ok_or_else(|| invalid(format!("unknown issuer '{}'", token.issuer)))?;
        let bytes = Base64
            .decode(token.signature.trim())
            .map_err(|_| invalid("signature is not valid base64".into()))?;
        let signature = Signature::try_from(bytes.as_slice())
            .map_err(|_| invalid("signature has the wrong length".into()))?;
        key.verify_strict(&token.signing_bytes(), &signature)
            .map_err(|_| invalid("signature verification failed".into()))?;

        if token.is_expired_at(now) {
            return Err(WardenError::Expired {
                token: token.id.clone(),
                expired_at: token.expires_at,
            });
        }
        Ok(())
    }

    /// Verifies every token, failing on the first invalid one.
    pub fn verify_all(&self, tokens: &[CapabilityToken]) -> ValidityResult {
        let now = Utc::now();
        for token in tokens {
            if let Err(e) = self.verify_at(token, now) {
                warn!("Rejected capability token {}: {e}", token.id);
                return Err(e);
            }
        }
        debug!("Verified {} capability token(s)", tokens.len());
        Ok(())
    }

    pub fn matches(token: &CapabilityToken, tool: &str) -> bool {
        token.pattern.matches(tool)
    }

    pub fn authorize(token: &CapabilityToken, operation: &str) -> bool {
        token.permits(operation)
    }
}

/// Tokens bucketed by the first namespace segment of their pattern.
///
/// A lookup only scans tokens rooted in the tool's own namespace, so
/// granting many unrelated tools does not slow down each call. Within a
/// bucket tokens keep the order they were supplied in.
#[derive(Debug, Clone, Default)]
pub struct TokenIndex {
    buckets: HashMap<String, Vec<Arc<CapabilityToken>>>,
    len: usize,
}

impl TokenIndex {
    pub fn new(tokens: impl IntoIterator<Item = Arc<CapabilityToken>>) -> Self {
        let mut index = Self::default();
        for token in tokens {
            index
                .buckets
                .entry(token.pattern.root().to_string())
                .or_default()
                .push(token);
            index.len += 1;
        }
        index
    }

    /// Tokens whose pattern matches `tool`, in supplied order.
    pub fn matching(&self, tool: &str) -> Vec<Arc<CapabilityToken>> {
        let root = tool.split('.').next().unwrap_or(tool);
        self.buckets
            .get(root)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|t| t.pattern.matches(tool))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// How many tokens a lookup for `tool` has to look at.
    pub fn candidates(&self, tool: &str) -> usize {
        let root = tool.split('.').next().unwrap_or(tool);
        self.buckets.get(root).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ToolPattern;
    use chrono::Duration;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::BTreeSet;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn trust() -> Arc<TrustStore> {
        let mut store = TrustStore::new();
        store.insert("authority", signing_key().verifying_key());
        Arc::new(store)
    }

    fn token(id: &str, pattern: &str, expires_at: DateTime<Utc>) -> CapabilityToken {
        let mut token = CapabilityToken {
            id: id.into(),
            pattern: ToolPattern::parse(pattern).unwrap(),
            operations: BTreeSet::from(["read".to_string()]),
            constraints: vec![],
            issuer: "authority".into(),
            expires_at,
            signature: String::new(),
        };
        let sig = signing_key().sign(&token.signing_bytes());
        token.signature = Base64.encode(sig.to_bytes());
        token
    }

    fn tomorrow() -> DateTime<Utc> {
        Utc::now() + Duration::days(1)
    }

    #[test]
    fn test_valid_token_verifies() {
        let v = TokenValidator::new(trust());
        assert!(v.verify(&token("t1", "crm.read.*", tomorrow())).is_ok());
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let v = TokenValidator::new(trust());
        let mut t = token("t1", "crm.read.*", tomorrow());
        t.operations.insert("write".into());
        let err = v.verify(&t).unwrap_err();
        assert!(matches!(err, WardenError::InvalidSignature { .. }));
    }

    #[test]
    fn test_unknown_issuer_and_garbage_signature() {
        let v = TokenValidator::new(trust());
        let mut t = token("t1", "crm.read.*", tomorrow());
        t.issuer = "someone-else".into();
        assert!(v.verify(&t).unwrap_err().to_string().contains("unknown issuer"));

        let mut t = token("t1", "crm.read.*", tomorrow());
        t.signature = "not base64!!".into();
        assert!(matches!(v.verify(&t), Err(WardenError::InvalidSignature { .. })));

        t.signature = Base64.encode([1u8; 10]);
        assert!(matches!(v.verify(&t), Err(WardenError::InvalidSignature { .. })));
    }

    #[test]
    fn test_expiry_boundary() {
        let v = TokenValidator::new(trust());
        let expires = Utc::now() + Duration::minutes(5);
        let t = token("t1", "crm.read.*", expires);
        assert!(v.verify_at(&t, expires - Duration::seconds(1)).is_ok());
        let err = v.verify_at(&t, expires).unwrap_err();
        assert!(matches!(err, WardenError::Expired { .. }));
    }

    #[test]
    fn test_verify_is_idempotent() {
        let v = TokenValidator::new(trust());
        let now = Utc::now();
        let good = token("t1", "crm.read.*", tomorrow());
        let stale = token("t2", "crm.read.*", now - Duration::seconds(1));
        assert_eq!(v.verify_at(&good, now), v.verify_at(&good, now));
        assert_eq!(v.verify_at(&stale, now), v.verify_at(&stale, now));
    }

    #[test]
    fn test_verify_all_stops_on_first_bad_token() {
        let v = TokenValidator::new(trust());
        let good = token("good", "crm.read.*", tomorrow());
        let mut bad = token("bad", "crm.read.*", tomorrow());
        bad.id = "renamed".into();
        let err = v.verify_all(&[good.clone(), bad]).unwrap_err();
        assert!(err.to_string().contains("renamed"));
        assert!(v.verify_all(&[good]).is_ok());
    }

    #[test]
    fn test_matches_and_authorize() {
        let t = token("t1", "salesforce.read.*", tomorrow());
        assert!(TokenValidator::matches(&t, "salesforce.read.getLead"));
        assert!(!TokenValidator::matches(&t, "salesforce.write.updateRecord"));
        assert!(TokenValidator::authorize(&t, "read"));
        assert!(!TokenValidator::authorize(&t, "write"));
    }

    #[test]
    fn test_trust_store_from_base64() {
        let encoded = Base64.encode(signing_key().verifying_key().to_bytes());
        let issuers = BTreeMap::from([("authority".to_string(), encoded)]);
        let store = TrustStore::from_base64(&issuers).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("authority").is_some());

        let short = BTreeMap::from([("k".to_string(), Base64.encode([0u8; 8]))]);
        assert!(TrustStore::from_base64(&short).is_err());
    }

    #[test]
    fn test_index_only_scans_own_namespace() {
        let mut tokens: Vec<Arc<CapabilityToken>> = (0..50)
            .map(|i| Arc::new(token(&format!("g{i}"), &format!("gdrive{i}.files.*"), tomorrow())))
            .collect();
        tokens.push(Arc::new(token("sf-read", "salesforce.read.*", tomorrow())));
        tokens.push(Arc::new(token("sf-exact", "salesforce.read.getLead", tomorrow())));
        tokens.push(Arc::new(token("sf-write", "salesforce.write.*", tomorrow())));
        let index = TokenIndex::new(tokens);

        assert_eq!(index.len(), 53);
        assert_eq!(index.candidates("salesforce.read.getLead"), 3);
        let ids: Vec<_> = index
            .matching("salesforce.read.getLead")
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(ids, vec!["sf-read", "sf-exact"]);
        assert!(index.matching("jira.read.getIssue").is_empty());
    }
}

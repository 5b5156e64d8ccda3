//! Consistency verifier.
//!
//! Inspects both backends under the lease and reports whether the token
//! lives in at most one place. Reports only; repair is left to callers
//! (typically [`AtomicTokenStore::clear_token`] followed by a fresh login).

use crate::error::Result;
use crate::store::AtomicTokenStore;
use serde::{Deserialize, Serialize};
use session_keeper_core::{StorageBackend, StorageMode};
use std::sync::Arc;

/// A violation of the single-location invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    /// Both backends hold the same token.
    DuplicateToken,
    /// Both backends hold different tokens.
    ConflictingTokens,
}

/// Result of a consistency check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// `true` when at most one backend holds a token.
    pub consistent: bool,
    /// Detected violations. Empty when consistent.
    pub issues: Vec<IssueKind>,
    /// Mode a reader would observe, ephemeral winning on conflict.
    pub mode: StorageMode,
}

/// Classify the raw values of the token key in each backend.
#[must_use]
pub fn classify(durable: Option<&str>, ephemeral: Option<&str>) -> ConsistencyReport {
    let issues = match (durable, ephemeral) {
        (Some(d), Some(e)) if d == e => vec![IssueKind::DuplicateToken],
        (Some(_), Some(_)) => vec![IssueKind::ConflictingTokens],
        _ => Vec::new(),
    };

    ConsistencyReport {
        consistent: issues.is_empty(),
        issues,
        mode: StorageMode::classify(durable.is_some(), ephemeral.is_some()),
    }
}

/// Runs consistency checks against a shared token store.
pub struct ConsistencyVerifier<D: StorageBackend, E: StorageBackend> {
    store: Arc<AtomicTokenStore<D, E>>,
}

impl<D: StorageBackend, E: StorageBackend> Clone for ConsistencyVerifier<D, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<D: StorageBackend, E: StorageBackend> ConsistencyVerifier<D, E> {
    /// Create a verifier for `store`.
    #[must_use]
    pub const fn new(store: Arc<AtomicTokenStore<D, E>>) -> Self {
        Self { store }
    }

    /// Read both backends under the lease and classify the result.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`](crate::StoreError::Unavailable) if the lease timed out
    /// - [`StoreError::Backend`](crate::StoreError::Backend) if a backend failed
    pub async fn verify(&self) -> Result<ConsistencyReport> {
        let snapshot = self
            .store
            .with_lease(async { self.store.read_both().await })
            .await?;

        let report = classify(snapshot.durable.as_deref(), snapshot.ephemeral.as_deref());
        if report.consistent {
            tracing::debug!(mode = ?report.mode, "Token storage consistent");
        } else {
            tracing::warn!(issues = ?report.issues, "Token storage inconsistent");
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::config::KeeperConfig;
    use crate::constants::keys;
    use proptest::prelude::*;
    use session_keeper_core::Token;

    #[test]
    fn test_classify_single_location() {
        let report = classify(Some("a"), None);
        assert!(report.consistent);
        assert_eq!(report.mode, StorageMode::Durable);

        let report = classify(None, None);
        assert!(report.consistent);
        assert_eq!(report.mode, StorageMode::None);
    }

    #[test]
    fn test_classify_duplicate_and_conflict() {
        assert_eq!(classify(Some("a"), Some("a")).issues, vec![IssueKind::DuplicateToken]);
        assert_eq!(
            classify(Some("a"), Some("b")).issues,
            vec![IssueKind::ConflictingTokens]
        );
    }

    #[tokio::test]
    async fn test_verify_detects_seeded_conflict() {
        let store = Arc::new(AtomicTokenStore::new(
            MemoryBackend::new(),
            MemoryBackend::new(),
            &KeeperConfig::default(),
        ));
        store.durable().set(keys::TOKEN, "a").await.unwrap();
        store.ephemeral().set(keys::TOKEN, "b").await.unwrap();
        let verifier = ConsistencyVerifier::new(Arc::clone(&store));

        let report = verifier.verify().await.unwrap();
        assert!(!report.consistent);
        assert_eq!(report.issues, vec![IssueKind::ConflictingTokens]);
        assert_eq!(report.mode, StorageMode::Ephemeral);

        // Reporting does not repair.
        assert!(store.durable().get(keys::TOKEN).await.unwrap().is_some());

        store.set_token(&Token::from("c"), false).await.unwrap();
        assert!(verifier.verify().await.unwrap().consistent);
    }

    proptest! {
        #[test]
        fn prop_consistent_iff_at_most_one_populated(
            durable in proptest::option::of("[a-c]{1,2}"),
            ephemeral in proptest::option::of("[a-c]{1,2}"),
        ) {
            let report = classify(durable.as_deref(), ephemeral.as_deref());
            let both = durable.is_some() && ephemeral.is_some();
            prop_assert_eq!(report.consistent, !both);
            prop_assert_eq!(report.issues.len(), usize::from(both));
        }
    }
}

//! Policy Retrieval Point collaborator interface (spec Section 6) and a
//! static in-memory implementation for tests and the CLI.
//!
//! Grounded on `tenor-eval::adapter::static_adapter`, the teacher's
//! simplest `FactProvider` implementation that answers from an in-memory
//! map rather than a live source -- generalized here from "answer one
//! fact" to "answer the whole matching policy set as a stream", since a
//! PRP's matching set can itself change over the life of a subscription.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use sapl_compile::{CompiledPolicy, Subscription};

/// One snapshot of the PRP's answer to a subscription (spec Section 6):
/// the matching compiled policies, plus the total number of policy
/// documents known to the PRP (surfaced for coverage-adjacent
/// collaborators, SPEC addendum to Section 4.6).
pub struct MatchingDocuments {
    pub matches: Vec<Arc<CompiledPolicy>>,
    pub total_documents: usize,
}

/// `retrievePolicies(subscription) -> lazy sequence of MatchingDocuments`
/// (spec Section 6). Emits a new value whenever the matching set changes.
pub trait PolicyRetrievalPoint: Send + Sync {
    fn retrieve_policies(&self, subscription: Arc<Subscription>) -> BoxStream<'static, MatchingDocuments>;
}

/// A PRP whose document set never changes after construction: the
/// common case for CLI usage and tests, where policies are loaded once
/// from files or built in-memory rather than hot-reloaded from a policy
/// store.
///
/// `matcher` decides which of `documents` apply to a given subscription;
/// it is re-run on every `retrieve_policies` call (once, since this PRP
/// never emits a second snapshot) rather than cached, since subscriptions
/// differ.
pub struct StaticPolicyRetrievalPoint {
    documents: Vec<Arc<CompiledPolicy>>,
    matcher: Arc<dyn Fn(&Subscription, &CompiledPolicy) -> bool + Send + Sync>,
}

impl StaticPolicyRetrievalPoint {
    /// Every document matches every subscription -- the simplest possible
    /// PRP, useful when target expressions alone should gate applicability.
    pub fn match_all(documents: Vec<Arc<CompiledPolicy>>) -> Self {
        StaticPolicyRetrievalPoint {
            documents,
            matcher: Arc::new(|_, _| true),
        }
    }

    pub fn with_matcher(
        documents: Vec<Arc<CompiledPolicy>>,
        matcher: impl Fn(&Subscription, &CompiledPolicy) -> bool + Send + Sync + 'static,
    ) -> Self {
        StaticPolicyRetrievalPoint {
            documents,
            matcher: Arc::new(matcher),
        }
    }
}

impl PolicyRetrievalPoint for StaticPolicyRetrievalPoint {
    fn retrieve_policies(&self, subscription: Arc<Subscription>) -> BoxStream<'static, MatchingDocuments> {
        let matches: Vec<Arc<CompiledPolicy>> = self
            .documents
            .iter()
            .filter(|doc| (self.matcher)(&subscription, doc))
            .cloned()
            .collect();
        let total_documents = self.documents.len();
        futures::stream::once(futures::future::ready(MatchingDocuments {
            matches,
            total_documents,
        }))
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapl_core::Value;

    fn empty_subscription() -> Arc<Subscription> {
        Arc::new(Subscription::new(Value::Null, Value::Null, Value::Null, None))
    }

    #[tokio::test]
    async fn match_all_returns_every_document_once() {
        let prp = StaticPolicyRetrievalPoint::match_all(vec![]);
        let mut stream = prp.retrieve_policies(empty_subscription());
        let first = stream.next().await.unwrap();
        assert_eq!(first.matches.len(), 0);
        assert_eq!(first.total_documents, 0);
        assert!(stream.next().await.is_none());
    }
}

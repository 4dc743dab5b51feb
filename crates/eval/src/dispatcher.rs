//! The Subscription Dispatcher (spec Section 4.6): the top-level entry
//! point. For each incoming subscription it asks the PRP for matching
//! compiled policies, starts one evaluation stream per policy, combines
//! them with the PDP's configured top-level algorithm, deduplicates, and
//! hands the result to the subscriber.
//!
//! Grounded on `tenor-cli::serve::handlers`'s request-to-response pipeline
//! (resolve bundle -> build context -> evaluate -> respond) -- generalized
//! here from one-shot request/response to a live stream, since the PRP's
//! matching set and every attribute it depends on may themselves change
//! for the life of one subscription.
//!
//! Resolves spec Section 9's second open question: when the PRP emits a
//! fresh `MatchingDocuments` mid-subscription, the combine stage restarts
//! from the new snapshot rather than continuing to merge decisions
//! produced against the old one (`switch_map` over the PRP's stream
//! achieves this directly -- a new outer emission cancels whatever
//! per-policy streams were in flight).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use sapl_compile::stream_util::switch_map;
use sapl_compile::{AttributeBroker, EvaluationContext, FunctionBroker, ImportTable, Subscription};
use sapl_core::CombiningAlgorithm;

use crate::decision::PolicyDecision;
use crate::evaluator::{combine_decision_streams, evaluate_policy, prepare};
use crate::prp::{MatchingDocuments, PolicyRetrievalPoint};

static NEXT_EVALUATION_ID: AtomicU64 = AtomicU64::new(1);

/// The fixed, per-PDP-instance configuration the dispatcher needs to build
/// an `EvaluationContext` and combine top-level decisions (spec Section
/// 4.6: "combine using the PDP configuration's top-level algorithm").
/// Plain constructor struct, matching `tenor-cli::serve::state::AppState`'s
/// explicit-fields-over-global-singleton style (spec Section 9's "no
/// global singletons").
pub struct PdpConfiguration {
    pub pdp_id: Arc<str>,
    pub configuration_id: Arc<str>,
    pub algorithm: CombiningAlgorithm,
    pub function_broker: Arc<dyn FunctionBroker>,
    pub attribute_broker: Arc<dyn AttributeBroker>,
}

/// The dispatcher's output: the aggregate `PolicyDecision` plus the PRP's
/// `totalDocuments` for the snapshot it was produced against, surfaced as
/// out-of-band metadata for coverage-adjacent collaborators (SPEC_FULL
/// Section 4.6 supplement) -- it is not part of the Decision JSON itself.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedDecision {
    pub decision: PolicyDecision,
    pub total_documents: usize,
}

fn build_context(config: &PdpConfiguration, subscription: Arc<Subscription>) -> EvaluationContext {
    let evaluation_id = NEXT_EVALUATION_ID.fetch_add(1, Ordering::Relaxed);
    EvaluationContext {
        pdp_id: config.pdp_id.clone(),
        configuration_id: config.configuration_id.clone(),
        evaluation_id: Arc::from(evaluation_id.to_string()),
        subscription,
        function_broker: config.function_broker.clone(),
        attribute_broker: config.attribute_broker.clone(),
        local_variables: Arc::new(HashMap::new()),
        imports: Arc::new(ImportTable::default()),
    }
}

/// Evaluate one PRP snapshot: one evaluation stream per matching policy,
/// combined with the PDP's top-level algorithm. An empty match set is
/// `not-applicable`, consistent with the combining table's base case.
fn evaluate_snapshot(
    config: Arc<PdpConfiguration>,
    subscription: Arc<Subscription>,
    snapshot: MatchingDocuments,
) -> BoxStream<'static, DispatchedDecision> {
    let total_documents = snapshot.total_documents;
    let ctx = build_context(&config, subscription);

    let per_policy: Vec<BoxStream<'static, PolicyDecision>> = snapshot
        .matches
        .iter()
        .map(|policy| evaluate_policy(prepare((**policy).clone()), ctx.clone()))
        .collect();

    let combined: BoxStream<'static, PolicyDecision> = if per_policy.is_empty() {
        futures::stream::once(futures::future::ready(PolicyDecision::not_applicable())).boxed()
    } else {
        combine_decision_streams(config.algorithm, per_policy)
    };

    combined
        .map(move |decision| DispatchedDecision {
            decision,
            total_documents,
        })
        .boxed()
}

/// Drop consecutive duplicate emissions (spec Section 4.6: "deduplicate
/// on structural equality of the aggregate decision"). Only the decision
/// itself is compared; `total_documents` riding alongside a repeated
/// decision is not itself a reason to re-emit.
fn dedup_dispatched(stream: BoxStream<'static, DispatchedDecision>) -> BoxStream<'static, DispatchedDecision> {
    Box::pin(async_stream::stream! {
        futures::pin_mut!(stream);
        let mut last: Option<PolicyDecision> = None;
        while let Some(next) = stream.next().await {
            if last.as_ref() != Some(&next.decision) {
                last = Some(next.decision.clone());
                yield next;
            }
        }
    })
}

/// The dispatcher's entry point (spec Section 4.6). Cancelling the
/// returned stream (dropping it) unsubscribes from the PRP's stream and,
/// transitively, from every attribute stream any live policy held --
/// ordinary `Drop`-based cancellation, the same mechanism the broker's
/// `SubscriptionGuard` relies on.
pub fn dispatch(
    config: Arc<PdpConfiguration>,
    prp: Arc<dyn PolicyRetrievalPoint>,
    subscription: Arc<Subscription>,
) -> BoxStream<'static, DispatchedDecision> {
    let snapshots = prp.retrieve_policies(subscription.clone());
    let raw = switch_map(snapshots, move |snapshot| {
        evaluate_snapshot(config.clone(), subscription.clone(), snapshot)
    });
    dedup_dispatched(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapl_compile::{CompiledExpression, CompiledPolicy, CompiledPolicyRule, CompiledStatement, PureOperator, TracedValue};
    use sapl_core::{PolicyKind, Value};
    use std::collections::HashSet;

    struct NoFunctions;
    impl FunctionBroker for NoFunctions {
        fn is_provided_function(&self, _name: &str) -> bool {
            false
        }
        fn evaluate(&self, _name: &str, _args: &[Value]) -> Value {
            Value::error("no functions registered", None)
        }
    }

    struct NoAttributes;
    impl AttributeBroker for NoAttributes {
        fn attribute_stream(
            &self,
            _invocation: sapl_compile::AttributeFinderInvocation,
        ) -> BoxStream<'static, TracedValue> {
            futures::stream::empty().boxed()
        }
        fn provided_functions_of_library(&self, _library: &str) -> HashSet<String> {
            HashSet::new()
        }
        fn is_provided_function(&self, _fully_qualified_name: &str) -> bool {
            false
        }
    }

    struct ConstTarget(bool);
    impl PureOperator for ConstTarget {
        fn evaluate(&self, _ctx: &EvaluationContext) -> TracedValue {
            use sapl_compile::Trace;
            TracedValue::new(Value::Boolean(self.0), Trace::leaf("const", None))
        }
        fn is_depending_on_subscription(&self) -> bool {
            false
        }
    }

    fn empty_subscription() -> Arc<Subscription> {
        Arc::new(Subscription::new(Value::Null, Value::Null, Value::Null, None))
    }

    fn config() -> Arc<PdpConfiguration> {
        Arc::new(PdpConfiguration {
            pdp_id: Arc::from("pdp-test"),
            configuration_id: Arc::from("config-test"),
            algorithm: CombiningAlgorithm::DenyOverrides,
            function_broker: Arc::new(NoFunctions),
            attribute_broker: Arc::new(NoAttributes),
        })
    }

    fn permit_rule(name: &str) -> CompiledPolicy {
        CompiledPolicy::Rule(CompiledPolicyRule {
            name: name.to_string(),
            entitlement: PolicyKind::Permit,
            target: Arc::new(ConstTarget(true)),
            body: vec![CompiledStatement::Condition(CompiledExpression::Value(Value::Boolean(true)))],
            obligation: None,
            advice: None,
            transform: None,
            schemas: Vec::new(),
            imports: Arc::new(ImportTable::default()),
        })
    }

    fn deny_rule(name: &str) -> CompiledPolicy {
        CompiledPolicy::Rule(CompiledPolicyRule {
            name: name.to_string(),
            entitlement: PolicyKind::Deny,
            target: Arc::new(ConstTarget(true)),
            body: vec![CompiledStatement::Condition(CompiledExpression::Value(Value::Boolean(true)))],
            obligation: None,
            advice: None,
            transform: None,
            schemas: Vec::new(),
            imports: Arc::new(ImportTable::default()),
        })
    }

    #[tokio::test]
    async fn no_matching_policies_is_not_applicable() {
        let prp = Arc::new(crate::prp::StaticPolicyRetrievalPoint::match_all(vec![]));
        let mut stream = dispatch(config(), prp, empty_subscription());
        let first = stream.next().await.unwrap();
        assert_eq!(first.decision.decision, crate::decision::Decision::NotApplicable);
        assert_eq!(first.total_documents, 0);
    }

    #[tokio::test]
    async fn deny_overrides_wins_over_permit() {
        let docs = vec![Arc::new(permit_rule("allow")), Arc::new(deny_rule("block"))];
        let prp = Arc::new(crate::prp::StaticPolicyRetrievalPoint::match_all(docs));
        let mut stream = dispatch(config(), prp, empty_subscription());
        let first = stream.next().await.unwrap();
        assert_eq!(first.decision.decision, crate::decision::Decision::Deny);
        assert_eq!(first.total_documents, 2);
    }

    #[tokio::test]
    async fn repeated_identical_decisions_are_not_redelivered() {
        let docs = vec![Arc::new(permit_rule("allow"))];
        let prp = Arc::new(crate::prp::StaticPolicyRetrievalPoint::match_all(docs));
        let mut stream = dispatch(config(), prp, empty_subscription());
        let first = stream.next().await.unwrap();
        assert_eq!(first.decision.decision, crate::decision::Decision::Permit);
        // The static PRP emits exactly one snapshot, so the stream ends
        // here; there is no duplicate second snapshot to suppress, but
        // dedup_dispatched is exercised directly by combine-layer tests.
        assert!(stream.next().await.is_none());
    }
}

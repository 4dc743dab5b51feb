//! The Policy Evaluator (spec Section 4.4): walks a compiled policy and an
//! `EvaluationContext` into a lazy, reactive sequence of `PolicyDecision`s.
//!
//! There is no direct Tenor analogue for reactive re-evaluation -- Tenor's
//! `rules::eval_strata` (see its module doc) evaluates a whole contract
//! once, synchronously, stratum by stratum. SAPL's body statements and
//! obligation/advice/transform expressions may be live streams, so this
//! module generalizes that stratified walk into a `switch_map` chain
//! (`sapl_compile::stream_util`, itself enriched in from
//! `dropbox-dTOOL`'s `dashflow-streaming`): whenever an upstream value in
//! the chain changes, the smallest enclosing downstream subtree restarts
//! from there, per spec Section 4.4's "Reactive behaviour" paragraph.
//!
//! A policy's own `target`/schemas and a policy-set's own local variables
//! are always `PureOperator`s (synchronous, no live input) -- they are
//! evaluated exactly once per subscription, not re-triggered, matching
//! the spec's characterization of `target: PureOperator`.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use sapl_core::{PolicyKind, SubscriptionElement, Value};
use sapl_compile::{
    CompiledPolicy, CompiledPolicyRule, CompiledPolicySet, CompiledStatement, EvaluationContext,
    ImportTable, PrecompiledSchemaValidator, PureOperator, Subscription, TracedValue,
};
use sapl_compile::stream_util::{combine_latest, switch_map};

use crate::combine;
use crate::decision::PolicyDecision;

/// The compiled tree, re-owned so every node (including the ones nested
/// inside a `CompiledPolicySet`) has its own `Arc` handle. `sapl-compile`
/// hands back a plain `CompiledPolicy` whose nested `policies: Vec<..>`
/// are not individually `Arc`-wrapped (it has no reason to be, being a
/// compiler, not an evaluator); `prepare` does that wrapping once, at
/// policy-load time, so the evaluator can freely clone a handle to any
/// node into a `'static` stream closure.
pub enum EvalNode {
    Rule(CompiledPolicyRule),
    Set {
        name: String,
        variables: Vec<(String, Arc<dyn PureOperator>)>,
        algorithm: sapl_core::CombiningAlgorithm,
        policies: Vec<Arc<EvalNode>>,
        target: Arc<dyn PureOperator>,
        schemas: Vec<PrecompiledSchemaValidator>,
        imports: Arc<ImportTable>,
    },
}

impl EvalNode {
    pub fn name(&self) -> &str {
        match self {
            EvalNode::Rule(r) => &r.name,
            EvalNode::Set { name, .. } => name,
        }
    }
}

/// Wrap a freshly compiled policy document for evaluation (spec Section
/// 2's "compiled policies are shared (immutable) across evaluations").
pub fn prepare(policy: CompiledPolicy) -> Arc<EvalNode> {
    match policy {
        CompiledPolicy::Rule(rule) => Arc::new(EvalNode::Rule(rule)),
        CompiledPolicy::Set(set) => {
            let CompiledPolicySet {
                name,
                variables,
                algorithm,
                policies,
                target,
                schemas,
                imports,
            } = set;
            let policies = policies.into_iter().map(prepare).collect();
            Arc::new(EvalNode::Set {
                name,
                variables,
                algorithm,
                policies,
                target,
                schemas,
                imports,
            })
        }
    }
}

enum SchemaOutcome {
    Pass,
    NotApplicable,
    Indeterminate,
}

fn evaluate_schemas(schemas: &[PrecompiledSchemaValidator], subscription: &Subscription) -> SchemaOutcome {
    for schema in schemas {
        let value = match schema.element {
            SubscriptionElement::Subject => &subscription.subject,
            SubscriptionElement::Action => &subscription.action,
            SubscriptionElement::Resource => &subscription.resource,
            SubscriptionElement::Environment => &subscription.environment,
        };
        match value.to_json() {
            Err(_) => return SchemaOutcome::Indeterminate,
            Ok(json) => {
                if !schema.validator.is_valid(&json) {
                    return SchemaOutcome::NotApplicable;
                }
            }
        }
    }
    SchemaOutcome::Pass
}

fn once(decision: PolicyDecision) -> BoxStream<'static, PolicyDecision> {
    futures::stream::once(futures::future::ready(decision)).boxed()
}

fn scoped(ctx: &EvaluationContext, imports: Arc<ImportTable>) -> EvaluationContext {
    EvaluationContext {
        imports,
        ..ctx.clone()
    }
}

/// Evaluate any compiled policy node (rule or set) into a reactive stream
/// of aggregate decisions, deduplicated on structural equality (spec
/// Section 4.4: "...if and only if the final decision value differs from
/// the last emitted one").
pub fn evaluate_policy(node: Arc<EvalNode>, ctx: EvaluationContext) -> BoxStream<'static, PolicyDecision> {
    let raw = match node.as_ref() {
        EvalNode::Rule(_) => evaluate_rule(node, ctx),
        EvalNode::Set { .. } => evaluate_set(node, ctx),
    };
    dedup(raw)
}

/// Drop consecutive duplicate emissions (spec Section 4.4 and, at the
/// aggregate layer, Section 8's dedup invariant).
pub fn dedup(stream: BoxStream<'static, PolicyDecision>) -> BoxStream<'static, PolicyDecision> {
    Box::pin(async_stream::stream! {
        futures::pin_mut!(stream);
        let mut last: Option<PolicyDecision> = None;
        while let Some(next) = stream.next().await {
            if last.as_ref() != Some(&next) {
                last = Some(next.clone());
                yield next;
            }
        }
    })
}

fn evaluate_rule(node: Arc<EvalNode>, ctx: EvaluationContext) -> BoxStream<'static, PolicyDecision> {
    let rule = match node.as_ref() {
        EvalNode::Rule(r) => r,
        _ => unreachable!(),
    };
    let ctx = scoped(&ctx, rule.imports.clone());

    match evaluate_schemas(&rule.schemas, &ctx.subscription) {
        SchemaOutcome::NotApplicable => return once(PolicyDecision::not_applicable()),
        SchemaOutcome::Indeterminate => return once(PolicyDecision::indeterminate()),
        SchemaOutcome::Pass => {}
    }

    let target = rule.target.evaluate(&ctx);
    match target.value.as_bool() {
        Some(true) => {}
        Some(false) => return once(PolicyDecision::not_applicable()),
        None => return once(PolicyDecision::indeterminate()),
    }

    let body = evaluate_body(node.clone(), 0, ctx, Arc::new(HashSet::new()));
    switch_map(body, move |outcome| match outcome {
        BodyOutcome::NotApplicable => once(PolicyDecision::not_applicable()),
        BodyOutcome::Indeterminate => once(PolicyDecision::indeterminate()),
        BodyOutcome::FellThrough(final_ctx) => finalize_decision_stream(node.clone(), final_ctx),
    })
}

enum BodyOutcome {
    NotApplicable,
    Indeterminate,
    FellThrough(EvaluationContext),
}

fn once_body(outcome: BodyOutcome) -> BoxStream<'static, BodyOutcome> {
    futures::stream::once(futures::future::ready(outcome)).boxed()
}

/// Evaluate `rule.body[index..]` left to right (spec Section 4.4 step 3).
/// A `ValueDefinition` binds a local variable (duplicate names are
/// `indeterminate`); a `Condition` gates on a boolean. Whichever
/// sub-expression is live (Stream stratum), the remainder of the body
/// restarts on every new value (`switch_map`), matching "re-triggers
/// evaluation of the smallest enclosing expression subtree".
fn evaluate_body(
    node: Arc<EvalNode>,
    index: usize,
    ctx: EvaluationContext,
    bound: Arc<HashSet<String>>,
) -> BoxStream<'static, BodyOutcome> {
    let rule = match node.as_ref() {
        EvalNode::Rule(r) => r,
        _ => unreachable!(),
    };

    let Some(statement) = rule.body.get(index) else {
        return once_body(BodyOutcome::FellThrough(ctx));
    };

    match statement {
        CompiledStatement::ValueDefinition { name, value } => {
            if bound.contains(name) {
                return once_body(BodyOutcome::Indeterminate);
            }
            let mut next_bound = (*bound).clone();
            next_bound.insert(name.clone());
            let next_bound = Arc::new(next_bound);
            let name = name.clone();

            let outer = sapl_compile::passes::subscribe_any(value, ctx.clone());
            switch_map(outer, move |tv: TracedValue| {
                let next_ctx = ctx.with_variable(name.clone(), tv.value.clone());
                evaluate_body(node.clone(), index + 1, next_ctx, next_bound.clone())
            })
        }
        CompiledStatement::Condition(expr) => {
            let outer = sapl_compile::passes::subscribe_any(expr, ctx.clone());
            switch_map(outer, move |tv: TracedValue| {
                if tv.value.is_error() {
                    return once_body(BodyOutcome::Indeterminate);
                }
                match tv.value.as_bool() {
                    Some(true) => evaluate_body(node.clone(), index + 1, ctx.clone(), bound.clone()),
                    Some(false) => once_body(BodyOutcome::NotApplicable),
                    None => once_body(BodyOutcome::Indeterminate),
                }
            })
        }
    }
}

fn const_array_stream(value: Value) -> BoxStream<'static, TracedValue> {
    futures::stream::once(futures::future::ready(TracedValue::new(
        value,
        sapl_compile::Trace::leaf("default", None),
    )))
    .boxed()
}

/// Evaluate obligation/advice/transform, if present, reactively combined
/// via `combine_latest` (spec Section 4.4 step 4): any value changing
/// re-evaluates the whole triple, since all three feed one emitted
/// decision.
fn finalize_decision_stream(node: Arc<EvalNode>, ctx: EvaluationContext) -> BoxStream<'static, PolicyDecision> {
    let rule = match node.as_ref() {
        EvalNode::Rule(r) => r,
        _ => unreachable!(),
    };
    let entitlement = rule.entitlement;

    let obligation_stream = rule
        .obligation
        .as_ref()
        .map(|op| op.subscribe(ctx.clone()))
        .unwrap_or_else(|| const_array_stream(Value::Array(Vec::new())));
    let advice_stream = rule
        .advice
        .as_ref()
        .map(|op| op.subscribe(ctx.clone()))
        .unwrap_or_else(|| const_array_stream(Value::Array(Vec::new())));
    let has_transform = rule.transform.is_some();
    let mut streams = vec![obligation_stream, advice_stream];
    if let Some(transform) = &rule.transform {
        streams.push(transform.subscribe(ctx.clone()));
    }

    combine_latest(streams)
        .map(move |vals: Vec<TracedValue>| {
            let obligation = &vals[0];
            let advice = &vals[1];
            let transform = if has_transform { vals.get(2) } else { None };

            if obligation.value.is_error() || advice.value.is_error() || transform.is_some_and(|t| t.value.is_error())
            {
                return PolicyDecision::indeterminate();
            }

            let obligations = match &obligation.value {
                Value::Array(items) => items.clone(),
                _ => return PolicyDecision::indeterminate(),
            };
            let advice = match &advice.value {
                Value::Array(items) => items.clone(),
                _ => return PolicyDecision::indeterminate(),
            };
            let resource = transform.map(|t| t.value.clone());

            match entitlement {
                PolicyKind::Permit => PolicyDecision::permit(obligations, advice, resource),
                PolicyKind::Deny => PolicyDecision::deny(obligations, advice, resource),
            }
        })
        .boxed()
}

fn evaluate_set(node: Arc<EvalNode>, ctx: EvaluationContext) -> BoxStream<'static, PolicyDecision> {
    let (target, schemas, imports, variables, algorithm, policies) = match node.as_ref() {
        EvalNode::Set {
            target,
            schemas,
            imports,
            variables,
            algorithm,
            policies,
            ..
        } => (target, schemas, imports.clone(), variables, *algorithm, policies),
        _ => unreachable!(),
    };

    let ctx = scoped(&ctx, imports);

    match evaluate_schemas(schemas, &ctx.subscription) {
        SchemaOutcome::NotApplicable => return once(PolicyDecision::not_applicable()),
        SchemaOutcome::Indeterminate => return once(PolicyDecision::indeterminate()),
        SchemaOutcome::Pass => {}
    }

    let set_target = target.evaluate(&ctx);
    match set_target.value.as_bool() {
        Some(true) => {}
        Some(false) => return once(PolicyDecision::not_applicable()),
        None => return once(PolicyDecision::indeterminate()),
    }

    let mut var_ctx = ctx;
    for (name, operator) in variables {
        let tv = operator.evaluate(&var_ctx);
        if tv.value.is_error() {
            return once(PolicyDecision::indeterminate());
        }
        var_ctx = var_ctx.with_variable(name.clone(), tv.value);
    }

    if policies.is_empty() {
        return once(combine::combine(algorithm, &[]));
    }

    let child_streams: Vec<BoxStream<'static, PolicyDecision>> = policies
        .iter()
        .map(|child| evaluate_policy(child.clone(), var_ctx.clone()))
        .collect();

    combine_decision_streams(algorithm, child_streams)
}

/// Generic `combine_latest` over `PolicyDecision` streams (spec Section
/// 4.4's "combine using the set's algorithm", applied reactively: the
/// aggregate recomputes whenever any one child's decision changes).
/// `sapl_compile::stream_util::combine_latest` is specific to
/// `TracedValue`; this is the same shape one layer up, where the payload
/// is an already-reduced `PolicyDecision` rather than a raw value.
pub fn combine_decision_streams(
    algorithm: sapl_core::CombiningAlgorithm,
    streams: Vec<BoxStream<'static, PolicyDecision>>,
) -> BoxStream<'static, PolicyDecision> {
    let n = streams.len();
    let indexed = streams
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.map(move |d| (i, d)).boxed())
        .collect::<Vec<_>>();
    let merged = futures::stream::select_all(indexed);

    Box::pin(async_stream::stream! {
        let mut latest: Vec<Option<PolicyDecision>> = vec![None; n];
        futures::pin_mut!(merged);
        while let Some((i, d)) = merged.next().await {
            latest[i] = Some(d);
            if latest.iter().all(Option::is_some) {
                let snapshot: Vec<PolicyDecision> = latest.iter().map(|o| o.clone().unwrap()).collect();
                yield combine::combine(algorithm, &snapshot);
            }
        }
    })
}

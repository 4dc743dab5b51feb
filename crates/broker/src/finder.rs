//! The finder-registration contract (spec Section 9 re-architecture note:
//! "explicit `AttributeFinderSpecification` values plus a plain function
//! pointer / trait object passed at registration. No runtime reflection;
//! finders are data.").
//!
//! Grounded on `tenor-eval::fact_provider::FactProvider` -- an
//! `async_trait` supplier invoked by the evaluator with no reflection --
//! generalized from Tenor's one-shot `provide()` call into a
//! stream-returning call, since a SAPL attribute is continuous rather than
//! fetched once per evaluation.

use futures::stream::BoxStream;
use sapl_core::Value;

/// A registered attribute finder. `invoke` is handed the already-validated
/// argument vector (entity prepended unless environment-attribute,
/// variables map appended if `takes_variables`, spec Section 4.3 step 4)
/// and returns its upstream sequence.
///
/// `is_streaming` tells the broker whether the returned stream is expected
/// to emit further values on its own (a true "stream" finder, e.g. a
/// sensor feed) or completes after one value (a "pull" finder, e.g. a
/// database lookup) that the broker should re-invoke on `poll_interval`.
pub trait AttributeFinder: Send + Sync {
    fn invoke(&self, args: &[Value]) -> BoxStream<'static, Value>;
    fn is_streaming(&self) -> bool;
}

/// Wraps a plain synchronous function `Fn(&[Value]) -> Value` as a
/// one-shot, non-streaming finder -- the common case (most attributes are
/// pull-style lookups, not live feeds).
pub struct FnFinder<F>(pub F)
where
    F: Fn(&[Value]) -> Value + Send + Sync;

impl<F> AttributeFinder for FnFinder<F>
where
    F: Fn(&[Value]) -> Value + Send + Sync,
{
    fn invoke(&self, args: &[Value]) -> BoxStream<'static, Value> {
        let value = (self.0)(args);
        Box::pin(futures::stream::once(futures::future::ready(value)))
    }

    fn is_streaming(&self) -> bool {
        false
    }
}

/// Wraps a function that builds a fresh live stream per invocation (e.g.
/// backed by a `tokio::sync::broadcast` feed or a websocket) as a
/// streaming finder -- the broker never re-invokes it on a poll interval,
/// since it is expected to keep emitting on its own.
pub struct StreamFinder<F>(pub F)
where
    F: Fn(&[Value]) -> BoxStream<'static, Value> + Send + Sync;

impl<F> AttributeFinder for StreamFinder<F>
where
    F: Fn(&[Value]) -> BoxStream<'static, Value> + Send + Sync,
{
    fn invoke(&self, args: &[Value]) -> BoxStream<'static, Value> {
        (self.0)(args)
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

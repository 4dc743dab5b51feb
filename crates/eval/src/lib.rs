//! sapl-eval: the Policy Evaluator, Combining Algorithms, Policy
//! Retrieval Point collaborator interface, and Subscription Dispatcher
//! (spec Section 2, 4.4-4.6).
//!
//! `evaluator` walks one compiled policy into a reactive decision stream;
//! `combine` reduces a list of those decisions per spec Section 4.5;
//! `prp` is the collaborator contract the dispatcher queries for
//! applicable policies; `dispatcher` is the top-level entry point tying
//! all three together for one subscription.

pub mod combine;
pub mod decision;
pub mod dispatcher;
pub mod evaluator;
pub mod prp;

pub use decision::{Decision, PolicyDecision};
pub use dispatcher::{dispatch, DispatchedDecision, PdpConfiguration};
pub use evaluator::{evaluate_policy, prepare, EvalNode};
pub use prp::{MatchingDocuments, PolicyRetrievalPoint, StaticPolicyRetrievalPoint};

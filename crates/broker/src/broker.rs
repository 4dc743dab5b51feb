//! The Attribute Broker itself (spec Section 4.3): routes
//! `AttributeFinderInvocation`s to registered finders, caches live streams
//! by invocation fingerprint, and exposes the admin
//! `register`/`remove_attribute_finder` operations.
//!
//! The cache is a `Vec` scanned by `PartialEq` rather than a `HashMap`:
//! `AttributeFinderInvocation` derives `Eq` but not `Hash` (it embeds
//! `sapl_core::Value`, whose `Object`/`Array` variants would need to
//! commit to a specific collision policy for `IndexMap`/`Decimal` hashing
//! that the spec leaves unspecified). A production deployment with many
//! concurrent distinct invocations would index this properly; for the
//! scale this engine's tests and CLI exercise, a linear scan guarded by
//! one `tokio::sync::Mutex` matches "the broker's cache map is the only
//! cross-subscription mutable state... writes must be serialized" (spec
//! Section 5) without inventing a hashing scheme the spec doesn't define.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use sapl_compile::{AttributeFinderInvocation, AttributeFinderSpecification, InnerArity, TracedValue};
use sapl_core::Value;

use crate::config::BrokerConfig;
use crate::entry::{ServedBy, StreamEntry};
use crate::error::BrokerError;
use crate::finder::AttributeFinder;

struct RegisteredFinder {
    spec: AttributeFinderSpecification,
    finder: Arc<dyn AttributeFinder>,
}

struct Inner {
    config: BrokerConfig,
    registry: Mutex<std::collections::HashMap<String, RegisteredFinder>>,
    cache: Mutex<Vec<(AttributeFinderInvocation, Arc<StreamEntry>)>>,
}

/// The concrete, stateful Attribute Broker. Cheaply `Clone`-able (an
/// `Arc` wrapper); share one instance across every subscription in a PDP.
#[derive(Clone)]
pub struct AttributeBroker {
    inner: Arc<Inner>,
}

impl AttributeBroker {
    pub fn new(config: BrokerConfig) -> Self {
        AttributeBroker {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(std::collections::HashMap::new()),
                cache: Mutex::new(Vec::new()),
            }),
        }
    }

    pub async fn register_attribute_finder(
        &self,
        spec: AttributeFinderSpecification,
        finder: Arc<dyn AttributeFinder>,
    ) -> Result<(), BrokerError> {
        if spec.fully_qualified_name.is_empty() {
            return Err(BrokerError::InvalidSpecification {
                name: spec.fully_qualified_name.clone(),
                reason: "fully qualified name must not be empty".to_string(),
            });
        }
        let name = spec.fully_qualified_name.clone();
        {
            let mut registry = self.inner.registry.lock().await;
            if registry.contains_key(&name) {
                return Err(BrokerError::AlreadyRegistered(name));
            }
            registry.insert(name.clone(), RegisteredFinder { spec, finder });
        }

        // Invalidate any cache entry previously served as "unresolved"
        // under this exact name -- a fresh finder may now answer it (spec
        // Section 4.3: "invalidates any cached AttributeStream whose
        // invocation name is unresolved").
        let mut cache = self.inner.cache.lock().await;
        let before = cache.len();
        cache.retain(|(invocation, entry)| {
            !(entry.served_by == ServedBy::Unresolved && invocation.fully_qualified_name == name)
        });
        if cache.len() != before {
            info!(attribute = %name, "invalidated cached unresolved lookups after finder registration");
        }

        Ok(())
    }

    pub async fn remove_attribute_finder(&self, name: &str) -> Result<(), BrokerError> {
        let removed = self.inner.registry.lock().await.remove(name);
        if removed.is_none() {
            return Err(BrokerError::NotRegistered(name.to_string()));
        }

        let cache = self.inner.cache.lock().await;
        let affected: Vec<Arc<StreamEntry>> = cache
            .iter()
            .filter(|(_, entry)| entry.served_by == ServedBy::Finder(name.to_string()))
            .map(|(_, entry)| entry.clone())
            .collect();
        drop(cache);

        for entry in affected {
            entry.force_terminate("attribute no longer available").await;
        }
        let mut cache = self.inner.cache.lock().await;
        cache.retain(|(_, entry)| entry.served_by != ServedBy::Finder(name.to_string()));
        warn!(finder = %name, "attribute finder removed; dependent cache entries terminated");
        Ok(())
    }

    async fn find_cached(&self, invocation: &AttributeFinderInvocation) -> Option<Arc<StreamEntry>> {
        let cache = self.inner.cache.lock().await;
        cache
            .iter()
            .find(|(key, _)| key == invocation)
            .map(|(_, entry)| entry.clone())
    }

    async fn insert_cache(&self, invocation: AttributeFinderInvocation, entry: Arc<StreamEntry>) {
        self.inner.cache.lock().await.push((invocation, entry));
    }

    #[cfg(test)]
    pub(crate) async fn cache_len(&self) -> usize {
        self.inner.cache.lock().await.len()
    }

    fn remove_cache_entry(&self, target: &Arc<StreamEntry>) {
        let inner = self.inner.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let mut cache = inner.cache.lock().await;
            cache.retain(|(_, entry)| !Arc::ptr_eq(entry, &target));
        });
    }

    /// Resolve `invocation` to its cache entry (creating one if needed)
    /// and attach a subscriber to it, returning both the entry (so the
    /// caller can detach from the *same* entry on cancellation) and the
    /// subscriber's stream.
    async fn resolve_and_subscribe(
        &self,
        invocation: AttributeFinderInvocation,
    ) -> (Arc<StreamEntry>, BoxStream<'static, TracedValue>) {
        if let Some(entry) = self.find_cached(&invocation).await {
            let stream = entry.subscribe().await;
            return (entry, stream);
        }

        let registry = self.inner.registry.lock().await;
        let registered = registry.get(&invocation.fully_qualified_name);

        let (spec, finder) = match registered {
            Some(r) => (r.spec.clone(), r.finder.clone()),
            None => {
                drop(registry);
                let entry = StreamEntry::terminal(
                    ServedBy::Unresolved,
                    Value::error(format!("unknown attribute {}", invocation.fully_qualified_name), None),
                    "broker:unknown-attribute",
                );
                self.insert_cache(invocation, entry.clone()).await;
                let stream = entry.subscribe().await;
                return (entry, stream);
            }
        };
        drop(registry);

        if !spec.validate_entity(invocation.entity.as_ref()) {
            let entry = StreamEntry::terminal(
                ServedBy::Finder(spec.fully_qualified_name.clone()),
                Value::error(
                    format!("attribute '{}': invalid entity argument", invocation.fully_qualified_name),
                    None,
                ),
                "broker:validation-failure",
            );
            self.insert_cache(invocation, entry.clone()).await;
            let stream = entry.subscribe().await;
            return (entry, stream);
        }
        if !spec.validate_arguments(&invocation.arguments) {
            let entry = StreamEntry::terminal(
                ServedBy::Finder(spec.fully_qualified_name.clone()),
                Value::error(
                    format!("attribute '{}': invalid argument(s)", invocation.fully_qualified_name),
                    None,
                ),
                "broker:validation-failure",
            );
            self.insert_cache(invocation, entry.clone()).await;
            let stream = entry.subscribe().await;
            return (entry, stream);
        }

        let args = build_argument_vector(&spec, &invocation);
        let entry = StreamEntry::live(spec.fully_qualified_name.clone(), finder, args, invocation.clone());
        self.insert_cache(invocation, entry.clone()).await;
        let stream = entry.subscribe().await;
        (entry, stream)
    }
}

/// Build the finder call's argument vector per spec Section 4.3 step 4:
/// entity prepended unless the attribute is environment-scoped; arguments
/// either spread or packed into one `Array` for a variadic finder;
/// variables map appended last if the spec declares `takes_variables`.
fn build_argument_vector(spec: &AttributeFinderSpecification, invocation: &AttributeFinderInvocation) -> Vec<Value> {
    let mut out = Vec::new();
    if !spec.is_environment_attribute {
        out.push(invocation.entity.clone().unwrap_or(Value::Undefined));
    }
    match spec.inner_arity {
        InnerArity::Variadic => out.push(Value::Array(invocation.arguments.clone())),
        InnerArity::Fixed(_) => out.extend(invocation.arguments.iter().cloned()),
    }
    if spec.takes_variables {
        let mut map = indexmap::IndexMap::with_capacity(invocation.variables.len());
        for (k, v) in &invocation.variables {
            map.insert(k.clone(), v.clone());
        }
        out.push(Value::Object(map));
    }
    out
}

struct SubscriptionGuard {
    entry: Arc<StreamEntry>,
    broker: AttributeBroker,
    grace_period: Duration,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let entry = self.entry.clone();
        let broker = self.broker.clone();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            let for_cleanup = entry.clone();
            entry
                .unsubscribe(grace_period, move || broker.remove_cache_entry(&for_cleanup))
                .await;
        });
    }
}

impl sapl_compile::AttributeBroker for AttributeBroker {
    fn attribute_stream(&self, mut invocation: AttributeFinderInvocation) -> BoxStream<'static, TracedValue> {
        self.inner.config.resolve_timing(&mut invocation);
        let this = self.clone();
        let grace_period = self.inner.config.default_grace_period;

        Box::pin(async_stream::stream! {
            let (entry, inner_stream) = this.resolve_and_subscribe(invocation).await;
            futures::pin_mut!(inner_stream);

            let _guard = SubscriptionGuard {
                entry,
                broker: this.clone(),
                grace_period,
            };

            while let Some(item) = inner_stream.next().await {
                yield item;
            }
        })
    }

    fn provided_functions_of_library(&self, library: &str) -> HashSet<String> {
        // Synchronous trait method over async-guarded state: broker
        // registration is rare relative to lookups, so a short blocking
        // wait here (rather than threading async through the whole
        // `sapl-compile` trait surface) is the simpler contract.
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                self.inner
                    .registry
                    .lock()
                    .await
                    .keys()
                    .filter(|name| name.rsplit_once('.').map(|(lib, _)| lib) == Some(library))
                    .cloned()
                    .collect()
            })
        })
    }

    fn is_provided_function(&self, fully_qualified_name: &str) -> bool {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                self.inner.registry.lock().await.contains_key(fully_qualified_name)
            })
        })
    }
}

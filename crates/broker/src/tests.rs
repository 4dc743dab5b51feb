//! Broker-level integration tests for the two attribute-broker end-to-end
//! scenarios named literally in the spec (Section 8, scenarios 1 and 2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use rust_decimal::Decimal;

use sapl_compile::{AttributeBroker as _, AttributeFinderInvocation, AttributeFinderSpecification, InnerArity};
use sapl_core::Value;

use crate::{AttributeBroker, BrokerConfig, StreamFinder};

fn invocation(name: &str) -> AttributeFinderInvocation {
    AttributeFinderInvocation {
        config_id: "pdp-1".to_string(),
        fully_qualified_name: name.to_string(),
        entity: None,
        arguments: vec![],
        variables: HashMap::new(),
        initial_timeout_millis: 0,
        freshness_ttl_millis: 0,
        poll_interval_millis: None,
        backoff_budget: 0,
        request_initial_only: false,
    }
}

#[tokio::test]
async fn unknown_attribute_yields_terminal_error() {
    let broker = AttributeBroker::new(BrokerConfig::default());
    let mut stream = broker.attribute_stream(invocation("unknown.attr"));
    let first = stream.next().await.expect("a terminal value");
    assert!(first.value.is_error());
    assert!(stream.next().await.is_none(), "unknown attribute is a single terminal emission");
}

#[tokio::test(start_paused = true)]
async fn grace_period_replays_latest_to_new_subscriber() {
    let broker = AttributeBroker::new(BrokerConfig {
        default_grace_period: Duration::from_millis(200),
        ..Default::default()
    });

    let finder: Arc<dyn crate::AttributeFinder> = Arc::new(StreamFinder(|_args: &[Value]| -> BoxStream<'static, Value> {
        async_stream::stream! {
            yield Value::Number(Decimal::from(1));
            tokio::time::sleep(Duration::from_millis(1000)).await;
            yield Value::Number(Decimal::from(2));
            tokio::time::sleep(Duration::from_millis(1000)).await;
            yield Value::Number(Decimal::from(3));
        }
        .boxed()
    }));

    let spec = AttributeFinderSpecification {
        fully_qualified_name: "foo.bar".to_string(),
        is_environment_attribute: true,
        inner_arity: InnerArity::Fixed(0),
        takes_variables: false,
        entity_validator: None,
        parameter_validators: vec![],
    };
    broker.register_attribute_finder(spec, finder).await.unwrap();

    let inv = invocation("foo.bar");

    let mut a = broker.attribute_stream(inv.clone());
    let first = a.next().await.unwrap();
    assert_eq!(first.value, Value::Number(Decimal::from(1)));
    drop(a);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut b = broker.attribute_stream(inv.clone());
    let replayed = b.next().await.unwrap();
    assert_eq!(replayed.value, Value::Number(Decimal::from(1)), "B's first value must be the replayed latest");

    let second = b.next().await.unwrap();
    assert_eq!(second.value, Value::Number(Decimal::from(2)));
    let third = b.next().await.unwrap();
    assert_eq!(third.value, Value::Number(Decimal::from(3)));

    drop(b);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(broker.cache_len().await, 0, "cache entry must be torn down once the grace period fully expires");
}

#[tokio::test]
async fn removing_a_finder_terminates_its_dependent_streams() {
    let broker = AttributeBroker::new(BrokerConfig::default());
    let finder: Arc<dyn crate::AttributeFinder> =
        Arc::new(crate::FnFinder(|_args: &[Value]| Value::Boolean(true)));
    let spec = AttributeFinderSpecification {
        fully_qualified_name: "risk.level".to_string(),
        is_environment_attribute: true,
        inner_arity: InnerArity::Fixed(0),
        takes_variables: false,
        entity_validator: None,
        parameter_validators: vec![],
    };
    broker.register_attribute_finder(spec, finder).await.unwrap();

    let inv = invocation("risk.level");
    let mut s = broker.attribute_stream(inv.clone());
    let first = s.next().await.unwrap();
    assert_eq!(first.value, Value::Boolean(true));

    broker.remove_attribute_finder("risk.level").await.unwrap();

    // A fresh subscription to the same invocation (still cached, now
    // terminated) must observe the "no longer available" terminal error.
    let mut s2 = broker.attribute_stream(inv);
    let after_removal = s2.next().await.unwrap();
    assert!(after_removal.value.is_error());
}

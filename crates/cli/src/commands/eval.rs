use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use futures::StreamExt;
use sapl_broker::BrokerConfig;
use sapl_core::{CombiningAlgorithm, Value};
use sapl_eval::{dispatch, PdpConfiguration, PolicyRetrievalPoint, StaticPolicyRetrievalPoint};

use crate::finders::{load_static_finders, NoFunctionBroker};
use crate::{report_error, OutputFormat};

fn read_json(path: &Path, output: OutputFormat, quiet: bool) -> serde_json::Value {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            report_error(&format!("error: file not found: {}", path.display()), output, quiet);
            process::exit(1);
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            report_error(&format!("error: invalid JSON in {}: {}", path.display(), e), output, quiet);
            process::exit(1);
        }
    }
}

/// Compile one policy file, evaluate it against one subscription, and
/// print the first `limit` aggregate decisions the dispatcher emits.
/// Every attribute finder in this demo is one-shot (`crate::finders`), so
/// the stream naturally completes after its first decision unless the
/// policy itself has no live sub-expressions left to settle -- `limit`
/// exists mainly to bound a policy that legitimately emits more than one
/// decision before converging.
pub(crate) async fn cmd_eval(
    policy_path: &Path,
    subscription_path: &Path,
    attributes_path: Option<&PathBuf>,
    algorithm: &str,
    limit: usize,
    output: OutputFormat,
    quiet: bool,
) {
    let doc_name = policy_path.display().to_string();
    let policy_json = read_json(policy_path, output, quiet);
    let document = match crate::policy_json::parse_policy_document(&policy_json, &doc_name) {
        Ok(d) => d,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    };
    let compiled = match sapl_compile::compile_policy_document(&document) {
        Ok(c) => c,
        Err(e) => {
            report_error(&format!("{}", e), output, quiet);
            process::exit(1);
        }
    };

    let algorithm: CombiningAlgorithm = match serde_json::from_value(serde_json::Value::String(algorithm.to_string()))
    {
        Ok(a) => a,
        Err(_) => {
            report_error(&format!("error: unknown combining algorithm '{}'", algorithm), output, quiet);
            process::exit(1);
        }
    };

    let subscription_json = read_json(subscription_path, output, quiet);
    let subscription = Arc::new(sapl_compile::Subscription::new(
        subscription_json.get("subject").map(Value::from_json).unwrap_or(Value::Undefined),
        subscription_json.get("action").map(Value::from_json).unwrap_or(Value::Undefined),
        subscription_json.get("resource").map(Value::from_json).unwrap_or(Value::Undefined),
        subscription_json.get("environment").map(Value::from_json),
    ));

    let attribute_broker = sapl_broker::AttributeBroker::new(BrokerConfig::default());
    if let Some(path) = attributes_path {
        match load_static_finders(&attribute_broker, path).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                report_error(&format!("error: registering attribute finders: {}", e), output, quiet);
                process::exit(1);
            }
            Err(e) => {
                report_error(&format!("error: reading {}: {}", path.display(), e), output, quiet);
                process::exit(1);
            }
        }
    }

    let config = Arc::new(PdpConfiguration {
        pdp_id: Arc::from("sapl-cli"),
        configuration_id: Arc::from("default"),
        algorithm,
        function_broker: Arc::new(NoFunctionBroker),
        attribute_broker: Arc::new(attribute_broker),
    });

    let prp: Arc<dyn PolicyRetrievalPoint> =
        Arc::new(StaticPolicyRetrievalPoint::match_all(vec![Arc::new(compiled)]));

    tracing::info!(policy = %doc_name, "dispatching subscription");
    let mut stream = dispatch(config, prp, subscription);
    let mut emitted = 0usize;
    while emitted < limit {
        match stream.next().await {
            Some(decision) => {
                tracing::info!(decision = decision.decision.decision.as_str(), "emitted");
                print_decision(&decision, output, quiet);
                emitted += 1;
            }
            None => break,
        }
    }
}

fn print_decision(decision: &sapl_eval::DispatchedDecision, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Json => {
            let mut json = decision.decision.to_json();
            if let serde_json::Value::Object(map) = &mut json {
                map.insert("totalDocuments".to_string(), serde_json::json!(decision.total_documents));
            }
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e)));
        }
        OutputFormat::Text => {
            println!(
                "{} (totalDocuments={})",
                decision.decision.decision.as_str(),
                decision.total_documents
            );
        }
    }
}

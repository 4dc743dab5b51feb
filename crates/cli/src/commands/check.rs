use std::path::Path;
use std::process;

use crate::{report_error, OutputFormat};

/// Read a policy JSON file and compile it, without evaluating anything.
/// Mirrors `tenor-cli check`'s elaborate-then-report shape, minus the
/// static-analysis selection (SAPL has no analysis suite in scope).
pub(crate) fn cmd_check(file: &Path, output: OutputFormat, quiet: bool) {
    let source = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(_) => {
            report_error(&format!("error: policy file not found: {}", file.display()), output, quiet);
            process::exit(1);
        }
    };

    let doc_name = file.display().to_string();
    let json: serde_json::Value = match serde_json::from_str(&source) {
        Ok(v) => v,
        Err(e) => {
            report_error(&format!("error: invalid JSON in {}: {}", doc_name, e), output, quiet);
            process::exit(1);
        }
    };

    let document = match crate::policy_json::parse_policy_document(&json, &doc_name) {
        Ok(d) => d,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    };

    match sapl_compile::compile_policy_document(&document) {
        Ok(compiled) => {
            tracing::info!(policy = compiled.name(), "compiled successfully");
            if !quiet {
                match output {
                    OutputFormat::Text => println!("ok: '{}' compiles cleanly", compiled.name()),
                    OutputFormat::Json => {
                        println!(
                            "{}",
                            serde_json::json!({"status": "ok", "name": compiled.name()})
                        );
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "compile failed");
            report_error(&format!("{}", e), output, quiet);
            process::exit(1);
        }
    }
}

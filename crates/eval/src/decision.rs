//! The aggregate decision type and its JSON boundary (spec Section 6).
//!
//! Grounded on `tenor-eval::types::VerdictSet::to_json`, which likewise
//! hand-serializes a runtime value into a JSON object rather than
//! deriving `serde::Serialize` over it -- `Value` itself has no derived
//! impl (`to_json`/`from_json` are its boundary), so `PolicyDecision`
//! follows the same pattern one layer up.

use sapl_core::Value;

/// One of the four outcomes named in spec Section 1/6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Deny,
    Indeterminate,
    NotApplicable,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Permit => "PERMIT",
            Decision::Deny => "DENY",
            Decision::Indeterminate => "INDETERMINATE",
            Decision::NotApplicable => "NOT_APPLICABLE",
        }
    }
}

/// The per-policy or aggregate decision (spec Section 6: `decision`,
/// optional `obligations`, `advice`, `resource`). Obligations/advice are
/// always present as (possibly empty) ordered lists internally; they are
/// only omitted from the JSON form when empty, matching the spec's
/// "optional" framing at the wire boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub obligations: Vec<Value>,
    pub advice: Vec<Value>,
    pub resource: Option<Value>,
}

impl PolicyDecision {
    pub fn permit(obligations: Vec<Value>, advice: Vec<Value>, resource: Option<Value>) -> Self {
        PolicyDecision {
            decision: Decision::Permit,
            obligations,
            advice,
            resource,
        }
    }

    pub fn deny(obligations: Vec<Value>, advice: Vec<Value>, resource: Option<Value>) -> Self {
        PolicyDecision {
            decision: Decision::Deny,
            obligations,
            advice,
            resource,
        }
    }

    /// Indeterminate carries no obligations, advice, or resource (spec
    /// Section 4.4: "turns the decision into indeterminate with no
    /// obligations, advice, or resource").
    pub fn indeterminate() -> Self {
        PolicyDecision {
            decision: Decision::Indeterminate,
            obligations: Vec::new(),
            advice: Vec::new(),
            resource: None,
        }
    }

    pub fn not_applicable() -> Self {
        PolicyDecision {
            decision: Decision::NotApplicable,
            obligations: Vec::new(),
            advice: Vec::new(),
            resource: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("decision".to_string(), serde_json::Value::String(self.decision.as_str().to_string()));
        if !self.obligations.is_empty() {
            out.insert(
                "obligations".to_string(),
                serde_json::Value::Array(
                    self.obligations
                        .iter()
                        .map(|v| v.to_json().unwrap_or(serde_json::Value::Null))
                        .collect(),
                ),
            );
        }
        if !self.advice.is_empty() {
            out.insert(
                "advice".to_string(),
                serde_json::Value::Array(
                    self.advice
                        .iter()
                        .map(|v| v.to_json().unwrap_or(serde_json::Value::Null))
                        .collect(),
                ),
            );
        }
        if let Some(resource) = &self.resource {
            out.insert(
                "resource".to_string(),
                resource.to_json().unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_serializes_with_obligations() {
        let d = PolicyDecision::permit(vec![Value::Text("notify".to_string())], vec![], None);
        let json = d.to_json();
        assert_eq!(json["decision"], "PERMIT");
        assert_eq!(json["obligations"][0], "notify");
        assert!(json.get("advice").is_none());
    }

    #[test]
    fn indeterminate_carries_nothing() {
        let d = PolicyDecision::indeterminate();
        let json = d.to_json();
        assert_eq!(json["decision"], "INDETERMINATE");
        assert!(json.get("obligations").is_none());
        assert!(json.get("resource").is_none());
    }
}

//! Validation rules.
//!
//! [`ValidationRules`] decide between `VALIDATED` and `NEEDS_REVIEW` once
//! extraction has succeeded. [`DocumentRules`] reject unusable uploads at
//! submit time, before any contract exists.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::DocumentRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Minimum accuracy score on the 0-100 scale.
    pub threshold: f64,
    /// Top-level fields that must be present and non-empty.
    pub required_fields: Vec<String>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            threshold: 95.0,
            required_fields: vec![
                "contract_number".to_string(),
                "parties".to_string(),
                "total_value".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    NeedsReview(Vec<String>),
}

impl ValidationRules {
    pub fn evaluate(&self, data: &Value, accuracy_score: f64) -> Verdict {
        let mut reasons = Vec::new();
        if accuracy_score < self.threshold {
            reasons.push(format!(
                "accuracy score {accuracy_score} below threshold {}",
                self.threshold
            ));
        }
        for field in &self.required_fields {
            if !is_present(data.get(field)) {
                reasons.push(format!("missing required field: {field}"));
            }
        }
        if reasons.is_empty() {
            Verdict::Accepted
        } else {
            Verdict::NeedsReview(reasons)
        }
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
        Some(_) => true,
    }
}

/// Upload constraints checked by `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentRules {
    /// Allowed file extensions, lower case without the dot.
    pub allowed_types: Vec<String>,
    pub max_size_bytes: u64,
}

impl Default for DocumentRules {
    fn default() -> Self {
        Self {
            allowed_types: ["pdf", "docx", "png", "jpg", "jpeg"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_size_bytes: 25 * 1024 * 1024,
        }
    }
}

impl DocumentRules {
    pub fn check(&self, document: &DocumentRef) -> Result<()> {
        let ext = document.extension().ok_or_else(|| {
            Error::InvalidDocument(format!("{} has no file extension", document.file_name))
        })?;
        if !self.allowed_types.iter().any(|t| t.eq_ignore_ascii_case(&ext)) {
            return Err(Error::InvalidDocument(format!(
                "file type .{ext} is not accepted"
            )));
        }
        if document.size_bytes == 0 {
            return Err(Error::InvalidDocument("document is empty".to_string()));
        }
        if document.size_bytes > self.max_size_bytes {
            return Err(Error::InvalidDocument(format!(
                "document is {} bytes, limit is {}",
                document.size_bytes, self.max_size_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete() -> Value {
        json!({
            "contract_number": "MSA-2024-017",
            "parties": ["Acme Corp", "Globex LLC"],
            "total_value": 125000.0,
        })
    }

    #[test]
    fn accepts_confident_complete_extraction() {
        let rules = ValidationRules::default();
        assert_eq!(rules.evaluate(&complete(), 97.0), Verdict::Accepted);
        assert_eq!(rules.evaluate(&complete(), 95.0), Verdict::Accepted);
    }

    #[test]
    fn low_score_and_missing_fields_are_both_reported() {
        let rules = ValidationRules {
            threshold: 80.0,
            ..ValidationRules::default()
        };
        let data = json!({ "contract_number": "MSA-1", "parties": [], "total_value": null });
        match rules.evaluate(&data, 62.0) {
            Verdict::NeedsReview(reasons) => {
                assert_eq!(reasons.len(), 3, "{reasons:?}");
                assert!(reasons[0].contains("below threshold"));
            }
            Verdict::Accepted => panic!("expected review"),
        }
    }

    #[test]
    fn document_rules_enforce_type_and_size() {
        let rules = DocumentRules::default();
        let mut doc = DocumentRef {
            uri: "s3://contracts/a.PDF".into(),
            file_name: "a.PDF".into(),
            content_type: "application/pdf".into(),
            size_bytes: 2048,
        };
        assert!(rules.check(&doc).is_ok());

        doc.size_bytes = 26 * 1024 * 1024;
        assert!(matches!(rules.check(&doc), Err(Error::InvalidDocument(_))));

        doc.size_bytes = 2048;
        doc.file_name = "payload.exe".into();
        assert!(matches!(rules.check(&doc), Err(Error::InvalidDocument(_))));
    }
}

//! Text sanitization, structural validation, field rules, and the storage encoding.
//!
//! The encoding is a format compatibility shim (base64 over UTF-8 JSON), not a
//! security boundary.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use doc_model::{Coordinates, Extraction, NewExtraction};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const MAX_TEXT_LENGTH: usize = 10_000;

static DOI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^10\.\d{4,}/[-._;()/:A-Za-z0-9]+$").expect("valid DOI regex")
});

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded bytes are not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Strips angle brackets, trims, and caps the result at [`MAX_TEXT_LENGTH`] characters.
pub fn sanitize_text(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !matches!(c, '<' | '>')).collect();
    stripped.trim().chars().take(MAX_TEXT_LENGTH).collect()
}

/// Escapes text for interpolation into HTML element content or attribute values.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn structurally_valid(field_name: &str, text: &str, page: u32, coordinates: &Coordinates) -> bool {
    !field_name.is_empty()
        && !text.is_empty()
        && page >= 1
        && coordinates.x >= 0.0
        && coordinates.y >= 0.0
        && coordinates.width > 0.0
        && coordinates.height > 0.0
}

/// Checks the structural invariants of a candidate extraction.
pub fn validate_extraction(candidate: &NewExtraction) -> bool {
    structurally_valid(&candidate.field_name, &candidate.text, candidate.page, &candidate.coordinates)
}

/// Same checks as [`validate_extraction`], applied to a stored record.
pub fn validate_record(record: &Extraction) -> bool {
    structurally_valid(&record.field_name, &record.text, record.page, &record.coordinates)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self { valid: true, message: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { valid: false, message: Some(message.into()) }
    }
}

/// Applies a comma-separated rule list (`required`, `minLength:N`, `doi`, `pmid`,
/// `year`) to a trimmed value and reports the first failing rule.
///
/// Format rules skip empty values; only `required` and `minLength` reject them.
pub fn validate_input(value: &str, rules: &str) -> ValidationResult {
    let value = value.trim();

    for rule in rules.split(',').map(str::trim).filter(|rule| !rule.is_empty()) {
        if rule == "required" && value.is_empty() {
            return ValidationResult::failed("This field is required");
        }

        if let Some(min) = rule.strip_prefix("minLength:") {
            if let Ok(min) = min.trim().parse::<usize>() {
                if value.chars().count() < min {
                    return ValidationResult::failed(format!(
                        "Minimum length is {min} characters"
                    ));
                }
            }
        }

        if value.is_empty() {
            continue;
        }

        match rule {
            "doi" if !DOI.is_match(value) => {
                return ValidationResult::failed("Invalid DOI format");
            }
            "pmid" if !value.chars().all(|c| c.is_ascii_digit()) => {
                return ValidationResult::failed("PMID must be numeric");
            }
            "year" if !leading_integer(value).is_some_and(|year| (1900..=2100).contains(&year)) => {
                return ValidationResult::failed("Invalid year");
            }
            _ => {}
        }
    }

    ValidationResult::ok()
}

/// Parses the optional sign and leading digits of `value`, ignoring any trailing text.
fn leading_integer(value: &str) -> Option<i64> {
    let end = value
        .char_indices()
        .find(|&(index, c)| !(c.is_ascii_digit() || (index == 0 && matches!(c, '-' | '+'))))
        .map_or(value.len(), |(index, _)| index);

    value[..end].parse().ok()
}

/// JSON, then UTF-8 bytes, then standard base64.
pub fn encode_data<T: Serialize + ?Sized>(value: &T) -> Result<String, EncodingError> {
    let json = serde_json::to_string(value)?;
    Ok(STANDARD.encode(json.as_bytes()))
}

pub fn decode_data<T: DeserializeOwned>(encoded: &str) -> Result<T, EncodingError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let json = String::from_utf8(bytes)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_model::ExtractionMethod;
    use serde_json::json;

    fn candidate() -> NewExtraction {
        NewExtraction {
            field_name: "sample_size".to_owned(),
            text: "120 patients".to_owned(),
            page: 3,
            coordinates: Coordinates::new(10.0, 20.0, 100.0, 15.0),
            method: ExtractionMethod::Manual,
            document_name: "trial.pdf".to_owned(),
        }
    }

    #[test]
    fn sanitize_caps_length_at_ten_thousand_chars() {
        let long = "a".repeat(15_000);

        assert_eq!(sanitize_text(&long).chars().count(), 10_000);
    }

    #[test]
    fn sanitize_strips_angle_brackets() {
        let cleaned = sanitize_text("<script>x</script>");

        assert!(!cleaned.contains('<'));
        assert!(!cleaned.contains('>'));
        assert_eq!(cleaned, "scriptx/script");
    }

    #[test]
    fn sanitize_trims_before_capping() {
        let padded = format!("   {}", "é".repeat(10_005));

        let cleaned = sanitize_text(&padded);

        assert!(cleaned.starts_with('é'));
        assert_eq!(cleaned.chars().count(), 10_000);
    }

    #[test]
    fn escape_html_covers_markup_characters() {
        assert_eq!(escape_html(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn structural_validation_rejects_each_invalid_field() {
        assert!(validate_extraction(&candidate()));

        let mut cases = Vec::new();
        cases.push(NewExtraction { field_name: String::new(), ..candidate() });
        cases.push(NewExtraction { text: String::new(), ..candidate() });
        cases.push(NewExtraction { page: 0, ..candidate() });
        for coordinates in [
            Coordinates::new(-1.0, 0.0, 10.0, 10.0),
            Coordinates::new(0.0, -1.0, 10.0, 10.0),
            Coordinates::new(0.0, 0.0, 0.0, 10.0),
            Coordinates::new(0.0, 0.0, 10.0, -2.0),
        ] {
            cases.push(NewExtraction { coordinates, ..candidate() });
        }

        for case in cases {
            assert!(!validate_extraction(&case), "{case:?} should be rejected");
        }
    }

    #[test]
    fn doi_rule_accepts_registrant_suffixes() {
        assert!(validate_input("10.1234/test-doi_2023.v1", "doi").valid);

        let rejected = validate_input("invalid-doi", "doi");
        assert!(!rejected.valid);
        assert_eq!(rejected.message.as_deref(), Some("Invalid DOI format"));
    }

    #[test]
    fn year_rule_is_inclusive_at_both_ends() {
        assert!(validate_input("1900", "year").valid);
        assert!(validate_input("2100", "year").valid);
        assert!(!validate_input("1899", "year").valid);
        assert!(!validate_input("2101", "year").valid);
        assert!(!validate_input("abc", "year").valid);
    }

    #[test]
    fn first_failing_rule_wins() {
        let result = validate_input("", "required,minLength:3");
        assert_eq!(result.message.as_deref(), Some("This field is required"));

        let result = validate_input("ab", "required,minLength:3,pmid");
        assert_eq!(result.message.as_deref(), Some("Minimum length is 3 characters"));

        let result = validate_input("12a", "minLength:3,pmid");
        assert_eq!(result.message.as_deref(), Some("PMID must be numeric"));
    }

    #[test]
    fn format_rules_ignore_empty_values() {
        assert!(validate_input("   ", "doi,pmid,year").valid);
        assert!(validate_input("anything", "").valid);
    }

    #[test]
    fn encoding_round_trips_awkward_strings() {
        let value = json!({
            "quote": "she said \"hi\"",
            "markup": "<b>bold</b>",
            "unicode": "β-blocker 5 µg · 患者",
            "nested": [1, 2.5, null, true],
        });

        let encoded = encode_data(&value).expect("value should encode");
        let decoded: serde_json::Value = decode_data(&encoded).expect("value should decode");

        assert_eq!(decoded, value);
        assert!(encoded.is_ascii());
    }

    #[test]
    fn encoding_matches_the_persisted_format() {
        // base64 of the UTF-8 JSON bytes of ["é"]
        assert_eq!(encode_data(&["é"]).expect("value should encode"), "WyLDqSJd");
    }

    #[test]
    fn decoding_garbage_is_an_error() {
        let err = decode_data::<serde_json::Value>("%%% not base64").expect_err("should fail");

        assert!(matches!(err, EncodingError::Base64(_)));
    }
}

//! Placeholder substitution for step content.
//!
//! A pattern is written with the literal marker `PARAM_NAME` standing for
//! the parameter name, e.g. `{{PARAM_NAME}}` or `${PARAM_NAME}`. The text
//! around the marker becomes the token delimiters.
//!
//! Substitution is plain token replacement, not a template language:
//! tokens whose parameter is missing or non-scalar are left verbatim.

use regex::{Captures, Regex};
use serde_json::Value;

use appdeck_core::types::PLACEHOLDER_NAME_MARKER;

use crate::error::PatternError;
use crate::executor::Params;

/// A compiled placeholder pattern.
#[derive(Debug, Clone)]
pub struct PlaceholderPattern {
    source: String,
    regex: Regex,
}

impl PlaceholderPattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let (prefix, suffix) = pattern
            .split_once(PLACEHOLDER_NAME_MARKER)
            .ok_or_else(|| PatternError::MissingMarker(pattern.to_string()))?;
        if prefix.is_empty() && suffix.is_empty() {
            return Err(PatternError::NoDelimiters(pattern.to_string()));
        }
        let regex = Regex::new(&format!(
            "{}([A-Za-z_][A-Za-z0-9_]*){}",
            regex::escape(prefix),
            regex::escape(suffix)
        ))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// The pattern this was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Replace every resolvable token in `content`.
    pub fn substitute(&self, content: &str, params: &Params) -> String {
        self.regex
            .replace_all(content, |caps: &Captures| {
                params
                    .get(&caps[1])
                    .and_then(scalar_text)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Names of all tokens in `content`, in order of appearance.
    pub fn placeholders(&self, content: &str) -> Vec<String> {
        self.regex
            .captures_iter(content)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Names of tokens in `content` that `params` cannot resolve.
    pub fn unresolved(&self, content: &str, params: &Params) -> Vec<String> {
        self.placeholders(content)
            .into_iter()
            .filter(|name| params.get(name).and_then(scalar_text).is_none())
            .collect()
    }
}

/// Text form of a scalar parameter value; `None` for null, arrays and objects.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn default_pattern() -> PlaceholderPattern {
        PlaceholderPattern::compile("{{PARAM_NAME}}").unwrap()
    }

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn content_without_placeholders_is_unchanged() {
        let pattern = default_pattern();
        let content = "systemctl restart nginx && echo '{not a token}'";
        let p = params(&[("PORT", json!(80))]);
        assert_eq!(pattern.substitute(content, &p), content);
    }

    #[test]
    fn empty_params_leave_content_unchanged() {
        let pattern = default_pattern();
        let content = "listen {{PORT}}; root {{ROOT}};";
        assert_eq!(pattern.substitute(content, &Params::new()), content);
    }

    #[test]
    fn all_placeholders_resolved() {
        let pattern = default_pattern();
        let p = params(&[("PORT", json!(8080)), ("ROOT", json!("/srv/www"))]);
        assert_eq!(
            pattern.substitute("listen {{PORT}}; root {{ROOT}}; # {{PORT}}", &p),
            "listen 8080; root /srv/www; # 8080"
        );
        assert!(pattern.unresolved("listen {{PORT}}", &p).is_empty());
    }

    #[test]
    fn unmatched_placeholders_stay_verbatim() {
        let pattern = default_pattern();
        let p = params(&[("PORT", json!(8080))]);
        assert_eq!(
            pattern.substitute("{{PORT}} {{MISSING}}", &p),
            "8080 {{MISSING}}"
        );
        assert_eq!(pattern.unresolved("{{PORT}} {{MISSING}}", &p), vec!["MISSING"]);
    }

    #[test]
    fn only_scalars_are_substituted() {
        let pattern = default_pattern();
        let p = params(&[
            ("FLAG", json!(true)),
            ("RATIO", json!(0.5)),
            ("LIST", json!([1, 2])),
            ("MAP", json!({"a": 1})),
            ("NOTHING", Value::Null),
        ]);
        assert_eq!(
            pattern.substitute("{{FLAG}} {{RATIO}} {{LIST}} {{MAP}} {{NOTHING}}", &p),
            "true 0.5 {{LIST}} {{MAP}} {{NOTHING}}"
        );
    }

    #[test]
    fn custom_pattern() {
        let pattern = PlaceholderPattern::compile("${PARAM_NAME}").unwrap();
        let p = params(&[("USER", json!("deploy"))]);
        assert_eq!(
            pattern.substitute("chown ${USER} /srv {{USER}}", &p),
            "chown deploy /srv {{USER}}"
        );
        assert_eq!(pattern.source(), "${PARAM_NAME}");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let pattern = default_pattern();
        let p = params(&[("A", json!("{{B}}")), ("B", json!("boom"))]);
        assert_eq!(pattern.substitute("{{A}}", &p), "{{B}}");
    }

    #[test]
    fn placeholders_lists_tokens_in_order() {
        let pattern = default_pattern();
        assert_eq!(
            pattern.placeholders("{{B}} then {{A}} then {{B}}"),
            vec!["B", "A", "B"]
        );
    }

    #[test]
    fn rejects_patterns_without_marker_or_delimiters() {
        assert!(matches!(
            PlaceholderPattern::compile("{{NAME}}"),
            Err(PatternError::MissingMarker(_))
        ));
        assert!(matches!(
            PlaceholderPattern::compile("PARAM_NAME"),
            Err(PatternError::NoDelimiters(_))
        ));
    }
}

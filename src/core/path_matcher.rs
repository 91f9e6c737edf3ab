//! Route pattern compilation.
//!
//! A pattern such as `/users/{id}` or `/files/{name}.{ext}` compiles into an
//! anchored regex with one named capture group per placeholder. Placeholders
//! take the form `{name}` (one or more non-slash characters) or
//! `{name:regex}`; the custom regex may itself contain balanced braces, e.g.
//! `{year:\d{4}}`.
use std::collections::HashMap;

use regex::{Regex, RegexBuilder};

use crate::core::error::RouteError;

/// Pattern reserved for the catch-all route that is always evaluated last.
pub const CATCH_ALL_PATTERN: &str = "/{path:.*}";

const DEFAULT_PARAM_REGEX: &str = "[^/]+";

/// Extracted path parameters keyed by placeholder name.
pub type PathParams = HashMap<String, String>;

/// A compiled route pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    pattern: String,
    regex: Regex,
    params: Vec<String>,
    case_sensitive: bool,
    catch_all: bool,
}

impl PathPattern {
    /// Compile `pattern`. Matching is case-insensitive unless
    /// `case_sensitive` is set.
    pub fn compile(pattern: &str, case_sensitive: bool) -> Result<Self, RouteError> {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');

        let mut params: Vec<String> = Vec::new();
        let mut literal = String::new();
        let mut sole_placeholder_regex: Option<String> = None;
        let mut placeholder_count = 0usize;
        let mut has_literal = false;

        let mut chars = pattern.char_indices();
        while let Some((start, ch)) = chars.next() {
            if ch != '{' {
                literal.push(ch);
                continue;
            }

            if !literal.is_empty() {
                if literal != "/" || placeholder_count > 0 {
                    has_literal = true;
                }
                source.push_str(&regex::escape(&literal));
                literal.clear();
            }

            // Scan forward to the brace that closes this placeholder.
            let mut depth = 1usize;
            let mut end = None;
            let mut escaped = false;
            for (idx, inner) in chars.by_ref() {
                if escaped {
                    escaped = false;
                    continue;
                }
                match inner {
                    '\\' => escaped = true,
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(idx);
                            break;
                        }
                    }
                    _ => {}
                }
            }

            let end = end.ok_or_else(|| RouteError::UnterminatedPlaceholder {
                pattern: pattern.to_string(),
                position: start,
            })?;

            let body = &pattern[start + 1..end];
            let (name, custom) = match body.split_once(':') {
                Some((name, custom)) => (name.trim(), Some(custom)),
                None => (body.trim(), None),
            };

            if !is_valid_param_name(name) {
                return Err(RouteError::InvalidParameterName {
                    pattern: pattern.to_string(),
                    name: name.to_string(),
                });
            }
            if params.iter().any(|existing| existing == name) {
                return Err(RouteError::DuplicateParameter {
                    pattern: pattern.to_string(),
                    name: name.to_string(),
                });
            }

            let group_regex = custom.unwrap_or(DEFAULT_PARAM_REGEX);
            source.push_str(&format!("(?P<{name}>{group_regex})"));
            params.push(name.to_string());
            placeholder_count += 1;
            sole_placeholder_regex = Some(group_regex.to_string());
        }

        if !literal.is_empty() {
            has_literal = true;
            source.push_str(&regex::escape(&literal));
        }
        source.push('$');

        let regex = RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|source| RouteError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;

        let catch_all =
            !has_literal && placeholder_count == 1 && sole_placeholder_regex.as_deref() == Some(".*");

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            params,
            case_sensitive,
            catch_all,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// The generated regex source, mainly for diagnostics.
    pub fn regex_source(&self) -> &str {
        self.regex.as_str()
    }

    /// Regex source with capture group names removed. Two patterns with the
    /// same shape and case handling accept exactly the same paths.
    pub fn shape(&self) -> String {
        let source = self.regex.as_str();
        let mut shape = String::with_capacity(source.len());
        let mut rest = source;
        while let Some(start) = rest.find("(?P<") {
            shape.push_str(&rest[..start]);
            shape.push('(');
            let after = &rest[start + 4..];
            rest = match after.find('>') {
                Some(end) => &after[end + 1..],
                None => after,
            };
        }
        shape.push_str(rest);
        shape
    }

    /// Whether every path this pattern accepts is already accepted by `other`.
    pub fn is_equivalent_to(&self, other: &PathPattern) -> bool {
        if self.catch_all && other.catch_all {
            return true;
        }
        self.case_sensitive == other.case_sensitive && self.shape() == other.shape()
    }

    /// Parameter names in the order they appear in the pattern.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Whether this pattern matches every path (e.g. `/{path:.*}`).
    pub fn is_catch_all(&self) -> bool {
        self.catch_all
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Match `path` and return percent-decoded parameter values.
    pub fn captures(&self, path: &str) -> Option<PathParams> {
        let caps = self.regex.captures(path)?;
        let mut extracted = PathParams::with_capacity(self.params.len());
        for name in &self.params {
            if let Some(value) = caps.name(name) {
                let raw = value.as_str();
                let decoded = urlencoding::decode(raw)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| raw.to_string());
                extracted.insert(name.clone(), decoded);
            }
        }
        Some(extracted)
    }
}

fn is_valid_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Normalize a route pattern: leading slash added, trailing slashes dropped.
pub fn normalize_pattern(pattern: &str) -> String {
    let trimmed = pattern.trim();
    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Join a mount prefix and a route path into a normalized pattern.
pub fn join_paths(base: &str, path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let path = path.trim().trim_start_matches('/');
    match (base.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => normalize_pattern(path),
        (false, true) => normalize_pattern(base),
        (false, false) => normalize_pattern(&format!("{base}/{path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalence_ignores_parameter_names() {
        let page = PathPattern::compile("/{page:.*}", false).unwrap();
        let path = PathPattern::compile("/{path:.*}", true).unwrap();
        assert!(page.is_equivalent_to(&path));

        let a = PathPattern::compile("/api/{path:.*}", false).unwrap();
        let b = PathPattern::compile("/api/{rest:.*}", false).unwrap();
        let c = PathPattern::compile("/api/{rest:.*}", true).unwrap();
        let d = PathPattern::compile("/api/{rest}", false).unwrap();
        assert_eq!(a.shape(), b.shape());
        assert!(a.is_equivalent_to(&b));
        assert!(!a.is_equivalent_to(&c));
        assert!(!a.is_equivalent_to(&d));
    }

    #[test]
    fn test_literal_pattern_matches_only_itself() {
        let pattern = PathPattern::compile("/health", false).unwrap();
        assert!(pattern.params().is_empty());
        assert!(pattern.is_match("/health"));
        assert!(pattern.is_match("/HEALTH"));
        assert!(!pattern.is_match("/health/"));
        assert!(!pattern.is_match("/healthz"));
        assert!(!pattern.is_match("/x/health"));
    }

    #[test]
    fn test_case_sensitive_literal() {
        let pattern = PathPattern::compile("/Health", true).unwrap();
        assert!(pattern.is_match("/Health"));
        assert!(!pattern.is_match("/health"));
    }

    #[test]
    fn test_literal_regex_metacharacters_are_escaped() {
        let pattern = PathPattern::compile("/v1.0/items+", false).unwrap();
        assert!(pattern.is_match("/v1.0/items+"));
        assert!(!pattern.is_match("/v1x0/items"));
    }

    #[test]
    fn test_single_placeholder() {
        let pattern = PathPattern::compile("/users/{id}", false).unwrap();
        let params = pattern.captures("/users/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert!(pattern.captures("/users/").is_none());
        assert!(pattern.captures("/users/42/extra").is_none());
    }

    #[test]
    fn test_placeholders_split_on_literal_dot() {
        let pattern = PathPattern::compile("/files/{name}.{ext}", false).unwrap();
        let params = pattern.captures("/files/report.pdf").unwrap();
        assert_eq!(params["name"], "report");
        assert_eq!(params["ext"], "pdf");
        assert_eq!(pattern.params(), ["name".to_string(), "ext".to_string()]);
    }

    #[test]
    fn test_custom_regex_with_nested_braces() {
        let pattern = PathPattern::compile(r"/archive/{year:\d{4}}/{slug}", false).unwrap();
        let params = pattern.captures("/archive/2024/hello").unwrap();
        assert_eq!(params["year"], "2024");
        assert!(pattern.captures("/archive/24/hello").is_none());
    }

    #[test]
    fn test_values_are_percent_decoded() {
        let pattern = PathPattern::compile("/tags/{tag}", false).unwrap();
        let params = pattern.captures("/tags/rust%20lang").unwrap();
        assert_eq!(params["tag"], "rust lang");
    }

    #[test]
    fn test_unterminated_placeholder_is_rejected() {
        let err = PathPattern::compile("/users/{id", false).unwrap_err();
        assert!(matches!(
            err,
            RouteError::UnterminatedPlaceholder { position: 7, .. }
        ));
    }

    #[test]
    fn test_invalid_and_duplicate_names_are_rejected() {
        assert!(matches!(
            PathPattern::compile("/a/{1x}", false),
            Err(RouteError::InvalidParameterName { .. })
        ));
        assert!(matches!(
            PathPattern::compile("/a/{id}/{id}", false),
            Err(RouteError::DuplicateParameter { .. })
        ));
        assert!(matches!(
            PathPattern::compile("/a/{id:[}", false),
            Err(RouteError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_catch_all_detection() {
        assert!(PathPattern::compile(CATCH_ALL_PATTERN, false).unwrap().is_catch_all());
        assert!(PathPattern::compile("{rest:.*}", false).unwrap().is_catch_all());
        assert!(!PathPattern::compile("/api/{rest:.*}", false).unwrap().is_catch_all());
        assert!(!PathPattern::compile("/{id}", false).unwrap().is_catch_all());

        let catch_all = PathPattern::compile(CATCH_ALL_PATTERN, false).unwrap();
        assert!(catch_all.is_match("/"));
        assert!(catch_all.is_match("/anything/at/all"));
    }

    #[test]
    fn test_join_and_normalize() {
        assert_eq!(normalize_pattern("users/"), "/users");
        assert_eq!(normalize_pattern("/"), "/");
        assert_eq!(join_paths("/api/", "/users/"), "/api/users");
        assert_eq!(join_paths("", ""), "/");
        assert_eq!(join_paths("/api", ""), "/api");
        assert_eq!(join_paths("", "{path:.*}"), "/{path:.*}");
    }
}

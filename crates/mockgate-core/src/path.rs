//! Path templates: `/users/{id}` style captures and trailing `{*}` wildcards.

use std::collections::BTreeMap;

use thiserror::Error;

/// Why a template failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template must not be empty")]
    Empty,
    #[error("template must start with `/`")]
    NoLeadingSlash,
    #[error("parameter name must not be empty")]
    EmptyParameter,
    #[error("duplicate parameter `{0}`")]
    DuplicateParameter(String),
    #[error("invalid parameter name `{0}`")]
    InvalidParameter(String),
    #[error("wildcard `{{*}}` is only allowed at the end of the template")]
    WildcardNotAtEnd,
    #[error("wildcard templates cannot also capture named parameters")]
    WildcardWithParameters,
    #[error("segment `{0}` mixes literal text with a capture")]
    MixedSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// No captures, plain string equality.
    Exact,
    /// Segment-wise comparison with `{name}` captures.
    Segments(Vec<Segment>),
    /// Trailing `{*}`: prefix match, remainder captured under `*`.
    Wildcard { prefix: String },
}

/// A compiled path template.
///
/// Matching is purely structural: no trailing-slash normalization and no
/// percent-decoding beyond what the HTTP layer already did.
///
/// # Example
///
/// ```
/// use mockgate_core::path::PathTemplate;
///
/// let template = PathTemplate::compile("/users/{id}/posts/{post_id}").unwrap();
/// let params = template.capture("/users/42/posts/7").unwrap();
/// assert_eq!(params["id"], "42");
/// assert_eq!(params["post_id"], "7");
/// assert!(template.capture("/users/42").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    matcher: Matcher,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl PathTemplate {
    /// Compile and validate a template.
    ///
    /// # Errors
    ///
    /// Rejects templates that do not start with `/`, carry duplicate or
    /// malformed parameter names, place `{*}` anywhere but the suffix,
    /// combine `{*}` with named captures, or embed a capture inside a
    /// literal segment.
    pub fn compile(raw: &str) -> Result<Self, TemplateError> {
        if raw.is_empty() {
            return Err(TemplateError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(TemplateError::NoLeadingSlash);
        }

        if let Some(prefix) = raw.strip_suffix("{*}") {
            if prefix.contains('{') || prefix.contains('}') {
                // Either a second wildcard or a named capture before the tail.
                if prefix.contains("{*}") {
                    return Err(TemplateError::WildcardNotAtEnd);
                }
                return Err(TemplateError::WildcardWithParameters);
            }
            return Ok(Self {
                raw: raw.to_string(),
                matcher: Matcher::Wildcard {
                    prefix: prefix.to_string(),
                },
            });
        }
        if raw.contains("{*}") {
            return Err(TemplateError::WildcardNotAtEnd);
        }

        if !raw.contains('{') && !raw.contains('}') {
            return Ok(Self {
                raw: raw.to_string(),
                matcher: Matcher::Exact,
            });
        }

        let mut segments = Vec::new();
        let mut seen = Vec::new();
        for part in raw.split('/') {
            if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                let name = inner.trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyParameter);
                }
                if !is_identifier(name) {
                    return Err(TemplateError::InvalidParameter(name.to_string()));
                }
                if seen.contains(&name) {
                    return Err(TemplateError::DuplicateParameter(name.to_string()));
                }
                seen.push(name);
                segments.push(Segment::Param(name.to_string()));
            } else if part.contains('{') || part.contains('}') {
                return Err(TemplateError::MixedSegment(part.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            matcher: Matcher::Segments(segments),
        })
    }

    /// The template string this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names captured by this template (`*` for the wildcard).
    pub fn param_names(&self) -> Vec<&str> {
        match &self.matcher {
            Matcher::Exact => Vec::new(),
            Matcher::Wildcard { .. } => vec!["*"],
            Matcher::Segments(segments) => segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Param(name) => Some(name.as_str()),
                    Segment::Literal(_) => None,
                })
                .collect(),
        }
    }

    /// Match `path` against the template, returning captured parameters.
    ///
    /// Returns `Some` with a possibly empty map on a hit, `None` on a miss.
    /// A `{name}` capture consumes exactly one non-empty segment; the
    /// wildcard consumes the remainder verbatim, empty string included.
    pub fn capture(&self, path: &str) -> Option<BTreeMap<String, String>> {
        match &self.matcher {
            Matcher::Exact => (self.raw == path).then(BTreeMap::new),
            Matcher::Wildcard { prefix } => path.strip_prefix(prefix.as_str()).map(|rest| {
                BTreeMap::from([("*".to_string(), rest.to_string())])
            }),
            Matcher::Segments(segments) => {
                let mut params = BTreeMap::new();
                let mut actual = path.split('/');
                for segment in segments {
                    let piece = actual.next()?;
                    match segment {
                        Segment::Literal(expected) => {
                            if expected != piece {
                                return None;
                            }
                        }
                        Segment::Param(name) => {
                            if piece.is_empty() {
                                return None;
                            }
                            params.insert(name.clone(), piece.to_string());
                        }
                    }
                }
                if actual.next().is_some() {
                    return None;
                }
                Some(params)
            }
        }
    }

    /// Substitute `params` back into the template.
    ///
    /// Inverse of [`capture`](Self::capture): for any path `p` matched by
    /// this template, expanding the captured parameters yields `p` again.
    pub fn expand(&self, params: &BTreeMap<String, String>) -> Option<String> {
        match &self.matcher {
            Matcher::Exact => Some(self.raw.clone()),
            Matcher::Wildcard { prefix } => {
                Some(format!("{prefix}{}", params.get("*")?))
            }
            Matcher::Segments(segments) => {
                let mut out = Vec::with_capacity(segments.len());
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => out.push(text.clone()),
                        Segment::Param(name) => out.push(params.get(name)?.clone()),
                    }
                }
                Some(out.join("/"))
            }
        }
    }
}

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Parsed `namespace/alias:tag` template reference.
///
/// Parsing lowercases the input, drops the literal `default` tag, and checks
/// that an explicit namespace matches the caller's team slug. Rendering a
/// parsed reference and parsing it again is the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    namespace: Option<String>,
    alias: String,
    tag: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("template reference must not be empty")]
    Empty,
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),
    #[error("invalid alias {0:?}")]
    InvalidAlias(String),
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    #[error("tag {0:?} must not be a UUID")]
    TagIsUuid(String),
    #[error("namespace {namespace:?} does not match team {team_slug:?}")]
    NamespaceMismatch {
        namespace: String,
        team_slug: Option<String>,
    },
}

fn valid_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_'))
}

fn valid_tag(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
}

impl TemplateRef {
    /// Parses and normalizes a template reference supplied by `team_slug`.
    pub fn parse(input: &str, team_slug: Option<&str>) -> Result<Self, IdentifierError> {
        let input = input.trim().to_ascii_lowercase();
        if input.is_empty() {
            return Err(IdentifierError::Empty);
        }

        let (namespace, rest) = match input.split_once('/') {
            Some((namespace, rest)) => {
                if !valid_name(namespace) {
                    return Err(IdentifierError::InvalidNamespace(namespace.to_string()));
                }
                (Some(namespace.to_string()), rest)
            }
            None => (None, input.as_str()),
        };

        let (alias, tag) = match rest.split_once(':') {
            Some((alias, tag)) => (alias, Some(tag)),
            None => (rest, None),
        };

        if !valid_name(alias) {
            return Err(IdentifierError::InvalidAlias(alias.to_string()));
        }

        let tag = match tag {
            None => None,
            Some(tag) => {
                if !valid_tag(tag) {
                    return Err(IdentifierError::InvalidTag(tag.to_string()));
                }
                if Uuid::parse_str(tag).is_ok() {
                    return Err(IdentifierError::TagIsUuid(tag.to_string()));
                }
                // the default tag is the same as no tag at all
                if tag == "default" {
                    None
                } else {
                    Some(tag.to_string())
                }
            }
        };

        if let Some(namespace) = &namespace {
            if team_slug != Some(namespace.as_str()) {
                return Err(IdentifierError::NamespaceMismatch {
                    namespace: namespace.clone(),
                    team_slug: team_slug.map(str::to_string),
                });
            }
        }

        Ok(Self {
            namespace,
            alias: alias.to_string(),
            tag,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        f.write_str(&self.alias)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// FHIR SearchParameter kinds understood by the compiler.
/// See: https://hl7.org/fhir/R4B/search.html#table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterType {
    String,
    Token,
    Date,
    Number,
    Reference,
    Uri,
}

impl SearchParameterType {
    /// Parse a search parameter type from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "token" => Some(Self::Token),
            "date" => Some(Self::Date),
            "number" => Some(Self::Number),
            "reference" => Some(Self::Reference),
            "uri" => Some(Self::Uri),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Token => "token",
            Self::Date => "date",
            Self::Number => "number",
            Self::Reference => "reference",
            Self::Uri => "uri",
        }
    }
}

impl fmt::Display for SearchParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search modifiers, applied as a suffix to the parameter name: `name:modifier`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchModifier {
    Missing,
    /// Typed reference, e.g. `subject:Patient`.
    Type(String),
    Not,
    Above,
    Below,
    OfType,
    In,
    NotIn,
    Exact,
    Contains,
}

impl SearchModifier {
    /// Parse a modifier suffix.
    ///
    /// A suffix starting with an uppercase ASCII letter is a resource type
    /// assertion and parses to [`SearchModifier::Type`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(Self::Missing),
            "not" => Some(Self::Not),
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            "of-type" | "ofType" => Some(Self::OfType),
            "in" => Some(Self::In),
            "not-in" => Some(Self::NotIn),
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            other if other.starts_with(|c: char| c.is_ascii_uppercase()) => {
                Some(Self::Type(other.to_string()))
            }
            _ => None,
        }
    }

    /// Check if this modifier is applicable to the given parameter type.
    pub fn applicable_to(&self, param_type: SearchParameterType) -> bool {
        match self {
            Self::Missing => true,
            Self::Type(_) => matches!(param_type, SearchParameterType::Reference),
            Self::Not | Self::Above | Self::Below | Self::OfType | Self::In | Self::NotIn => {
                matches!(param_type, SearchParameterType::Token)
            }
            Self::Exact | Self::Contains => matches!(param_type, SearchParameterType::String),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Missing => "missing",
            Self::Type(t) => t,
            Self::Not => "not",
            Self::Above => "above",
            Self::Below => "below",
            Self::OfType => "of-type",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::Exact => "exact",
            Self::Contains => "contains",
        }
    }
}

impl fmt::Display for SearchModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `name:modifier` into its parts. Only the first `:` separates.
pub fn split_modifier(raw_name: &str) -> (&str, Option<&str>) {
    match raw_name.split_once(':') {
        Some((name, suffix)) => (name, Some(suffix)),
        None => (raw_name, None),
    }
}

/// Comparison prefixes for number/date search values, e.g. `ge2020-01-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    #[default]
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchPrefix::Eq => "eq",
            SearchPrefix::Ne => "ne",
            SearchPrefix::Gt => "gt",
            SearchPrefix::Ge => "ge",
            SearchPrefix::Lt => "lt",
            SearchPrefix::Le => "le",
        };
        f.write_str(s)
    }
}

impl SearchPrefix {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "ge" => Some(Self::Ge),
            "lt" => Some(Self::Lt),
            "le" => Some(Self::Le),
            _ => None,
        }
    }

    /// Split a leading two-letter prefix off a value; defaults to `eq`.
    pub fn split(value: &str) -> (Self, &str) {
        if let Some(head) = value.get(..2)
            && let Some(prefix) = Self::parse(head)
        {
            return (prefix, &value[2..]);
        }
        (Self::Eq, value)
    }

    pub fn sql_operator(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// Storage mapping for one searchable field of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParamConfig {
    /// The code used in search queries (e.g. "name", "code").
    pub name: String,
    /// Storage column holding the value (the code for tokens).
    pub column: String,
    #[serde(rename = "type")]
    pub kind: SearchParameterType,
    /// Column holding the token system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_column: Option<String>,
    /// Resource type a reference parameter points at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    /// Column holding the referenced resource type; defaults to `{column}_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_column: Option<String>,
}

impl SearchParamConfig {
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        kind: SearchParameterType,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            kind,
            system_column: None,
            target_type: None,
            type_column: None,
        }
    }

    #[must_use]
    pub fn with_system_column(mut self, column: impl Into<String>) -> Self {
        self.system_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn with_target_type(mut self, target: impl Into<String>) -> Self {
        self.target_type = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_type_column(mut self, column: impl Into<String>) -> Self {
        self.type_column = Some(column.into());
        self
    }

    pub fn type_column(&self) -> String {
        self.type_column
            .clone()
            .unwrap_or_else(|| format!("{}_type", self.column))
    }
}

//! Attribute value trees and reference parsing.
//!
//! Plan files carry attributes as free-form YAML. This module turns them into
//! a tagged [`AttributeValue`] tree where every `${resource.attribute}`
//! interpolation becomes an explicit [`Reference`] node, resolved only after
//! the referenced resource is ready.

use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder replaced by the instance index in counted resources.
pub const COUNT_INDEX: &str = "${count.index}";

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Literal string.
    String(String),
    /// Literal number.
    Number(f64),
    /// Literal boolean.
    Bool(bool),
    /// Ordered list of values.
    List(Vec<AttributeValue>),
    /// String-keyed map of values.
    Map(BTreeMap<String, AttributeValue>),
    /// A whole-value reference to another resource's attribute.
    Reference(Reference),
    /// A string mixing literals and references.
    Template(Vec<TemplatePart>),
}

/// One segment of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Literal text.
    Literal(String),
    /// Interpolated reference.
    Reference(Reference),
}

/// A reference to a realized attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Base identifier of the referenced resource.
    pub resource: String,
    /// Which instance(s) of a counted resource are referenced.
    pub selector: Selector,
    /// Exported attribute name.
    pub attribute: String,
}

/// Instance selector for counted resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
    /// The resource is not counted.
    Whole,
    /// A single instance, `name[i]`.
    Index(usize),
    /// Every instance, `name[*]`; resolves to a list.
    Splat,
}

impl AttributeValue {
    /// Converts a YAML value into an attribute tree.
    ///
    /// # Errors
    ///
    /// Returns a message if the value contains nulls, tags, non-string map
    /// keys or malformed interpolations.
    pub fn from_yaml(value: &YamlValue) -> Result<Self, String> {
        match value {
            YamlValue::Null => Err(String::from("null is not a valid attribute value")),
            YamlValue::Bool(b) => Ok(Self::Bool(*b)),
            YamlValue::Number(n) => n
                .as_f64()
                .map(Self::Number)
                .ok_or_else(|| format!("unsupported number: {n}")),
            YamlValue::String(s) => Self::parse_string(s),
            YamlValue::Sequence(items) => items
                .iter()
                .map(Self::from_yaml)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            YamlValue::Mapping(map) => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    let key = key
                        .as_str()
                        .ok_or_else(|| String::from("map keys must be strings"))?;
                    out.insert(key.to_string(), Self::from_yaml(item)?);
                }
                Ok(Self::Map(out))
            }
            YamlValue::Tagged(tagged) => Err(format!("YAML tags are not supported: {}", tagged.tag)),
        }
    }

    /// Parses a string that may contain `${...}` interpolations.
    ///
    /// # Errors
    ///
    /// Returns a message if an interpolation is unterminated or malformed.
    pub fn parse_string(input: &str) -> Result<Self, String> {
        let mut parts = parse_template(input)?;
        if parts.len() > 1 {
            return Ok(Self::Template(parts));
        }
        Ok(match parts.pop() {
            None => Self::String(String::new()),
            Some(TemplatePart::Literal(s)) => Self::String(s),
            Some(TemplatePart::Reference(r)) => Self::Reference(r),
        })
    }

    /// Returns every reference contained in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::String(_) | Self::Number(_) | Self::Bool(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Reference(r) = part {
                        out.push(r);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Short name of the variant, used in validation messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Bool(_) => "bool",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Reference(_) => "reference",
            Self::Template(_) => "template",
        }
    }

    /// Resolves references through `lookup`, producing a plain JSON value.
    ///
    /// # Errors
    ///
    /// Returns the error of the first reference `lookup` could not satisfy.
    pub fn resolve<F, E>(&self, lookup: &F) -> Result<JsonValue, E>
    where
        F: Fn(&Reference) -> Result<JsonValue, E>,
    {
        match self {
            Self::String(s) => Ok(JsonValue::String(s.clone())),
            Self::Number(n) => Ok(number_to_json(*n)),
            Self::Bool(b) => Ok(JsonValue::Bool(*b)),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            Self::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), item.resolve(lookup)?);
                }
                Ok(JsonValue::Object(out))
            }
            Self::Reference(r) => lookup(r),
            Self::Template(parts) => {
                let mut rendered = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Literal(s) => rendered.push_str(s),
                        TemplatePart::Reference(r) => {
                            let value = lookup(r)?;
                            rendered.push_str(&json_to_text(&value));
                        }
                    }
                }
                Ok(JsonValue::String(rendered))
            }
        }
    }
}

impl Reference {
    /// Parses the inside of an interpolation such as `web[0].private_ip`.
    ///
    /// # Errors
    ///
    /// Returns a message describing the malformed reference.
    pub fn parse(inner: &str) -> Result<Self, String> {
        let inner = inner.trim();
        if inner == "count.index" {
            return Err(String::from("count.index is only valid inside a resource with count"));
        }

        let (head, attribute) = inner
            .split_once('.')
            .ok_or_else(|| format!("reference '{inner}' must have the form resource.attribute"))?;

        if attribute.is_empty() || !attribute.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(format!("invalid attribute name in reference '{inner}'"));
        }

        let (resource, selector) = match head.find('[') {
            Some(open) if head.ends_with(']') => {
                let raw = &head[open + 1..head.len() - 1];
                let selector = if raw == "*" {
                    Selector::Splat
                } else {
                    raw.parse::<usize>()
                        .map(Selector::Index)
                        .map_err(|_| format!("invalid instance index '{raw}' in reference '{inner}'"))?
                };
                (&head[..open], selector)
            }
            Some(_) => return Err(format!("unbalanced brackets in reference '{inner}'")),
            None => (head, Selector::Whole),
        };

        if !is_identifier(resource) {
            return Err(format!("invalid resource name in reference '{inner}'"));
        }

        Ok(Self {
            resource: resource.to_string(),
            selector,
            attribute: attribute.to_string(),
        })
    }

    /// Returns the declaration identifier this reference points at, for
    /// single-instance selectors.
    #[must_use]
    pub fn target_id(&self) -> Option<String> {
        match self.selector {
            Selector::Whole => Some(self.resource.clone()),
            Selector::Index(i) => Some(instance_id(&self.resource, i)),
            Selector::Splat => None,
        }
    }
}

/// Builds the identifier of instance `index` of a counted resource.
#[must_use]
pub fn instance_id(base: &str, index: usize) -> String {
    format!("{base}[{index}]")
}

/// Returns true if `name` is a valid resource identifier:
/// a lowercase letter followed by lowercase letters, digits, `-` or `_`.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Replaces `${count.index}` in every string of a YAML tree.
///
/// An escaped `$${count.index}` is left as written.
#[must_use]
pub fn substitute_count_index(value: &YamlValue, index: usize) -> YamlValue {
    match value {
        YamlValue::String(s) => YamlValue::String(rewrite_count_index(s, &index.to_string()).0),
        YamlValue::Sequence(items) => YamlValue::Sequence(
            items.iter().map(|item| substitute_count_index(item, index)).collect(),
        ),
        YamlValue::Mapping(map) => YamlValue::Mapping(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_count_index(v, index)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Returns true if any string in the YAML tree mentions `${count.index}`.
#[must_use]
pub fn mentions_count_index(value: &YamlValue) -> bool {
    match value {
        YamlValue::String(s) => rewrite_count_index(s, "").1,
        YamlValue::Sequence(items) => items.iter().any(mentions_count_index),
        YamlValue::Mapping(map) => map.values().any(mentions_count_index),
        _ => false,
    }
}

/// Replaces unescaped `${count.index}` with `index`, reporting whether any was found.
fn rewrite_count_index(s: &str, index: &str) -> (String, bool) {
    let mut out = String::with_capacity(s.len());
    let mut found = false;
    let mut rest = s;

    while let Some(pos) = rest.find(COUNT_INDEX) {
        out.push_str(&rest[..pos]);
        if rest[..pos].ends_with('$') {
            out.push_str(COUNT_INDEX);
        } else {
            out.push_str(index);
            found = true;
        }
        rest = &rest[pos + COUNT_INDEX.len()..];
    }

    out.push_str(rest);
    (out, found)
}

/// Renders a JSON value as interpolated text.
#[must_use]
pub fn json_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(n: f64) -> JsonValue {
    // Integral values keep an integer representation in provider payloads.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        JsonValue::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number)
    }
}

fn parse_template(input: &str) -> Result<Vec<TemplatePart>, String> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find("${") {
        if rest[..pos].ends_with('$') {
            // "$${" escapes a literal "${"
            literal.push_str(&rest[..pos - 1]);
            literal.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }

        literal.push_str(&rest[..pos]);
        let body = &rest[pos + 2..];
        let end = body
            .find('}')
            .ok_or_else(|| format!("unterminated interpolation in '{input}'"))?;
        let reference = Reference::parse(&body[..end])?;

        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
        }
        parts.push(TemplatePart::Reference(reference));
        rest = &body[end + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    Ok(parts)
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selector {
            Selector::Whole => write!(f, "${{{}.{}}}", self.resource, self.attribute),
            Selector::Index(i) => write!(f, "${{{}[{i}].{}}}", self.resource, self.attribute),
            Selector::Splat => write!(f, "${{{}[*].{}}}", self.resource, self.attribute),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Reference(r) => write!(f, "{r}"),
            Self::Template(parts) => {
                write!(f, "\"")?;
                for part in parts {
                    match part {
                        TemplatePart::Literal(s) => write!(f, "{s}")?,
                        TemplatePart::Reference(r) => write!(f, "{r}")?,
                    }
                }
                write!(f, "\"")
            }
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reference(resource: &str, selector: Selector, attribute: &str) -> Reference {
        Reference {
            resource: resource.to_string(),
            selector,
            attribute: attribute.to_string(),
        }
    }

    #[test]
    fn test_plain_string_has_no_references() {
        let value = AttributeValue::parse_string("10.0.0.0/16").unwrap();
        assert_eq!(value, AttributeValue::String(String::from("10.0.0.0/16")));
        assert!(value.references().is_empty());
    }

    #[test]
    fn test_whole_string_reference() {
        let value = AttributeValue::parse_string("${vpc.id}").unwrap();
        assert_eq!(value, AttributeValue::Reference(reference("vpc", Selector::Whole, "id")));
    }

    #[test]
    fn test_indexed_and_splat_references() {
        let indexed = Reference::parse("web[2].private_ip").unwrap();
        assert_eq!(indexed, reference("web", Selector::Index(2), "private_ip"));
        assert_eq!(indexed.target_id().as_deref(), Some("web[2]"));

        let splat = Reference::parse("subnet[*].id").unwrap();
        assert_eq!(splat.selector, Selector::Splat);
        assert!(splat.target_id().is_none());
    }

    #[test]
    fn test_template_mixes_literals_and_references() {
        let value = AttributeValue::parse_string("http://${lb.dns_name}/health").unwrap();
        let AttributeValue::Template(parts) = &value else {
            panic!("expected template, got {value:?}");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(value.references().len(), 1);
    }

    #[test]
    fn test_escaped_interpolation_stays_literal() {
        let value = AttributeValue::parse_string("echo $${HOME}").unwrap();
        assert_eq!(value, AttributeValue::String(String::from("echo ${HOME}")));
    }

    #[test]
    fn test_malformed_references_rejected() {
        assert!(AttributeValue::parse_string("${vpc}").is_err());
        assert!(AttributeValue::parse_string("${vpc.id").is_err());
        assert!(AttributeValue::parse_string("${Vpc.id}").is_err());
        assert!(AttributeValue::parse_string("${web[x].id}").is_err());
        assert!(AttributeValue::parse_string("${count.index}").is_err());
    }

    #[test]
    fn test_yaml_tree_conversion() {
        let yaml: YamlValue = serde_yaml::from_str(
            r"
subnets: ['${subnet[0].id}', '${subnet[1].id}']
port: 80
internal: false
tags:
  Name: web
",
        )
        .unwrap();
        let value = AttributeValue::from_yaml(&yaml).unwrap();
        assert_eq!(value.references().len(), 2);
        assert!(AttributeValue::from_yaml(&YamlValue::Null).is_err());
    }

    #[test]
    fn test_resolve_substitutes_references() {
        let value = AttributeValue::parse_string("${lb.dns_name}:${lb.port}").unwrap();
        let resolved = value
            .resolve(&|r: &Reference| match r.attribute.as_str() {
                "dns_name" => Ok(json!("lb-1.elb.amazonaws.com")),
                "port" => Ok(json!(80)),
                _ => Err(r.clone()),
            })
            .unwrap();
        assert_eq!(resolved, json!("lb-1.elb.amazonaws.com:80"));

        let integral = AttributeValue::Number(3.0)
            .resolve(&|_| Ok::<_, ()>(JsonValue::Null))
            .unwrap();
        assert_eq!(integral, json!(3));
    }

    #[test]
    fn test_resolve_reports_unresolved_reference() {
        let value = AttributeValue::parse_string("${db.endpoint}").unwrap();
        let err = value
            .resolve(&|r: &Reference| Err::<JsonValue, _>(r.resource.clone()))
            .unwrap_err();
        assert_eq!(err, "db");
    }

    #[test]
    fn test_count_index_substitution() {
        let yaml: YamlValue = serde_yaml::from_str("cidr_block: '10.0.${count.index}.0/24'").unwrap();
        assert!(mentions_count_index(&yaml));
        let substituted = substitute_count_index(&yaml, 3);
        assert!(!mentions_count_index(&substituted));
        assert_eq!(substituted["cidr_block"].as_str(), Some("10.0.3.0/24"));
    }

    #[test]
    fn test_escaped_count_index_stays_literal() {
        let yaml: YamlValue = serde_yaml::from_str("user_data: 'echo $${count.index}'").unwrap();
        assert!(!mentions_count_index(&yaml));
        let substituted = substitute_count_index(&yaml, 3);
        assert_eq!(substituted["user_data"].as_str(), Some("echo $${count.index}"));

        let rendered = AttributeValue::parse_string("echo $${count.index}").unwrap();
        assert_eq!(rendered, AttributeValue::String(String::from("echo ${count.index}")));

        let mixed: YamlValue = serde_yaml::from_str("name: 'web-${count.index}-$${count.index}'").unwrap();
        assert!(mentions_count_index(&mixed));
        let substituted = substitute_count_index(&mixed, 1);
        assert_eq!(substituted["name"].as_str(), Some("web-1-$${count.index}"));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("web-lb"));
        assert!(is_identifier("db_cluster2"));
        assert!(!is_identifier("2web"));
        assert!(!is_identifier("Web"));
        assert!(!is_identifier(""));
    }
}

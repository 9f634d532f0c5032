//! Resource addresses and attribute references.
//!
//! An address is `type.name`, optionally followed by an instance key for
//! multi-instance declarations: `type.name[0]` or `type.name["eu-west"]`.
//! A reference is an address followed by an attribute path:
//! `aws_vpc.main.id` or `aws_subnet.app[1].tags.env`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

use super::Attributes;

/// Instance key of a multi-instance declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceKey {
    /// Ordinal index (`[3]`).
    Index(u64),
    /// Map key (`["name"]`).
    Key(String),
}

/// Unique address of a resource instance.
///
/// Ordering is by type, then name, then instance key, which is the
/// tie-break order used for deterministic plans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    /// Resource type, selects the provider.
    pub resource_type: String,
    /// Declared name.
    pub name: String,
    /// Instance key for multi-instance declarations.
    pub key: Option<InstanceKey>,
}

/// A reference to an attribute of another resource, resolved at apply time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    /// Referenced resource.
    pub address: Address,
    /// Dotted attribute path inside the referenced resource.
    pub attribute: String,
}

impl Address {
    /// Creates a single-instance address.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            key: None,
        }
    }

    /// Returns this address with an ordinal instance key.
    #[must_use]
    pub fn with_index(mut self, index: u64) -> Self {
        self.key = Some(InstanceKey::Index(index));
        self
    }

    /// Returns this address with a map instance key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(InstanceKey::Key(key.into()));
        self
    }

    /// Builds a reference to one of this resource's attributes.
    #[must_use]
    pub fn attr(&self, attribute: impl Into<String>) -> Reference {
        Reference {
            address: self.clone(),
            attribute: attribute.into(),
        }
    }

    /// Checks that the type and name are identifiers, so the address
    /// survives a round trip through its string form.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidAddress`] naming the offending part.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (part, what) in [(&self.resource_type, "resource type"), (&self.name, "name")] {
            if !is_valid_identifier(part) {
                return Err(GraphError::invalid_address(
                    self.to_string(),
                    format!("invalid {what} '{part}'"),
                ));
            }
        }
        Ok(())
    }

    /// Parses the address prefix of `input`, returning the unparsed rest.
    fn parse_prefix(input: &str) -> Result<(Self, &str), GraphError> {
        let (resource_type, rest) = input
            .split_once('.')
            .ok_or_else(|| GraphError::invalid_address(input, "expected 'type.name'"))?;

        let name_end = rest.find(['.', '[']).unwrap_or(rest.len());
        let name = &rest[..name_end];
        let mut rest = &rest[name_end..];

        for (part, what) in [(resource_type, "resource type"), (name, "name")] {
            if !is_valid_identifier(part) {
                return Err(GraphError::invalid_address(
                    input,
                    format!("invalid {what} '{part}'"),
                ));
            }
        }

        let mut key = None;
        if let Some(after) = rest.strip_prefix('[') {
            let (parsed, remaining) = parse_key(after)
                .ok_or_else(|| GraphError::invalid_address(input, "malformed instance key"))?;
            key = Some(parsed);
            rest = remaining;
        }

        Ok((
            Self {
                resource_type: resource_type.to_string(),
                name: name.to_string(),
                key,
            },
            rest,
        ))
    }
}

impl Reference {
    /// Looks up the referenced attribute in a resource's recorded attributes.
    ///
    /// `id` falls back to the provider identifier when the provider did not
    /// report it as an attribute.
    #[must_use]
    pub fn lookup(&self, id: &str, attributes: &Attributes) -> Option<serde_json::Value> {
        let mut segments = self.attribute.split('.');
        let first = segments.next()?;

        let mut current = match attributes.get(first) {
            Some(value) => value.clone(),
            None if first == "id" => serde_json::Value::String(id.to_string()),
            None => return None,
        };

        for segment in segments {
            current = match current {
                serde_json::Value::Object(mut map) => map.remove(segment)?,
                serde_json::Value::Array(mut items) => {
                    let idx: usize = segment.parse().ok()?;
                    if idx >= items.len() {
                        return None;
                    }
                    items.swap_remove(idx)
                }
                _ => return None,
            };
        }

        Some(current)
    }

    /// Checks the address and every attribute path segment.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidAddress`] if either is malformed.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.address.validate()?;
        if self.attribute.split('.').all(is_path_segment) {
            Ok(())
        } else {
            Err(GraphError::invalid_address(
                self.to_string(),
                format!("invalid attribute path '{}'", self.attribute),
            ))
        }
    }

    /// Returns the top-level attribute name this reference reads.
    #[must_use]
    pub fn root_attribute(&self) -> &str {
        self.attribute
            .split_once('.')
            .map_or(self.attribute.as_str(), |(root, _)| root)
    }
}

/// Parses the inside of `[...]`, returning the key and the text after `]`.
///
/// Quoted keys use `\"` and `\\` escapes.
fn parse_key(after_bracket: &str) -> Option<(InstanceKey, &str)> {
    if let Some(quoted) = after_bracket.strip_prefix('"') {
        let mut key = String::new();
        let mut chars = quoted.char_indices();
        while let Some((idx, c)) = chars.next() {
            match c {
                '\\' => key.push(chars.next()?.1),
                '"' => {
                    let rest = quoted[idx + 1..].strip_prefix(']')?;
                    return Some((InstanceKey::Key(key), rest));
                }
                other => key.push(other),
            }
        }
        return None;
    }

    let close = after_bracket.find(']')?;
    let index = after_bracket[..close].parse().ok()?;
    Some((InstanceKey::Index(index), &after_bracket[close + 1..]))
}

/// Returns true if `name` is a valid type, name, or attribute segment.
///
/// Identifiers start with an ASCII letter or underscore and continue with
/// ASCII alphanumerics, underscores or hyphens.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_path_segment(segment: &str) -> bool {
    is_valid_identifier(segment) || segment.parse::<usize>().is_ok()
}

impl FromStr for Address {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, rest) = Self::parse_prefix(s)?;
        if !rest.is_empty() {
            return Err(GraphError::invalid_address(
                s,
                format!("unexpected trailing '{rest}'"),
            ));
        }
        Ok(address)
    }
}

impl FromStr for Reference {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, rest) = Address::parse_prefix(s)?;
        let attribute = rest
            .strip_prefix('.')
            .ok_or_else(|| GraphError::invalid_address(s, "expected '<address>.<attribute>'"))?;

        if !attribute.split('.').all(is_path_segment) {
            return Err(GraphError::invalid_address(
                s,
                format!("invalid attribute path '{attribute}'"),
            ));
        }

        Ok(Self {
            address,
            attribute: attribute.to_string(),
        })
    }
}

impl TryFrom<String> for Address {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for Reference {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.to_string()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => {
                f.write_str("[\"")?;
                for c in k.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"]")
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_address() {
        let addr: Address = "aws_vpc.main".parse().expect("valid address");
        assert_eq!(addr, Address::new("aws_vpc", "main"));
        assert_eq!(addr.to_string(), "aws_vpc.main");
    }

    #[test]
    fn test_parse_indexed_addresses() {
        let by_index: Address = "aws_subnet.app[2]".parse().expect("valid address");
        assert_eq!(by_index, Address::new("aws_subnet", "app").with_index(2));

        let by_key: Address = "aws_subnet.app[\"eu.west\"]".parse().expect("valid address");
        assert_eq!(by_key, Address::new("aws_subnet", "app").with_key("eu.west"));
        assert_eq!(by_key.to_string(), "aws_subnet.app[\"eu.west\"]");
    }

    #[test]
    fn test_quoted_key_escapes_round_trip() {
        for key in ["eu\"west", "back\\slash", "a]b", "\"]"] {
            let addr = Address::new("vpc", "main").with_key(key);
            let parsed: Address = addr.to_string().parse().expect("escaped key parses");
            assert_eq!(parsed, addr);

            let json = serde_json::to_string(&addr).expect("serialize");
            let back: Address = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, addr);
        }
        assert_eq!(
            Address::new("vpc", "main").with_key("eu\"west").to_string(),
            r#"vpc.main["eu\"west"]"#
        );
        assert!("vpc.main[\"open".parse::<Address>().is_err());
    }

    #[test]
    fn test_validate_rejects_unparseable_parts() {
        assert!(Address::new("vpc", "main").with_key("any text").validate().is_ok());
        assert!(Address::new("vpc", "a.b").validate().is_err());
        assert!(Address::new("vpc", "").validate().is_err());
        assert!(Address::new("aws vpc", "main").validate().is_err());
        assert!(Address::new("vpc", "main").attr("tags.env").validate().is_ok());
        assert!(Address::new("vpc", "main").attr("tags..env").validate().is_err());
        assert!(Address::new("vpc", "a[0]").attr("id").validate().is_err());
    }

    #[test]
    fn test_reject_malformed_addresses() {
        assert!("vpc".parse::<Address>().is_err());
        assert!("vpc.".parse::<Address>().is_err());
        assert!("1vpc.main".parse::<Address>().is_err());
        assert!("vpc.main[".parse::<Address>().is_err());
        assert!("vpc.main[x]".parse::<Address>().is_err());
        assert!("vpc.main.id".parse::<Address>().is_err());
    }

    #[test]
    fn test_parse_reference() {
        let r: Reference = "aws_subnet.app[1].tags.env".parse().expect("valid reference");
        assert_eq!(r.address, Address::new("aws_subnet", "app").with_index(1));
        assert_eq!(r.attribute, "tags.env");
        assert_eq!(r.root_attribute(), "tags");
        assert_eq!(r.to_string(), "aws_subnet.app[1].tags.env");

        assert!("aws_vpc.main".parse::<Reference>().is_err());
    }

    #[test]
    fn test_address_ordering_is_type_name_key() {
        let mut addrs = vec![
            Address::new("b", "a"),
            Address::new("a", "z"),
            Address::new("a", "b").with_index(1),
            Address::new("a", "b"),
            Address::new("a", "b").with_index(0),
        ];
        addrs.sort();
        let rendered: Vec<String> = addrs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["a.b", "a.b[0]", "a.b[1]", "a.z", "b.a"]);
    }

    #[test]
    fn test_lookup_nested_and_id_fallback() {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("tags"), json!({"env": "prod"}));
        attrs.insert(String::from("ports"), json!([80, 443]));

        let vpc = Address::new("aws_vpc", "main");
        assert_eq!(vpc.attr("tags.env").lookup("vpc-1", &attrs), Some(json!("prod")));
        assert_eq!(vpc.attr("ports.1").lookup("vpc-1", &attrs), Some(json!(443)));
        assert_eq!(vpc.attr("id").lookup("vpc-1", &attrs), Some(json!("vpc-1")));
        assert_eq!(vpc.attr("missing").lookup("vpc-1", &attrs), None);
    }

    #[test]
    fn test_serde_as_string() {
        let addr = Address::new("aws_vpc", "main").with_key("a");
        let json = serde_json::to_string(&addr).expect("serialize");
        assert_eq!(json, r#""aws_vpc.main[\"a\"]""#);
        let back: Address = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("aws_vpc"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("web-1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("9lives"));
        assert!(!is_valid_identifier("a.b"));
    }
}

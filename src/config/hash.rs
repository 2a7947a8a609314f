//! Declaration hashing for change detection.
//!
//! This module provides deterministic hashing of resource declarations and
//! whole plans so the planner can tell recorded resources whose declaration
//! changed since they were realized.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::schema::ResourceKind;
use super::value::{AttributeValue, Reference, Selector, TemplatePart};

/// Hasher for computing declaration and plan hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a single resource declaration.
    ///
    /// Identity, kind, attributes and dependencies all contribute. Maps are
    /// hashed in key order so the result is deterministic.
    #[must_use]
    pub fn hash_declaration(
        &self,
        id: &str,
        kind: ResourceKind,
        attributes: &BTreeMap<String, AttributeValue>,
        dependencies: &[String],
    ) -> String {
        let mut hasher = Sha256::new();

        update_str(&mut hasher, id);
        update_str(&mut hasher, kind.as_str());

        hasher.update((attributes.len() as u64).to_be_bytes());
        for (name, value) in attributes {
            update_str(&mut hasher, name);
            update_value(&mut hasher, value);
        }

        let mut deps: Vec<_> = dependencies.iter().collect();
        deps.sort();
        hasher.update((deps.len() as u64).to_be_bytes());
        for dep in deps {
            update_str(&mut hasher, dep);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a whole plan from its declaration hashes and outputs.
    #[must_use]
    pub fn hash_plan<'a>(
        &self,
        project: &str,
        environment: &str,
        declaration_hashes: impl IntoIterator<Item = &'a str>,
        outputs: impl IntoIterator<Item = (&'a str, &'a AttributeValue)>,
    ) -> String {
        let mut hasher = Sha256::new();

        update_str(&mut hasher, project);
        update_str(&mut hasher, environment);

        for hash in declaration_hashes {
            update_str(&mut hasher, hash);
        }

        for (name, value) in outputs {
            update_str(&mut hasher, name);
            update_value(&mut hasher, value);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

// Length-prefixed so adjacent strings cannot collide.
fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn update_reference(hasher: &mut Sha256, reference: &Reference) {
    update_str(hasher, &reference.resource);
    match reference.selector {
        Selector::Whole => hasher.update([0u8]),
        Selector::Index(i) => {
            hasher.update([1u8]);
            hasher.update((i as u64).to_be_bytes());
        }
        Selector::Splat => hasher.update([2u8]),
    }
    update_str(hasher, &reference.attribute);
}

fn update_value(hasher: &mut Sha256, value: &AttributeValue) {
    match value {
        AttributeValue::String(s) => {
            hasher.update([b's']);
            update_str(hasher, s);
        }
        AttributeValue::Number(n) => {
            hasher.update([b'n']);
            hasher.update(n.to_bits().to_be_bytes());
        }
        AttributeValue::Bool(b) => {
            hasher.update([b'b', u8::from(*b)]);
        }
        AttributeValue::List(items) => {
            hasher.update([b'l']);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                update_value(hasher, item);
            }
        }
        AttributeValue::Map(map) => {
            hasher.update([b'm']);
            hasher.update((map.len() as u64).to_be_bytes());
            for (key, item) in map {
                update_str(hasher, key);
                update_value(hasher, item);
            }
        }
        AttributeValue::Reference(reference) => {
            hasher.update([b'r']);
            update_reference(hasher, reference);
        }
        AttributeValue::Template(parts) => {
            hasher.update([b't']);
            hasher.update((parts.len() as u64).to_be_bytes());
            for part in parts {
                match part {
                    TemplatePart::Literal(s) => update_str(hasher, s),
                    TemplatePart::Reference(reference) => update_reference(hasher, reference),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(pairs: &[(&str, &str)]) -> BTreeMap<String, AttributeValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), AttributeValue::parse_string(v).unwrap()))
            .collect()
    }

    #[test]
    fn test_declaration_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let attrs = attributes(&[("vpc_id", "${vpc.id}"), ("cidr_block", "10.0.1.0/24")]);

        let hash1 = hasher.hash_declaration("subnet", ResourceKind::Subnet, &attrs, &[String::from("vpc")]);
        let hash2 = hasher.hash_declaration("subnet", ResourceKind::Subnet, &attrs, &[String::from("vpc")]);

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_attribute_change_changes_hash() {
        let hasher = ConfigHasher::new();
        let a = attributes(&[("cidr_block", "10.0.0.0/16")]);
        let b = attributes(&[("cidr_block", "10.1.0.0/16")]);

        assert_ne!(
            hasher.hash_declaration("vpc", ResourceKind::Vpc, &a, &[]),
            hasher.hash_declaration("vpc", ResourceKind::Vpc, &b, &[])
        );
    }

    #[test]
    fn test_literal_and_reference_hash_differently() {
        let hasher = ConfigHasher::new();
        let literal = BTreeMap::from([(
            String::from("vpc_id"),
            AttributeValue::String(String::from("${vpc.id}")),
        )]);
        let reference = attributes(&[("vpc_id", "${vpc.id}")]);

        assert_ne!(
            hasher.hash_declaration("sg", ResourceKind::SecurityGroup, &literal, &[]),
            hasher.hash_declaration("sg", ResourceKind::SecurityGroup, &reference, &[])
        );
    }

    #[test]
    fn test_dependency_order_does_not_matter() {
        let hasher = ConfigHasher::new();
        let attrs = BTreeMap::new();
        let ab = [String::from("a"), String::from("b")];
        let ba = [String::from("b"), String::from("a")];

        assert_eq!(
            hasher.hash_declaration("x", ResourceKind::Instance, &attrs, &ab),
            hasher.hash_declaration("x", ResourceKind::Instance, &attrs, &ba)
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}

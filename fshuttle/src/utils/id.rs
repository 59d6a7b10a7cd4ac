use crate::models::{EntityKey, PropertyValues, RawValue};
use uuid::Uuid;

pub fn uuid_v5(ns: Uuid, name: &[u8]) -> Uuid {
    Uuid::new_v5(&ns, name)
}

/// Content address of a value; the datatype is part of the hash so `"1"` and `1` differ.
pub fn value_hash(value: &RawValue) -> [u8; 16] {
    let mut name = Vec::from(value.type_name().as_bytes());
    name.push(b'|');
    match value {
        RawValue::Binary(bytes) => name.extend_from_slice(bytes),
        other => name.extend_from_slice(other.canonical_text().as_bytes()),
    }
    uuid_v5(Uuid::NAMESPACE_OID, &name).into_bytes()
}

/// Surrogate id derived purely from the natural key.
pub fn stable_entity_id(key: &EntityKey) -> Uuid {
    // name 形如 "<entity set id>|<entity id>"
    let name = format!("{}|{}", key.entity_set_id, key.entity_id);
    uuid_v5(Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Builds the default business key from the entity set's primary-key property types.
///
/// Components follow the order of `key_property_ids`; values inside a component are
/// sorted so the result does not depend on the order rows were merged in. Returns an
/// empty string when no key property has a value.
pub fn default_entity_id(key_property_ids: &[Uuid], properties: &PropertyValues) -> String {
    let components: Vec<String> = key_property_ids
        .iter()
        .map(|id| {
            let mut texts: Vec<String> = properties
                .get(id)
                .map(|values| values.iter().map(|v| escape(&v.canonical_text())).collect())
                .unwrap_or_default();
            texts.sort();
            texts.join(",")
        })
        .collect();

    if components.iter().all(|c| c.is_empty()) {
        String::new()
    } else {
        components.join("|")
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | ',' | '|') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn test_default_id_follows_key_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let props: PropertyValues = HashMap::from([
            (a, HashSet::from([RawValue::from("x")])),
            (b, HashSet::from([RawValue::Integer(2), RawValue::Integer(1)])),
        ]);
        assert_eq!(default_entity_id(&[a, b], &props), "x|1,2");
        assert_eq!(default_entity_id(&[b, a], &props), "1,2|x");
    }

    #[test]
    fn test_default_id_blank_without_key_values() {
        let a = Uuid::new_v4();
        assert_eq!(default_entity_id(&[a], &HashMap::new()), "");
        assert_eq!(default_entity_id(&[], &HashMap::new()), "");
    }

    #[test]
    fn test_separators_are_escaped() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let joined: PropertyValues = HashMap::from([(a, HashSet::from([RawValue::from("x|y")]))]);
        let split: PropertyValues = HashMap::from([
            (a, HashSet::from([RawValue::from("x")])),
            (b, HashSet::from([RawValue::from("y")])),
        ]);
        assert_ne!(
            default_entity_id(&[a, b], &joined),
            default_entity_id(&[a, b], &split)
        );
    }

    #[test]
    fn test_value_hash_distinguishes_types() {
        assert_ne!(value_hash(&RawValue::from("1")), value_hash(&RawValue::Integer(1)));
        assert_eq!(value_hash(&RawValue::from("a")), value_hash(&RawValue::from("a")));
    }

    #[test]
    fn test_stable_entity_id_is_deterministic() {
        let key = EntityKey::new(Uuid::nil(), "42");
        assert_eq!(stable_entity_id(&key), stable_entity_id(&key.clone()));
        assert_ne!(stable_entity_id(&key), stable_entity_id(&EntityKey::new(Uuid::nil(), "43")));
    }
}

use serde_yaml::Value;

/// Deep-merges layer `b` over layer `a`.
///
/// Mappings recurse; any other type is replaced by `b`'s value. With
/// `allow_append`, a list in `a` is extended by `b`'s list instead of being
/// replaced — the semantics behind the `+key` configuration syntax.
pub fn deep_merge(a: &Value, b: &Value, allow_append: bool) -> Value {
    let (Value::Mapping(a_map), Value::Mapping(b_map)) = (a, b) else {
        return b.clone();
    };
    let mut result = a_map.clone();
    for (key, b_value) in b_map {
        let merged = match result.get(key) {
            Some(a_value) if a_value.is_mapping() && b_value.is_mapping() => {
                deep_merge(a_value, b_value, allow_append)
            }
            Some(Value::Sequence(a_seq)) if allow_append => match b_value.as_sequence() {
                Some(b_seq) => {
                    let mut joined = a_seq.clone();
                    joined.extend(b_seq.iter().cloned());
                    Value::Sequence(joined)
                }
                None => b_value.clone(),
            },
            _ => b_value.clone(),
        };
        result.insert(key.clone(), merged);
    }
    Value::Mapping(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn mappings_recurse_scalars_replace() {
        let a = yaml("executor:\n  type: qubes\n  options:\n    dispvm: builder-dvm\ndebug: false");
        let b = yaml("executor:\n  options:\n    dispvm: other-dvm\ndebug: true");
        let merged = deep_merge(&a, &b, false);
        assert_eq!(
            merged,
            yaml("executor:\n  type: qubes\n  options:\n    dispvm: other-dvm\ndebug: true")
        );
    }

    #[test]
    fn lists_replace_without_append() {
        let a = yaml("distributions: [host-fc32]");
        let b = yaml("distributions: [vm-bookworm]");
        assert_eq!(deep_merge(&a, &b, false), yaml("distributions: [vm-bookworm]"));
    }

    #[test]
    fn lists_concatenate_in_order_with_append() {
        let a = yaml("distributions: [host-fc32]");
        let b = yaml("distributions: [vm-bookworm, vm-archlinux]");
        assert_eq!(
            deep_merge(&a, &b, true),
            yaml("distributions: [host-fc32, vm-bookworm, vm-archlinux]")
        );
    }
}

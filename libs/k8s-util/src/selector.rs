use std::collections::BTreeMap;

/// Serializes a `matchLabels` map into its canonical label-selector form.
///
/// Keys are emitted in sorted order, so two maps with the same entries always
/// produce the same string.
pub fn selector_string(match_labels: &BTreeMap<String, String>) -> String {
    let mut selector = String::with_capacity(match_labels.len() * 20);
    for (key, value) in match_labels {
        if !selector.is_empty() {
            selector.push(',');
        }
        selector.push_str(key);
        selector.push('=');
        selector.push_str(value);
    }
    selector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_labels() {
        assert_eq!(selector_string(&BTreeMap::new()), "");
    }

    #[test]
    fn test_single_label() {
        let labels = BTreeMap::from([("app".to_string(), "demo".to_string())]);
        assert_eq!(selector_string(&labels), "app=demo");
    }

    #[test]
    fn test_labels_sorted_by_key() {
        let labels = BTreeMap::from([
            ("zone".to_string(), "b".to_string()),
            ("app".to_string(), "demo".to_string()),
        ]);
        assert_eq!(selector_string(&labels), "app=demo,zone=b");
    }

    #[test]
    fn test_identical_maps_serialize_identically() {
        let first = BTreeMap::from([
            ("app".to_string(), "demo".to_string()),
            ("tier".to_string(), "web".to_string()),
        ]);
        let second = BTreeMap::from([
            ("tier".to_string(), "web".to_string()),
            ("app".to_string(), "demo".to_string()),
        ]);
        assert_eq!(selector_string(&first), selector_string(&second));
    }
}

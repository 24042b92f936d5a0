//! Merging of TOML layers
//!
//! - Tables: merged key by key, recursively
//! - Arrays: replaced wholesale by the later layer
//! - Scalars: the later layer wins

use toml::Value;

/// Merge `overlay` on top of `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Table(mut base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_table.insert(key, merged);
            }
            Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Fold layers in order; the last has the highest precedence.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers
        .into_iter()
        .fold(Value::Table(toml::Table::new()), deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Value {
        Value::Table(s.parse::<toml::Table>().unwrap())
    }

    #[test]
    fn test_nested_tables_merge() {
        let base = parse("[worker]\nname = \"a\"\npoll_interval_ms = 50\n");
        let overlay = parse("[worker]\nname = \"b\"\n");
        let merged = deep_merge(base, overlay);

        assert_eq!(merged["worker"]["name"].as_str(), Some("b"));
        assert_eq!(merged["worker"]["poll_interval_ms"].as_integer(), Some(50));
    }

    #[test]
    fn test_labels_are_replaced_not_appended() {
        let base = parse("[worker]\nlabels = [\"linux\", \"x86\"]\n");
        let overlay = parse("[worker]\nlabels = [\"gpu\"]\n");
        let merged = deep_merge(base, overlay);

        let labels = merged["worker"]["labels"].as_array().unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].as_str(), Some("gpu"));
    }

    #[test]
    fn test_merge_layers_precedence() {
        let merged = merge_layers(vec![
            parse("[logging]\nfilter = \"info\"\n"),
            parse("[logging]\nfilter = \"warn\"\n"),
            parse("[logging]\nfilter = \"debug\"\n"),
        ]);
        assert_eq!(merged["logging"]["filter"].as_str(), Some("debug"));
    }

    #[test]
    fn test_empty_layers() {
        assert_eq!(merge_layers(Vec::new()), Value::Table(toml::Table::new()));
    }
}

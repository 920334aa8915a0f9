//! Deep-merge of SignalR incremental state (§4.1, DESIGN NOTES §9). This is
//! the *only* place accumulation happens in the Normalizer: maps merge
//! recursively key-by-key, scalars and arrays replace outright.
use serde_json::Value;

pub fn deep_merge(base: &mut Value, update: Value) {
    match (base, update) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, update_value) => {
            *base_slot = update_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_merge_recursively() {
        let mut base = json!({"44": {"Speed": 300, "Gear": 4}});
        deep_merge(&mut base, json!({"44": {"Gear": 5}}));
        assert_eq!(base, json!({"44": {"Speed": 300, "Gear": 5}}));
    }

    #[test]
    fn scalars_and_arrays_replace() {
        let mut base = json!({"Sectors": [1, 2, 3]});
        deep_merge(&mut base, json!({"Sectors": [4, 5]}));
        assert_eq!(base, json!({"Sectors": [4, 5]}));
    }

    #[test]
    fn new_keys_are_inserted() {
        let mut base = json!({"44": {"Speed": 300}});
        deep_merge(&mut base, json!({"77": {"Speed": 280}}));
        assert_eq!(base["77"]["Speed"], json!(280));
    }
}

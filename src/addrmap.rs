//! JSON forces object keys to be strings; every query reply and every
//! persisted snapshot round-trips the four display addresses through
//! string keys. Centralized here per the design notes, rather than
//! scattered `to_string()`/`parse()` calls at each call site.

use std::collections::BTreeMap;

/// Converts a fixed `[T; 4]` keyed by address 0..=3 into a string-keyed map
/// suitable for JSON serialization.
pub fn to_key_map<T: Clone>(values: &[T; 4]) -> BTreeMap<String, T> {
    (0..4)
        .map(|i| (i.to_string(), values[i].clone()))
        .collect()
}

/// Parses a string-keyed JSON map back into addresses, silently skipping
/// keys that aren't valid 0..=3 addresses (best-effort load, per spec).
pub fn from_key_map<T>(map: &BTreeMap<String, T>) -> Vec<(usize, &T)>
where
    T: Clone,
{
    map.iter()
        .filter_map(|(k, v)| k.parse::<usize>().ok().filter(|a| *a < 4).map(|a| (a, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_key_map_uses_string_addresses() {
        let values = [true, false, true, false];
        let map = to_key_map(&values);
        assert_eq!(map.get("0"), Some(&true));
        assert_eq!(map.get("3"), Some(&false));
    }

    #[test]
    fn from_key_map_skips_out_of_range_keys() {
        let mut map = BTreeMap::new();
        map.insert("0".to_string(), 1);
        map.insert("9".to_string(), 2);
        map.insert("bogus".to_string(), 3);
        let parsed = from_key_map(&map);
        assert_eq!(parsed, vec![(0usize, &1)]);
    }
}

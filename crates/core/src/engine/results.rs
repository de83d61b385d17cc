use std::collections::BTreeMap;

/// Parse tool output made up solely of `key=value` lines, as printed by
/// tools run with `-g`. Returns `None` for any other output.
pub fn parse_key_values(stdout: &str) -> Option<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return None;
        }
        values.insert(key.to_string(), value.trim().to_string());
    }
    (!values.is_empty()).then_some(values)
}

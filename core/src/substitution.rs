//! Constant/argument substitution: replaces `@{name}` tokens in strings using a
//! per-task argument map that overrides a process-wide constants map.
//!
//! Grounded on `examples/original_source/tubular/constantManager.py`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\{([A-Za-z0-9_\-]+)\}").expect("static regex is valid"));

#[derive(Debug, Error)]
pub enum ConstantsError {
    #[error("constant '{0}' has a non-string value")]
    NonString(String),
}

/// Process-wide constants table. Readers take a short shared lock; a config reload
/// swaps the whole map under a single writer lock (spec.md §4.1).
#[derive(Debug, Default)]
pub struct Constants {
    inner: RwLock<HashMap<String, String>>,
}

impl Constants {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self {
            inner: RwLock::new(values),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    /// Atomically swaps in a new snapshot of constants, used by config reload.
    pub fn replace(&self, values: HashMap<String, String>) {
        let mut guard = self.inner.write().expect("constants lock poisoned");
        *guard = values;
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .expect("constants lock poisoned")
            .get(key)
            .cloned()
    }
}

/// Loads a YAML mapping of string->string into a `Constants` table, rejecting any
/// non-string value (spec.md §4.1: "Non-string constant or arg values are a
/// load-time error"). Collects every offending key rather than stopping at the
/// first one, per SPEC_FULL.md.
pub fn load_constants(raw: &serde_yaml::Mapping) -> Result<HashMap<String, String>, Vec<String>> {
    let mut out = HashMap::with_capacity(raw.len());
    let mut bad = Vec::new();

    for (key, value) in raw {
        let key = key.as_str().unwrap_or_default().to_string();
        match value.as_str() {
            Some(v) => {
                out.insert(key, v.to_string());
            }
            None => bad.push(key),
        }
    }

    if bad.is_empty() {
        Ok(out)
    } else {
        Err(bad)
    }
}

/// Replaces every `@{name}` token in `text`. Resolution order per token:
/// (a) `args`, (b) `constants`, (c) leave the token literal.
pub fn replace(text: &str, args: &HashMap<String, String>, constants: &Constants) -> String {
    TOKEN_RE
        .replace_all(text, |caps: &regex::Captures| {
            let key = &caps[1];
            if let Some(v) = args.get(key) {
                v.clone()
            } else if let Some(v) = constants.get(key) {
                v
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_override_constants() {
        let constants = Constants::new(HashMap::from([("b".to_string(), "B".to_string())]));
        let args = HashMap::from([("a".to_string(), "A".to_string())]);
        assert_eq!(replace("x@{a}y@{b}z", &args, &constants), "xAyBz");
    }

    #[test]
    fn unknown_token_stays_literal() {
        let constants = Constants::empty();
        let args = HashMap::new();
        assert_eq!(replace("x@{c}y", &args, &constants), "x@{c}y");
    }

    #[test]
    fn non_matching_grammar_untouched() {
        let constants = Constants::empty();
        let args = HashMap::new();
        assert_eq!(replace("${not-a-token}", &args, &constants), "${not-a-token}");
        assert_eq!(replace("@{has space}", &args, &constants), "@{has space}");
    }

    #[test]
    fn args_win_over_constants_when_both_present() {
        let constants = Constants::new(HashMap::from([("msg".to_string(), "hi".to_string())]));
        let args = HashMap::from([("msg".to_string(), "hello".to_string())]);
        assert_eq!(replace("@{msg}", &args, &constants), "hello");
    }

    #[test]
    fn load_constants_rejects_non_string_values() {
        let yaml: serde_yaml::Mapping = serde_yaml::from_str("a: hi\nb: 5\n").unwrap();
        let err = load_constants(&yaml).unwrap_err();
        assert_eq!(err, vec!["b".to_string()]);
    }

    #[test]
    fn constants_replace_is_visible_to_readers() {
        let constants = Constants::empty();
        assert_eq!(replace("@{x}", &HashMap::new(), &constants), "@{x}");
        constants.replace(HashMap::from([("x".to_string(), "y".to_string())]));
        assert_eq!(replace("@{x}", &HashMap::new(), &constants), "y");
    }
}

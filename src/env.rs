//! Environment snapshot and `${VAR}` substitution
//!
//! All environment reads in the core go through an [`Env`] value captured
//! once at startup. Resolution against a snapshot keeps the whole pipeline
//! deterministic for a given input set, and lets tests drive every component
//! with literal pairs instead of mutating process state.

use std::collections::HashMap;

/// Immutable snapshot of the process environment.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from literal pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// Look up a variable, falling back to a default.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Look up an integer variable; non-numeric values fall back to the default.
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Look up a float variable; non-numeric values fall back to the default.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Look up a boolean variable (`true`/`1`/`yes` count as true).
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }

    /// Whether a variable is present (even if empty).
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Iterate over all captured pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Expand `${NAME}` and `${NAME:-default}` references in `input`.
    ///
    /// Unset variables without a default expand to the empty string. The
    /// syntax is deliberately small: no nesting, no other shell operators.
    pub fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let token = &after[..end];
                    let (name, default) = match token.split_once(":-") {
                        Some((n, d)) => (n, Some(d)),
                        None => (token, None),
                    };
                    match self.get(name) {
                        Some(value) => out.push_str(value),
                        None => out.push_str(default.unwrap_or("")),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated reference, keep it verbatim
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

//! Secret redaction.
//!
//! Every subprocess invocation that sees a secret must redact it before
//! logging and before any PR comment or check-run text. Callers build a
//! [`RedactionList`] from whatever secrets the current operation touched
//! (tokens, PyPI credentials, container registry passwords) and apply it
//! to every string that crosses a log/comment/check-run boundary.

const MASK: &str = "*****";

#[derive(Debug, Clone, Default)]
pub struct RedactionList(Vec<String>);

impl RedactionList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, secret: impl Into<String>) -> Self {
        self.push(secret);
        self
    }

    pub fn push(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        if !secret.is_empty() {
            self.0.push(secret);
        }
    }

    /// Replaces every occurrence of every non-empty secret with `*****`,
    /// longest secrets first so that one secret being a substring of
    /// another doesn't leave a residual fragment.
    pub fn redact(&self, text: &str) -> String {
        let mut secrets: Vec<&str> = self.0.iter().map(String::as_str).collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        let mut out = text.to_string();
        for secret in secrets {
            if secret.is_empty() {
                continue;
            }
            out = out.replace(secret, MASK);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_exact_and_substring_secrets() {
        let list = RedactionList::new().with("ghp_abcdef").with("ghp_ab");
        let redacted = list.redact("token is ghp_abcdef in use");
        assert!(!redacted.contains("ghp_abcdef"));
        assert!(redacted.contains(MASK));
    }

    #[test]
    fn empty_secret_is_ignored() {
        let list = RedactionList::new().with("");
        assert_eq!(list.redact("nothing to hide"), "nothing to hide");
    }
}

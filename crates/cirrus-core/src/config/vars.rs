//! Environment variable interpolation for committer configuration files.
//!
//! Recognised forms:
//! - `$VAR` or `${VAR}`: value of VAR, error if unset
//! - `${VAR:-default}`: default when VAR is unset or empty
//! - `${VAR-default}`: default only when VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("interpolation pattern is valid")
});

/// Output of [`interpolate`].
#[derive(Debug)]
pub struct Interpolated {
    pub text: String,
    /// One message per variable that could not be resolved.
    pub errors: Vec<String>,
}

impl Interpolated {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn resolve(caps: &Captures, errors: &mut Vec<String>) -> String {
    let whole = &caps[0];
    if caps.name("escape").is_some() {
        return "$".to_string();
    }

    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return whole.to_string();
    };
    let name = name.as_str();
    let empty_means_unset = caps.name("op").is_some_and(|op| op.as_str() == ":-");
    let default = caps.name("default").map(|m| m.as_str());

    match (env::var(name), default) {
        (Ok(value), _) if value.contains(['\n', '\r']) => {
            errors.push(format!("environment variable '{name}' contains a newline"));
            whole.to_string()
        }
        (Ok(value), Some(default)) if value.is_empty() && empty_means_unset => default.to_string(),
        (Ok(value), _) => value,
        (Err(_), Some(default)) => default.to_string(),
        (Err(_), None) => {
            errors.push(format!("environment variable '{name}' is not set"));
            whole.to_string()
        }
    }
}

/// Substitute environment variables into `input`.
///
/// Every unresolved variable is reported, not just the first one.
pub fn interpolate(input: &str) -> Interpolated {
    let mut errors = Vec::new();
    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| resolve(caps, &mut errors))
        .into_owned();
    Interpolated { text, errors }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Run `f` with the given variables set (or removed), restoring them afterwards.
    pub(crate) fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        // SAFETY: each test uses its own variable names and restores them
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        let result = f();

        // SAFETY: restoring the saved environment
        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_bare_and_braced() {
        with_env_vars(&[("CIRRUS_TEST_BUCKET", Some("logs"))], || {
            let out = interpolate("a: $CIRRUS_TEST_BUCKET\nb: s3://${CIRRUS_TEST_BUCKET}/out");
            assert!(out.is_ok());
            assert_eq!(out.text, "a: logs\nb: s3://logs/out");
        });
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        with_env_vars(
            &[("CIRRUS_TEST_MISSING_A", None), ("CIRRUS_TEST_MISSING_B", None)],
            || {
                let out = interpolate("$CIRRUS_TEST_MISSING_A ${CIRRUS_TEST_MISSING_B}");
                assert_eq!(out.errors.len(), 2);
                assert!(out.errors[0].contains("CIRRUS_TEST_MISSING_A"));
                assert!(out.text.contains("${CIRRUS_TEST_MISSING_B}"));
            },
        );
    }

    #[test]
    fn test_defaults() {
        with_env_vars(&[("CIRRUS_TEST_EMPTY", Some(""))], || {
            assert_eq!(interpolate("${CIRRUS_TEST_EMPTY:-8}").text, "8");
            assert_eq!(interpolate("${CIRRUS_TEST_EMPTY-8}").text, "");
        });
        with_env_vars(&[("CIRRUS_TEST_UNSET", None)], || {
            assert_eq!(interpolate("${CIRRUS_TEST_UNSET-8}").text, "8");
        });
    }

    #[test]
    fn test_newline_rejected() {
        with_env_vars(&[("CIRRUS_TEST_NEWLINE", Some("a\nb"))], || {
            let out = interpolate("$CIRRUS_TEST_NEWLINE");
            assert!(!out.is_ok());
        });
    }

    #[test]
    fn test_escape() {
        assert_eq!(interpolate("cost: $$5").text, "cost: $5");
    }
}

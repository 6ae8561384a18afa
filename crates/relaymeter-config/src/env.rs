use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Matches `{{ env.NAME }}` and `{{ env.NAME | default("value") }}`
fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#)
            .expect("placeholder pattern is valid")
    })
}

/// Replace environment placeholders in raw TOML before it is parsed
///
/// Comment lines are left untouched so documented examples never need
/// their variables to be set.
pub fn expand_env(input: &str) -> Result<String, String> {
    let mut expanded = Vec::new();

    for line in input.split('\n') {
        if line.trim_start().starts_with('#') {
            expanded.push(line.to_owned());
            continue;
        }

        let mut failure = None;
        let replaced = placeholder().replace_all(line, |caps: &Captures<'_>| {
            match resolve(&caps[1], caps.get(2).map(|m| m.as_str())) {
                Ok(value) => value,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }
        expanded.push(replaced.into_owned());
    }

    Ok(expanded.join("\n"))
}

fn resolve(key: &str, default: Option<&str>) -> Result<String, String> {
    let Some(name) = key.strip_prefix("env.").filter(|n| !n.is_empty() && !n.contains('.')) else {
        return Err(format!("only variables scoped with 'env.' are supported: `{key}`"));
    };

    match (std::env::var(name), default) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(fallback)) => Ok(fallback.to_owned()),
        (Err(_), None) => Err(format!("environment variable not found: `{name}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_untouched() {
        let input = "interval = \"10s\"\n";
        assert_eq!(expand_env(input).unwrap(), input);
    }

    #[test]
    fn variables_are_substituted() {
        temp_env::with_vars([("RM_HOST", Some("redis")), ("RM_PORT", Some("6379"))], || {
            let result = expand_env("url = \"redis://{{ env.RM_HOST }}:{{env.RM_PORT}}\"").unwrap();
            assert_eq!(result, "url = \"redis://redis:6379\"");
        });
    }

    #[test]
    fn missing_variable_is_an_error() {
        temp_env::with_var_unset("RM_MISSING", || {
            let err = expand_env("url = \"{{ env.RM_MISSING }}\"").unwrap_err();
            assert!(err.contains("RM_MISSING"));
        });
    }

    #[test]
    fn default_applies_only_when_unset() {
        temp_env::with_var_unset("RM_OPTIONAL", || {
            let result = expand_env("a = \"{{ env.RM_OPTIONAL | default(\"30s\") }}\"").unwrap();
            assert_eq!(result, "a = \"30s\"");
        });
        temp_env::with_var("RM_OPTIONAL", Some("5s"), || {
            let result = expand_env("a = \"{{ env.RM_OPTIONAL | default(\"30s\") }}\"").unwrap();
            assert_eq!(result, "a = \"5s\"");
        });
    }

    #[test]
    fn comments_are_not_expanded() {
        temp_env::with_var_unset("RM_MISSING", || {
            let input = "  # url = \"{{ env.RM_MISSING }}\"\nkey = 1";
            assert_eq!(expand_env(input).unwrap(), input);
        });
    }

    #[test]
    fn other_scopes_are_rejected() {
        let err = expand_env("key = \"{{ vault.SECRET }}\"").unwrap_err();
        assert!(err.contains("only variables scoped with 'env.'"));
    }
}

//! Inline environment-variable interpolation for string values in the
//! configuration file, so that secrets never have to live in the TOML
//! itself. Supports two equivalent forms: `${VAR}` and `{{ env.VAR }}`,
//! each with an optional `:-default` fallback.

/// Expand every `${VAR}` / `{{ env.VAR }}` occurrence in `input` against the
/// process environment. Returns an error naming the first variable that is
/// missing and has no default.
pub fn expand(input: &str) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if input[i..].starts_with("{{") {
            let Some(close) = input[i..].find("}}") else {
                out.push_str(&input[i..]);
                break;
            };

            let inner = input[i + 2..i + close].trim();
            let Some(var) = inner.strip_prefix("env.").map(str::trim) else {
                // Not an `env.` expression; leave the literal `{{ ... }}` untouched.
                out.push_str(&input[i..i + close + 2]);
                i += close + 2;
                continue;
            };

            out.push_str(&resolve(var)?);
            i += close + 2;
        } else if input[i..].starts_with("${") {
            let Some(close) = input[i..].find('}') else {
                out.push_str(&input[i..]);
                break;
            };

            let inner = &input[i + 2..i + close];
            out.push_str(&resolve(inner)?);
            i += close + 1;
        } else {
            let ch = input[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    Ok(out)
}

fn resolve(expr: &str) -> Result<String, String> {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name.trim(), Some(default)),
        None => (expr.trim(), None),
    };

    if name.is_empty() {
        return Err("empty variable name".to_string());
    }

    match std::env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => match default {
            Some(default) => Ok(default.to_string()),
            None => Err(format!("environment variable `{name}` is not set")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::expand;

    #[test]
    fn expands_dollar_brace_form() {
        unsafe { std::env::set_var("ONE_API_TEST_EXPAND_A", "hello") };
        assert_eq!(expand("${ONE_API_TEST_EXPAND_A}").unwrap(), "hello");
    }

    #[test]
    fn expands_env_dot_form() {
        unsafe { std::env::set_var("ONE_API_TEST_EXPAND_B", "world") };
        assert_eq!(expand("{{ env.ONE_API_TEST_EXPAND_B }}").unwrap(), "world");
    }

    #[test]
    fn falls_back_to_default() {
        unsafe { std::env::remove_var("ONE_API_TEST_EXPAND_MISSING") };
        assert_eq!(expand("${ONE_API_TEST_EXPAND_MISSING:-fallback}").unwrap(), "fallback");
    }

    #[test]
    fn errors_when_missing_and_no_default() {
        unsafe { std::env::remove_var("ONE_API_TEST_EXPAND_MISSING_2") };
        assert!(expand("${ONE_API_TEST_EXPAND_MISSING_2}").is_err());
    }

    #[test]
    fn passes_through_plain_strings() {
        assert_eq!(expand("sk-plain-value").unwrap(), "sk-plain-value");
    }
}

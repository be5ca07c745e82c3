use std::path::Path;

use anyhow::bail;
use indoc::indoc;
use serde::Deserialize;
use toml::Value;

use crate::{Config, dynamic_string};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref().to_path_buf();
    let content = std::fs::read_to_string(&path)?;
    let mut raw_config: Value = toml::from_str(&content)?;

    expand_dynamic_strings(&mut Vec::new(), &mut raw_config)?;

    let config = Config::deserialize(raw_config)?;
    validate_has_channels(&config)?;
    validate_channel_groups(&config)?;

    Ok(config)
}

pub(crate) fn validate_has_channels(config: &Config) -> anyhow::Result<()> {
    if config.channels.is_empty() {
        bail!(indoc! {r#"
            No channels configured. one-api requires at least one upstream channel to function.

            Example configuration:

              [channels.openai-primary]
              type = "openai"
              name = "OpenAI primary"
              api_key = "${OPENAI_API_KEY}"
              groups = ["default"]
        "#});
    }

    Ok(())
}

pub(crate) fn validate_channel_groups(config: &Config) -> anyhow::Result<()> {
    for (id, channel) in &config.channels {
        if channel.common().groups.is_empty() {
            bail!("channel '{id}' must belong to at least one group");
        }
    }

    Ok(())
}

fn expand_dynamic_strings(path: &mut Vec<Result<&str, usize>>, value: &mut Value) -> anyhow::Result<()> {
    match value {
        Value::String(s) => match dynamic_string::expand(s) {
            Ok(out) => *s = out,
            Err(reason) => {
                let mut p = String::new();

                for segment in path.iter() {
                    match segment {
                        Ok(s) => {
                            p.push_str(s);
                            p.push('.');
                        }
                        Err(i) => p.push_str(&format!("[{i}]")),
                    }
                }

                if p.ends_with('.') {
                    p.pop();
                }

                bail!("Failed to expand '{p}': {reason}");
            }
        },
        Value::Array(values) => {
            for (i, value) in values.iter_mut().enumerate() {
                path.push(Err(i));
                expand_dynamic_strings(path, value)?;
                path.pop();
            }
        }
        Value::Table(map) => {
            for (key, value) in map.iter_mut() {
                path.push(Ok(key.as_str()));
                expand_dynamic_strings(path, value)?;
                path.pop();
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use tempfile::NamedTempFile;

    use super::*;

    fn write_toml(contents: &str) -> NamedTempFile {
        use std::io::Write;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_and_expands_env_vars() {
        unsafe { std::env::set_var("ONE_API_TEST_LOADER_KEY", "sk-from-env") };

        let file = write_toml(indoc! {r#"
            [channels.openai-primary]
            type = "openai"
            name = "OpenAI primary"
            api_key = "${ONE_API_TEST_LOADER_KEY}"
            groups = ["default"]
        "#});

        let config = load(file.path()).unwrap();

        assert_eq!(config.channels.len(), 1);
    }

    #[test]
    fn rejects_empty_channel_set() {
        let file = write_toml("");

        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("No channels configured"));
    }

    #[test]
    fn rejects_channel_with_no_groups() {
        let file = write_toml(indoc! {r#"
            [channels.openai-primary]
            type = "openai"
            name = "OpenAI primary"
            api_key = "sk-test"
            groups = []
        "#});

        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("at least one group"));
    }
}

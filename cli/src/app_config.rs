//! `key = value` file configuration for CLI defaults. No external parser crate: a
//! handful of scalar settings don't justify one (see SPEC_FULL.md §1A).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// File-backed defaults, merged under CLI flags (flags win).
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub threads: Option<u32>,
    pub concurrency: Option<usize>,
    pub auto_retry: Option<bool>,
    pub max_retries: Option<u32>,
}

impl FileConfig {
    fn validate(&self) -> Result<()> {
        if let Some(threads) = self.threads
            && !(1..=32).contains(&threads)
        {
            bail!("Invalid config value for `threads`: {threads}. Expected range: 1..=32");
        }
        if let Some(concurrency) = self.concurrency
            && !(1..=64).contains(&concurrency)
        {
            bail!("Invalid config value for `concurrency`: {concurrency}. Expected range: 1..=64");
        }
        if let Some(max_retries) = self.max_retries
            && max_retries > 20
        {
            bail!("Invalid config value for `max_retries`: {max_retries}. Expected range: 0..=20");
        }
        Ok(())
    }
}

/// Resolves `$XDG_CONFIG_HOME/dlaccel/config` falling back to `$HOME/.config/dlaccel/config`.
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("dlaccel").join("config"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".config").join("dlaccel").join("config"))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file from the default path if one exists; an absent file is not an
/// error, it just means every default comes from the CLI's own built-in defaults.
pub fn load_default_file_config() -> Result<FileConfig> {
    let Some(path) = resolve_default_config_path() else {
        return Ok(FileConfig::default());
    };
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    load_file_config(&path)
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw).with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {}: expected key = value", line_index + 1);
        };
        let key = raw_key.trim();
        let value = raw_value.trim();

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(parse_string_literal(value).with_context(|| {
                    format!("Invalid `output_dir` value on line {}", line_index + 1)
                })?));
            }
            "db_path" => {
                cfg.db_path = Some(PathBuf::from(
                    parse_string_literal(value)
                        .with_context(|| format!("Invalid `db_path` value on line {}", line_index + 1))?,
                ));
            }
            "socket_path" => {
                cfg.socket_path = Some(PathBuf::from(parse_string_literal(value).with_context(|| {
                    format!("Invalid `socket_path` value on line {}", line_index + 1)
                })?));
            }
            "threads" => {
                cfg.threads = Some(
                    parse_integer_u32(value)
                        .with_context(|| format!("Invalid `threads` value on line {}", line_index + 1))?,
                );
            }
            "concurrency" => {
                let parsed = parse_integer_u32(value)
                    .with_context(|| format!("Invalid `concurrency` value on line {}", line_index + 1))?;
                cfg.concurrency = Some(parsed as usize);
            }
            "auto_retry" => {
                cfg.auto_retry = Some(
                    parse_boolean(value)
                        .with_context(|| format!("Invalid `auto_retry` value on line {}", line_index + 1))?,
                );
            }
            "max_retries" => {
                cfg.max_retries = Some(
                    parse_integer_u32(value)
                        .with_context(|| format!("Invalid `max_retries` value on line {}", line_index + 1))?,
                );
            }
            unknown => {
                bail!("Unknown configuration key: '{}' on line {}", unknown, line_index + 1);
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u32(raw_value: &str) -> Result<u32> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i64>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u32::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u32"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
threads = 8
auto_retry = true
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.threads, Some(8));
        assert_eq!(cfg.auto_retry, Some(true));
        assert!(cfg.output_dir.is_none());
    }

    #[test]
    fn test_parse_config_rejects_invalid_threads() {
        let err = parse_config_str("threads = 0").expect_err("invalid threads expected");
        assert!(err.to_string().contains("threads"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("bogus = 1").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str(r#"threads = 4 # workers"#).expect("config with comment should parse");
        assert_eq!(cfg.threads, Some(4));
    }

    #[test]
    fn test_parse_config_paths() {
        let cfg = parse_config_str(
            r#"
output_dir = "/data/downloads"
db_path = "/data/dlaccel.db"
socket_path = "/run/dlaccel.sock"
"#,
        )
        .expect("path config should parse");
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/data/downloads")));
        assert_eq!(cfg.db_path, Some(PathBuf::from("/data/dlaccel.db")));
        assert_eq!(cfg.socket_path, Some(PathBuf::from("/run/dlaccel.sock")));
    }

    #[test]
    fn test_parse_config_rejects_invalid_concurrency() {
        let err = parse_config_str("concurrency = 0").expect_err("invalid concurrency expected");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_max_retries() {
        let err = parse_config_str("max_retries = 21").expect_err("invalid max_retries expected");
        assert!(err.to_string().contains("max_retries"));
    }
}

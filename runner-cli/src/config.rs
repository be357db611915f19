// Configuration helpers
// Env file loading and the map and list formats used by runner settings

use std::collections::BTreeMap;
use std::path::Path;

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped and
/// surrounding quotes are stripped from values.
pub fn parse_env_file(data: &str) -> Vec<(String, String)> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), unquote(value.trim()).to_string()))
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Load an env file into the process environment without overriding
/// variables that are already set. Must run before any thread is spawned.
pub fn load_env_file(path: &Path) -> Result<()> {
    let data = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read env file {}", path.display()))?;
    for (key, value) in parse_env_file(&data) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

/// Parse `key:value,key2:value2`
pub fn parse_map(value: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in parse_list(value) {
        let (key, val) = pair
            .split_once(':')
            .ok_or_else(|| eyre!("invalid key:value pair '{}'", pair))?;
        map.insert(key.trim().to_string(), val.trim().to_string());
    }
    Ok(map)
}

/// Parse `KEY=VALUE` pairs as given on the command line
pub fn parse_assignments(values: &[String]) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| eyre!("invalid format '{}'. Expected KEY=VALUE", item))
        })
        .collect()
}

/// Parse a comma separated list, dropping empty entries
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_env_file() {
        let data = r#"
# runner settings
DRONE_RPC_HOST=ci.example.com
DRONE_RPC_SECRET="s3cr3t"
export DRONE_RUNNER_NAME='runner-1'

INVALID LINE
"#;
        let vars = parse_env_file(data);
        assert_eq!(
            vars,
            vec![
                ("DRONE_RPC_HOST".to_string(), "ci.example.com".to_string()),
                ("DRONE_RPC_SECRET".to_string(), "s3cr3t".to_string()),
                ("DRONE_RUNNER_NAME".to_string(), "runner-1".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_env_file_keeps_existing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "KUBE_RUNNER_TEST_SET=from-file").unwrap();
        writeln!(file, "KUBE_RUNNER_TEST_UNSET=from-file").unwrap();
        std::env::set_var("KUBE_RUNNER_TEST_SET", "from-env");

        load_env_file(file.path()).unwrap();

        assert_eq!(std::env::var("KUBE_RUNNER_TEST_SET").unwrap(), "from-env");
        assert_eq!(std::env::var("KUBE_RUNNER_TEST_UNSET").unwrap(), "from-file");
    }

    #[test]
    fn test_parse_map() {
        let map = parse_map("team:platform, tier : ci").unwrap();
        assert_eq!(map["team"], "platform");
        assert_eq!(map["tier"], "ci");
        assert!(parse_map("").unwrap().is_empty());
        assert!(parse_map("novalue").is_err());
    }

    #[test]
    fn test_parse_assignments() {
        let vars = parse_assignments(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(vars["A"], "1");
        assert_eq!(vars["B"], "x=y");
        assert!(parse_assignments(&["oops".to_string()]).is_err());
    }
}

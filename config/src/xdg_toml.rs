//! Load `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

fn xdg_config_path(app_name: &str) -> Result<Option<PathBuf>, LoadError> {
    // Honor an explicit XDG_CONFIG_HOME before falling back to the platform dir.
    let config_dir = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir()
            .ok_or_else(|| LoadError::XdgPath("no config directory for platform".to_string()))?,
    };
    let path = config_dir.join(app_name).join("config.toml");
    if path.exists() {
        Ok(Some(path))
    } else {
        Ok(None)
    }
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Returns env key-value pairs from `[env]` section. Missing file or empty section returns empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let path = match xdg_config_path(app_name)? {
        Some(p) => p,
        None => return Ok(HashMap::new()),
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn missing_config_returns_empty_map() {
        let map = load_env_map("config-crate-test-nonexistent-12345").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn load_env_map_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("testapp");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nORCH_MAX_TEST_RETRIES = \"5\"\n",
        )
        .unwrap();

        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir.path());
        let result = load_env_map("testapp");
        match prev {
            Some(p) => env::set_var("XDG_CONFIG_HOME", p),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }

        let map = result.unwrap();
        assert_eq!(map.get("ORCH_MAX_TEST_RETRIES"), Some(&"5".to_string()));
    }
}

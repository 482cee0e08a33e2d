use crate::config::Config;
use crate::utils::{IkupError, Result};
use std::path::PathBuf;

/// Get the default config file path: ~/.config/ikup/config.toml
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ikup").join("config.toml"))
}

/// Load configuration: `IKUP_CONFIG` (or the explicit path) wins, otherwise
/// the default location, otherwise built-in defaults. Environment variables
/// prefixed `IKUP_` override individual keys afterwards.
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let explicit = path.or_else(|| std::env::var_os("IKUP_CONFIG").map(PathBuf::from));
    let mut config = match explicit {
        Some(path) => {
            log::info!("Loading config from: {}", path.display());
            let content = std::fs::read_to_string(&path).map_err(|e| {
                IkupError::config(format!("cannot read {}: {}", path.display(), e))
            })?;
            toml::from_str(&content)?
        }
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                let content = std::fs::read_to_string(&path)?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        },
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Override keys from `IKUP_<UPPERCASE_KEY>` variables. The expected type
/// of each value comes from the current config rendered as a TOML table.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    let rendered =
        toml::Table::try_from(&*config).map_err(|e| IkupError::config(e.to_string()))?;
    let mut table = rendered.clone();
    let mut changed = false;
    for (key, value) in rendered.iter() {
        let env_name = format!("IKUP_{}", key.to_uppercase());
        let env_value = match std::env::var(&env_name) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let parsed = parse_env_value(&env_value, value).ok_or_else(|| {
            IkupError::config(format!("invalid value for {}: '{}'", env_name, env_value))
        })?;
        log::debug!("Config override from {}", env_name);
        table.insert(key.clone(), parsed);
        changed = true;
    }
    if changed {
        *config = table.try_into().map_err(|e: toml::de::Error| {
            IkupError::config(format!("invalid environment override: {}", e))
        })?;
    }
    Ok(())
}

fn parse_env_value(text: &str, like: &toml::Value) -> Option<toml::Value> {
    match like {
        toml::Value::String(_) => Some(toml::Value::String(text.to_string())),
        toml::Value::Integer(_) => text.parse::<i64>().ok().map(toml::Value::Integer),
        toml::Value::Float(_) => text.parse::<f64>().ok().map(toml::Value::Float),
        toml::Value::Boolean(_) => match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "t" | "y" | "yes" => Some(toml::Value::Boolean(true)),
            "false" | "0" | "f" | "n" | "no" => Some(toml::Value::Boolean(false)),
            _ => None,
        },
        _ => None,
    }
}

/// Render the effective configuration, for `dump-config`.
pub fn dump_config(config: &Config) -> String {
    toml::to_string(config).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so the env override cases
    // share one test.
    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        std::env::set_var("IKUP_ID_SPACE", "24bit");
        std::env::set_var("IKUP_MAX_NUM_IDS", "77");
        std::env::set_var("IKUP_FORCE_UPLOAD", "yes");
        std::env::set_var("IKUP_SCALE", "1.5");
        apply_env_overrides(&mut config).unwrap();
        assert_eq!(config.id_space, "24bit");
        assert_eq!(config.max_num_ids, 77);
        assert!(config.force_upload);
        assert_eq!(config.scale, 1.5);

        std::env::set_var("IKUP_MAX_NUM_IDS", "not-a-number");
        assert!(apply_env_overrides(&mut config).is_err());

        std::env::remove_var("IKUP_ID_SPACE");
        std::env::remove_var("IKUP_MAX_NUM_IDS");
        std::env::remove_var("IKUP_FORCE_UPLOAD");
        std::env::remove_var("IKUP_SCALE");
    }

    #[test]
    fn test_dump_config_round_trips() {
        let config = Config::default();
        let dumped = dump_config(&config);
        let parsed: Config = toml::from_str(&dumped).unwrap();
        assert_eq!(parsed.chunk_size, config.chunk_size);
        assert_eq!(parsed.id_space, config.id_space);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("no_such_key = 1");
        assert!(result.is_err());
    }
}

//! Configuration validation utilities.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, ZincConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &ZincConfig) -> ConfigResult<()> {
    validate_logging(&config.logging)?;
    validate_plugins(&config.plugins)?;
    validate_adapters(config)?;
    validate_permissions(config)?;
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    Ok(())
}

fn validate_plugins(plugins: &[String]) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in plugins {
        if name.trim().is_empty() {
            return Err(ConfigError::validation("Plugin name cannot be empty"));
        }
        if !seen.insert(name) {
            return Err(ConfigError::DuplicatePlugin(name.clone()));
        }
    }
    Ok(())
}

fn validate_adapters(config: &ZincConfig) -> ConfigResult<()> {
    for protocol in config.adapters.keys() {
        if protocol.is_empty() || protocol.contains(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "Invalid adapter protocol: {protocol:?}"
            )));
        }
    }
    Ok(())
}

/// Permission keys are command paths such as `admin/kick`.
fn validate_permissions(config: &ZincConfig) -> ConfigResult<()> {
    for key in config.permissions.keys() {
        let mut tokens = key.split_whitespace();
        let valid = match (tokens.next(), tokens.next()) {
            (Some(path), None) => !path.split('/').any(str::is_empty),
            _ => false,
        };
        if !valid {
            return Err(ConfigError::validation(format!(
                "Invalid command path in permissions: {key:?}, expected a form like \"admin/kick\""
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zinc_core::Role;

    #[test]
    fn test_validate_empty_config() {
        assert!(validate_config(&ZincConfig::default()).is_ok());
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = ZincConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));
        config.logging.file_path = Some("zinc.log".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_plugin() {
        let config = ZincConfig {
            plugins: vec!["echo".into(), "echo".into()],
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::DuplicatePlugin(_))
        ));
    }

    #[test]
    fn test_permission_paths() {
        let mut config = ZincConfig::default();
        config
            .permissions
            .insert("admin/kick".into(), vec![Role::Admins]);
        assert!(validate_config(&config).is_ok());

        config
            .permissions
            .insert("ban <user:integer>".into(), vec![Role::Master]);
        assert!(validate_config(&config).is_err());
        config.permissions.remove("ban <user:integer>");

        config.permissions.insert("admin//ban".into(), vec![Role::Master]);
        assert!(validate_config(&config).is_err());
    }
}

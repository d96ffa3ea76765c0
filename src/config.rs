use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    /// Optional HTTP listen address for metrics and health (e.g. "127.0.0.1:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (directory size).
    pub metrics_listen: Option<String>,
    /// Entries loaded into the directory before the listener starts.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub dn: String,
    pub password: String,
    pub mail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedGroup {
    pub dn: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Invalid YAML configuration")?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            metrics_listen: None,
            directory: DirectoryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:1389");
        assert!(config.metrics_listen.is_none());
        assert!(config.directory.users.is_empty());
        assert!(config.directory.groups.is_empty());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
listen:
  url: "ldap://0.0.0.0:389"
metrics_listen: "127.0.0.1:9090"
directory:
  users:
    - dn: "cn=toplevel_user,cn=TOPLEVEL,dc=example,dc=com"
      password: "toplevel_password"
    - dn: "cn=regular_user,ou=USERS,dc=example,dc=com"
      password: "regular_password"
      mail: "regular_user@example.com"
  groups:
    - dn: "cn=regular_group,ou=GROUPS,dc=example,dc=com"
      members:
        - "cn=regular_user,ou=USERS,dc=example,dc=com"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://0.0.0.0:389");
        assert_eq!(config.metrics_listen, Some("127.0.0.1:9090".to_string()));
        assert_eq!(config.directory.users.len(), 2);
        assert_eq!(config.directory.users[0].mail, None);
        assert_eq!(config.directory.users[1].mail, Some("regular_user@example.com".to_string()));
        assert_eq!(config.directory.groups.len(), 1);
        assert_eq!(
            config.directory.groups[0].members,
            vec!["cn=regular_user,ou=USERS,dc=example,dc=com".to_string()]
        );
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://:1389");
        assert!(config.metrics_listen.is_none());
        assert!(config.directory.users.is_empty());
    }

    #[test]
    fn test_config_group_without_members() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
directory:
  groups:
    - dn: "cn=empty,ou=GROUPS,dc=example,dc=com"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(config.directory.groups[0].members.is_empty());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:1389"
directory:
  users:
    - dn: "cn=u1,dc=example,dc=com"
      password: "pw1"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:1389");
        assert_eq!(config.directory.users[0].dn, "cn=u1,dc=example,dc=com");
        assert_eq!(config.directory.users[0].password, "pw1");
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        let yaml = "invalid: yaml: content: [";
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_user_without_password_is_rejected() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
directory:
  users:
    - dn: "cn=u1,dc=example,dc=com"
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }
}

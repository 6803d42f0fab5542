//! Basic-auth user list loaded from a `tomcat-users` style XML file.
//!
//! ```xml
//! <tomcat-users>
//!   <user name="alice" password="secret"/>
//! </tomcat-users>
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;
use wsterm_core::SecretLookup;

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize)]
struct RealmFile {
    #[serde(rename = "user", default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@password")]
    password: String,
}

/// In-memory user → password map.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Realm {
    users: HashMap<String, String>,
}

impl Realm {
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid realm XML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| AppError::RealmRead {
            path: path.to_path_buf(),
            source,
        })?;
        let realm = Self::parse(&content).map_err(|message| AppError::RealmParse {
            path: path.to_path_buf(),
            message,
        })?;
        debug!(path = %path.display(), users = realm.len(), "realm loaded");
        Ok(realm)
    }

    /// Parse realm XML. Later entries override earlier ones with the same name.
    ///
    /// # Errors
    ///
    /// Returns the parser message if the XML is malformed.
    pub fn parse(xml: &str) -> std::result::Result<Self, String> {
        let file: RealmFile = quick_xml::de::from_str(xml).map_err(|error| error.to_string())?;
        let users = file
            .users
            .into_iter()
            .map(|user| (user.name, user.password))
            .collect();
        Ok(Self { users })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl SecretLookup for Realm {
    fn secret(&self, user: &str, _realm: &str) -> Option<String> {
        self.users.get(user).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const USERS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tomcat-users>
  <role rolename="manager"/>
  <user name="alice" password="wonderland" roles="manager"/>
  <user name="bob" password="builder"/>
</tomcat-users>"#;

    #[test]
    fn parse_reads_user_attributes() {
        let realm = Realm::parse(USERS).expect("parse");
        assert_eq!(realm.len(), 2);
        assert_eq!(realm.secret("alice", "Restricted").as_deref(), Some("wonderland"));
        assert_eq!(realm.secret("bob", "Restricted").as_deref(), Some("builder"));
        assert_eq!(realm.secret("carol", "Restricted"), None);
    }

    #[test]
    fn parse_accepts_empty_user_list() {
        let realm = Realm::parse("<tomcat-users></tomcat-users>").expect("parse");
        assert!(realm.is_empty());
    }

    #[test]
    fn parse_rejects_malformed_xml() {
        assert!(Realm::parse("<tomcat-users><user name=").is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(USERS.as_bytes()).expect("write");
        let realm = Realm::load(file.path()).expect("load");
        assert_eq!(realm.len(), 2);
    }

    #[test]
    fn load_missing_file_is_realm_read_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let error = Realm::load(&dir.path().join("missing.xml")).expect_err("missing");
        assert!(matches!(error, AppError::RealmRead { .. }));
        assert_eq!(error.exit_code(), 2);
    }
}

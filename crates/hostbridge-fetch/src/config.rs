use crate::FetchError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Where and how archives are fetched.
///
/// `url`, when set, is a mirror base: the path of every `http(s)://` reference is
/// requested from the mirror instead of the origin host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl FetchConfig {
    pub fn with_mirror(url: &str) -> Self {
        Self {
            url: Some(url.trim_end_matches('/').to_owned()),
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    pub fn load(path: &Path) -> Result<Self, FetchError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| FetchError::Config(format!("invalid fetch config: {e}")))?;
        if let Some(ref mut url) = config.url {
            *url = url.trim_end_matches('/').to_owned();
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), FetchError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| FetchError::Config(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(path).map_err(|e| FetchError::Io(e.error))?;
        Ok(())
    }

    /// The URL actually requested for `reference`.
    pub fn resolve(&self, reference: &str) -> String {
        let Some(ref mirror) = self.url else {
            return reference.to_owned();
        };
        let rest = reference
            .strip_prefix("https://")
            .or_else(|| reference.strip_prefix("http://"));
        match rest {
            Some(rest) => match rest.find('/') {
                Some(slash) => format!("{mirror}{}", &rest[slash..]),
                None => mirror.clone(),
            },
            None => reference.to_owned(),
        }
    }
}

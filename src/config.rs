use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use toml_edit::{DocumentMut, Item, Table, value};

const API_URL_KEY: &str = "PREFECT_API_URL";
const API_KEY_KEY: &str = "PREFECT_API_KEY";

/// Which Prefect Cloud installation to talk to, selected by `CLOUD_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudEnv {
    #[default]
    Prd,
    Stg,
    Dev,
}

impl CloudEnv {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "prd" | "prod" => Ok(CloudEnv::Prd),
            "stg" => Ok(CloudEnv::Stg),
            "dev" => Ok(CloudEnv::Dev),
            other => bail!("unknown CLOUD_ENV {:?} (expected prd, stg or dev)", other),
        }
    }

    pub fn api_base(self) -> &'static str {
        match self {
            CloudEnv::Prd => "https://api.prefect.cloud/api",
            CloudEnv::Stg => "https://api.stg.prefect.dev/api",
            CloudEnv::Dev => "https://api.prefect.dev/api",
        }
    }

    pub fn ui_base(self) -> &'static str {
        match self {
            CloudEnv::Prd => "https://app.prefect.cloud",
            CloudEnv::Stg => "https://app.stg.prefect.dev",
            CloudEnv::Dev => "https://app.prefect.dev",
        }
    }
}

impl fmt::Display for CloudEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloudEnv::Prd => "prd",
            CloudEnv::Stg => "stg",
            CloudEnv::Dev => "dev",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub cloud_env: CloudEnv,
    pub prefect_home: PathBuf,
    pub env_api_url: Option<String>,
    pub env_api_key: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cloud_env = match non_empty("CLOUD_ENV") {
            Some(raw) => CloudEnv::parse(&raw)?,
            None => CloudEnv::default(),
        };
        let prefect_home = match non_empty("PREFECT_HOME") {
            Some(home) => PathBuf::from(home),
            None => dirs::home_dir()
                .context("could not find home directory; set PREFECT_HOME")?
                .join(".prefect"),
        };

        Ok(Settings {
            cloud_env,
            prefect_home,
            env_api_url: non_empty(API_URL_KEY),
            env_api_key: non_empty(API_KEY_KEY),
        })
    }

    pub fn profiles(&self) -> ProfileStore {
        ProfileStore::new(self.prefect_home.join("profiles.toml"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(rename = "PREFECT_API_URL", default)]
    pub api_url: Option<String>,
    #[serde(rename = "PREFECT_API_KEY", default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProfilesFile {
    active: Option<String>,
    #[serde(default)]
    profiles: BTreeMap<String, Profile>,
}

/// The `profiles.toml` file shared with the Prefect SDK.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load_active(&self) -> Result<Option<(String, Profile)>> {
        let Some(content) = self.read().await? else {
            return Ok(None);
        };
        let file: ProfilesFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        let Some(active) = file.active else {
            return Ok(None);
        };
        let profile = file.profiles.get(&active).cloned().unwrap_or_default();
        Ok(Some((active, profile)))
    }

    pub async fn save(&self, name: &str, api_url: &str, api_key: &str) -> Result<()> {
        let mut doc = self.read_document().await?;

        let profiles = doc.entry("profiles").or_insert_with(|| {
            let mut table = Table::new();
            table.set_implicit(true);
            Item::Table(table)
        });
        let profiles = profiles
            .as_table_mut()
            .with_context(|| format!("`profiles` in {} is not a table", self.path.display()))?;
        let profile = profiles
            .entry(name)
            .or_insert(toml_edit::table())
            .as_table_mut()
            .with_context(|| format!("profile {:?} is not a table", name))?;
        profile[API_URL_KEY] = value(api_url);
        profile[API_KEY_KEY] = value(api_key);
        doc["active"] = value(name);

        self.write(&doc).await?;
        tracing::debug!(profile = name, path = %self.path.display(), "config: profile saved");
        Ok(())
    }

    /// Drop the API URL and key from the active profile, returning its name.
    pub async fn clear_active_credentials(&self) -> Result<Option<String>> {
        let mut doc = self.read_document().await?;
        let Some(active) = doc.get("active").and_then(|v| v.as_str()).map(str::to_string) else {
            return Ok(None);
        };

        let Some(profile) = doc
            .get_mut("profiles")
            .and_then(|p| p.get_mut(&active))
            .and_then(|p| p.as_table_like_mut())
        else {
            return Ok(None);
        };
        let had_url = profile.remove(API_URL_KEY).is_some();
        let had_key = profile.remove(API_KEY_KEY).is_some();
        if !had_url && !had_key {
            return Ok(None);
        }

        self.write(&doc).await?;
        Ok(Some(active))
    }

    async fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(Some(content))
    }

    async fn read_document(&self) -> Result<DocumentMut> {
        let content = self.read().await?.unwrap_or_default();
        content
            .parse::<DocumentMut>()
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    async fn write(&self, doc: &DocumentMut) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&self.path, doc.to_string())
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

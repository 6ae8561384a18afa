use serde::Deserialize;
use url::Url;

/// Durable store selection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local maps; state is lost on restart
    #[default]
    Memory,
    /// Redis hashes and lists
    Redis(RedisStorageConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStorageConfig {
    pub url: Url,
    /// Prefix of every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "relaymeter".to_owned()
}

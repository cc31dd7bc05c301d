//! Persisted settings and the wiring they drive.
//!
//! Values are stored as strings in `settings.redb`. [`Settings`] resolves
//! them, with defaults and environment overrides, into the chunker,
//! embedder and generator the knowledge base is opened with.

use std::{fmt, path::Path, str::FromStr, sync::Arc};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;

use crate::{
    chunking::{Chunker, ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE},
    data_dir::DataDir,
    embedding::{EmbeddingProvider, HashingEmbedder},
    error::{Error, Result},
    knowledge_base::{DEFAULT_TOP_K, KnowledgeBase},
    model_manager::{ColbertEmbedder, DEFAULT_MODEL_ID},
    openai::{DEFAULT_CHAT_MODEL, DEFAULT_EMBEDDING_MODEL, OpenAiChat, OpenAiClient, OpenAiEmbedder},
    tokenizer::{self, Tokenizer},
};

const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

pub const EMBEDDER_ENV_VAR: &str = "KNOWBASE_EMBEDDER";
pub const MODEL_ENV_VAR: &str = "KNOWBASE_MODEL";

/// Recognised setting keys with a short description.
pub const KEYS: &[(&str, &str)] = &[
    ("embedder", "embedding provider: hashing, colbert or openai"),
    ("model", "embedding model id (dimension for hashing)"),
    ("tokenizer", "chunk token counter: words, chars or hf:<model>"),
    ("chunk_size", "target chunk size in tokens"),
    ("chunk_overlap", "tokens shared by consecutive chunks"),
    ("top_k", "default number of search results"),
    ("openai_base_url", "base URL of an OpenAI-compatible API"),
    ("chat_model", "chat model used by `ask`"),
];

pub struct SettingsDb {
    db: Database,
}

impl SettingsDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Store a setting after checking the key is known and the value parses.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn unset(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Stored settings in key order.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl fmt::Debug for SettingsDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsDb").finish_non_exhaustive()
    }
}

fn check_key(key: &str) -> Result<()> {
    if KEYS.iter().any(|(k, _)| *k == key) {
        Ok(())
    } else {
        Err(Error::Config(format!("unknown setting '{key}'")))
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!("{key} must be a non-negative integer, got '{value}'"))
    })
}

fn validate(key: &str, value: &str) -> Result<()> {
    check_key(key)?;
    match key {
        "embedder" => value.parse::<EmbedderKind>().map(drop),
        "chunk_size" | "chunk_overlap" | "top_k" => parse_count(key, value).map(drop),
        "tokenizer" => match value {
            "words" | "chars" => Ok(()),
            v if v.strip_prefix("hf:").is_some_and(|m| !m.is_empty()) => Ok(()),
            _ => Err(Error::Config(format!(
                "unknown tokenizer '{value}' (expected words, chars or hf:<model>)"
            ))),
        },
        _ if value.trim().is_empty() => {
            Err(Error::Config(format!("{key} must not be empty")))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    #[default]
    Hashing,
    Colbert,
    OpenAi,
}

impl FromStr for EmbedderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashing" => Ok(Self::Hashing),
            "colbert" => Ok(Self::Colbert),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!(
                "unknown embedder '{other}' (expected hashing, colbert or openai)"
            ))),
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hashing => "hashing",
            Self::Colbert => "colbert",
            Self::OpenAi => "openai",
        })
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub embedder: EmbedderKind,
    /// Embedding model; `None` means the embedder's default.
    pub model: Option<String>,
    pub tokenizer: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub openai_base_url: Option<String>,
    pub chat_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedder: EmbedderKind::default(),
            model: None,
            tokenizer: "chars".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
            openai_base_url: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
        }
    }
}

impl Settings {
    /// Resolve settings from the database, then apply `KNOWBASE_EMBEDDER`
    /// and `KNOWBASE_MODEL` from the environment.
    pub fn load(db: &SettingsDb) -> Result<Self> {
        let stored = db.list()?;
        Self::resolve(
            |key| {
                stored
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            },
            |var| std::env::var(var).ok().filter(|v| !v.is_empty()),
        )
    }

    fn resolve(
        stored: impl Fn(&str) -> Option<String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();
        let count = |key: &str, default: usize| -> Result<usize> {
            stored(key).map_or(Ok(default), |v| parse_count(key, &v))
        };

        let embedder = match env(EMBEDDER_ENV_VAR).or_else(|| stored("embedder")) {
            Some(v) => v.parse()?,
            None => defaults.embedder,
        };

        Ok(Self {
            embedder,
            model: env(MODEL_ENV_VAR).or_else(|| stored("model")),
            tokenizer: stored("tokenizer").unwrap_or(defaults.tokenizer),
            chunk_size: count("chunk_size", defaults.chunk_size)?,
            chunk_overlap: count("chunk_overlap", defaults.chunk_overlap)?,
            top_k: count("top_k", defaults.top_k)?,
            openai_base_url: stored("openai_base_url"),
            chat_model: stored("chat_model").unwrap_or(defaults.chat_model),
        })
    }

    pub fn chunking_config(&self) -> ChunkingConfig {
        ChunkingConfig::new(self.chunk_size, self.chunk_overlap)
    }

    pub fn build_tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::from(tokenizer::from_setting(&self.tokenizer)?))
    }

    pub fn build_chunker(&self) -> Result<Chunker> {
        Chunker::new(self.chunking_config(), self.build_tokenizer()?)
    }

    fn openai_client(&self) -> OpenAiClient {
        OpenAiClient::from_env(self.openai_base_url.as_deref())
    }

    pub fn build_embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        Ok(match self.embedder {
            EmbedderKind::Hashing => match &self.model {
                Some(dim) => Arc::new(HashingEmbedder::new(parse_count("model", dim)?)),
                None => Arc::new(HashingEmbedder::default()),
            },
            EmbedderKind::Colbert => Arc::new(ColbertEmbedder::new(
                self.model.clone().unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            )),
            EmbedderKind::OpenAi => Arc::new(OpenAiEmbedder::new(
                self.openai_client(),
                self.model.as_deref().unwrap_or(DEFAULT_EMBEDDING_MODEL),
            )),
        })
    }

    pub fn build_generator(&self) -> OpenAiChat {
        OpenAiChat::new(self.openai_client(), self.chat_model.clone())
    }

    /// Open the knowledge base in `data_dir` with these settings.
    pub fn open_knowledge_base(&self, data_dir: &DataDir) -> Result<KnowledgeBase> {
        KnowledgeBase::open(
            data_dir.knowledge_db(),
            self.build_chunker()?,
            self.build_embedder()?,
        )
    }
}

use crate::error::CoreError;
use crate::executor::DatabaseConfig;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

pub mod storage;

// --- Data Structures for models.json ---

/// Holds the specific details for an individual AI model.
#[derive(Deserialize, Debug, Clone)]
pub struct ModelDetails {
    pub model_tag: String,
    pub input_price: f32,
    #[serde(default)]
    pub output_price: f32,
    #[serde(default)]
    pub token_window: u32,
    #[serde(default)]
    pub dimensions: usize,
}

/// Holds the configuration for a specific provider, including API keys and models.
#[derive(Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub models: HashMap<String, ModelDetails>,
    #[serde(default)]
    pub embedders: HashMap<String, ModelDetails>,
}

// --- Helper Function ---

/// Gets a variable from the environment, loading from a .env file first.
/// The `key_ref` is expected to be in the format "env:VAR_NAME".
pub fn get_env_var(key_ref: &str) -> Result<String, CoreError> {
    dotenvy::dotenv().ok();
    if let Some(var_name) = key_ref.strip_prefix("env:") {
        env::var(var_name).map_err(|_| {
            CoreError::Config(format!(
                "Environment variable '{}' not found. Please set it in your .env file.",
                var_name
            ))
        })
    } else {
        // If it doesn't start with "env:", assume it's a literal value.
        Ok(key_ref.to_string())
    }
}

fn optional_env(name: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, CoreError> {
    match optional_env(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            CoreError::Config(format!("Environment variable '{}' has an invalid value: {}", name, raw))
        }),
        None => Ok(default),
    }
}

// --- ModelLibrary for loading and accessing model data ---

pub struct ModelLibrary {
    pub providers: HashMap<String, ProviderConfig>,
}

impl ModelLibrary {
    pub fn from_json(json_str: &str) -> Result<Self, CoreError> {
        let providers: HashMap<String, ProviderConfig> = serde_json::from_str(json_str)
            .map_err(|e| CoreError::Config(format!("Failed to parse models.json: {}", e)))?;
        Ok(ModelLibrary { providers })
    }

    fn bundled() -> Result<Self, CoreError> {
        // The `models.json` is included at compile time, making the library self-contained.
        Self::from_json(include_str!("config/models.json"))
    }

    /// Finds a chat model by name, returning its provider's name alongside.
    pub fn find_model(&self, model_name: &str) -> Option<(&str, &ProviderConfig, &ModelDetails)> {
        self.providers.iter().find_map(|(provider_name, provider_data)| {
            provider_data
                .models
                .get(model_name)
                .map(|details| (provider_name.as_str(), provider_data, details))
        })
    }

    pub fn find_embedder(
        &self,
        embedder_name: &str,
    ) -> Option<(&str, &ProviderConfig, &ModelDetails)> {
        self.providers.iter().find_map(|(provider_name, provider_data)| {
            provider_data
                .embedders
                .get(embedder_name)
                .map(|details| (provider_name.as_str(), provider_data, details))
        })
    }
}

/// The compiled-in model catalogue, parsed on first access.
pub static MODEL_LIBRARY: Lazy<ModelLibrary> =
    Lazy::new(|| ModelLibrary::bundled().expect("Failed to load model library from models.json"));

pub static DEFAULT_APP_DIR: Lazy<PathBuf> = Lazy::new(|| {
    home::home_dir()
        .map(|mut path| {
            path.push(".finqa");
            path
        })
        .unwrap_or_else(|| PathBuf::from(".finqa"))
});

// --- Runtime settings ---

/// Everything the pipeline needs to be assembled, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding `<prefix>_ddl.sql` files.
    pub ddl_dir: PathBuf,
    pub database: DatabaseConfig,
    /// When set, company names are mapped through this SQLite table instead of the built-in one.
    pub company_map_db: Option<PathBuf>,
    pub classifier_path: PathBuf,
    pub index_dir: PathBuf,
    pub chunk_db_path: PathBuf,
    pub embedding_model: String,
    pub sql_model: String,
    pub answer_model: String,
    /// Keys for the SQL model's provider.
    pub api_keys: Vec<String>,
    /// Keys for the answer model's provider.
    pub answer_api_keys: Vec<String>,
    pub max_repair_attempts: u32,
    pub top_k: usize,
    pub usage_dir: Option<PathBuf>,
}

impl Settings {
    /// Builds settings from `FINQA_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self, CoreError> {
        let app_dir = DEFAULT_APP_DIR.clone();
        let path_or = |name: &str, default: PathBuf| {
            optional_env(name).map(PathBuf::from).unwrap_or(default)
        };

        let sql_model =
            optional_env("FINQA_SQL_MODEL").unwrap_or_else(|| "llama-3.1-8b-instant".to_string());

        let answer_model =
            optional_env("FINQA_ANSWER_MODEL").unwrap_or_else(|| "mixtral-8x7b-32768".to_string());

        let (sql_provider, sql_config) = provider_for(&sql_model)?;
        let api_keys = match optional_env("FINQA_API_KEYS") {
            Some(raw) => split_keys(&raw),
            None => vec![get_env_var(&sql_config.api_key)?],
        };
        let (answer_provider, answer_config) = provider_for(&answer_model)?;
        let answer_api_keys = answer_key_list(
            optional_env("FINQA_ANSWER_API_KEYS"),
            sql_provider == answer_provider,
            &api_keys,
            answer_config,
        )?;

        let schema_alias = match optional_env("FINQA_SCHEMA_ALIAS") {
            Some(alias) if alias.eq_ignore_ascii_case("none") => None,
            Some(alias) => Some(alias),
            None => Some("ADMIN".to_string()),
        };

        Ok(Settings {
            ddl_dir: path_or("FINQA_DDL_DIR", app_dir.join("ddl")),
            database: DatabaseConfig {
                path: path_or("FINQA_DATABASE_PATH", app_dir.join("financials.db")),
                schema_alias,
            },
            company_map_db: optional_env("FINQA_COMPANY_MAP_DB").map(PathBuf::from),
            classifier_path: path_or("FINQA_CLASSIFIER_PATH", app_dir.join("classifier.json")),
            index_dir: path_or("FINQA_INDEX_DIR", app_dir.join("index")),
            chunk_db_path: path_or("FINQA_CHUNK_DB", app_dir.join("chunks.db")),
            embedding_model: optional_env("FINQA_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            sql_model,
            answer_model,
            api_keys,
            answer_api_keys,
            max_repair_attempts: parse_env("FINQA_MAX_REPAIR_ATTEMPTS", 4)?,
            top_k: parse_env("FINQA_TOP_K", 4)?,
            usage_dir: optional_env("FINQA_USAGE_DIR").map(PathBuf::from),
        })
    }
}

fn provider_for(model_name: &str) -> Result<(&'static str, &'static ProviderConfig), CoreError> {
    let (provider_name, provider, _) = MODEL_LIBRARY.find_model(model_name).ok_or_else(|| {
        CoreError::Config(format!("Model '{}' not found in `models.json`", model_name))
    })?;
    Ok((provider_name, provider))
}

/// Keys for the answer model: an explicit list wins, then the SQL keys when both
/// models share a provider, then the answer provider's own key reference.
fn answer_key_list(
    explicit: Option<String>,
    same_provider: bool,
    sql_keys: &[String],
    answer_provider: &ProviderConfig,
) -> Result<Vec<String>, CoreError> {
    match explicit {
        Some(raw) => Ok(split_keys(&raw)),
        None if same_provider => Ok(sql_keys.to_vec()),
        None => Ok(vec![get_env_var(&answer_provider.api_key)?]),
    }
}

/// Splits a comma separated key list, dropping blanks.
pub fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_catalogue_parses_and_resolves() {
        let (provider, _, details) = MODEL_LIBRARY.find_model("llama-3.1-8b-instant").unwrap();
        assert_eq!(provider, "Groq");
        assert_eq!(details.model_tag, "llama-3.1-8b-instant");

        let (provider, _, embedder) = MODEL_LIBRARY.find_embedder("text-embedding-3-small").unwrap();
        assert_eq!(provider, "OpenAI");
        assert_eq!(embedder.dimensions, 1536);

        assert!(MODEL_LIBRARY.find_model("no-such-model").is_none());
    }

    #[test]
    fn literal_key_refs_pass_through() {
        assert_eq!(get_env_var("gsk_literal").unwrap(), "gsk_literal");
        assert!(matches!(
            get_env_var("env:FINQA_TEST_SURELY_UNSET_VARIABLE"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn answer_keys_follow_the_answer_provider() {
        let (_, openai) = provider_for("GPT 4o MINI").unwrap();
        let mut literal = openai.clone();
        literal.api_key = "sk-openai".to_string();
        let sql_keys = vec!["gsk-1".to_string(), "gsk-2".to_string()];

        assert_eq!(answer_key_list(None, true, &sql_keys, &literal).unwrap(), sql_keys);
        assert_eq!(
            answer_key_list(None, false, &sql_keys, &literal).unwrap(),
            vec!["sk-openai".to_string()]
        );
        assert_eq!(
            answer_key_list(Some("sk-a, sk-b".to_string()), false, &sql_keys, &literal).unwrap(),
            vec!["sk-a".to_string(), "sk-b".to_string()]
        );

        let (groq, _) = provider_for("llama-3.1-8b-instant").unwrap();
        let (answer, _) = provider_for("GPT 4o MINI").unwrap();
        assert_ne!(groq, answer);
    }

    #[test]
    fn key_lists_drop_blanks() {
        assert_eq!(split_keys(" a, ,b,"), vec!["a".to_string(), "b".to_string()]);
    }
}

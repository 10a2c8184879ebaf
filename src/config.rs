//! Configuração do partchain carregada a partir de `partchain.toml`.
//!
//! A struct [`PartchainConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `PARTCHAIN_STORE_DIR` tem precedência sobre o arquivo.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::FailurePolicy;
use crate::error::PartchainError;
use crate::orchestrator::RetentionPolicy;
use crate::poller::BoundedPoller;

pub const DEFAULT_CONFIG_FILE: &str = "partchain.toml";
pub const STORE_DIR_ENV: &str = "PARTCHAIN_STORE_DIR";

/// Configuração de nível superior carregada de `partchain.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartchainConfig {
    /// Intervalo entre sondagens de negociação e de timeout, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tempo máximo de espera por uma negociação ou transferência.
    #[serde(default = "default_request_ttl_secs")]
    pub request_ttl_secs: u64,

    /// Retenção de jobs COMPLETED antes da limpeza.
    #[serde(default = "default_ttl_secs")]
    pub ttl_completed_jobs_secs: u64,

    /// Retenção de jobs ERROR antes da limpeza.
    #[serde(default = "default_ttl_secs")]
    pub ttl_failed_jobs_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Timeout de uma batch order quando o pedido não informa um.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Timeout de cada job quando o pedido não informa um.
    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,

    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Política de falha aplicada a novas batch orders.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Base das URLs de batch geradas pelo planner.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Diretório dos snapshots de batches e orders.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

// Valor padrão do intervalo de sondagem: 1000ms.
fn default_poll_interval_ms() -> u64 {
    1000
}

// Valor padrão do TTL de negociação: 10 minutos.
fn default_request_ttl_secs() -> u64 {
    600
}

// Valor padrão das retenções: 1 hora.
fn default_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

// Valor padrão do timeout de order: 12 horas.
fn default_timeout_secs() -> u64 {
    43200
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_batch_size() -> usize {
    10
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".partchain")
}

impl Default for PartchainConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_ttl_secs: default_request_ttl_secs(),
            ttl_completed_jobs_secs: default_ttl_secs(),
            ttl_failed_jobs_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            default_timeout_secs: default_timeout_secs(),
            default_job_timeout_secs: default_job_timeout_secs(),
            default_batch_size: default_batch_size(),
            failure_policy: FailurePolicy::default(),
            public_base_url: default_public_base_url(),
            store_dir: default_store_dir(),
        }
    }
}

impl PartchainConfig {
    /// Carrega a configuração de `path`, ou de `partchain.toml` no diretório
    /// atual. Usa valores padrão se o arquivo padrão não existir; um caminho
    /// explícito inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self, PartchainError> {
        let config = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_toml(&std::fs::read_to_string(path)?)?
                } else {
                    Self::default()
                }
            }
        };

        let config = config.with_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, PartchainError> {
        Ok(toml::from_str(contents)?)
    }

    /// Aplica as variáveis de ambiente, que têm precedência sobre o arquivo.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(STORE_DIR_ENV).filter(|dir| !dir.is_empty()) {
            self.store_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn validate(&self) -> Result<(), PartchainError> {
        if self.poll_interval_ms == 0 {
            return Err(PartchainError::Config("poll_interval_ms must be positive".into()));
        }
        if self.default_batch_size == 0 {
            return Err(PartchainError::Config("default_batch_size must be positive".into()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(PartchainError::Config("cleanup_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn poller(&self) -> BoundedPoller {
        BoundedPoller::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.request_ttl_secs),
        )
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            ttl_completed_jobs: Duration::from_secs(self.ttl_completed_jobs_secs),
            ttl_failed_jobs: Duration::from_secs(self.ttl_failed_jobs_secs),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

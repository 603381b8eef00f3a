use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use offer_api::{durable_name, ConsumerSpec, StreamLimits, StreamSpec};
use storage_file::FileStorageConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "offer-cacher", about = "Кэш offer'ов: NATS JetStream → файлы → HTTP")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить consumer и HTTP API
    Serve(ServeArgs),
    /// Опубликовать один offer в JetStream
    Publish(PublishArgs),
}

#[derive(Args, Clone, Debug, Default)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу. Без него все настройки по умолчанию.
    #[arg(long, env = "OFFER_CACHER_CONFIG")]
    pub config: Option<String>,

    /// HTTP порт
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Storage root для file storage
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Адрес NATS сервера
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// Имя durable consumer'а (по умолчанию hostname инстанса)
    #[arg(long, env = "HOSTNAME")]
    pub durable: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct PublishArgs {
    /// Адрес NATS сервера
    #[arg(long, env = "NATS_URL", default_value = "localhost:4222")]
    pub nats_url: String,

    /// Subject сообщения
    #[arg(long, default_value = "publish-offers.cli")]
    pub subject: String,

    /// Не проверять payload перед отправкой
    #[arg(long)]
    pub raw: bool,

    /// JSON документ offer'а. Без аргумента читается stdin.
    pub payload: Option<String>,
}

// ---- TOML Config ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    File,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_name")]
    pub name: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_max_messages")]
    pub max_messages: i64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: i64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: default_stream_name(),
            subject: default_subject(),
            max_messages: default_max_messages(),
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Окно ожидания ack до повторной доставки.
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_wait_ms: default_ack_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    #[serde(default = "default_durable")]
    pub durable: String,
    #[serde(default = "default_storage")]
    pub storage: StorageKind,
    /// `[file]`: настройки file storage.
    #[serde(default)]
    pub file: FileStorageConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            nats_url: default_nats_url(),
            durable: default_durable(),
            storage: default_storage(),
            file: FileStorageConfig::default(),
            stream: StreamConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    3001
}
fn default_nats_url() -> String {
    "localhost:4222".into()
}
fn default_durable() -> String {
    "offer-cacher".into()
}
fn default_storage() -> StorageKind {
    StorageKind::File
}
fn default_stream_name() -> String {
    "OFFERS".into()
}
fn default_subject() -> String {
    "publish-offers.*".into()
}
fn default_max_messages() -> i64 {
    100_000
}
fn default_max_bytes() -> i64 {
    256 * 1024 * 1024
}
fn default_ack_wait_ms() -> u64 {
    10_000
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        Self::parse(&content)
            .map_err(|detail| ServerError::Config { context: "parse", detail: format!("'{path}': {detail}") })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Файл (если задан) → CLI/env overrides → нормализация → проверка.
    pub fn resolve(args: &ServeArgs) -> Result<Self, ServerError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(args);
        config.durable = durable_name(&config.durable);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, args: &ServeArgs) {
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(dir) = &args.data_dir {
            self.file.data_dir = dir.clone();
        }
        if let Some(url) = non_blank(&args.nats_url) {
            self.nats_url = url.to_string();
        }
        if let Some(durable) = non_blank(&args.durable) {
            self.durable = durable.to_string();
        }
    }

    fn validate(&self) -> Result<(), ServerError> {
        let invalid = |detail: &str| ServerError::Config { context: "validate", detail: detail.to_string() };
        if self.durable.is_empty() {
            return Err(invalid("durable consumer name is empty"));
        }
        if self.stream.name.trim().is_empty() {
            return Err(invalid("stream.name is empty"));
        }
        if self.stream.subject.trim().is_empty() {
            return Err(invalid("stream.subject is empty"));
        }
        if self.consumer.ack_wait_ms == 0 {
            return Err(invalid("consumer.ack_wait_ms must be positive"));
        }
        Ok(())
    }

    pub fn stream_spec(&self) -> StreamSpec {
        StreamSpec {
            name: self.stream.name.clone(),
            subject: self.stream.subject.clone(),
            limits: StreamLimits {
                max_messages: self.stream.max_messages,
                max_bytes: self.stream.max_bytes,
            },
        }
    }

    pub fn consumer_spec(&self) -> ConsumerSpec {
        ConsumerSpec {
            stream: self.stream.name.clone(),
            durable: self.durable.clone(),
            filter_subject: self.stream.subject.clone(),
            ack_wait: Duration::from_millis(self.consumer.ack_wait_ms),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

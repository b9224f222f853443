mod types;

pub use types::*;

use crate::backup::key::KeyTemplate;
use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MYSQL2S3_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .map(|h| h.join(".mysql2s3"))
        .unwrap_or_else(|| PathBuf::from(".mysql2s3"))
        .join("config.toml")
}

/// File settings first, then the process environment on top.
pub fn load() -> Result<AppConfig> {
    let mut config = load_from(&config_path())?;
    apply_env(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BackupError::Config(format!("{} has an invalid value: '{}'", name, value)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(BackupError::Config(format!("{} has an invalid value: '{}'", name, value))),
    }
}

pub fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("CONCURRENCY") {
        config.concurrency = parse("CONCURRENCY", &v)?;
    }
    if let Some(v) = lookup("MYSQL_HOST") {
        config.mysql.host = v;
    }
    if let Some(v) = lookup("MYSQL_PORT") {
        config.mysql.port = Some(parse("MYSQL_PORT", &v)?);
    }
    if let Some(v) = lookup("MYSQL_USER") {
        config.mysql.user = v;
    }
    if let Some(v) = lookup("MYSQL_PWD") {
        config.mysql.password = Some(v);
    }
    if let Some(v) = lookup("MYSQLDUMP_PATH") {
        config.mysql.dump_binary = v;
    }
    if let Some(v) = lookup("EXCLUDE_MYSQL_SCHEMA") {
        config.mysql.exclude_mysql_schema = parse_bool("EXCLUDE_MYSQL_SCHEMA", &v)?;
    }
    if let Some(v) = lookup("EXCLUDE_DATABASES") {
        config.mysql.exclude = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(v) = lookup("AWS_REGION") {
        config.s3.region = Some(v);
    }
    if let Some(v) = lookup("AWS_S3_ENDPOINT") {
        config.s3.endpoint = Some(v);
    }
    if let Some(v) = lookup("AWS_S3_BUCKET") {
        config.s3.bucket = v;
    }
    if let Some(v) = lookup("AWS_S3_PARTSIZE") {
        config.s3.part_size = parse("AWS_S3_PARTSIZE", &v)?;
    }
    if let Some(v) = lookup("AWS_S3_QUEUESIZE") {
        config.s3.queue_size = parse("AWS_S3_QUEUESIZE", &v)?;
    }
    if let Some(v) = lookup("KEYNAME_TEMPLATE") {
        config.s3.key_template = v;
    }
    if let Some(v) = lookup("KEY_PREFIX") {
        config.s3.prefix = v;
    }
    if let Some(v) = lookup("COMPRESSION_TYPE") {
        config.compression.kind = v;
    }
    if let Some(v) = lookup("COMPRESSION_LEVEL") {
        config.compression.level = parse("COMPRESSION_LEVEL", &v)?;
    }
    if let Some(v) = lookup("COMPRESSION_THREADS") {
        config.compression.threads = parse("COMPRESSION_THREADS", &v)?;
    }
    if let Some(v) = lookup("DUMP_BUFFER_CHUNKS") {
        config.dump_buffer_chunks = parse("DUMP_BUFFER_CHUNKS", &v)?;
    }
    if let Some(v) = lookup("JOB_TIMEOUT_SECS") {
        config.job_timeout_secs = if v.trim().is_empty() {
            None
        } else {
            Some(parse("JOB_TIMEOUT_SECS", &v)?)
        };
    }
    Ok(())
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(BackupError::Config(msg.to_string()));

        if self.s3.bucket.trim().is_empty() {
            return fail("AWS_S3_BUCKET must be set");
        }
        if self.mysql.host.trim().is_empty() || self.mysql.user.trim().is_empty() {
            return fail("MYSQL_HOST and MYSQL_USER must not be empty");
        }
        if self.concurrency == 0 {
            return fail("CONCURRENCY must be at least 1");
        }
        if self.compression.level > 9 {
            return fail("COMPRESSION_LEVEL must be between 0 and 9");
        }
        if self.s3.part_size < MIN_PART_SIZE {
            return Err(BackupError::Config(format!(
                "AWS_S3_PARTSIZE must be at least {} bytes",
                MIN_PART_SIZE
            )));
        }
        if self.s3.queue_size == 0 {
            return fail("AWS_S3_QUEUESIZE must be at least 1");
        }
        if self.dump_buffer_chunks == 0 {
            return fail("DUMP_BUFFER_CHUNKS must be at least 1");
        }
        KeyTemplate::new(&self.s3.key_template, &self.s3.prefix)?;
        Ok(())
    }
}

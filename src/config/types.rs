use serde::Deserialize;

pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: Option<String>,
    pub dump_binary: String,
    pub exclude_mysql_schema: bool,
    pub exclude: Vec<String>,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            user: "root".to_string(),
            password: None,
            dump_binary: "mysqldump".to_string(),
            exclude_mysql_schema: false,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub key_template: String,
    pub part_size: usize,
    pub queue_size: usize,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            endpoint: None,
            prefix: String::new(),
            key_template: "%Y/%m/%d/$database.$ext".to_string(),
            part_size: 8 * 1024 * 1024,
            queue_size: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: u32,
    pub threads: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            level: 6,
            threads: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub concurrency: usize,
    pub mysql: MysqlConfig,
    pub s3: S3Config,
    pub compression: CompressionConfig,
    pub dump_buffer_chunks: usize,
    pub job_timeout_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            mysql: MysqlConfig::default(),
            s3: S3Config::default(),
            compression: CompressionConfig::default(),
            dump_buffer_chunks: 16,
            job_timeout_secs: None,
        }
    }
}

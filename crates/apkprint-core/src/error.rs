//! 错误类型
//!
//! 只有规则集加载失败是致命的；其余错误都在工件边界以内恢复，
//! 并以注记形式出现在报告里。
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 规则集加载失败（致命）
#[derive(Debug, Error)]
pub enum RulesetLoadError {
    #[error("ruleset file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("cannot read ruleset {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not a compiled ruleset (bad magic)")]
    BadMagic,
    #[error("incompatible ruleset format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("ruleset blob truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("ruleset checksum mismatch")]
    ChecksumMismatch,
    #[error("malformed ruleset payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid rule `{id}`: {reason}")]
    InvalidRule { id: String, reason: String },
}

/// 规则源编译失败
#[derive(Debug, Error)]
pub enum RuleCompileError {
    #[error("cannot read rule source {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid rule source {origin}: {source}")]
    Toml {
        origin: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("duplicate rule id `{0}`")]
    DuplicateRule(String),
    #[error("invalid rule `{id}`: {reason}")]
    InvalidRule { id: String, reason: String },
    #[error("cannot encode ruleset: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 配置文件错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// 容器结构损坏（只截断该分支）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("corrupt container structure at {path}: {reason}")]
pub struct ContainerParseError {
    pub path: String,
    pub reason: String,
}

/// 单个条目读取失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot read entry {path}: {reason}")]
pub struct EntryReadError {
    pub path: String,
    pub reason: String,
}

/// 工件无法打开（批处理中只影响该工件）
#[derive(Debug, Error)]
pub enum ArtifactScanError {
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("scan cancelled before {0} was started")]
    Cancelled(String),
}

//! 规则目录：加载二进制规则集，按规则 id 提供元数据
//!
//! 目录在进程启动时加载一次，之后只读共享（`Arc<Catalog>`），无需加锁。
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

use crate::error::RulesetLoadError;
use crate::rules::{RuleSpec, RulesetPayload};
use crate::types::Category;

/// 二进制规则集魔数
pub const MAGIC: &[u8; 8] = b"APKPRULE";
/// 当前支持的规则集格式版本
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 4 + 32;

/// 规则在目录内的稳定下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(pub(crate) usize);

/// 对外暴露的规则元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMetadata {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub priority: i32,
}

/// 已加载的规则目录
#[derive(Debug)]
pub struct Catalog {
    version: String,
    digest: String,
    metadata: Vec<RuleMetadata>,
    by_name: HashMap<String, RuleId>,
    specs: Vec<RuleSpec>,
}

impl Catalog {
    /// 从文件加载；区分“文件不存在”与其他 I/O 错误
    pub fn load_path(path: &Path) -> Result<Self, RulesetLoadError> {
        let blob = std::fs::read(path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => RulesetLoadError::NotFound { path: path.to_path_buf() },
            _ => RulesetLoadError::Io { path: path.to_path_buf(), source },
        })?;
        let catalog = Self::load(&blob)?;
        debug!(path = %path.display(), rules = catalog.len(), version = %catalog.version, "ruleset file read");
        Ok(catalog)
    }

    /// 从内存中的二进制规则集加载
    pub fn load(blob: &[u8]) -> Result<Self, RulesetLoadError> {
        if blob.len() < MAGIC.len() || &blob[..MAGIC.len()] != MAGIC {
            return Err(RulesetLoadError::BadMagic);
        }
        if blob.len() < HEADER_LEN {
            return Err(RulesetLoadError::Truncated { needed: HEADER_LEN, actual: blob.len() });
        }
        let found = read_u32(&blob[8..12]);
        if found != FORMAT_VERSION {
            return Err(RulesetLoadError::UnsupportedVersion { found, expected: FORMAT_VERSION });
        }
        let len = read_u32(&blob[12..16]) as usize;
        let needed = HEADER_LEN.saturating_add(len);
        if blob.len() < needed {
            return Err(RulesetLoadError::Truncated { needed, actual: blob.len() });
        }
        let body = &blob[HEADER_LEN..needed];
        if Sha256::digest(body).as_slice() != &blob[16..HEADER_LEN] {
            return Err(RulesetLoadError::ChecksumMismatch);
        }

        let payload: RulesetPayload = serde_json::from_slice(body)?;
        Self::from_payload(payload, hex::encode(Sha256::digest(blob)))
    }

    fn from_payload(payload: RulesetPayload, digest: String) -> Result<Self, RulesetLoadError> {
        let mut metadata = Vec::with_capacity(payload.rules.len());
        let mut by_name = HashMap::with_capacity(payload.rules.len());
        for (idx, spec) in payload.rules.iter().enumerate() {
            spec.validate()
                .map_err(|reason| RulesetLoadError::InvalidRule { id: spec.id.clone(), reason })?;
            if by_name.insert(spec.id.clone(), RuleId(idx)).is_some() {
                return Err(RulesetLoadError::InvalidRule {
                    id: spec.id.clone(),
                    reason: "duplicate rule id".into(),
                });
            }
            metadata.push(RuleMetadata {
                id: spec.id.clone(),
                name: spec.name.clone(),
                category: spec.category,
                priority: spec.priority,
            });
        }
        Ok(Self { version: payload.version, digest, metadata, by_name, specs: payload.rules })
    }

    /// 规则集版本（来自规则源）
    pub fn version(&self) -> &str {
        &self.version
    }

    /// 整个二进制规则集的 SHA-256（十六进制）
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// 查询规则元数据
    ///
    /// # Panics
    /// `id` 必须来自同一目录构建的匹配器；未知 id 属于调用方契约错误。
    pub fn metadata(&self, id: RuleId) -> &RuleMetadata {
        match self.metadata.get(id.0) {
            Some(m) => m,
            None => panic!("rule id {} not present in catalog ({} rules)", id.0, self.metadata.len()),
        }
    }

    /// 按规则字符串 id 查找
    pub fn lookup(&self, id: &str) -> Option<RuleId> {
        self.by_name.get(id).copied()
    }

    /// 按加载顺序遍历全部规则
    pub fn rules(&self) -> impl Iterator<Item = (RuleId, &RuleMetadata)> {
        self.metadata.iter().enumerate().map(|(i, m)| (RuleId(i), m))
    }

    pub(crate) fn specs(&self) -> &[RuleSpec] {
        &self.specs
    }
}

fn read_u32(b: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&b[..4]);
    u32::from_le_bytes(word)
}

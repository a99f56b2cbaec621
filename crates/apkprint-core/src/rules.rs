//! 规则源加载（TOML）与编译为规则集二进制
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::{FORMAT_VERSION, MAGIC};
use crate::error::RuleCompileError;
use crate::types::{Category, FileKind};

/// 单个模式的配置（literal / hex / regex 三选一）
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatternEntry {
    id: String,
    #[serde(default)]
    literal: Option<String>,
    #[serde(default)]
    hex: Option<String>,
    #[serde(default)]
    regex: Option<String>,
    #[serde(default)]
    at: Option<u64>,
}

/// 单条规则的配置
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    category: Category,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    file_types: Vec<FileKind>,
    #[serde(default)]
    min_size: Option<u64>,
    #[serde(default)]
    max_size: Option<u64>,
    #[serde(default)]
    condition: Condition,
    #[serde(default)]
    none_of: Vec<String>,
    #[serde(default)]
    patterns: Vec<PatternEntry>,
}

/// 顶层规则文件结构
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

/// 规则的命中条件（针对 none_of 以外的模式）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    All,
    Any,
    AtLeast(usize),
}

/// 归一化后的模式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PatternKind {
    /// 定长字节串（literal 或不含通配符的 hex）
    Literal(Vec<u8>),
    /// bytes 正则（regex 或含 `??` 的 hex）
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PatternSpec {
    pub(crate) id: String,
    pub(crate) kind: PatternKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) at: Option<u64>,
}

/// 归一化后的规则规格（写入规则集负载）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RuleSpec {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) category: Category,
    pub(crate) priority: i32,
    #[serde(default)]
    pub(crate) file_types: Vec<FileKind>,
    #[serde(default)]
    pub(crate) min_size: Option<u64>,
    #[serde(default)]
    pub(crate) max_size: Option<u64>,
    pub(crate) condition: Condition,
    #[serde(default)]
    pub(crate) none_of: Vec<String>,
    pub(crate) patterns: Vec<PatternSpec>,
}

impl RuleSpec {
    /// 参与条件计数的模式（排除 none_of）
    pub(crate) fn required_patterns(&self) -> impl Iterator<Item = (usize, &PatternSpec)> {
        self.patterns
            .iter()
            .enumerate()
            .filter(move |(_, p)| !self.none_of.iter().any(|n| n == &p.id))
    }

    /// 结构性校验；加载二进制规则集时会再次执行
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("empty rule id".into());
        }
        if self.patterns.is_empty() {
            return Err("rule has no patterns".into());
        }
        let mut ids = HashSet::new();
        for p in &self.patterns {
            if !ids.insert(p.id.as_str()) {
                return Err(format!("duplicate pattern id `{}`", p.id));
            }
            match &p.kind {
                PatternKind::Literal(bytes) if bytes.is_empty() => {
                    return Err(format!("pattern `{}` is empty", p.id));
                }
                PatternKind::Regex(re) => {
                    regex::bytes::Regex::new(re)
                        .map_err(|e| format!("pattern `{}`: {e}", p.id))?;
                }
                _ => {}
            }
        }
        for n in &self.none_of {
            if !ids.contains(n.as_str()) {
                return Err(format!("none_of references unknown pattern `{n}`"));
            }
        }
        let required = self.required_patterns().count();
        if required == 0 {
            return Err("every pattern is listed in none_of".into());
        }
        if let Condition::AtLeast(n) = self.condition {
            if n == 0 || n > required {
                return Err(format!("at_least = {n} outside 1..={required}"));
            }
        }
        if let (Some(lo), Some(hi)) = (self.min_size, self.max_size) {
            if lo > hi {
                return Err(format!("min_size {lo} > max_size {hi}"));
            }
        }
        Ok(())
    }
}

/// 规则集负载（JSON 编码后写入二进制规则集）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RulesetPayload {
    pub(crate) version: String,
    pub(crate) rules: Vec<RuleSpec>,
}

/// 规则源集合：逐个加入 TOML 文件后编译
#[derive(Debug, Default)]
pub struct RulesetSource {
    version: Option<String>,
    rules: Vec<RuleSpec>,
    seen: HashSet<String>,
}

impl RulesetSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已加入的规则数
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 解析一段 TOML 规则文本，返回新增规则数
    pub fn add_toml_str(&mut self, origin: &str, text: &str) -> Result<usize, RuleCompileError> {
        let parsed: RuleFile = toml::from_str(text).map_err(|source| RuleCompileError::Toml {
            origin: origin.to_string(),
            source,
        })?;

        match (&self.version, parsed.version) {
            (None, v @ Some(_)) => self.version = v,
            (Some(cur), Some(v)) if *cur != v => {
                warn!(origin, current = %cur, ignored = %v, "conflicting ruleset version");
            }
            _ => {}
        }

        let mut added = 0;
        for e in parsed.rules {
            let spec = normalize_entry(e)?;
            if !self.seen.insert(spec.id.clone()) {
                return Err(RuleCompileError::DuplicateRule(spec.id));
            }
            self.rules.push(spec);
            added += 1;
        }
        debug!(origin, added, "loaded rule source");
        Ok(added)
    }

    /// 加入单个 TOML 文件，或目录下的全部 `*.toml`（按路径排序）
    pub fn add_path(&mut self, path: &Path) -> Result<usize, RuleCompileError> {
        let mut files: Vec<PathBuf> = Vec::new();
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(|e| RuleCompileError::Io {
                    path: path.to_path_buf(),
                    source: e.into(),
                })?;
                let p = entry.path();
                if entry.file_type().is_file() && p.extension().is_some_and(|x| x == "toml") {
                    files.push(p.to_path_buf());
                }
            }
        } else {
            files.push(path.to_path_buf());
        }

        let mut added = 0;
        for f in files {
            let txt = std::fs::read_to_string(&f).map_err(|source| RuleCompileError::Io {
                path: f.clone(),
                source,
            })?;
            added += self.add_toml_str(&f.display().to_string(), &txt)?;
        }
        Ok(added)
    }

    /// 编译为带版本与校验和的二进制规则集
    ///
    /// 布局：magic(8) | format version u32 LE | payload len u32 LE | sha256(payload) | payload
    pub fn compile(self) -> Result<Vec<u8>, RuleCompileError> {
        let payload = RulesetPayload {
            version: self.version.unwrap_or_else(|| "unversioned".to_string()),
            rules: self.rules,
        };
        let body = serde_json::to_vec(&payload)?;
        let len = u32::try_from(body.len()).map_err(|_| RuleCompileError::InvalidRule {
            id: "*".into(),
            reason: "ruleset payload exceeds 4 GiB".into(),
        })?;
        let digest = Sha256::digest(&body);

        let mut blob = Vec::with_capacity(MAGIC.len() + 8 + digest.len() + body.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        blob.extend_from_slice(&len.to_le_bytes());
        blob.extend_from_slice(&digest);
        blob.extend_from_slice(&body);
        Ok(blob)
    }
}

/// 编译一组规则源路径（文件或目录）
pub fn compile_sources(paths: &[PathBuf]) -> Result<Vec<u8>, RuleCompileError> {
    let mut src = RulesetSource::new();
    for p in paths {
        src.add_path(p)?;
    }
    src.compile()
}

fn normalize_entry(e: RuleEntry) -> Result<RuleSpec, RuleCompileError> {
    let invalid = |reason: String| RuleCompileError::InvalidRule { id: e.id.clone(), reason };

    let mut patterns = Vec::with_capacity(e.patterns.len());
    for p in &e.patterns {
        let kind = match (&p.literal, &p.hex, &p.regex) {
            (Some(lit), None, None) => PatternKind::Literal(lit.as_bytes().to_vec()),
            (None, Some(hex), None) => parse_hex(hex).map_err(|r| invalid(format!("pattern `{}`: {r}", p.id)))?,
            (None, None, Some(re)) => PatternKind::Regex(re.clone()),
            _ => {
                return Err(invalid(format!(
                    "pattern `{}` needs exactly one of literal, hex or regex",
                    p.id
                )))
            }
        };
        patterns.push(PatternSpec { id: p.id.clone(), kind, at: p.at });
    }

    let spec = RuleSpec {
        name: e.name.clone().unwrap_or_else(|| e.id.clone()),
        id: e.id.clone(),
        category: e.category,
        priority: e.priority,
        file_types: e.file_types.clone(),
        min_size: e.min_size,
        max_size: e.max_size,
        condition: e.condition,
        none_of: e.none_of.clone(),
        patterns,
    };
    spec.validate().map_err(invalid)?;
    Ok(spec)
}

/// 解析 `"64 65 78 0a ?? 30"` 形式的十六进制模式
/// - 无通配符：直接得到字节串
/// - 含 `??`：转为 bytes 正则（`(?s-u)`，`.` 可匹配任意字节）
fn parse_hex(src: &str) -> Result<PatternKind, String> {
    let compact: String = src.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err("empty hex pattern".into());
    }
    if compact.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    if !compact.contains('?') {
        return hex::decode(&compact).map(PatternKind::Literal).map_err(|e| e.to_string());
    }

    let mut re = String::from("(?s-u)");
    for i in (0..compact.len()).step_by(2) {
        let tok = &compact[i..i + 2];
        if tok == "??" {
            re.push('.');
        } else {
            let b = u8::from_str_radix(tok, 16).map_err(|_| format!("bad hex byte `{tok}`"))?;
            re.push_str(&format!("\\x{b:02x}"));
        }
    }
    Ok(PatternKind::Regex(re))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = "2024.10"

[[rules]]
id = "dx"
name = "dx"
category = "compiler"
priority = 10
file_types = ["dex"]

[[rules.patterns]]
id = "magic"
hex = "64 65 78 0a"
at = 0

[[rules.patterns]]
id = "marker"
literal = "dx-marker"

[[rules]]
id = "emulator_checks"
category = "anti_vm"
condition = { at_least = 1 }
none_of = ["sdk"]

[[rules.patterns]]
id = "goldfish"
literal = "goldfish"

[[rules.patterns]]
id = "sdk"
regex = "ro\\.build\\.sdk"
"#;

    #[test]
    fn parses_and_normalizes_rules() {
        let mut src = RulesetSource::new();
        assert_eq!(src.add_toml_str("sample", SAMPLE).unwrap(), 2);
        assert_eq!(src.version.as_deref(), Some("2024.10"));

        let dx = &src.rules[0];
        assert_eq!(dx.category, Category::Compiler);
        assert_eq!(dx.priority, 10);
        assert_eq!(dx.patterns[0].kind, PatternKind::Literal(b"dex\n".to_vec()));
        assert_eq!(dx.patterns[0].at, Some(0));

        let vm = &src.rules[1];
        assert_eq!(vm.name, "emulator_checks");
        assert_eq!(vm.condition, Condition::AtLeast(1));
        assert_eq!(vm.required_patterns().count(), 1);
    }

    #[test]
    fn rejects_duplicate_rule_ids() {
        let mut src = RulesetSource::new();
        src.add_toml_str("a", SAMPLE).unwrap();
        let err = src.add_toml_str("b", SAMPLE).unwrap_err();
        assert!(matches!(err, RuleCompileError::DuplicateRule(id) if id == "dx"));
    }

    #[test]
    fn rejects_ambiguous_pattern() {
        let txt = r#"
[[rules]]
id = "bad"
category = "packer"
[[rules.patterns]]
id = "p"
literal = "a"
hex = "61"
"#;
        let err = RulesetSource::new().add_toml_str("t", txt).unwrap_err();
        assert!(matches!(err, RuleCompileError::InvalidRule { ref id, .. } if id == "bad"));
    }

    #[test]
    fn rejects_invalid_regex_and_dangling_none_of() {
        let bad_regex = r#"
[[rules]]
id = "r"
category = "packer"
[[rules.patterns]]
id = "p"
regex = "(unclosed"
"#;
        assert!(RulesetSource::new().add_toml_str("t", bad_regex).is_err());

        let dangling = r#"
[[rules]]
id = "r"
category = "packer"
none_of = ["missing"]
[[rules.patterns]]
id = "p"
literal = "x"
"#;
        assert!(RulesetSource::new().add_toml_str("t", dangling).is_err());
    }

    #[test]
    fn hex_with_wildcards_becomes_regex() {
        match parse_hex("7f 45 ?? 46").unwrap() {
            PatternKind::Regex(re) => {
                let rx = regex::bytes::Regex::new(&re).unwrap();
                assert!(rx.is_match(b"\x7fE\x00F"));
                assert!(rx.is_match(b"\x7fE\nF"));
                assert!(!rx.is_match(b"\x7fF\x00F"));
            }
            other => panic!("expected regex, got {other:?}"),
        }
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn compiled_blob_has_header() {
        let mut src = RulesetSource::new();
        src.add_toml_str("sample", SAMPLE).unwrap();
        let blob = src.compile().unwrap();
        assert_eq!(&blob[..8], MAGIC);
        assert_eq!(u32::from_le_bytes(blob[8..12].try_into().unwrap()), FORMAT_VERSION);
    }

    #[test]
    fn add_path_reads_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.toml"), "version = \"b\"\n").unwrap();
        std::fs::write(dir.path().join("a.toml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut src = RulesetSource::new();
        assert_eq!(src.add_path(dir.path()).unwrap(), 2);
        assert_eq!(src.version.as_deref(), Some("2024.10"));
    }
}

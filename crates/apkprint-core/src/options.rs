//! 扫描选项与统计信息（模块）
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::classify::PrecedencePolicy;
use crate::error::ConfigError;
use crate::filetype::TypingMode;
use crate::report::{AggregateOptions, Report};
use crate::walker::WalkOptions;

/// 扫描选项；可由 TOML 配置文件加载，未给出的字段取默认值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanOptions {
    /// 最大嵌套深度（工件本身为 0）
    pub max_depth: usize,
    /// 单个条目的大小上限（字节）；超过则跳过并记录
    pub max_entry_size: u64,
    /// 单个工件内访问成员的总数上限
    pub max_entries: usize,
    /// 线程数：None 表示自动（等于 CPU 核数）；Some(1) 走串行
    pub threads: Option<usize>,
    /// 容器成员的筛选方式
    pub typing: TypingMode,
    /// 容器自身也作为条目扫描
    pub include_containers: bool,
    /// 报告中去除重复条目
    pub dedup: bool,
    /// 报告中保留命中证据
    pub evidence: bool,
    /// 类别互斥表与优先级覆盖
    pub precedence: PrecedencePolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        let walk = WalkOptions::default();
        Self {
            max_depth: walk.max_depth,
            max_entry_size: walk.max_entry_size,
            max_entries: walk.max_entries,
            threads: None,
            typing: walk.typing,
            include_containers: walk.include_containers,
            dedup: false,
            evidence: false,
            precedence: PrecedencePolicy::default(),
        }
    }
}

impl ScanOptions {
    pub fn from_toml_str(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Toml { path: path.to_path_buf(), source })
    }

    /// 读取配置文件
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(path, &txt)
    }

    /// 实际使用的线程数（至少为 1）
    pub fn effective_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub(crate) fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            max_depth: self.max_depth,
            max_entry_size: self.max_entry_size,
            max_entries: self.max_entries,
            typing: self.typing,
            include_containers: self.include_containers,
        }
    }

    pub(crate) fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions { dedup: self.dedup, evidence: self.evidence }
    }
}

/// 扫描统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub artifacts_scanned: usize,
    pub artifacts_failed: usize,
    /// 至少一个条目命中规则的工件数
    pub artifacts_with_matches: usize,
    /// 带错误或警告注记的工件数
    pub artifacts_with_problems: usize,
    pub entries_reported: usize,
    pub entries_with_matches: usize,
    pub entries_with_notes: usize,
    pub incomplete: usize,
}

impl ScanStats {
    pub fn record(&mut self, report: &Report) {
        if report.error.is_some() {
            self.artifacts_failed += 1;
        } else {
            self.artifacts_scanned += 1;
        }
        if report.has_matches() {
            self.artifacts_with_matches += 1;
        }
        if report.has_problems() {
            self.artifacts_with_problems += 1;
        }
        if report.incomplete {
            self.incomplete += 1;
        }
        for e in &report.entries {
            self.entries_reported += 1;
            if e.classification.as_ref().is_some_and(|c| !c.is_empty()) {
                self.entries_with_matches += 1;
            }
            if !e.notes.is_empty() {
                self.entries_with_notes += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    #[test]
    fn partial_config_keeps_defaults() {
        let opts = ScanOptions::from_toml_str(
            Path::new("cfg.toml"),
            r#"
max_depth = 1
typing = "filename"
threads = 2

[precedence]
exclusive = ["compiler", "packer"]
"#,
        )
        .unwrap();
        assert_eq!(opts.max_depth, 1);
        assert_eq!(opts.typing, TypingMode::Filename);
        assert_eq!(opts.effective_threads(), 2);
        assert_eq!(opts.max_entry_size, ScanOptions::default().max_entry_size);
        assert!(opts.precedence.is_exclusive(Category::Packer));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ScanOptions::from_toml_str(Path::new("cfg.toml"), "max_dpeth = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn stats_follow_reports() {
        use crate::classify::Classification;
        use crate::report::{EntryReport, Note};
        use crate::types::FileKind;
        use std::collections::{BTreeMap, BTreeSet};

        let partial = Report {
            artifact: "a.apk".into(),
            size: Some(10),
            entries: vec![
                EntryReport {
                    path: "a.apk!classes.dex".into(),
                    kind: Some(FileKind::Dex),
                    depth: Some(1),
                    classification: Some(Classification::default()),
                    notes: Vec::new(),
                    evidence: BTreeMap::new(),
                },
                EntryReport {
                    path: "a.apk!big.dex".into(),
                    kind: Some(FileKind::Dex),
                    depth: Some(1),
                    classification: None,
                    notes: vec![Note::TooLarge { size: 10, limit: 5 }],
                    evidence: BTreeMap::new(),
                },
            ],
            summary: BTreeMap::from([(Category::Packer, BTreeSet::from(["Jiagu".to_string()]))]),
            error: None,
            incomplete: true,
        };
        let mut stats = ScanStats::default();
        stats.record(&partial);
        stats.record(&Report::failed("b.apk", "cannot open b.apk"));

        assert_eq!(stats.artifacts_scanned, 1);
        assert_eq!(stats.artifacts_failed, 1);
        assert_eq!(stats.artifacts_with_matches, 1);
        assert_eq!(stats.artifacts_with_problems, 2);
        assert_eq!(stats.entries_reported, 2);
        assert_eq!(stats.entries_with_matches, 0);
        assert_eq!(stats.entries_with_notes, 1);
        assert_eq!(stats.incomplete, 1);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScanOptions::from_toml_file(&dir.path().join("none.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

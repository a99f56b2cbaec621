//! 报告聚合：按发现顺序合并条目结果，可选去重，并生成工件级汇总
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::classify::{Classification, EntryOutcome};
use crate::engine::Evidence;
use crate::error::ContainerParseError;
use crate::types::{Category, FileKind};

/// 条目注记（警告或错误）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Note {
    /// 超过大小上限被跳过
    TooLarge { size: u64, limit: u64 },
    /// 条目字节读取失败
    ReadError { reason: String },
    /// 容器结构损坏，该分支被截断
    ContainerParse { reason: String },
}

/// 报告中的单个记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub path: String,
    /// 容器错误标记没有类型与深度
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FileKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    /// `None` 表示未分类（被跳过或读取失败），与空分类不同
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence: BTreeMap<String, Vec<Evidence>>,
}

/// 一个工件的最终报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub artifact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub entries: Vec<EntryReport>,
    /// 全部条目的类别并集
    pub summary: BTreeMap<Category, BTreeSet<String>>,
    /// 工件级错误（无法打开等）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 被取消时为 true，entries 只包含已完成的部分
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl Report {
    /// 只有错误信息的报告
    pub fn failed(artifact: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            size: None,
            entries: Vec::new(),
            summary: BTreeMap::new(),
            error: Some(error.into()),
            incomplete: false,
        }
    }

    /// 是否存在任何错误或警告注记
    pub fn has_problems(&self) -> bool {
        self.error.is_some() || self.entries.iter().any(|e| !e.notes.is_empty())
    }

    /// 任意条目是否命中了规则
    pub fn has_matches(&self) -> bool {
        !self.summary.is_empty()
    }
}

/// 分类阶段交给聚合器的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRecord {
    Entry { path: String, kind: FileKind, depth: usize, outcome: EntryOutcome },
    ContainerError(ContainerParseError),
}

/// 聚合选项
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateOptions {
    /// 去除路径与分类都相同的重复条目（默认关闭，保持完整）
    pub dedup: bool,
    /// 在报告中保留命中证据
    pub evidence: bool,
}

/// 把 (发现序号, 记录) 聚合为报告
///
/// 记录可以乱序到达；这里按发现序号重新排序，保证输出可复现。
pub fn aggregate<I>(artifact: &str, records: I, opts: AggregateOptions) -> Report
where
    I: IntoIterator<Item = (usize, ScanRecord)>,
{
    let ordered: BTreeMap<usize, ScanRecord> = records.into_iter().collect();

    let mut entries = Vec::with_capacity(ordered.len());
    let mut summary: BTreeMap<Category, BTreeSet<String>> = BTreeMap::new();
    let mut seen: HashSet<(String, Classification)> = HashSet::new();

    for record in ordered.into_values() {
        let report = match record {
            ScanRecord::ContainerError(e) => EntryReport {
                path: e.path,
                kind: None,
                depth: None,
                classification: None,
                notes: vec![Note::ContainerParse { reason: e.reason }],
                evidence: BTreeMap::new(),
            },
            ScanRecord::Entry { path, kind, depth, outcome } => {
                let (classification, notes, evidence) = match outcome {
                    EntryOutcome::Classified { classification, evidence } => {
                        let evidence = if opts.evidence { evidence } else { BTreeMap::new() };
                        (Some(classification), Vec::new(), evidence)
                    }
                    EntryOutcome::TooLarge { size, limit } => {
                        (None, vec![Note::TooLarge { size, limit }], BTreeMap::new())
                    }
                    EntryOutcome::Unreadable(e) => {
                        (None, vec![Note::ReadError { reason: e.reason }], BTreeMap::new())
                    }
                };
                EntryReport { path, kind: Some(kind), depth: Some(depth), classification, notes, evidence }
            }
        };

        if let Some(c) = &report.classification {
            if opts.dedup && !seen.insert((report.path.clone(), c.clone())) {
                continue;
            }
            for (category, names) in c.iter() {
                summary.entry(category).or_default().extend(names.iter().cloned());
            }
        }
        entries.push(report);
    }

    Report {
        artifact: artifact.to_string(),
        size: None,
        entries,
        summary,
        error: None,
        incomplete: false,
    }
}

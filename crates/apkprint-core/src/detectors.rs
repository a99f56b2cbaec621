//! 检测器集合：把规则目录中的全部模式编译成少量自动机
//!
//! - 无偏移约束的定长字节串 → 一个 Aho-Corasick（重叠查找）
//! - 正则 / 含通配符的 hex → 一个 `RegexSet`，命中后再用单条正则取偏移
//! - 带 `at` 的模式 → 在固定偏移处直接比较
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::bytes::{Regex, RegexSet};

use crate::error::RulesetLoadError;
use crate::rules::{PatternKind, RuleSpec};

/// 模式在目录中的位置：(规则下标, 规则内模式下标)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) rule: usize,
    pub(crate) pattern: usize,
}

/// 固定偏移模式
pub(crate) enum Anchored {
    Literal(Vec<u8>),
    Regex(Regex),
}

pub(crate) struct AnchoredPattern {
    pub(crate) slot: Slot,
    pub(crate) at: usize,
    pub(crate) matcher: Anchored,
}

/// 字节级检测器集合
pub(crate) struct DetectorSet {
    pub(crate) ac: Option<AhoCorasick>,
    /// AC 模式下标 -> 规则模式位置
    pub(crate) ac_slots: Vec<Slot>,
    pub(crate) regex_set: Option<RegexSet>,
    /// 与 regex_set 一一对应
    pub(crate) regexes: Vec<Regex>,
    pub(crate) regex_slots: Vec<Slot>,
    pub(crate) anchored: Vec<AnchoredPattern>,
}

impl DetectorSet {
    /// 从规则规格构建检测器集合
    pub(crate) fn from_specs(specs: &[RuleSpec]) -> Result<Self, RulesetLoadError> {
        let mut literals: Vec<Vec<u8>> = Vec::new();
        let mut ac_slots = Vec::new();
        let mut regex_src: Vec<String> = Vec::new();
        let mut regex_slots = Vec::new();
        let mut anchored = Vec::new();

        for (ri, spec) in specs.iter().enumerate() {
            let invalid = |reason: String| RulesetLoadError::InvalidRule { id: spec.id.clone(), reason };
            for (pi, p) in spec.patterns.iter().enumerate() {
                let slot = Slot { rule: ri, pattern: pi };
                match (&p.kind, p.at) {
                    (PatternKind::Literal(bytes), None) => {
                        literals.push(bytes.clone());
                        ac_slots.push(slot);
                    }
                    (PatternKind::Regex(re), None) => {
                        regex_src.push(re.clone());
                        regex_slots.push(slot);
                    }
                    (kind, Some(at)) => {
                        let at = usize::try_from(at).map_err(|_| invalid(format!("offset {at} too large")))?;
                        let matcher = match kind {
                            PatternKind::Literal(bytes) => Anchored::Literal(bytes.clone()),
                            PatternKind::Regex(re) => {
                                Anchored::Regex(Regex::new(re).map_err(|e| invalid(e.to_string()))?)
                            }
                        };
                        anchored.push(AnchoredPattern { slot, at, matcher });
                    }
                }
            }
        }

        // 重叠查找要求 Standard 语义
        let ac = if literals.is_empty() {
            None
        } else {
            Some(
                AhoCorasickBuilder::new()
                    .match_kind(MatchKind::Standard)
                    .build(&literals)
                    .map_err(|e| RulesetLoadError::InvalidRule { id: "*".into(), reason: e.to_string() })?,
            )
        };

        let mut regexes = Vec::with_capacity(regex_src.len());
        for (src, slot) in regex_src.iter().zip(&regex_slots) {
            let rx = Regex::new(src).map_err(|e| RulesetLoadError::InvalidRule {
                id: specs[slot.rule].id.clone(),
                reason: e.to_string(),
            })?;
            regexes.push(rx);
        }
        let regex_set = if regex_src.is_empty() {
            None
        } else {
            Some(RegexSet::new(&regex_src).map_err(|e| RulesetLoadError::InvalidRule {
                id: "*".into(),
                reason: e.to_string(),
            })?)
        };

        Ok(Self { ac, ac_slots, regex_set, regexes, regex_slots, anchored })
    }

    /// 编译出的模式总数
    pub(crate) fn pattern_count(&self) -> usize {
        self.ac_slots.len() + self.regex_slots.len() + self.anchored.len()
    }
}

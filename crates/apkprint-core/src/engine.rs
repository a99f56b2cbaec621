//! 字节级扫描引擎：在内存缓冲区上运行检测器并评估规则条件
use serde::Serialize;

use crate::catalog::{Catalog, RuleId};
use crate::detectors::{Anchored, DetectorSet, Slot};
use crate::error::RulesetLoadError;
use crate::rules::Condition;
use crate::types::FileKind;

/// 证据预览的最大字节数
const PREVIEW_MAX: usize = 32;

/// 模式匹配能力：对一段字节返回触发的规则
///
/// 第三方签名引擎只需实现此 trait 即可替换默认实现。
pub trait PatternMatcher: Send + Sync {
    fn scan(&self, kind: FileKind, data: &[u8]) -> Vec<RuleMatch>;
}

/// 命中的单个模式（仅用于诊断，不参与分类）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evidence {
    pub pattern: String,
    pub offset: usize,
    pub preview: String,
}

/// 一条规则在某个条目上的命中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule: RuleId,
    pub evidence: Vec<Evidence>,
}

/// 规则的结构性门槛与条件
struct RuleGate {
    file_types: Vec<FileKind>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    condition: Condition,
    required: Vec<usize>,
    forbidden: Vec<usize>,
}

impl RuleGate {
    fn admits(&self, kind: FileKind, len: usize) -> bool {
        let len = len as u64;
        (self.file_types.is_empty() || self.file_types.contains(&kind))
            && self.min_size.map_or(true, |m| len >= m)
            && self.max_size.map_or(true, |m| len <= m)
    }
}

/// 默认签名匹配器（Aho-Corasick + RegexSet）
pub struct SignatureMatcher {
    detectors: DetectorSet,
    gates: Vec<RuleGate>,
    pattern_ids: Vec<Vec<String>>,
    /// 规则 -> 其首个模式在扁平命中表中的下标
    base: Vec<usize>,
    total: usize,
}

impl SignatureMatcher {
    /// 由目录构建；目录中的 RuleId 与本匹配器输出一一对应
    pub fn new(catalog: &Catalog) -> Result<Self, RulesetLoadError> {
        let specs = catalog.specs();
        let detectors = DetectorSet::from_specs(specs)?;

        let mut gates = Vec::with_capacity(specs.len());
        let mut pattern_ids = Vec::with_capacity(specs.len());
        let mut base = Vec::with_capacity(specs.len());
        let mut total = 0;
        for spec in specs {
            base.push(total);
            total += spec.patterns.len();
            let required: Vec<usize> = spec.required_patterns().map(|(i, _)| i).collect();
            let forbidden = (0..spec.patterns.len()).filter(|i| !required.contains(i)).collect();
            gates.push(RuleGate {
                file_types: spec.file_types.clone(),
                min_size: spec.min_size,
                max_size: spec.max_size,
                condition: spec.condition,
                required,
                forbidden,
            });
            pattern_ids.push(spec.patterns.iter().map(|p| p.id.clone()).collect());
        }
        debug_assert_eq!(total, detectors.pattern_count());

        Ok(Self { detectors, gates, pattern_ids, base, total })
    }

    fn slot_index(&self, slot: Slot) -> usize {
        self.base[slot.rule] + slot.pattern
    }

    /// 收集每个模式的最早命中区间
    fn collect_hits(&self, data: &[u8]) -> Vec<Option<(usize, usize)>> {
        let mut hits: Vec<Option<(usize, usize)>> = vec![None; self.total];
        let mut record = |idx: usize, start: usize, end: usize| {
            if hits[idx].map_or(true, |(s, _)| start < s) {
                hits[idx] = Some((start, end));
            }
        };

        if let Some(ac) = &self.detectors.ac {
            for m in ac.find_overlapping_iter(data) {
                let slot = self.detectors.ac_slots[m.pattern().as_usize()];
                record(self.slot_index(slot), m.start(), m.end());
            }
        }

        if let Some(set) = &self.detectors.regex_set {
            for i in set.matches(data).iter() {
                if let Some(m) = self.detectors.regexes[i].find(data) {
                    record(self.slot_index(self.detectors.regex_slots[i]), m.start(), m.end());
                }
            }
        }

        for a in &self.detectors.anchored {
            if a.at > data.len() {
                continue;
            }
            let span = match &a.matcher {
                Anchored::Literal(bytes) => data
                    .get(a.at..a.at.saturating_add(bytes.len()))
                    .filter(|window| *window == bytes.as_slice())
                    .map(|_| (a.at, a.at + bytes.len())),
                // 最左匹配：若存在从 at 开始的匹配，find_at 一定返回它
                Anchored::Regex(rx) => rx
                    .find_at(data, a.at)
                    .filter(|m| m.start() == a.at)
                    .map(|m| (m.start(), m.end())),
            };
            if let Some((s, e)) = span {
                record(self.slot_index(a.slot), s, e);
            }
        }

        hits
    }
}

impl PatternMatcher for SignatureMatcher {
    fn scan(&self, kind: FileKind, data: &[u8]) -> Vec<RuleMatch> {
        let hits = self.collect_hits(data);
        let mut out = Vec::new();

        for (ri, gate) in self.gates.iter().enumerate() {
            if !gate.admits(kind, data.len()) {
                continue;
            }
            let hit = |pi: &usize| hits[self.base[ri] + pi].is_some();
            if gate.forbidden.iter().any(hit) {
                continue;
            }
            let n = gate.required.iter().filter(|pi| hit(*pi)).count();
            let fired = match gate.condition {
                Condition::All => n == gate.required.len(),
                Condition::Any => n > 0,
                Condition::AtLeast(k) => n >= k,
            };
            if !fired {
                continue;
            }

            let evidence = gate
                .required
                .iter()
                .filter_map(|&pi| {
                    hits[self.base[ri] + pi].map(|(s, e)| Evidence {
                        pattern: self.pattern_ids[ri][pi].clone(),
                        offset: s,
                        preview: data[s..e.min(s + PREVIEW_MAX)].escape_ascii().to_string(),
                    })
                })
                .collect();
            out.push(RuleMatch { rule: RuleId(ri), evidence });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RulesetSource;

    const RULES: &str = r#"
[[rules]]
id = "dex_magic"
category = "anomaly"
file_types = ["dex"]
[[rules.patterns]]
id = "m"
hex = "64 65 78 0a"
at = 0

[[rules]]
id = "jiagu"
category = "packer"
condition = "any"
[[rules.patterns]]
id = "a"
literal = "libjiagu.so"
[[rules.patterns]]
id = "b"
literal = "libjiagu_art.so"

[[rules]]
id = "qemu"
category = "anti_vm"
condition = { at_least = 2 }
none_of = ["whitelisted"]
[[rules.patterns]]
id = "prop"
regex = "ro\\.kernel\\.qemu"
[[rules.patterns]]
id = "goldfish"
literal = "goldfish"
[[rules.patterns]]
id = "pipe"
hex = "71 65 6d 75 ?? 70 69 70 65"
[[rules.patterns]]
id = "whitelisted"
literal = "TEST-HARNESS"

[[rules]]
id = "tiny"
category = "anomaly"
max_size = 8
[[rules.patterns]]
id = "x"
literal = "x"
"#;

    fn matcher() -> (Catalog, SignatureMatcher) {
        let mut src = RulesetSource::new();
        src.add_toml_str("t", RULES).unwrap();
        let cat = Catalog::load(&src.compile().unwrap()).unwrap();
        let m = SignatureMatcher::new(&cat).unwrap();
        (cat, m)
    }

    fn fired(cat: &Catalog, m: &SignatureMatcher, kind: FileKind, data: &[u8]) -> Vec<String> {
        m.scan(kind, data).into_iter().map(|r| cat.metadata(r.rule).id.clone()).collect()
    }

    #[test]
    fn anchored_hex_respects_offset_and_file_type() {
        let (cat, m) = matcher();
        assert_eq!(fired(&cat, &m, FileKind::Dex, b"dex\n035\0........."), vec!["dex_magic"]);
        assert!(fired(&cat, &m, FileKind::Dex, b"..dex\n035\0......").is_empty());
        assert!(fired(&cat, &m, FileKind::Elf, b"dex\n035\0.........").is_empty());
    }

    #[test]
    fn any_condition_and_evidence_offsets() {
        let (cat, m) = matcher();
        let data = b"libjiagu.so|libjiagu_art.so";
        let res = m.scan(FileKind::Unknown, data);
        assert_eq!(res.len(), 1);
        assert_eq!(cat.metadata(res[0].rule).id, "jiagu");
        // 两个字面量都命中
        let ids: Vec<_> = res[0].evidence.iter().map(|e| e.pattern.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(res[0].evidence[0].offset, 0);
        assert_eq!(res[0].evidence[1].offset, 12);
    }

    #[test]
    fn at_least_with_exclusion() {
        let (cat, m) = matcher();
        let two = b"ro.kernel.qemu ... qemu_pipe";
        assert_eq!(fired(&cat, &m, FileKind::Unknown, two), vec!["qemu"]);

        let one = b"ro.kernel.qemu only";
        assert!(fired(&cat, &m, FileKind::Unknown, one).is_empty());

        let excluded = b"ro.kernel.qemu goldfish TEST-HARNESS";
        assert!(fired(&cat, &m, FileKind::Unknown, excluded).is_empty());
    }

    #[test]
    fn size_gate() {
        let (cat, m) = matcher();
        assert_eq!(fired(&cat, &m, FileKind::Unknown, b"xx"), vec!["tiny"]);
        assert!(fired(&cat, &m, FileKind::Unknown, b"x.........").is_empty());
    }

    #[test]
    fn empty_buffer_matches_nothing() {
        let (cat, m) = matcher();
        assert!(fired(&cat, &m, FileKind::Dex, b"").is_empty());
    }
}

//! 条目分类：匹配 → 按类别分组 → 应用优先级策略
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::catalog::Catalog;
use crate::engine::{Evidence, PatternMatcher, RuleMatch};
use crate::error::EntryReadError;
use crate::types::Category;
use crate::walker::{Entry, EntryContent};

/// 互斥类别内的取舍方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// 只保留最高优先级（同级全部保留）
    #[default]
    Highest,
    /// 保留与最高优先级相差不超过 n 的规则
    Margin(u32),
}

/// 优先级策略（数据驱动，新增类别无需改动分类流程）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrecedencePolicy {
    /// 互斥类别；其余类别为叠加
    pub exclusive: BTreeSet<Category>,
    pub resolution: Resolution,
    /// 规则 id -> 覆盖后的优先级
    pub priority_overrides: BTreeMap<String, i32>,
}

impl Default for PrecedencePolicy {
    fn default() -> Self {
        Self {
            exclusive: [Category::Compiler, Category::Manipulator].into_iter().collect(),
            resolution: Resolution::Highest,
            priority_overrides: BTreeMap::new(),
        }
    }
}

impl PrecedencePolicy {
    pub fn is_exclusive(&self, category: Category) -> bool {
        self.exclusive.contains(&category)
    }
}

/// 单个条目的分类结果：类别 -> 胜出规则名
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Classification {
    categories: BTreeMap<Category, Vec<String>>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn get(&self, category: Category) -> &[String] {
        self.categories.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &[String])> {
        self.categories.iter().map(|(c, v)| (*c, v.as_slice()))
    }
}

/// 分类器对单个条目的产出
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Classified {
        classification: Classification,
        /// 规则 id -> 命中证据（含被优先级淘汰的规则）
        evidence: BTreeMap<String, Vec<Evidence>>,
    },
    TooLarge { size: u64, limit: u64 },
    Unreadable(EntryReadError),
}

/// 对单个条目分类；不修改条目
pub fn classify(
    entry: &Entry,
    catalog: &Catalog,
    matcher: &dyn PatternMatcher,
    policy: &PrecedencePolicy,
) -> EntryOutcome {
    let data = match &entry.content {
        EntryContent::Bytes(d) => d,
        EntryContent::TooLarge { size, limit } => return EntryOutcome::TooLarge { size: *size, limit: *limit },
        EntryContent::Unreadable(e) => return EntryOutcome::Unreadable(e.clone()),
    };

    let matches = matcher.scan(entry.kind, data);
    let classification = resolve(&matches, catalog, policy);
    debug!(path = %entry.path, fired = matches.len(), "entry classified");

    let evidence = matches
        .into_iter()
        .map(|m| (catalog.metadata(m.rule).id.clone(), m.evidence))
        .collect();
    EntryOutcome::Classified { classification, evidence }
}

/// 把一组命中解析为无冲突的分类
pub fn resolve(matches: &[RuleMatch], catalog: &Catalog, policy: &PrecedencePolicy) -> Classification {
    let mut grouped: BTreeMap<Category, Vec<(i32, &str)>> = BTreeMap::new();
    for m in matches {
        let meta = catalog.metadata(m.rule);
        let priority = policy.priority_overrides.get(&meta.id).copied().unwrap_or(meta.priority);
        grouped.entry(meta.category).or_default().push((priority, meta.name.as_str()));
    }

    let mut categories = BTreeMap::new();
    for (category, mut rules) in grouped {
        if policy.is_exclusive(category) {
            let top = rules.iter().map(|(p, _)| *p).max().unwrap_or_default();
            let margin = match policy.resolution {
                Resolution::Highest => 0,
                Resolution::Margin(n) => i64::from(n),
            };
            rules.retain(|(p, _)| i64::from(top) - i64::from(*p) <= margin);
        }
        // 优先级降序 → 名称升序，保证输出稳定
        rules.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        let mut names: Vec<String> = Vec::with_capacity(rules.len());
        for (_, name) in rules {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        categories.insert(category, names);
    }

    Classification { categories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SignatureMatcher;
    use crate::rules::RulesetSource;
    use crate::types::FileKind;

    const RULES: &str = r#"
[[rules]]
id = "dx"
name = "dx"
category = "compiler"
priority = 1
[[rules.patterns]]
id = "p"
literal = "DX"

[[rules]]
id = "r8"
name = "r8"
category = "compiler"
priority = 5
[[rules.patterns]]
id = "p"
literal = "R8"

[[rules]]
id = "d8"
name = "d8"
category = "compiler"
priority = 5
[[rules.patterns]]
id = "p"
literal = "D8"

[[rules]]
id = "emu_props"
name = "emulator properties"
category = "anti_vm"
priority = 1
[[rules.patterns]]
id = "p"
literal = "qemu"

[[rules]]
id = "emu_files"
name = "emulator files"
category = "anti_vm"
priority = 9
[[rules.patterns]]
id = "p"
literal = "goldfish"
"#;

    fn setup() -> (Catalog, SignatureMatcher) {
        let mut src = RulesetSource::new();
        src.add_toml_str("t", RULES).unwrap();
        let cat = Catalog::load(&src.compile().unwrap()).unwrap();
        let m = SignatureMatcher::new(&cat).unwrap();
        (cat, m)
    }

    fn entry(data: &[u8]) -> Entry {
        Entry {
            path: "x.dex".into(),
            kind: FileKind::Dex,
            depth: 0,
            content: EntryContent::Bytes(data.to_vec()),
        }
    }

    fn classified(outcome: EntryOutcome) -> Classification {
        match outcome {
            EntryOutcome::Classified { classification, .. } => classification,
            other => panic!("expected classification, got {other:?}"),
        }
    }

    #[test]
    fn exclusive_category_keeps_only_top_priority() {
        let (cat, m) = setup();
        let c = classified(classify(&entry(b"DX R8"), &cat, &m, &PrecedencePolicy::default()));
        assert_eq!(c.get(Category::Compiler), ["r8"]);
    }

    #[test]
    fn equal_priority_ties_are_preserved() {
        let (cat, m) = setup();
        let c = classified(classify(&entry(b"DX R8 D8"), &cat, &m, &PrecedencePolicy::default()));
        assert_eq!(c.get(Category::Compiler), ["d8", "r8"]);
    }

    #[test]
    fn additive_category_keeps_everything() {
        let (cat, m) = setup();
        let c = classified(classify(&entry(b"qemu goldfish"), &cat, &m, &PrecedencePolicy::default()));
        assert_eq!(c.get(Category::AntiVm), ["emulator files", "emulator properties"]);
    }

    #[test]
    fn margin_and_overrides_are_configurable() {
        let (cat, m) = setup();
        let policy = PrecedencePolicy { resolution: Resolution::Margin(4), ..PrecedencePolicy::default() };
        let c = classified(classify(&entry(b"DX R8"), &cat, &m, &policy));
        assert_eq!(c.get(Category::Compiler), ["r8", "dx"]);

        let mut policy = PrecedencePolicy::default();
        policy.priority_overrides.insert("dx".into(), 100);
        let c = classified(classify(&entry(b"DX R8"), &cat, &m, &policy));
        assert_eq!(c.get(Category::Compiler), ["dx"]);

        let policy = PrecedencePolicy { exclusive: BTreeSet::new(), ..PrecedencePolicy::default() };
        let c = classified(classify(&entry(b"DX R8"), &cat, &m, &policy));
        assert_eq!(c.get(Category::Compiler).len(), 2);
    }

    #[test]
    fn nothing_recognized_is_empty_not_error() {
        let (cat, m) = setup();
        match classify(&entry(b"plain"), &cat, &m, &PrecedencePolicy::default()) {
            EntryOutcome::Classified { classification, evidence } => {
                assert!(classification.is_empty());
                assert!(evidence.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unreadable_and_oversized_entries_pass_through() {
        let (cat, m) = setup();
        let mut e = entry(b"");
        e.content = EntryContent::TooLarge { size: 10, limit: 5 };
        assert_eq!(
            classify(&e, &cat, &m, &PrecedencePolicy::default()),
            EntryOutcome::TooLarge { size: 10, limit: 5 }
        );

        let err = EntryReadError { path: "x.dex".into(), reason: "crc".into() };
        e.content = EntryContent::Unreadable(err.clone());
        assert_eq!(classify(&e, &cat, &m, &PrecedencePolicy::default()), EntryOutcome::Unreadable(err));
    }

    #[test]
    fn policy_loads_from_toml() {
        let p: PrecedencePolicy = toml::from_str(
            r#"
exclusive = ["compiler", "packer"]
resolution = { margin = 2 }
[priority_overrides]
dx = 7
"#,
        )
        .unwrap();
        assert!(p.is_exclusive(Category::Packer));
        assert!(!p.is_exclusive(Category::Manipulator));
        assert_eq!(p.resolution, Resolution::Margin(2));
        assert_eq!(p.priority_overrides.get("dx"), Some(&7));
    }
}

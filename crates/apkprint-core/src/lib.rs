//! 工具链指纹识别核心库
//!
//! 设计要点：
//! - 规则源（TOML）离线编译为带版本与校验和的二进制规则集，进程启动时加载一次，只读共享。
//! - 工件按容器结构逐层展开为条目；深度、大小、成员数量都有上限，损坏结构只截断分支。
//!   磁盘工件不整体读入内存，常驻内存约为“单条目大小 × 并发度”。
//! - 每个条目独立匹配与分类，可并行；聚合器按发现顺序重排，输出可复现。
//! - 条目级与工件级错误都记录在报告中，只有规则集加载失败是致命的。

mod catalog;
mod classify;
mod detectors;
mod engine;
mod error;
mod filetype;
mod options;
mod report;
mod rules;
mod scan;
mod types;
mod walker;

pub use catalog::{Catalog, RuleId, RuleMetadata, FORMAT_VERSION, MAGIC};
pub use classify::{classify, resolve, Classification, EntryOutcome, PrecedencePolicy, Resolution};
pub use engine::{Evidence, PatternMatcher, RuleMatch, SignatureMatcher};
pub use error::{
    ArtifactScanError, ConfigError, ContainerParseError, EntryReadError, RuleCompileError, RulesetLoadError,
};
pub use filetype::{detect, kind_from_magic, kind_from_name, TypingMode};
pub use options::{ScanOptions, ScanStats};
pub use report::{aggregate, AggregateOptions, EntryReport, Note, Report, ScanRecord};
pub use rules::{compile_sources, Condition, RulesetSource};
pub use scan::{expand_inputs, ArtifactSource, CancelToken, Scanner};
pub use types::{Category, FileKind};
pub use walker::{walk, walk_path, Entry, EntryContent, Walk, WalkItem, WalkOptions, PATH_SEPARATOR};

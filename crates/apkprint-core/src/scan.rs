//! 扫描主流程与并行调度
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::classify::classify;
use crate::engine::{PatternMatcher, SignatureMatcher};
use crate::error::{ArtifactScanError, RulesetLoadError};
use crate::options::ScanOptions;
use crate::report::{aggregate, Report, ScanRecord};
use crate::walker::{walk, walk_path, Walk, WalkItem};

/// 扫描输入：本地路径或内存字节
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    Path(PathBuf),
    Bytes { name: String, data: Vec<u8> },
}

impl ArtifactSource {
    pub fn name(&self) -> String {
        match self {
            ArtifactSource::Path(p) => p.display().to_string(),
            ArtifactSource::Bytes { name, .. } => name.clone(),
        }
    }
}

/// 取消信号；在条目之间检查（粗粒度）
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 扫描调度器：持有只读目录与匹配器，可跨线程共享
pub struct Scanner {
    catalog: Arc<Catalog>,
    matcher: Arc<dyn PatternMatcher>,
    options: ScanOptions,
    cancel: CancelToken,
    pool: Option<rayon::ThreadPool>,
}

impl Scanner {
    /// 使用默认签名匹配器
    pub fn new(catalog: Arc<Catalog>, options: ScanOptions) -> Result<Self, RulesetLoadError> {
        let matcher = Arc::new(SignatureMatcher::new(&catalog)?);
        Ok(Self::with_matcher(catalog, matcher, options))
    }

    /// 使用外部提供的匹配器（其输出的 RuleId 必须来自同一目录）
    pub fn with_matcher(catalog: Arc<Catalog>, matcher: Arc<dyn PatternMatcher>, options: ScanOptions) -> Self {
        // 决策：线程数>1 时为条目级并行建立专用线程池；否则走串行
        let threads = options.effective_threads();
        let pool = if threads > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "cannot build worker pool, falling back to serial scanning");
                    None
                }
            }
        } else {
            None
        };
        Self { catalog, matcher, options, cancel: CancelToken::new(), pool }
    }

    /// 使用外部取消信号
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// 扫描一批工件，每个工件恰好产生一份报告
    pub fn scan<I>(&self, sources: I) -> Vec<Report>
    where
        I: IntoIterator<Item = ArtifactSource>,
    {
        let mut reports = Vec::new();
        self.scan_each(sources, |r| reports.push(r));
        reports
    }

    /// 逐个工件扫描并回调（便于流式输出）
    pub fn scan_each<I, F>(&self, sources: I, mut on_report: F)
    where
        I: IntoIterator<Item = ArtifactSource>,
        F: FnMut(Report),
    {
        for source in sources {
            on_report(self.scan_artifact(source));
        }
    }

    /// 扫描单个工件；打开失败时返回只含错误的报告
    pub fn scan_artifact(&self, source: ArtifactSource) -> Report {
        let name = source.name();
        if self.cancel.is_cancelled() {
            let mut report = Report::failed(&name, ArtifactScanError::Cancelled(name.clone()).to_string());
            report.incomplete = true;
            return report;
        }
        let walk_opts = self.options.walk_options();
        match source {
            ArtifactSource::Path(path) => match walk_path(&name, &path, &walk_opts) {
                Ok(entries) => self.scan_walk(&name, entries),
                Err(e) => {
                    warn!(artifact = %name, error = %e, "artifact could not be opened");
                    Report::failed(name, e.to_string())
                }
            },
            ArtifactSource::Bytes { data, .. } => self.scan_walk(&name, walk(&name, data, &walk_opts)),
        }
    }

    /// 扫描内存中的工件字节
    pub fn scan_bytes(&self, name: &str, data: Vec<u8>) -> Report {
        let walk_opts = self.options.walk_options();
        self.scan_walk(name, walk(name, data, &walk_opts))
    }

    fn scan_walk(&self, name: &str, entries: Walk<'_>) -> Report {
        let size = entries.artifact_size();
        info!(artifact = name, size, "scanning artifact");

        let (records, incomplete) = match &self.pool {
            Some(pool) => self.classify_parallel(pool, entries),
            None => self.classify_serial(entries),
        };

        let mut report = aggregate(name, records, self.options.aggregate_options());
        report.size = Some(size);
        report.incomplete = incomplete;
        if incomplete {
            warn!(artifact = name, entries = report.entries.len(), "scan cancelled, report is partial");
        } else {
            debug!(artifact = name, entries = report.entries.len(), "artifact finished");
        }
        report
    }

    fn classify_item(&self, item: WalkItem) -> ScanRecord {
        match item {
            WalkItem::Entry(entry) => {
                let outcome = classify(&entry, &self.catalog, self.matcher.as_ref(), &self.options.precedence);
                // entry 在此处释放，其字节缓冲不会超出本任务
                ScanRecord::Entry { path: entry.path, kind: entry.kind, depth: entry.depth, outcome }
            }
            WalkItem::ParseError(e) => ScanRecord::ContainerError(e),
        }
    }

    /// 串行路径
    fn classify_serial(&self, entries: Walk<'_>) -> (Vec<(usize, ScanRecord)>, bool) {
        let mut records = Vec::new();
        for (idx, item) in entries.enumerate() {
            if self.cancel.is_cancelled() {
                return (records, true);
            }
            records.push((idx, self.classify_item(item)));
        }
        (records, false)
    }

    /// 并行调度：
    /// - 遍历器在独立线程产出条目，经有界通道交给 Rayon 线程池
    /// - 通道容量等于线程数，常驻内存约为“单条目大小 × 并发度”
    /// - 结果带发现序号返回，由聚合器重排
    fn classify_parallel(&self, pool: &rayon::ThreadPool, entries: Walk<'_>) -> (Vec<(usize, ScanRecord)>, bool) {
        use crossbeam_channel as channel;
        use rayon::iter::{ParallelBridge, ParallelIterator};

        let threads = pool.current_num_threads().max(1);
        let truncated = AtomicBool::new(false);
        let cancel = &self.cancel;

        type Msg = (usize /*idx*/, WalkItem);
        let (tx, rx) = channel::bounded::<Msg>(threads);
        let (rtx, rrx) = channel::unbounded::<(usize, ScanRecord)>();

        let records = std::thread::scope(|s| {
            let truncated = &truncated;
            s.spawn(move || {
                for (idx, item) in entries.enumerate() {
                    if cancel.is_cancelled() {
                        truncated.store(true, Ordering::SeqCst);
                        break;
                    }
                    if tx.send((idx, item)).is_err() {
                        break;
                    }
                }
                // 结束后 Sender 被丢弃，worker 端迭代随之结束
            });
            s.spawn(move || {
                pool.install(|| {
                    rx.into_iter().par_bridge().for_each_with(rtx, |rtx, (idx, item)| {
                        if cancel.is_cancelled() {
                            truncated.store(true, Ordering::SeqCst);
                            return;
                        }
                        let _ = rtx.send((idx, self.classify_item(item)));
                    });
                });
            });
            rrx.iter().collect::<Vec<_>>()
        });

        (records, truncated.load(Ordering::SeqCst))
    }
}

/// 把输入展开为工件列表：目录递归取其中的普通文件（按路径排序）
pub fn expand_inputs(inputs: &[PathBuf]) -> Vec<ArtifactSource> {
    let mut out = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            out.push(ArtifactSource::Path(input.clone()));
            continue;
        }
        for entry in WalkDir::new(input).sort_by_file_name() {
            match entry {
                Ok(e) if e.file_type().is_file() => out.push(ArtifactSource::Path(e.into_path())),
                Ok(_) => {}
                // 无法访问的路径仍保留，扫描时会得到错误报告
                Err(e) => match e.path() {
                    Some(p) => out.push(ArtifactSource::Path(p.to_path_buf())),
                    None => warn!(error = %e, "skipping unreadable input"),
                },
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn expand_inputs_walks_directories_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.apk"), b"b").unwrap();
        std::fs::write(dir.path().join("a.apk"), b"a").unwrap();
        std::fs::write(dir.path().join("sub").join("c.dex"), b"c").unwrap();
        let missing = dir.path().join("missing.apk");

        let sources = expand_inputs(&[dir.path().to_path_buf(), missing.clone()]);
        let names: Vec<String> = sources
            .iter()
            .map(|s| match s {
                ArtifactSource::Path(p) => p.strip_prefix(dir.path()).unwrap().display().to_string(),
                ArtifactSource::Bytes { name, .. } => name.clone(),
            })
            .collect();
        assert_eq!(names, vec!["a.apk", "b.apk", "sub/c.dex", "missing.apk"]);
    }
}

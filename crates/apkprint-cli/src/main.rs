mod output;

use anyhow::{Context, Result};
use apkprint_core::{
    compile_sources, expand_inputs, Catalog, RulesetSource, ScanOptions, ScanStats, Scanner, TypingMode,
};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::output::{write_json, write_text, JsonDocument};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "apkprint", version, about = "Android 应用工具链指纹识别")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 扫描 APK / DEX / ELF / ZIP 工件
    Scan {
        /// 输入文件或目录（目录递归展开）
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// 规则集：编译后的规则文件，或 TOML 规则源（文件/目录）
        #[arg(long, default_value = "rules")]
        rules: PathBuf,

        /// 扫描配置文件（TOML）
        #[arg(long)]
        config: Option<PathBuf>,

        /// 以 JSON 文档输出
        #[arg(long)]
        json: bool,

        /// 输出文件，缺省写到标准输出
        #[arg(long)]
        output: Option<PathBuf>,

        /// 线程数（"auto"=CPU 核心数）
        #[arg(long)]
        threads: Option<String>,

        /// 最大嵌套深度
        #[arg(long)]
        scan_depth: Option<usize>,

        /// 单个条目的最大扫描大小（字节）
        #[arg(long)]
        entry_max_scan_size: Option<u64>,

        /// 成员筛选方式
        #[arg(long, value_parser = ["magic", "filename", "none"])]
        typing: Option<String>,

        /// 容器本身也作为条目扫描
        #[arg(long)]
        include_containers: bool,

        /// 去除重复条目
        #[arg(long)]
        dedup: bool,
    },

    /// 把 TOML 规则源编译为规则集文件
    Compile {
        /// 规则源文件或目录（目录下的 *.toml）
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        #[arg(long)]
        output: PathBuf,
    },

    /// 列出规则集中的规则
    Rules {
        #[arg(long, default_value = "rules")]
        rules: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // 日志写到 stderr；RUST_LOG 优先于 -v
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Scan {
            inputs,
            rules,
            config,
            json,
            output,
            threads,
            scan_depth,
            entry_max_scan_size,
            typing,
            include_containers,
            dedup,
        } => {
            let mut opts = match &config {
                Some(path) => ScanOptions::from_toml_file(path).context("load scan config")?,
                None => ScanOptions::default(),
            };
            // 命令行参数覆盖配置文件
            if let Some(t) = threads {
                opts.threads = parse_threads(&t);
            }
            if let Some(d) = scan_depth {
                opts.max_depth = d;
            }
            if let Some(n) = entry_max_scan_size {
                opts.max_entry_size = n;
            }
            if let Some(t) = typing {
                opts.typing = parse_typing(&t);
            }
            opts.include_containers |= include_containers;
            opts.dedup |= dedup;

            let catalog = Arc::new(load_catalog(&rules)?);
            info!(rules = catalog.len(), version = catalog.version(), digest = catalog.digest(), "ruleset loaded");

            let scanner = Scanner::new(Arc::clone(&catalog), opts).context("prepare pattern matcher")?;
            let sources = expand_inputs(&inputs);
            info!(artifacts = sources.len(), threads = scanner.options().effective_threads(), "starting scan");

            let mut out: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(File::create(path).context("create output file")?)),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };

            let mut stats = ScanStats::default();
            if json {
                let reports = scanner.scan(sources);
                reports.iter().for_each(|r| stats.record(r));
                write_json(&mut out, &JsonDocument::new(&catalog, &reports)).context("write json report")?;
            } else {
                let mut failed_write = None;
                scanner.scan_each(sources, |report| {
                    stats.record(&report);
                    if failed_write.is_none() {
                        failed_write = write_text(&mut out, &report).err();
                    }
                });
                if let Some(e) = failed_write {
                    return Err(e).context("write text report");
                }
            }
            out.flush().context("flush output")?;

            info!(
                artifacts_scanned = stats.artifacts_scanned,
                artifacts_failed = stats.artifacts_failed,
                artifacts_with_matches = stats.artifacts_with_matches,
                artifacts_with_problems = stats.artifacts_with_problems,
                incomplete = stats.incomplete,
                entries = stats.entries_reported,
                entries_with_matches = stats.entries_with_matches,
                entries_with_notes = stats.entries_with_notes,
                "scan finished"
            );
            if stats.artifacts_failed > 0 {
                warn!(failed = stats.artifacts_failed, "some artifacts could not be scanned");
            }
        }

        Commands::Compile { sources, output } => {
            let blob = compile_sources(&sources).context("compile rule sources")?;
            // 回读一次，确保产物可被加载
            let catalog = Catalog::load(&blob).context("verify compiled ruleset")?;
            std::fs::write(&output, &blob).with_context(|| format!("write {}", output.display()))?;
            println!(
                "compiled {} rules (version {}) into {}\nsha256 {}",
                catalog.len(),
                catalog.version(),
                output.display(),
                catalog.digest()
            );
        }

        Commands::Rules { rules } => {
            let catalog = load_catalog(&rules)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            writeln!(out, "# ruleset {} ({} rules, sha256 {})", catalog.version(), catalog.len(), catalog.digest())?;
            for (_, meta) in catalog.rules() {
                writeln!(out, "{}\t{}\t{}\t{}", meta.id, meta.category, meta.priority, meta.name)?;
            }
        }
    }

    Ok(())
}

/// 加载规则集：编译产物直接加载；TOML 源（文件或目录）先在内存中编译
fn load_catalog(path: &Path) -> Result<Catalog> {
    let is_source = path.is_dir() || path.extension().is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    if !is_source {
        return Catalog::load_path(path).context("load ruleset");
    }
    let mut src = RulesetSource::new();
    src.add_path(path).context("read rule sources")?;
    let blob = src.compile().context("compile rule sources")?;
    Catalog::load(&blob).context("load ruleset")
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}

fn parse_typing(s: &str) -> TypingMode {
    match s {
        "filename" => TypingMode::Filename,
        "none" => TypingMode::None,
        _ => TypingMode::Magic,
    }
}

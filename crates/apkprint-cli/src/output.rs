//! 报告渲染：缩进文本或单个 JSON 文档
use apkprint_core::{Catalog, Note, Report};
use serde::Serialize;
use std::io::{self, Write};

/// `--json` 输出的顶层文档
#[derive(Debug, Serialize)]
pub struct JsonDocument<'a> {
    pub apkprint_version: &'static str,
    pub rules_version: &'a str,
    pub rules_digest: &'a str,
    pub reports: &'a [Report],
}

impl<'a> JsonDocument<'a> {
    pub fn new(catalog: &'a Catalog, reports: &'a [Report]) -> Self {
        Self {
            apkprint_version: env!("CARGO_PKG_VERSION"),
            rules_version: catalog.version(),
            rules_digest: catalog.digest(),
            reports,
        }
    }
}

pub fn write_json<W: Write>(out: &mut W, doc: &JsonDocument<'_>) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, doc)?;
    writeln!(out)
}

/// 文本格式：
/// ```text
/// [*] app.apk!classes.dex
///  |-> compiler : r8
/// ```
pub fn write_text<W: Write>(out: &mut W, report: &Report) -> io::Result<()> {
    if let Some(err) = &report.error {
        writeln!(out, "[!] {}: {}", report.artifact, err)?;
        return Ok(());
    }
    for entry in &report.entries {
        let matched = entry.classification.as_ref().filter(|c| !c.is_empty());
        if matched.is_none() && entry.notes.is_empty() {
            continue;
        }
        writeln!(out, "[*] {}", entry.path)?;
        if let Some(c) = matched {
            for (category, names) in c.iter() {
                writeln!(out, " |-> {} : {}", category, names.join(", "))?;
            }
        }
        for note in &entry.notes {
            writeln!(out, " |-> {}", describe(note))?;
        }
    }
    if report.incomplete {
        writeln!(out, "[!] {}: scan cancelled, results are partial", report.artifact)?;
    }
    Ok(())
}

fn describe(note: &Note) -> String {
    match note {
        Note::TooLarge { size, limit } => format!("skipped : {size} bytes exceeds limit of {limit}"),
        Note::ReadError { reason } => format!("unreadable : {reason}"),
        Note::ContainerParse { reason } => format!("corrupt container : {reason}"),
    }
}

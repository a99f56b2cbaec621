//! 公共类型（对外暴露）
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 规则类别（封闭集合）
///
/// 声明顺序即报告中的输出顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Compiler,
    Obfuscator,
    Packer,
    AntiDisassembly,
    AntiVm,
    AntiDebug,
    Manipulator,
    Anomaly,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Compiler,
        Category::Obfuscator,
        Category::Packer,
        Category::AntiDisassembly,
        Category::AntiVm,
        Category::AntiDebug,
        Category::Manipulator,
        Category::Anomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Compiler => "compiler",
            Category::Obfuscator => "obfuscator",
            Category::Packer => "packer",
            Category::AntiDisassembly => "anti_disassembly",
            Category::AntiVm => "anti_vm",
            Category::AntiDebug => "anti_debug",
            Category::Manipulator => "manipulator",
            Category::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// 条目类型提示（由魔数或文件名推断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Apk,
    Zip,
    Dex,
    Elf,
    Unknown,
}

impl FileKind {
    /// 是否为可继续展开的容器
    pub fn is_container(&self) -> bool {
        matches!(self, FileKind::Apk | FileKind::Zip)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Apk => "apk",
            FileKind::Zip => "zip",
            FileKind::Dex => "dex",
            FileKind::Elf => "elf",
            FileKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_str() {
        for c in Category::ALL {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
        assert!("nope".parse::<Category>().is_err());
    }

    #[test]
    fn category_serde_names_match_display() {
        let json = serde_json::to_string(&Category::AntiVm).unwrap();
        assert_eq!(json, "\"anti_vm\"");
    }
}

//! 条目类型推断（魔数 / 文件名）
use serde::{Deserialize, Serialize};

use crate::types::FileKind;

/// 成员筛选方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingMode {
    /// 只扫描魔数可识别的成员
    #[default]
    Magic,
    /// 只扫描扩展名可识别的成员
    Filename,
    /// 扫描全部成员
    None,
}

const DEX_MAGIC: &[u8] = b"dex\n";
const ELF_MAGIC: &[u8] = b"\x7fELF";
const ZIP_LOCAL: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY: &[u8] = b"PK\x05\x06";

/// 按魔数判定
pub fn kind_from_magic(data: &[u8]) -> FileKind {
    if data.starts_with(DEX_MAGIC) {
        FileKind::Dex
    } else if data.starts_with(ELF_MAGIC) {
        FileKind::Elf
    } else if data.starts_with(ZIP_LOCAL) || data.starts_with(ZIP_EMPTY) {
        FileKind::Zip
    } else {
        FileKind::Unknown
    }
}

/// 按扩展名判定（不区分大小写）
pub fn kind_from_name(name: &str) -> FileKind {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return FileKind::Unknown,
    };
    match ext.as_str() {
        "dex" | "odex" => FileKind::Dex,
        "so" | "elf" => FileKind::Elf,
        "apk" | "aab" | "apks" => FileKind::Apk,
        "zip" | "jar" | "aar" => FileKind::Zip,
        _ => FileKind::Unknown,
    }
}

/// 综合推断：容器总是以魔数为准，其余按 typing 模式
pub fn detect(name: &str, data: &[u8], typing: TypingMode) -> FileKind {
    let by_magic = kind_from_magic(data);
    match typing {
        TypingMode::Filename => match kind_from_name(name) {
            // 扩展名说是 apk 但内容不是 zip：不当作容器
            k if k.is_container() && !by_magic.is_container() => FileKind::Unknown,
            FileKind::Unknown if by_magic.is_container() => by_magic,
            k => k,
        },
        TypingMode::Magic | TypingMode::None => by_magic,
    }
}

/// 当前 typing 模式下该成员是否应被扫描
pub fn is_selected(kind: FileKind, typing: TypingMode) -> bool {
    match typing {
        TypingMode::None => true,
        TypingMode::Magic | TypingMode::Filename => kind != FileKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_detection() {
        assert_eq!(kind_from_magic(b"dex\n035\0"), FileKind::Dex);
        assert_eq!(kind_from_magic(b"\x7fELF\x02\x01"), FileKind::Elf);
        assert_eq!(kind_from_magic(b"PK\x03\x04...."), FileKind::Zip);
        assert_eq!(kind_from_magic(b"PK\x05\x06...."), FileKind::Zip);
        assert_eq!(kind_from_magic(b"\x89PNG"), FileKind::Unknown);
        assert_eq!(kind_from_magic(b""), FileKind::Unknown);
    }

    #[test]
    fn name_detection() {
        assert_eq!(kind_from_name("classes2.dex"), FileKind::Dex);
        assert_eq!(kind_from_name("lib/arm64-v8a/libfoo.SO"), FileKind::Elf);
        assert_eq!(kind_from_name("base.apk"), FileKind::Apk);
        assert_eq!(kind_from_name("README"), FileKind::Unknown);
    }

    #[test]
    fn filename_typing_never_trusts_extension_for_containers() {
        assert_eq!(detect("fake.apk", b"not a zip", TypingMode::Filename), FileKind::Unknown);
        assert_eq!(detect("blob.bin", b"PK\x03\x04", TypingMode::Filename), FileKind::Zip);
        assert_eq!(detect("classes.dex", b"garbage", TypingMode::Filename), FileKind::Dex);
        assert_eq!(detect("classes.txt", b"dex\n035\0", TypingMode::Filename), FileKind::Unknown);
    }

    #[test]
    fn selection_by_mode() {
        assert!(!is_selected(FileKind::Unknown, TypingMode::Magic));
        assert!(is_selected(FileKind::Unknown, TypingMode::None));
        assert!(is_selected(FileKind::Dex, TypingMode::Filename));
    }
}

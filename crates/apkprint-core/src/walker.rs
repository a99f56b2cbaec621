//! 容器遍历：把工件展开为可扫描条目的惰性序列
//!
//! 使用显式栈而不是递归，深度与成员数量都有上限；
//! 结构损坏只截断当前分支，不会中止整个遍历。
//! 磁盘上的工件不整体读入内存：顶层容器直接在文件上打开，
//! 非容器工件先按文件大小判断是否超限。
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{ArtifactScanError, ContainerParseError, EntryReadError};
use crate::filetype::{detect, is_selected, TypingMode};
use crate::types::FileKind;

/// 嵌套路径分隔符（`app.apk!assets/x.zip!classes.dex`）
pub const PATH_SEPARATOR: char = '!';

const ANDROID_MANIFEST: &str = "AndroidManifest.xml";
/// 类型探测时预读的字节数
const SNIFF_LEN: u64 = 8;

/// 遍历策略
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// 最大嵌套深度（工件本身为 0）
    pub max_depth: usize,
    /// 单个条目的大小上限（字节）
    pub max_entry_size: u64,
    /// 访问成员总数上限
    pub max_entries: usize,
    pub typing: TypingMode,
    /// 是否把容器自身也作为条目输出
    pub include_containers: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_entry_size: 100 * 1024 * 1024,
            max_entries: 10_000,
            typing: TypingMode::Magic,
            include_containers: false,
        }
    }
}

/// 条目内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    Bytes(Vec<u8>),
    /// 超过大小上限，未读入内存
    TooLarge { size: u64, limit: u64 },
    Unreadable(EntryReadError),
}

/// 一个可扫描条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub kind: FileKind,
    pub depth: usize,
    pub content: EntryContent,
}

/// 遍历产出：条目，或某个分支的结构错误标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkItem {
    Entry(Entry),
    ParseError(ContainerParseError),
}

/// 容器字节的来源：内存缓冲（嵌套成员、内存工件）或磁盘文件（顶层工件）
enum Backing {
    Memory(Cursor<Arc<[u8]>>),
    File { reader: BufReader<File>, path: PathBuf },
}

impl Backing {
    /// 独立的第二个读取句柄（文件重新打开，偏移互不影响）
    fn duplicate(&self) -> io::Result<Backing> {
        Ok(match self {
            Backing::Memory(c) => Backing::Memory(Cursor::new(Arc::clone(c.get_ref()))),
            Backing::File { path, .. } => {
                Backing::File { reader: BufReader::new(File::open(path)?), path: path.clone() }
            }
        })
    }
}

impl Read for Backing {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Backing::Memory(c) => c.read(buf),
            Backing::File { reader, .. } => reader.read(buf),
        }
    }
}

impl Seek for Backing {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Backing::Memory(c) => c.seek(pos),
            Backing::File { reader, .. } => reader.seek(pos),
        }
    }
}

struct Frame {
    archive: ZipArchive<Backing>,
    path: String,
    depth: usize,
    next: usize,
}

/// 惰性遍历器；只能从头重新调用 [`walk`] / [`walk_path`] 来重启
pub struct Walk<'a> {
    opts: &'a WalkOptions,
    pending: VecDeque<WalkItem>,
    stack: Vec<Frame>,
    visited: usize,
    size: u64,
}

/// 对内存中的完整工件字节开始遍历
pub fn walk<'a>(name: &str, data: Vec<u8>, opts: &'a WalkOptions) -> Walk<'a> {
    let mut w = Walk::new(opts, data.len() as u64);
    let kind = detect(name, &data, opts.typing);
    w.admit(name.to_string(), kind, 0, data);
    w
}

/// 对磁盘上的工件开始遍历
///
/// 只预读类型探测所需的字节；超限的非容器工件不会被读入，
/// 容器在文件上直接打开，成员按需解压。
pub fn walk_path<'a>(name: &str, path: &Path, opts: &'a WalkOptions) -> Result<Walk<'a>, ArtifactScanError> {
    let read_err = |source| ArtifactScanError::Read { path: path.to_path_buf(), source };
    let file = File::open(path).map_err(|source| ArtifactScanError::Open { path: path.to_path_buf(), source })?;
    let size = file.metadata().map_err(read_err)?.len();
    let mut reader = BufReader::new(file);

    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    reader.by_ref().take(SNIFF_LEN).read_to_end(&mut head).map_err(read_err)?;
    reader.rewind().map_err(read_err)?;
    let kind = detect(name, &head, opts.typing);

    let mut w = Walk::new(opts, size);
    let backing = Backing::File { reader, path: path.to_path_buf() };
    if kind.is_container() && opts.max_depth > 0 {
        w.open_container(name.to_string(), kind, 0, backing, size);
    } else {
        w.emit_backing(name.to_string(), kind, 0, Ok(backing), size);
    }
    Ok(w)
}

impl<'a> Walk<'a> {
    fn new(opts: &'a WalkOptions, size: u64) -> Self {
        Self { opts, pending: VecDeque::new(), stack: Vec::new(), visited: 0, size }
    }

    /// 工件本身的字节数
    pub fn artifact_size(&self) -> u64 {
        self.size
    }

    /// 处理已读入内存的条目：容器入栈，其余作为叶子输出
    fn admit(&mut self, path: String, kind: FileKind, depth: usize, data: Vec<u8>) {
        if !kind.is_container() || depth >= self.opts.max_depth {
            self.emit_bytes(path, kind, depth, data);
            return;
        }
        let size = data.len() as u64;
        let shared: Arc<[u8]> = data.into();
        self.open_container(path, kind, depth, Backing::Memory(Cursor::new(shared)), size);
    }

    fn open_container(&mut self, path: String, kind: FileKind, depth: usize, backing: Backing, size: u64) {
        // 打开失败时 backing 已被消耗，原始字节从第二个句柄读取
        let spare = backing.duplicate();
        match ZipArchive::new(backing) {
            Ok(archive) => {
                let kind = if archive.file_names().any(|n| n == ANDROID_MANIFEST) {
                    FileKind::Apk
                } else {
                    kind
                };
                debug!(%path, %kind, members = archive.len(), depth, "descending into container");
                if self.opts.include_containers {
                    self.emit_backing(path.clone(), kind, depth, spare, size);
                }
                self.stack.push(Frame { archive, path, depth, next: 0 });
            }
            Err(e) => {
                // 打不开的容器仍按原始字节扫描
                warn!(%path, error = %e, "container does not open, scanning as raw bytes");
                self.emit_backing(path.clone(), kind, depth, spare, size);
                self.pending.push_back(WalkItem::ParseError(ContainerParseError {
                    path,
                    reason: e.to_string(),
                }));
            }
        }
    }

    /// 从 backing 读出条目字节；先按已知大小判断上限
    fn emit_backing(&mut self, path: String, kind: FileKind, depth: usize, raw: io::Result<Backing>, size: u64) {
        let limit = self.opts.max_entry_size;
        if size > limit {
            self.emit_too_large(path, kind, depth, size);
            return;
        }
        let read = raw.and_then(|mut b| {
            b.rewind()?;
            read_capped(&mut b, limit)
        });
        match read {
            Ok(data) if data.len() as u64 > limit => {
                let size = size.max(data.len() as u64);
                self.emit_too_large(path, kind, depth, size);
            }
            Ok(data) => self.emit_bytes(path, kind, depth, data),
            Err(e) => {
                warn!(%path, error = %e, "entry unreadable");
                let reason = e.to_string();
                self.pending.push_back(WalkItem::Entry(Entry {
                    path: path.clone(),
                    kind,
                    depth,
                    content: EntryContent::Unreadable(EntryReadError { path, reason }),
                }));
            }
        }
    }

    fn emit_too_large(&mut self, path: String, kind: FileKind, depth: usize, size: u64) {
        let limit = self.opts.max_entry_size;
        warn!(%path, size, limit, "entry exceeds size ceiling");
        self.pending.push_back(WalkItem::Entry(Entry {
            path,
            kind,
            depth,
            content: EntryContent::TooLarge { size, limit },
        }));
    }

    fn emit_bytes(&mut self, path: String, kind: FileKind, depth: usize, data: Vec<u8>) {
        if data.len() as u64 > self.opts.max_entry_size {
            self.emit_too_large(path, kind, depth, data.len() as u64);
            return;
        }
        self.pending.push_back(WalkItem::Entry(Entry { path, kind, depth, content: EntryContent::Bytes(data) }));
    }

    /// 访问栈顶容器的下一个成员
    fn step(&mut self) {
        let opts = self.opts;
        let Some(frame) = self.stack.last_mut() else { return };
        if frame.next >= frame.archive.len() {
            self.stack.pop();
            return;
        }
        if self.visited >= opts.max_entries {
            warn!(budget = opts.max_entries, "member budget exhausted, stopping walk");
            let path = frame.path.clone();
            self.stack.clear();
            self.pending.push_back(WalkItem::ParseError(ContainerParseError {
                path,
                reason: format!("member budget of {} exhausted", opts.max_entries),
            }));
            return;
        }
        self.visited += 1;

        let index = frame.next;
        frame.next += 1;
        let depth = frame.depth + 1;
        let parent = frame.path.clone();
        let fallback_name = frame
            .archive
            .name_for_index(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{index}"));

        let outcome = read_member(&mut frame.archive, index, opts);
        let member = |name: &str| format!("{parent}{PATH_SEPARATOR}{name}");

        match outcome {
            Member::Skip => {}
            Member::Data { name, data } => {
                let kind = detect(&name, &data, opts.typing);
                self.admit(member(&name), kind, depth, data);
            }
            Member::TooLarge { name, kind, size } => self.emit_too_large(member(&name), kind, depth, size),
            Member::Unreadable { name, kind, reason } => {
                let path = member(name.as_deref().unwrap_or(&fallback_name));
                warn!(%path, %reason, "member unreadable");
                self.pending.push_back(WalkItem::Entry(Entry {
                    path: path.clone(),
                    kind,
                    depth,
                    content: EntryContent::Unreadable(EntryReadError { path, reason }),
                }));
            }
            Member::Corrupt { reason } => {
                warn!(path = %parent, member = index, %reason, "corrupt member header, truncating branch");
                self.stack.pop();
                self.pending.push_back(WalkItem::ParseError(ContainerParseError {
                    path: parent,
                    reason: format!("member #{index}: {reason}"),
                }));
            }
        }
    }
}

/// 最多读取 limit + 1 字节，用于判断实际长度是否超限
fn read_capped<R: Read>(reader: R, limit: u64) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut data)?;
    Ok(data)
}

impl Iterator for Walk<'_> {
    type Item = WalkItem;

    fn next(&mut self) -> Option<WalkItem> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.stack.is_empty() {
                return None;
            }
            self.step();
        }
    }
}

enum Member {
    Skip,
    Data { name: String, data: Vec<u8> },
    TooLarge { name: String, kind: FileKind, size: u64 },
    Unreadable { name: Option<String>, kind: FileKind, reason: String },
    Corrupt { reason: String },
}

/// 读取单个成员；声明大小与实际解压大小都受上限约束
fn read_member(archive: &mut ZipArchive<Backing>, index: usize, opts: &WalkOptions) -> Member {
    let mut file = match archive.by_index(index) {
        Ok(f) => f,
        // 不支持的压缩方式/加密：仅影响该成员
        Err(ZipError::UnsupportedArchive(reason)) => {
            return Member::Unreadable { name: None, kind: FileKind::Unknown, reason: reason.to_string() }
        }
        Err(e) => return Member::Corrupt { reason: e.to_string() },
    };
    if file.is_dir() {
        return Member::Skip;
    }

    let name = file.name().to_string();
    let limit = opts.max_entry_size;

    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    if let Err(e) = file.by_ref().take(SNIFF_LEN).read_to_end(&mut head) {
        let kind = detect(&name, &[], opts.typing);
        return Member::Unreadable { name: Some(name), kind, reason: e.to_string() };
    }
    let kind = detect(&name, &head, opts.typing);
    if !kind.is_container() && !is_selected(kind, opts.typing) {
        debug!(member = %name, "skipping member of unselected type");
        return Member::Skip;
    }

    let declared = file.size();
    if declared > limit {
        return Member::TooLarge { name, kind, size: declared };
    }

    let mut data = head;
    let remaining = limit.saturating_add(1).saturating_sub(data.len() as u64);
    if let Err(e) = file.by_ref().take(remaining).read_to_end(&mut data) {
        return Member::Unreadable { name: Some(name), kind, reason: e.to_string() };
    }
    // 声明大小可能是伪造的，以实际解压长度为准
    if data.len() as u64 > limit {
        return Member::TooLarge { name, kind, size: declared.max(data.len() as u64) };
    }
    Member::Data { name, data }
}

//! Chunked file transfer with trailing SHA-256 verification.
//!
//! Both `get` (server sends) and `put` (client sends) use the same engine:
//!
//! 1. The sender announces the files with a listing message, built by
//!    [`plan_files`].
//! 2. For each file, in listing order, the sender streams the bytes as binary
//!    messages through a [`ThrottledStream`], hashing as it goes.
//! 3. A text trailer (`getend`/`putend`) carries the lowercase hex digest and
//!    marks the end of the file.
//! 4. The receiver writes to a temporary sibling file while hashing, compares
//!    digests case-insensitively and renames into place only on a match.
//!
//! A mismatch is an [`ProtocolError::IntegrityFailure`]; the caller must tear
//! the whole connection down.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::channel::{MessageChannel, WireMessage};
use crate::error::{ProtocolError, Result};
use crate::messages::{self, FileEntry, FileKind, Inbound, Request, Response, Tagged, TransferEnd};
use crate::throttle::ThrottledStream;

/// Default size of one binary message (128 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Suffix of in-progress download/upload files.
const PARTIAL_SUFFIX: &str = ".ferry-part";

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Options and reporting
// =============================================================================

/// Tuning shared by sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Bytes per binary message.
    pub chunk_size: usize,
    /// File stream cap in bytes per second (0 = unlimited).
    pub max_bytes_per_second: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_bytes_per_second: 0,
        }
    }
}

/// Which flow a transfer belongs to. Selects the trailer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `get`: server to client, trailer `getend`.
    Download,
    /// `put`: client to server, trailer `putend`.
    Upload,
}

impl Direction {
    fn trailer_type(self) -> &'static str {
        match self {
            Direction::Download => "getend",
            Direction::Upload => "putend",
        }
    }

    fn encode_trailer(self, hash_sha256: String) -> Result<String> {
        let end = TransferEnd { hash_sha256 };
        match self {
            Direction::Download => messages::encode(&Response::GetEnd(end)),
            Direction::Upload => messages::encode(&Request::PutEnd(end)),
        }
    }

    /// Extracts the digest from a trailer; anything else breaks the sequence.
    fn decode_trailer(self, text: &str) -> Result<String> {
        let got = match self {
            Direction::Download => match messages::decode::<Response>(text)? {
                Inbound::Known(Response::GetEnd(end)) => return Ok(end.hash_sha256),
                Inbound::Known(other) => other.type_name().to_string(),
                Inbound::Unmapped(kind) => kind,
            },
            Direction::Upload => match messages::decode::<Request>(text)? {
                Inbound::Known(Request::PutEnd(end)) => return Ok(end.hash_sha256),
                Inbound::Known(other) => other.type_name().to_string(),
                Inbound::Unmapped(kind) => kind,
            },
        };
        Err(ProtocolError::UnexpectedMessage {
            expected: self.trailer_type(),
            got,
        })
    }
}

/// How a single file ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Bytes and trailer were sent.
    Sent,
    /// Received, verified and moved into place.
    Written,
    /// Destination already existed; bytes were consumed and verified only.
    Skipped,
}

/// Progress hooks invoked by the engine. All methods default to no-ops.
pub trait TransferObserver: Send {
    fn file_started(&mut self, _entry: &FileEntry) {}

    fn bytes_transferred(&mut self, _bytes: u64) {}

    fn file_finished(&mut self, _entry: &FileEntry, _outcome: FileOutcome) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// Totals for one batch of files.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub files_transferred: usize,
    pub files_skipped: usize,
    pub bytes: u64,
}

// =============================================================================
// Planning
// =============================================================================

/// A file selected for sending: its announced entry and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub entry: FileEntry,
    pub path: PathBuf,
}

/// Matches a `/`-separated relative path against a glob.
///
/// `*` matches any run of characters within one path segment, `?` matches
/// one character other than `/`, and `**` matches across segments (`**/`
/// may also match nothing). Everything else matches literally, case-sensitive.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let candidate: Vec<char> = candidate.chars().collect();
    let n = candidate.len();

    // reachable[i]: the pattern consumed so far can match candidate[..i].
    let mut reachable = vec![false; n + 1];
    reachable[0] = true;
    let mut next = vec![false; n + 1];

    for token in GlobToken::parse(pattern) {
        next.iter_mut().for_each(|slot| *slot = false);
        match token {
            GlobToken::Literal(c) => {
                for i in 0..n {
                    next[i + 1] = reachable[i] && candidate[i] == c;
                }
            }
            GlobToken::AnyChar => {
                for i in 0..n {
                    next[i + 1] = reachable[i] && candidate[i] != '/';
                }
            }
            GlobToken::Star => {
                let mut open = false;
                for j in 0..=n {
                    open |= reachable[j];
                    next[j] = open;
                    if j < n && candidate[j] == '/' {
                        open = false;
                    }
                }
            }
            GlobToken::DoubleStar => {
                let mut open = false;
                for j in 0..=n {
                    open |= reachable[j];
                    next[j] = open;
                }
            }
            GlobToken::DoubleStarSlash => {
                let mut open = false;
                for j in 0..=n {
                    next[j] = reachable[j] || (open && j > 0 && candidate[j - 1] == '/');
                    open |= reachable[j];
                }
            }
        }
        std::mem::swap(&mut reachable, &mut next);
        if !reachable.contains(&true) {
            return false;
        }
    }
    reachable[n]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobToken {
    Literal(char),
    AnyChar,
    /// `*`: any run without `/`.
    Star,
    /// `**`: any run.
    DoubleStar,
    /// `**/`: nothing, or any run ending in `/`.
    DoubleStarSlash,
}

impl GlobToken {
    fn parse(pattern: &str) -> Vec<GlobToken> {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::with_capacity(chars.len());
        let mut i = 0;
        while i < chars.len() {
            let token = match chars[i] {
                '*' if chars.get(i + 1) == Some(&'*') => {
                    if chars.get(i + 2) == Some(&'/') {
                        i += 3;
                        GlobToken::DoubleStarSlash
                    } else {
                        i += 2;
                        GlobToken::DoubleStar
                    }
                }
                '*' => {
                    i += 1;
                    GlobToken::Star
                }
                '?' => {
                    i += 1;
                    GlobToken::AnyChar
                }
                c => {
                    i += 1;
                    GlobToken::Literal(c)
                }
            };
            // Consecutive stars collapse; a run of them costs one pass.
            let repeated_star = matches!(token, GlobToken::Star | GlobToken::DoubleStar)
                && tokens.last() == Some(&token);
            if repeated_star {
                continue;
            }
            tokens.push(token);
        }
        tokens
    }
}

/// Renders `path` relative to `base` with `/` separators.
///
/// Returns `None` for paths outside `base` or with non UTF-8 components.
pub fn relative_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Selects the files under `dir` whose relative path matches `pattern`.
///
/// Symlinks are not followed and zero-length files are left out. The result
/// is sorted by name so both ends agree on transfer order.
pub fn plan_files(dir: &Path, pattern: &str) -> Result<Vec<PlannedFile>> {
    let mut planned = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(name) = relative_name(dir, entry.path()) else {
            warn!(path = %entry.path().display(), "Skipping file with unrepresentable name");
            continue;
        };
        if !glob_match(pattern, &name) {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| ProtocolError::TransferFailed(e.to_string()))?;
        if metadata.len() == 0 {
            continue;
        }

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        planned.push(PlannedFile {
            entry: FileEntry::file(name, metadata.len(), modified),
            path: entry.into_path(),
        });
    }

    planned.sort_by(|a, b| a.entry.name.cmp(&b.entry.name));
    Ok(planned)
}

/// Resolves an announced name inside `dest_dir`.
///
/// Only plain relative names are accepted: no empty, `.` or `..` segments,
/// no backslashes and nothing absolute.
pub fn resolve_destination(dest_dir: &Path, name: &str) -> Result<PathBuf> {
    let escapes = || ProtocolError::PathOutsideRoot(name.to_string());

    if name.is_empty() || name.contains('\\') || Path::new(name).has_root() {
        return Err(escapes());
    }

    let mut resolved = dest_dir.to_path_buf();
    for segment in name.split('/') {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if !segment.is_empty() => resolved.push(part),
            _ => return Err(escapes()),
        }
    }
    Ok(resolved)
}

// =============================================================================
// Sender
// =============================================================================

/// Streams every planned file followed by its trailer.
pub async fn send_files<C>(
    channel: &mut C,
    direction: Direction,
    files: &[PlannedFile],
    options: &TransferOptions,
    observer: &mut dyn TransferObserver,
) -> Result<TransferSummary>
where
    C: MessageChannel + ?Sized,
{
    let mut summary = TransferSummary::default();
    for file in files {
        observer.file_started(&file.entry);
        let sent = send_file(channel, direction, file, options, observer).await?;
        observer.file_finished(&file.entry, FileOutcome::Sent);

        summary.files_transferred += 1;
        summary.bytes += sent;
    }
    Ok(summary)
}

async fn send_file<C>(
    channel: &mut C,
    direction: Direction,
    file: &PlannedFile,
    options: &TransferOptions,
    observer: &mut dyn TransferObserver,
) -> Result<u64>
where
    C: MessageChannel + ?Sized,
{
    let source = File::open(&file.path).await?;
    let mut stream = ThrottledStream::new(source, options.max_bytes_per_second);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    let mut sent = 0u64;

    loop {
        let read = stream.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        hasher.update(chunk);
        channel.send(WireMessage::Binary(chunk.to_vec())).await?;

        sent += read as u64;
        observer.bytes_transferred(read as u64);
    }

    let digest = hex::encode(hasher.finalize());
    debug!(name = %file.entry.name, bytes = sent, sha256 = %digest, "File sent");
    channel
        .send(WireMessage::Text(direction.encode_trailer(digest)?))
        .await?;
    Ok(sent)
}

// =============================================================================
// Receiver
// =============================================================================

/// Receives every announced file into `dest_dir`.
///
/// All names are validated before any bytes are read. Files whose
/// destination already exists are skipped, but their bytes are still
/// consumed and verified so the sequence stays aligned.
pub async fn receive_files<C>(
    channel: &mut C,
    direction: Direction,
    dest_dir: &Path,
    files: &[FileEntry],
    options: &TransferOptions,
    observer: &mut dyn TransferObserver,
) -> Result<TransferSummary>
where
    C: MessageChannel + ?Sized,
{
    let mut destinations = Vec::with_capacity(files.len());
    for entry in files {
        if entry.kind != FileKind::File {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "file entry",
                got: format!("directory {}", entry.name),
            });
        }
        destinations.push(resolve_destination(dest_dir, &entry.name)?);
    }

    let mut summary = TransferSummary::default();
    for (entry, destination) in files.iter().zip(destinations) {
        observer.file_started(entry);
        let (outcome, bytes) = receive_file(
            channel,
            direction,
            dest_dir,
            entry,
            &destination,
            options,
            observer,
        )
        .await?;
        observer.file_finished(entry, outcome);

        match outcome {
            FileOutcome::Skipped => summary.files_skipped += 1,
            _ => summary.files_transferred += 1,
        }
        summary.bytes += bytes;
    }
    Ok(summary)
}

async fn receive_file<C>(
    channel: &mut C,
    direction: Direction,
    dest_dir: &Path,
    entry: &FileEntry,
    destination: &Path,
    options: &TransferOptions,
    observer: &mut dyn TransferObserver,
) -> Result<(FileOutcome, u64)>
where
    C: MessageChannel + ?Sized,
{
    if let Some(parent) = destination.parent() {
        ensure_inside(dest_dir, parent, &entry.name).await?;
        fs::create_dir_all(parent).await?;
    }

    if fs::try_exists(destination).await? {
        debug!(name = %entry.name, "Destination exists, discarding incoming bytes");
        let bytes = receive_bytes(channel, direction, entry, None, observer).await?;
        return Ok((FileOutcome::Skipped, bytes));
    }

    let partial = partial_path(destination);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&partial)
        .await?;
    let mut sink = ThrottledStream::new(file, options.max_bytes_per_second);

    let result = receive_bytes(channel, direction, entry, Some(&mut sink), observer).await;
    let result = match result {
        Ok(bytes) => match sink.shutdown().await {
            Ok(()) => Ok(bytes),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e),
    };
    drop(sink);

    match result {
        Ok(bytes) => {
            fs::rename(&partial, destination).await?;
            debug!(name = %entry.name, bytes, "File received");
            Ok((FileOutcome::Written, bytes))
        }
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&partial).await {
                warn!(path = %partial.display(), error = %remove_err, "Failed to remove partial file");
            }
            Err(e)
        }
    }
}

/// Reads binary messages until the trailer, hashing everything and writing
/// to `sink` when given. Verifies the digest before returning.
async fn receive_bytes<C>(
    channel: &mut C,
    direction: Direction,
    entry: &FileEntry,
    mut sink: Option<&mut ThrottledStream<File>>,
    observer: &mut dyn TransferObserver,
) -> Result<u64>
where
    C: MessageChannel + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut received = 0u64;

    let expected = loop {
        match channel.recv().await? {
            WireMessage::Binary(chunk) => {
                hasher.update(&chunk);
                if let Some(sink) = sink.as_deref_mut() {
                    sink.write_all(&chunk).await?;
                }
                received += chunk.len() as u64;
                observer.bytes_transferred(chunk.len() as u64);
            }
            WireMessage::Text(text) => break direction.decode_trailer(&text)?,
            WireMessage::Close(frame) => {
                return Err(ProtocolError::ConnectionClosed(match frame {
                    Some(frame) => frame.to_string(),
                    None => format!("while receiving {}", entry.name),
                }));
            }
        }
    };

    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(&expected) {
        return Err(ProtocolError::IntegrityFailure {
            name: entry.name.clone(),
            expected,
            actual,
        });
    }
    Ok(received)
}

/// Checks that the deepest existing ancestor of `dir` resolves inside
/// `dest_dir`, so a symlinked directory on the way down cannot lead elsewhere.
async fn ensure_inside(dest_dir: &Path, dir: &Path, name: &str) -> Result<()> {
    let root = fs::canonicalize(dest_dir).await?;
    for ancestor in dir.ancestors() {
        if let Ok(resolved) = fs::canonicalize(ancestor).await {
            if resolved.starts_with(&root) {
                return Ok(());
            }
            break;
        }
    }
    Err(ProtocolError::PathOutsideRoot(name.to_string()))
}

fn partial_path(destination: &Path) -> PathBuf {
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let unique = PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
    destination.with_file_name(format!(
        ".{}.{}-{}{}",
        file_name,
        std::process::id(),
        unique,
        PARTIAL_SUFFIX
    ))
}

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use encoding_rs::{Encoding, UTF_8};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::task::TaskOutput;

/// Where a task puts the bytes it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTarget {
    Memory,
    File(PathBuf),
}

impl TaskTarget {
    pub(crate) fn open(&self, size_hint: Option<u64>) -> CoreResult<Sink> {
        match self {
            TaskTarget::Memory => Ok(Sink::Memory(MemorySink::new(size_hint))),
            TaskTarget::File(path) => FileSink::create(path).map(Sink::File),
        }
    }
}

pub(crate) enum Sink {
    Memory(MemorySink),
    File(FileSink),
}

impl Sink {
    pub(crate) fn write_chunk(&mut self, chunk: &[u8]) -> CoreResult<()> {
        match self {
            Sink::Memory(sink) => {
                sink.buffer.extend_from_slice(chunk);
                Ok(())
            }
            Sink::File(sink) => sink
                .file
                .write_all(chunk)
                .map_err(|err| CoreError::transfer(format!("write {}: {}", sink.part.display(), err))),
        }
    }

    pub(crate) fn finish(self, content_type: Option<&str>) -> CoreResult<TaskOutput> {
        match self {
            Sink::Memory(sink) => Ok(TaskOutput::Text(Arc::from(decode_text(
                &sink.buffer,
                content_type,
            )))),
            Sink::File(sink) => sink.finish(),
        }
    }

    /// Throws away everything written so far.
    pub(crate) fn discard(self) {
        if let Sink::File(sink) = self {
            sink.discard();
        }
    }
}

pub(crate) struct MemorySink {
    buffer: Vec<u8>,
}

// caps the up-front allocation when the server announces a huge body
const MAX_PREALLOC: u64 = 1024 * 1024;

impl MemorySink {
    fn new(size_hint: Option<u64>) -> Self {
        let capacity = size_hint.unwrap_or(0).min(MAX_PREALLOC) as usize;
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }
}

/// Writes into `<dest>.part` and renames over the destination only once the
/// body is complete, so an existing file survives a failed download.
pub(crate) struct FileSink {
    path: PathBuf,
    part: PathBuf,
    file: File,
}

impl FileSink {
    fn create(path: &Path) -> CoreResult<Self> {
        let part = part_path(path);
        let file = File::create(&part)
            .map_err(|err| CoreError::transfer(format!("create {}: {}", part.display(), err)))?;
        Ok(Self {
            path: path.to_path_buf(),
            part,
            file,
        })
    }

    fn finish(mut self) -> CoreResult<TaskOutput> {
        let result = self.file.flush().and_then(|_| self.file.sync_all());
        if let Err(err) = result {
            let message = format!("flush {}: {}", self.part.display(), err);
            self.discard();
            return Err(CoreError::transfer(message));
        }
        let FileSink { path, part, file } = self;
        drop(file);
        if let Err(err) = fs::rename(&part, &path) {
            remove_part(&part);
            return Err(CoreError::transfer(format!(
                "move {} to {}: {}",
                part.display(),
                path.display(),
                err
            )));
        }
        Ok(TaskOutput::File(path))
    }

    fn discard(self) {
        let FileSink { part, file, .. } = self;
        drop(file);
        remove_part(&part);
    }
}

pub(crate) fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn remove_part(part: &Path) {
    match fs::remove_file(part) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %part.display(), error = %err, "failed to remove partial file"),
    }
}

/// Decodes a body using the `charset` of its content type, a byte order mark,
/// or UTF-8, in that order. Malformed sequences become U+FFFD.
pub fn decode_text(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_label)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    // decode() lets a BOM override the declared encoding
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

fn charset_label(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_declared_charset() {
        let latin1 = [0x63, 0x61, 0x66, 0xE9];
        assert_eq!(decode_text(&latin1, Some("text/plain; charset=ISO-8859-1")), "café");
        assert_eq!(decode_text(&latin1, Some("text/plain; Charset=\"latin1\"")), "café");
    }

    #[test]
    fn falls_back_to_bom_then_utf8() {
        let utf16 = [0xFF, 0xFE, b'h', 0x00, b'i', 0x00];
        assert_eq!(decode_text(&utf16, Some("text/plain")), "hi");
        assert_eq!(decode_text("héllo".as_bytes(), None), "héllo");
        assert_eq!(decode_text(&[0x66, 0xFF], None), "f\u{FFFD}");
    }

    #[test]
    fn unknown_charset_uses_utf8() {
        assert_eq!(decode_text(b"plain", Some("text/plain; charset=bogus")), "plain");
    }

    #[test]
    fn file_sink_discard_removes_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let mut sink = TaskTarget::File(path.clone()).open(None).unwrap();
        sink.write_chunk(b"half").unwrap();
        assert!(part_path(&path).exists());
        assert!(!path.exists());
        sink.discard();
        assert!(!part_path(&path).exists());
        assert!(!path.exists());
    }

    #[test]
    fn discard_keeps_previous_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        fs::write(&path, b"previous copy").unwrap();
        let mut sink = TaskTarget::File(path.clone()).open(None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"previous copy");
        sink.write_chunk(b"new but").unwrap();
        sink.discard();
        assert_eq!(fs::read(&path).unwrap(), b"previous copy");
    }

    #[test]
    fn part_file_sits_next_to_destination() {
        assert_eq!(
            part_path(Path::new("/data/out.bin")),
            PathBuf::from("/data/out.bin.part")
        );
    }

    #[test]
    fn file_sink_finish_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.bin");
        let mut sink = TaskTarget::File(path.clone()).open(Some(4)).unwrap();
        sink.write_chunk(b"done").unwrap();
        let output = sink.finish(None).unwrap();
        assert_eq!(output, TaskOutput::File(path.clone()));
        assert_eq!(fs::read(&path).unwrap(), b"done");
        assert!(!part_path(&path).exists());
    }
}

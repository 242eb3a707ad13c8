//! # Byte Sources
//!
//! The engine reads containers through an opaque seekable byte source so
//! plain files, in-memory buffers and archive members all look the same.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::source::MediaError;

// ============================================================================
// ByteSource
// ============================================================================

/// Anything the demuxer can read a container from
pub trait ByteSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteSource for T {}

// ============================================================================
// Shared Stream Handle
// ============================================================================

/// Cloneable handle over a single shared byte source.
///
/// The demuxer owns one handle; `MediaSource::rewind` takes another to
/// seek back to zero and reopen. The mutex serializes the cursor.
pub(crate) struct SharedStream {
    inner: Arc<Mutex<Box<dyn ByteSource>>>,
}

impl SharedStream {
    pub(crate) fn new(inner: Arc<Mutex<Box<dyn ByteSource>>>) -> Self {
        Self { inner }
    }
}

impl Clone for SharedStream {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Read for SharedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }
}

impl Seek for SharedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.lock().seek(pos)
    }
}

// ============================================================================
// Archive Members
// ============================================================================

/// Extract one member of a ZIP archive into an in-memory byte source.
///
/// Preview clips often ship inside theme packs; the member is read fully
/// up front so the demuxer can seek freely.
pub fn open_archive_member<R: Read + Seek>(
    archive: R,
    member: &str,
) -> Result<Cursor<Vec<u8>>, MediaError> {
    let mut archive = zip::ZipArchive::new(archive)
        .map_err(|e| MediaError::Archive(format!("open failed: {e}")))?;
    let mut file = archive
        .by_name(member)
        .map_err(|e| MediaError::Archive(format!("member '{member}': {e}")))?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    debug!("extracted archive member '{}' ({} bytes)", member, data.len());

    Ok(Cursor::new(data))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn make_archive() -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("clip.webm", options).unwrap();
        writer.write_all(b"not really webm").unwrap();
        writer.start_file("readme.txt", options).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_archive_member_roundtrip() {
        let mut archive = make_archive();
        archive.set_position(0);

        let mut member = open_archive_member(archive, "clip.webm").unwrap();
        let mut data = Vec::new();
        member.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"not really webm");

        // The extracted member is independently seekable
        member.seek(SeekFrom::Start(4)).unwrap();
        let mut tail = Vec::new();
        member.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, b"really webm");
    }

    #[test]
    fn test_missing_member_is_an_error() {
        let mut archive = make_archive();
        archive.set_position(0);
        assert!(open_archive_member(archive, "nope.mkv").is_err());
    }

    #[test]
    fn test_shared_stream_serializes_cursor() {
        let raw: Box<dyn ByteSource> = Box::new(Cursor::new(b"abcdef".to_vec()));
        let shared = Arc::new(Mutex::new(raw));

        let mut a = SharedStream::new(shared.clone());
        let mut b = a.clone();

        let mut buf = [0u8; 3];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        // The clone shares the same cursor position
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"def");

        b.seek(SeekFrom::Start(0)).unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}

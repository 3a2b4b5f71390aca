//! Output sinks for the recorder.
//!
//! A sink receives the already-encoded header once, then opaque body bytes,
//! and finally a close-time header patch. Buffering policy belongs to the
//! recorder; sinks only move bytes. The default sink writes a plain file,
//! [`CompressedFileSink`] wraps the record body (never the header) in a
//! zlib stream, and [`CollectSink`] gathers everything into memory for
//! in-process captures and tests.

use std::{
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use flate2::{Compression, write::ZlibEncoder};

/// Destination of an encoded capture.
///
/// Call order is fixed: `write_header` once, any number of `append`/`flush`
/// calls, `finalize` once, then optionally `patch_header`. Sinks that
/// cannot rewrite their output (e.g. a socket) report
/// [`io::ErrorKind::Unsupported`] from `patch_header` and the capture
/// simply keeps its open-time header.
pub trait RecordSink: Send {
    /// Writes the textual header. Called exactly once, first.
    fn write_header(&mut self, header: &[u8]) -> io::Result<()>;

    /// Appends encoded record bytes to the body.
    fn append(&mut self, body: &[u8]) -> io::Result<()>;

    /// Pushes buffered bytes towards the backing store.
    fn flush(&mut self) -> io::Result<()>;

    /// Terminates the body (finishing any compression stream) and flushes.
    fn finalize(&mut self) -> io::Result<()>;

    /// Rewrites the header region in place. `header` must have the same
    /// length as the header originally written; the fixed-width patched
    /// fields guarantee that.
    fn patch_header(&mut self, header: &[u8]) -> io::Result<()>;
}

/// Plain uncompressed file sink.
#[derive(Debug)]
pub struct FileSink {
    file: File,
    header_len: u64,
}

impl FileSink {
    /// Creates the capture file. Refuses to clobber an existing file unless
    /// `overwrite` is set; the caller maps that to a setup error.
    pub fn create(path: &Path, overwrite: bool) -> io::Result<Self> {
        let file = open_capture_file(path, overwrite)?;
        Ok(Self { file, header_len: 0 })
    }
}

fn open_capture_file(path: &Path, overwrite: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).read(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path)
}

impl RecordSink for FileSink {
    fn write_header(&mut self, header: &[u8]) -> io::Result<()> {
        self.header_len = header.len() as u64;
        self.file.write_all(header)
    }

    fn append(&mut self, body: &[u8]) -> io::Result<()> {
        self.file.write_all(body)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn patch_header(&mut self, header: &[u8]) -> io::Result<()> {
        if header.len() as u64 != self.header_len {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "header length changed"));
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(header)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.flush()
    }
}

/// File sink whose record body is a zlib stream. The header stays
/// uncompressed so it remains grep-able and patchable.
pub struct CompressedFileSink {
    state: CompressedState,
    header_len: u64,
}

enum CompressedState {
    /// Header not written yet.
    Open(File),
    /// Body in progress.
    Compressing(ZlibEncoder<File>),
    /// Body terminated; the file is available again for header patching.
    Finished(File),
    /// Transient marker while moving between states.
    Poisoned,
}

impl CompressedFileSink {
    pub fn create(path: &Path, overwrite: bool) -> io::Result<Self> {
        let file = open_capture_file(path, overwrite)?;
        Ok(Self {
            state: CompressedState::Open(file),
            header_len: 0,
        })
    }
}

impl RecordSink for CompressedFileSink {
    fn write_header(&mut self, header: &[u8]) -> io::Result<()> {
        match std::mem::replace(&mut self.state, CompressedState::Poisoned) {
            CompressedState::Open(mut file) => {
                self.header_len = header.len() as u64;
                file.write_all(header)?;
                self.state = CompressedState::Compressing(ZlibEncoder::new(file, Compression::default()));
                Ok(())
            }
            other => {
                self.state = other;
                Err(io::Error::new(io::ErrorKind::InvalidInput, "header already written"))
            }
        }
    }

    fn append(&mut self, body: &[u8]) -> io::Result<()> {
        match &mut self.state {
            CompressedState::Compressing(encoder) => encoder.write_all(body),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "sink not accepting records")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            CompressedState::Compressing(encoder) => encoder.flush(),
            _ => Ok(()),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, CompressedState::Poisoned) {
            CompressedState::Compressing(encoder) => {
                let mut file = encoder.finish()?;
                file.flush()?;
                self.state = CompressedState::Finished(file);
                Ok(())
            }
            other => {
                self.state = other;
                Err(io::Error::new(io::ErrorKind::InvalidInput, "sink not finalizable"))
            }
        }
    }

    fn patch_header(&mut self, header: &[u8]) -> io::Result<()> {
        match &mut self.state {
            CompressedState::Finished(file) => {
                if header.len() as u64 != self.header_len {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "header length changed"));
                }
                file.seek(SeekFrom::Start(0))?;
                file.write_all(header)?;
                file.seek(SeekFrom::End(0))?;
                file.flush()
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "body still open")),
        }
    }
}

/// Sink that collects the whole capture into a shared byte buffer.
///
/// Uses interior mutability so the bytes stay reachable through a
/// [`CollectSink::handle`] after the tracker has consumed the sink itself.
#[derive(Debug, Default)]
pub struct CollectSink {
    buffer: Arc<Mutex<Vec<u8>>>,
    header_len: usize,
}

impl CollectSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the collected bytes, valid after teardown.
    #[must_use]
    pub fn handle(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buffer)
    }
}

fn lock_buffer(buffer: &Mutex<Vec<u8>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    // A panic while holding the buffer lock cannot corrupt a byte vector.
    buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl RecordSink for CollectSink {
    fn write_header(&mut self, header: &[u8]) -> io::Result<()> {
        self.header_len = header.len();
        lock_buffer(&self.buffer).extend_from_slice(header);
        Ok(())
    }

    fn append(&mut self, body: &[u8]) -> io::Result<()> {
        lock_buffer(&self.buffer).extend_from_slice(body);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn patch_header(&mut self, header: &[u8]) -> io::Result<()> {
        let mut buffer = lock_buffer(&self.buffer);
        if header.len() != self.header_len || buffer.len() < header.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "header length changed"));
        }
        buffer[..header.len()].copy_from_slice(header);
        Ok(())
    }
}

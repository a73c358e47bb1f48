//! Process-wide output stream shared by every tool.
//!
//! All writes go through one [`parking_lot::Mutex`], so a line (or a whole
//! report written via [`OutputSink::finish`]) never interleaves with output
//! from another thread. Single lines are flushed as they are written; a
//! report goes out in one piece when the sink is finished. Writes are
//! best-effort: an I/O error clears the health flag and is logged once, it
//! never reaches the profiled program.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::error::{ProfileError, Result};

/// Serialized, line-atomic output stream.
pub struct OutputSink {
    stream: Mutex<Option<Box<dyn Write + Send>>>,
    healthy: AtomicBool,
}

impl OutputSink {
    /// Create (truncate) `path` and buffer writes to it.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|source| ProfileError::OpenOutput {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    pub fn from_writer<W: Write + Send + 'static>(w: W) -> Self {
        OutputSink {
            stream: Mutex::new(Some(Box::new(w))),
            healthy: AtomicBool::new(true),
        }
    }

    /// Write and flush one line under the lock.
    pub fn write_line(&self, args: fmt::Arguments<'_>) {
        let mut stream = self.stream.lock();
        let res = match stream.as_mut() {
            Some(w) => writeln!(w, "{}", args).and_then(|_| w.flush()),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "output already closed")),
        };
        self.note(res);
    }

    /// Run `f` on the stream, then flush and close it, all in one critical section.
    pub fn finish<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let mut stream = self.stream.lock();
        let res = match stream.take() {
            Some(mut w) => f(&mut *w).and_then(|_| w.flush()),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "output already closed")),
        };
        self.note(res);
    }

    /// Flush and close the stream. Later writes are dropped.
    pub fn close(&self) {
        self.finish(|_| Ok(()));
    }

    pub fn is_closed(&self) -> bool {
        self.stream.lock().is_none()
    }

    /// False once any write, flush or close has failed.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn note(&self, res: io::Result<()>) {
        if let Err(e) = res {
            if self.healthy.swap(false, Ordering::Relaxed) {
                warn!("profile output degraded: {}", e);
            }
        }
    }
}

/// Cloneable in-memory writer; every clone appends to the same buffer.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self { Self::default() }

    /// Buffer contents decoded as UTF-8 (lossy).
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    #[test]
    fn test_lines_and_finish() {
        let buf = SharedBuffer::new();
        let sink = OutputSink::from_writer(buf.clone());
        sink.write_line(format_args!("thread begin {}", 0));
        sink.finish(|w| writeln!(w, "done"));
        assert!(sink.is_closed());
        assert!(sink.is_healthy());
        assert_eq!(buf.lines(), vec!["thread begin 0", "done"]);
    }

    #[test]
    fn test_write_after_close_is_dropped() {
        let buf = SharedBuffer::new();
        let sink = OutputSink::from_writer(buf.clone());
        sink.close();
        sink.write_line(format_args!("late"));
        assert_eq!(buf.contents(), "");
        assert!(!sink.is_healthy());
    }

    #[test]
    fn test_io_error_clears_health() {
        let sink = OutputSink::from_writer(FailingWriter);
        assert!(sink.is_healthy());
        sink.write_line(format_args!("x"));
        assert!(!sink.is_healthy());
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out_42");
        let sink = OutputSink::create(&path).unwrap();
        sink.write_line(format_args!("Id,Instructions"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Id,Instructions\n");
        sink.close();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Id,Instructions\n");
    }

    #[test]
    fn test_lines_never_interleave() {
        let buf = SharedBuffer::new();
        let sink = Arc::new(OutputSink::from_writer(buf.clone()));
        std::thread::scope(|s| {
            for t in 0..4 {
                let sink = &sink;
                s.spawn(move || {
                    for i in 0..200 {
                        sink.write_line(format_args!("thread {} line {}", t, i));
                    }
                });
            }
        });
        let lines = buf.lines();
        assert_eq!(lines.len(), 800);
        assert!(lines.iter().all(|l| l.starts_with("thread ") && l.contains(" line ")));
    }
}

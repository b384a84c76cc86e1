//! in-memory pipe between a producer thread and a consumer
//!
//! the writer pushes owned chunks through a bounded channel, so a slow
//! consumer applies backpressure. the writer must be closed explicitly,
//! either cleanly (the reader sees EOF) or with an error (the reader sees
//! that error). a writer dropped without closing is reported to the reader
//! as a truncated stream.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

type Chunk = io::Result<Vec<u8>>;

/// create a connected writer/reader pair holding at most `capacity` chunks
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(capacity);
    (
        PipeWriter {
            tx: Some(tx),
            closed: false,
        },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
            failed: None,
            eof: false,
        },
    )
}

pub struct PipeWriter {
    tx: Option<SyncSender<Chunk>>,
    closed: bool,
}

impl PipeWriter {
    /// finish the stream; the reader sees EOF after the buffered data
    pub fn close(&mut self) {
        self.closed = true;
        self.tx.take();
    }

    /// finish the stream with an error the reader will return
    pub fn close_with_error(&mut self, err: io::Error) {
        self.closed = true;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write to closed pipe"))?;
        tx.send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.close_with_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe writer dropped without closing",
            ));
        }
    }
}

pub struct PipeReader {
    rx: Receiver<Chunk>,
    chunk: Vec<u8>,
    pos: usize,
    /// a producer error, repeated on every later read
    failed: Option<(io::ErrorKind, String)>,
    eof: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if let Some((kind, message)) = &self.failed {
                return Err(io::Error::new(*kind, message.clone()));
            }
            if self.eof {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.failed = Some((e.kind(), e.to_string()));
                    return Err(e);
                }
                Err(_) => {
                    self.eof = true;
                    return Ok(0);
                }
            }
        }
    }
}

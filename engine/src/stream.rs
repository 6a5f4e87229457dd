//! Chunked file reads with a stall limit.
//!
//! The file is opened and read on a helper thread that hands chunks over a
//! small bounded channel. The consumer waits at most `stall_limit` for each
//! chunk, so a read that stops making progress surfaces as
//! `EngineError::Timeout` while a slow but steady read never does.
//!
//! A helper blocked inside the OS call cannot be interrupted. It exits on its
//! own once that call returns and finds the consumer gone.

use crate::error::EngineError;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Chunks buffered ahead of the consumer.
const READ_AHEAD: usize = 2;

enum Message {
    Chunk(Vec<u8>),
    Eof,
    Failed(io::Error),
}

pub(crate) struct ChunkReader {
    path: PathBuf,
    stall_limit: Duration,
    chunks: Receiver<Message>,
    done: bool,
}

impl ChunkReader {
    /// Start reading `path` in chunks of `chunk_size` bytes.
    pub(crate) fn open(
        path: &Path,
        chunk_size: usize,
        stall_limit: Duration,
    ) -> Result<Self, EngineError> {
        let owned = path.to_path_buf();
        Self::spawn(path, chunk_size, stall_limit, move || File::open(owned))
    }

    /// Start reading whatever `open` returns. Opening happens on the helper
    /// thread too, so a source that blocks on open counts as a stall.
    pub(crate) fn spawn<R, F>(
        path: &Path,
        chunk_size: usize,
        stall_limit: Duration,
        open: F,
    ) -> Result<Self, EngineError>
    where
        R: Read,
        F: FnOnce() -> io::Result<R> + Send + 'static,
    {
        let (sender, chunks) = crossbeam_channel::bounded(READ_AHEAD);

        thread::Builder::new()
            .name("takeout-read".to_string())
            .spawn(move || {
                let mut source = match open() {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = sender.send(Message::Failed(e));
                        return;
                    }
                };
                loop {
                    let mut buffer = vec![0u8; chunk_size];
                    let message = match source.read(&mut buffer) {
                        Ok(0) => Message::Eof,
                        Ok(n) => {
                            buffer.truncate(n);
                            Message::Chunk(buffer)
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => Message::Failed(e),
                    };
                    let last = !matches!(message, Message::Chunk(_));
                    if sender.send(message).is_err() || last {
                        break;
                    }
                }
            })
            .map_err(|e| EngineError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(ChunkReader {
            path: path.to_path_buf(),
            stall_limit,
            chunks,
            done: false,
        })
    }

    /// Next chunk, or `None` at end of file.
    ///
    /// # Errors
    /// `Timeout` when no chunk arrives within the stall limit, `ReadError`
    /// when opening or reading fails.
    pub(crate) fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, EngineError> {
        if self.done {
            return Ok(None);
        }
        match self.chunks.recv_timeout(self.stall_limit) {
            Ok(Message::Chunk(chunk)) => Ok(Some(chunk)),
            Ok(Message::Eof) => {
                self.done = true;
                Ok(None)
            }
            Ok(Message::Failed(e)) => {
                self.done = true;
                Err(EngineError::ReadError {
                    path: self.path.clone(),
                    source: e,
                })
            }
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout {
                path: self.path.clone(),
                secs: self.stall_limit.as_secs(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Err(EngineError::ReadError {
                    path: self.path.clone(),
                    source: io::Error::new(io::ErrorKind::Other, "reader thread stopped"),
                })
            }
        }
    }
}

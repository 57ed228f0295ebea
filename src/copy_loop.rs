// com2tcp - Duplex Copy Loop
// One thread relaying a readable stream into a writable one

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::hexdump::format_hex;
use crate::logger::{LogSink, LOG_DEBUG, LOG_NOTICE};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub chunk_size: usize,
    /// When set, every relayed chunk is logged as `"<label> <hex bytes>"`.
    pub dump_label: Option<String>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions { chunk_size: DEFAULT_CHUNK_SIZE, dump_label: None }
    }
}

#[derive(Debug)]
pub enum StopReason {
    Cancelled,
    EndOfStream,
    ReadError(io::Error),
    WriteError(io::Error),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "stopped"),
            StopReason::EndOfStream => write!(f, "end of stream"),
            StopReason::ReadError(e) => write!(f, "read error: {}", e),
            StopReason::WriteError(e) => write!(f, "write error: {}", e),
        }
    }
}

/// Copies `source` into `target` chunk by chunk until cancelled, end of
/// stream, or an I/O error. Errors end the loop and are only reported back.
pub fn run_copy<R: Read, W: Write>(
    mut source: R,
    mut target: W,
    options: &CopyOptions,
    cancel: &CancelToken,
    logger: &dyn LogSink,
) -> StopReason {
    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    loop {
        if cancel.is_cancelled() {
            return StopReason::Cancelled;
        }
        let n = match source.read(&mut buffer) {
            Ok(0) => return StopReason::EndOfStream,
            Ok(n) => n,
            Err(_) if cancel.is_cancelled() => return StopReason::Cancelled,
            Err(e) => return StopReason::ReadError(e),
        };
        if let Err(e) = target.write_all(&buffer[..n]).and_then(|_| target.flush()) {
            return StopReason::WriteError(e);
        }
        if let Some(ref label) = options.dump_label {
            logger.log(&format!("{} {}", label, format_hex(&buffer[..n])), LOG_NOTICE);
        }
    }
}

/// A running copy loop. Stopping is one-shot; a stopped loop never resumes.
pub struct CopyLoop {
    cancel: CancelToken,
    interrupt: Option<Box<dyn Fn() + Send>>,
    handle: Option<JoinHandle<()>>,
}

impl CopyLoop {
    pub fn spawn<R, W>(
        name: &str,
        source: R,
        target: W,
        options: CopyOptions,
        cancel: CancelToken,
        logger: Arc<dyn LogSink>,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let loop_cancel = cancel.clone();
        let loop_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let reason = run_copy(source, target, &options, &loop_cancel, logger.as_ref());
                logger.log(&format!("{}: copy loop finished ({})", loop_name, reason), LOG_DEBUG);
            })?;
        Ok(CopyLoop {
            cancel,
            interrupt: None,
            handle: Some(handle),
        })
    }

    /// Extra action run on `stop`, used to unblock a source the token cannot
    /// reach (e.g. shutting down a socket the loop is reading).
    pub fn with_interrupt(mut self, interrupt: impl Fn() + Send + 'static) -> Self {
        self.interrupt = Some(Box::new(interrupt));
        self
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(ref interrupt) = self.interrupt {
            interrupt();
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Waits for the loop thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CopyLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

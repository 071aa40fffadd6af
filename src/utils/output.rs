/// Bounded, order-preserving capture of a child's stdout and stderr
///
/// One reader thread per pipe forwards chunks to a collector thread. The
/// collector keeps bytes until the shared budget is spent, then keeps
/// draining so the child never blocks on a full pipe.
use crate::config::types::{OutputSegment, StreamKind};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CHUNK_SIZE: usize = 8192;

/// Result of a capture.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub segments: Vec<OutputSegment>,
    /// Bytes were discarded because the budget ran out.
    pub truncated: bool,
    /// Collection stopped before both pipes reached EOF.
    pub incomplete: bool,
}

impl CapturedOutput {
    fn accept(&mut self, stream: StreamKind, data: &[u8], budget: usize) {
        let used = self.stdout.len() + self.stderr.len();
        let room = budget.saturating_sub(used);
        let keep = data.len().min(room);
        if keep < data.len() {
            self.truncated = true;
        }
        if keep == 0 {
            return;
        }
        let target = match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        target.extend_from_slice(&data[..keep]);
        match self.segments.last_mut() {
            Some(last) if last.stream == stream => last.len += keep,
            _ => self.segments.push(OutputSegment { stream, len: keep }),
        }
    }
}

struct Chunk {
    stream: StreamKind,
    data: Vec<u8>,
}

/// Running capture; call `finish` once the process is gone.
pub struct OutputCapture {
    state: Arc<Mutex<CapturedOutput>>,
    done: Receiver<()>,
}

impl OutputCapture {
    /// Start reading both pipes. `budget` caps stdout and stderr together.
    pub fn start<O, E>(stdout: Option<O>, stderr: Option<E>, budget: usize) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (chunk_tx, chunk_rx) = bounded::<Chunk>(16);
        let (done_tx, done_rx) = bounded::<()>(1);
        let state = Arc::new(Mutex::new(CapturedOutput::default()));

        if let Some(stdout) = stdout {
            spawn_reader(stdout, StreamKind::Stdout, chunk_tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_reader(stderr, StreamKind::Stderr, chunk_tx.clone());
        }
        drop(chunk_tx);

        let collector_state = Arc::clone(&state);
        thread::spawn(move || {
            for chunk in chunk_rx.iter() {
                if let Ok(mut output) = collector_state.lock() {
                    output.accept(chunk.stream, &chunk.data, budget);
                }
            }
            let _ = done_tx.send(());
        });

        Self { state, done: done_rx }
    }

    /// Wait up to `timeout` for both pipes to close and return what was captured.
    ///
    /// A descendant that escaped the process group can hold a pipe open; in
    /// that case the capture so far is returned and marked incomplete.
    pub fn finish(self, timeout: Duration) -> CapturedOutput {
        let incomplete = match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => true,
        };
        let mut output = match self.state.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        output.incomplete = incomplete;
        output
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R, stream: StreamKind, tx: Sender<Chunk>) {
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Chunk {
                        stream,
                        data: buf[..n].to_vec(),
                    };
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{:?} reader stopped: {}", stream, e);
                    break;
                }
            }
        }
    });
}

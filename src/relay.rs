//! Bidirectional byte relay.
//!
//! Each direction runs as its own task: read from the source, hand the bytes
//! to the optional tee, write them to the destination. When the source ends
//! (EOF or error alike) the destination's write side is shut down, which leaves
//! the opposite direction running until its own source ends.

use std::{fmt, io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

pub const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to remote.
    Upstream,
    /// Remote to client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("upstream"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// Diagnostic sink receiving a copy of every relayed chunk.
///
/// Called before the chunk is forwarded. A failing tee never affects
/// forwarding.
pub trait Tee: Send + Sync {
    fn tee(&self, direction: Direction, data: &[u8]) -> io::Result<()>;
}

/// Forwards teed bytes from both directions, in order, to an async writer.
///
/// Writing happens on a dedicated task, so a stalled writer never blocks the
/// relay tasks or the runtime's worker threads.
#[derive(Debug, Clone)]
pub struct WriterTee {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl WriterTee {
    /// Must be called from within a tokio runtime.
    pub fn spawn<W>(mut writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(chunk) = receiver.recv().await {
                if let Err(e) = writer.write_all(&chunk).await {
                    warn!(error = %e, "Failed to write dumped traffic; dumping stopped");
                    return;
                }
                if let Err(e) = writer.flush().await {
                    warn!(error = %e, "Failed to flush dumped traffic; dumping stopped");
                    return;
                }
            }
        });
        Self { sender }
    }

    /// Raw relayed bytes go to standard output.
    pub fn stdout() -> Self {
        Self::spawn(tokio::io::stdout())
    }
}

impl Tee for WriterTee {
    fn tee(&self, _direction: Direction, data: &[u8]) -> io::Result<()> {
        self.sender
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "dump writer has stopped"))
    }
}

/// Copies `reader` into `writer` until the reader ends, then shuts the writer down.
///
/// Returns the number of bytes forwarded.
pub async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    tee: Option<&dyn Tee>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!(%direction, "Source closed");
                break;
            }
            Ok(n) => {
                let data = &buffer[..n];
                trace!(%direction, bytes = n, "Forwarding data");
                if let Some(tee) = tee {
                    if let Err(e) = tee.tee(direction, data) {
                        debug!(%direction, error = %e, "Failed to dump traffic");
                    }
                }
                if let Err(e) = writer.write_all(data).await {
                    debug!(%direction, error = %e, bytes = n, "Failed to write to destination");
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!(%direction, error = %e, "Failed to read from source");
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(%direction, error = %e, "Failed to shut down destination");
    }
    total
}

/// Bytes forwarded in each direction once a relay has finished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayTotals {
    pub upstream: u64,
    pub downstream: u64,
}

/// The two tasks of a running relay.
///
/// Dropping the handle detaches both tasks; they keep running to completion.
pub struct RelayHandle {
    upstream: JoinHandle<u64>,
    downstream: JoinHandle<u64>,
}

impl RelayHandle {
    /// Waits until both directions have finished.
    pub async fn join(self) -> RelayTotals {
        let (upstream, downstream) = tokio::join!(self.upstream, self.downstream);
        RelayTotals {
            upstream: finished(Direction::Upstream, upstream),
            downstream: finished(Direction::Downstream, downstream),
        }
    }
}

fn finished(direction: Direction, result: Result<u64, tokio::task::JoinError>) -> u64 {
    result.unwrap_or_else(|e| {
        warn!(%direction, error = %e, "Relay task failed");
        0
    })
}

/// Starts relaying between `local` and `remote` in both directions.
pub fn spawn<L, R>(local: L, remote: R, tee: Option<Arc<dyn Tee>>) -> RelayHandle
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local_reader, local_writer) = tokio::io::split(local);
    let (remote_reader, remote_writer) = tokio::io::split(remote);
    let upstream_tee = tee.clone();
    let downstream_tee = tee;

    let upstream = tokio::spawn(async move {
        copy_direction(
            local_reader,
            remote_writer,
            Direction::Upstream,
            upstream_tee.as_deref(),
        )
        .await
    });
    let downstream = tokio::spawn(async move {
        copy_direction(
            remote_reader,
            local_writer,
            Direction::Downstream,
            downstream_tee.as_deref(),
        )
        .await
    });

    RelayHandle {
        upstream,
        downstream,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Direction, Tee};
    use std::{io, sync::Mutex};

    /// Tee that keeps every chunk in memory, per direction.
    #[derive(Default)]
    pub struct MemoryTee {
        upstream: Mutex<Vec<u8>>,
        downstream: Mutex<Vec<u8>>,
    }

    impl MemoryTee {
        pub fn bytes(&self, direction: Direction) -> Vec<u8> {
            match direction {
                Direction::Upstream => self.upstream.lock().unwrap().clone(),
                Direction::Downstream => self.downstream.lock().unwrap().clone(),
            }
        }
    }

    impl Tee for MemoryTee {
        fn tee(&self, direction: Direction, data: &[u8]) -> io::Result<()> {
            let sink = match direction {
                Direction::Upstream => &self.upstream,
                Direction::Downstream => &self.downstream,
            };
            sink.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }
}

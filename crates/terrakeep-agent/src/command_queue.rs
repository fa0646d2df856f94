use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use terrakeep_process::QueueOccupancy;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;

/// Encodes a command the way the server's console reader expects it: every
/// character is followed by a zero byte.
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmd.len() * 2);
    let mut buf = [0u8; 4];
    for c in cmd.chars() {
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        out.push(0);
    }
    out
}

#[derive(Debug)]
struct QueueInner {
    tx: mpsc::Sender<String>,
    urgent: mpsc::Sender<String>,
    in_flight: Arc<AtomicUsize>,
}

/// Outgoing console commands, bounded by the number accepted but not yet
/// written. Each [`CommandQueue::reset`] starts a fresh channel and counter so
/// a writer from a previous run can never touch the new count.
#[derive(Debug)]
pub struct CommandQueue {
    max: usize,
    inner: Mutex<Option<QueueInner>>,
}

/// A command picked up by the writer.
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Queued(String),
    /// Sent through [`CommandQueue::shutdown`]; jumps the backlog.
    Urgent(String),
}

/// Receiving half handed to the writer task.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<String>,
    urgent: mpsc::Receiver<String>,
    urgent_closed: bool,
    in_flight: Arc<AtomicUsize>,
}

impl CommandReceiver {
    /// Next command to write, urgent ones first. `None` once the queue is
    /// closed and drained.
    pub async fn next(&mut self) -> Option<Outgoing> {
        loop {
            tokio::select! {
                biased;
                cmd = self.urgent.recv(), if !self.urgent_closed => match cmd {
                    Some(cmd) => return Some(Outgoing::Urgent(cmd)),
                    None => self.urgent_closed = true,
                },
                cmd = self.rx.recv() => return cmd.map(Outgoing::Queued),
            }
        }
    }

    /// Drops every queued command, returning how many were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            self.done();
            dropped += 1;
        }
        dropped
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Marks one received command as written (or abandoned).
    pub fn done(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl CommandQueue {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            inner: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<QueueInner>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Replaces any previous channel and returns the receiver for a new writer.
    pub fn reset(&self) -> CommandReceiver {
        let (tx, rx) = mpsc::channel(self.max);
        let (urgent_tx, urgent) = mpsc::channel(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        *self.lock() = Some(QueueInner {
            tx,
            urgent: urgent_tx,
            in_flight: in_flight.clone(),
        });
        CommandReceiver {
            rx,
            urgent,
            urgent_closed: false,
            in_flight,
        }
    }

    /// Closes the queue and hands `cmd` to the writer as its final command.
    /// The writer discards any backlog and writes `cmd` next, regardless of
    /// capacity.
    pub fn shutdown(&self, cmd: impl Into<String>) -> Result<(), SupervisorError> {
        let mut line = cmd.into();
        let Some(q) = self.lock().take() else {
            return Err(SupervisorError::QueueClosed);
        };
        line.push('\n');
        q.urgent
            .try_send(line)
            .map_err(|_| SupervisorError::QueueClosed)
    }

    /// Stops accepting commands until the next reset.
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn in_flight(&self) -> usize {
        self.lock()
            .as_ref()
            .map(|q| q.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn occupancy(&self) -> QueueOccupancy {
        QueueOccupancy {
            current: u32::try_from(self.in_flight()).unwrap_or(u32::MAX),
            max: u32::try_from(self.max).unwrap_or(u32::MAX),
        }
    }

    /// Queues `cmd` plus a newline. A full or closed queue drops the command
    /// with a warning; the error is informational and never needs handling.
    pub fn enqueue(&self, cmd: impl Into<String>) -> Result<(), SupervisorError> {
        let cmd = cmd.into();
        let guard = self.lock();
        let Some(q) = guard.as_ref() else {
            tracing::warn!(command = %cmd, "server is not accepting commands, dropped");
            return Err(SupervisorError::QueueClosed);
        };

        let reserved = q
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            });
        if reserved.is_err() {
            tracing::warn!(
                command = %cmd,
                max = self.max,
                "attempted to run more than the maximum amount of commands"
            );
            return Err(SupervisorError::QueueCapacityExceeded { max: self.max });
        }

        let mut line = cmd;
        line.push('\n');
        if q.tx.try_send(line).is_err() {
            let _ = q
                .in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            tracing::warn!("command writer has exited, command dropped");
            return Err(SupervisorError::QueueClosed);
        }
        Ok(())
    }
}

/// Writes queued commands to the server's stdin one at a time, waiting `delay`
/// before each write. Exits on cancellation, when the queue is replaced, or
/// when stdin breaks.
pub async fn run_writer<W>(
    mut commands: CommandReceiver,
    mut stdin: W,
    delay: Duration,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    tracing::debug!("command writer started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = commands.next() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let (cmd, urgent) = match next {
            Outgoing::Queued(cmd) => (cmd, false),
            Outgoing::Urgent(cmd) => {
                let dropped = commands.discard_pending();
                if dropped > 0 {
                    tracing::warn!(dropped, "discarded queued commands for shutdown");
                }
                (cmd, true)
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if !urgent {
                    commands.done();
                }
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let bytes = encode_command(&cmd);
        tracing::trace!(command = %cmd.trim_end(), bytes = bytes.len(), "writing command");
        let res = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;
        if !urgent {
            commands.done();
        }

        if let Err(e) = res {
            tracing::warn!(error = %e, "server stdin closed, command writer exiting");
            break;
        }
    }
    tracing::debug!("command writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn encodes_each_char_with_trailing_zero() {
        assert_eq!(
            encode_command("say hi\n"),
            b"s\0a\0y\0 \0h\0i\0\n\0".to_vec()
        );
        assert!(encode_command("").is_empty());
    }

    #[tokio::test]
    async fn in_flight_tracks_accepted_minus_written() {
        let q = CommandQueue::new(10);
        let mut rx = q.reset();
        for i in 0..6 {
            q.enqueue(format!("cmd {i}")).unwrap();
        }
        for _ in 0..2 {
            let c = rx.recv().await.unwrap();
            assert!(c.ends_with('\n'));
            rx.done();
        }
        assert_eq!(q.in_flight(), 4);
        assert_eq!(q.occupancy(), QueueOccupancy { current: 4, max: 10 });
    }

    #[test]
    fn enqueue_beyond_capacity_is_dropped() {
        let q = CommandQueue::new(3);
        let _rx = q.reset();
        for _ in 0..3 {
            q.enqueue("time").unwrap();
        }
        for _ in 0..5 {
            assert!(matches!(
                q.enqueue("time"),
                Err(SupervisorError::QueueCapacityExceeded { max: 3 })
            ));
        }
        assert_eq!(q.in_flight(), 3);
    }

    #[test]
    fn closed_queue_rejects_without_counting() {
        let q = CommandQueue::new(3);
        assert!(matches!(q.enqueue("time"), Err(SupervisorError::QueueClosed)));
        let rx = q.reset();
        drop(rx);
        assert!(matches!(q.enqueue("time"), Err(SupervisorError::QueueClosed)));
        assert_eq!(q.in_flight(), 0);
        q.close();
        assert!(matches!(q.enqueue("time"), Err(SupervisorError::QueueClosed)));
    }

    #[test]
    fn reset_starts_a_fresh_count() {
        let q = CommandQueue::new(2);
        let old = q.reset();
        q.enqueue("a").unwrap();
        q.enqueue("b").unwrap();
        let _new = q.reset();
        assert_eq!(q.in_flight(), 0);
        old.done();
        assert_eq!(q.in_flight(), 0);
        q.enqueue("c").unwrap();
        assert_eq!(q.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_emits_wide_bytes_in_order() {
        let q = CommandQueue::new(10);
        let rx = q.reset();
        let (stdin, mut server_side) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_writer(
            rx,
            stdin,
            Duration::from_millis(500),
            cancel.clone(),
        ));

        q.enqueue("say hi").unwrap();
        q.enqueue("time").unwrap();

        let mut expected = encode_command("say hi\n");
        expected.extend(encode_command("time\n"));
        let mut got = vec![0u8; expected.len()];
        server_side.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        assert_eq!(q.in_flight(), 0);

        cancel.cancel();
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn writer_paces_commands() {
        let q = CommandQueue::new(10);
        let rx = q.reset();
        let (stdin, mut server_side) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        tokio::spawn(run_writer(
            rx,
            stdin,
            Duration::from_millis(500),
            cancel.clone(),
        ));

        let started = tokio::time::Instant::now();
        q.enqueue("a").unwrap();
        q.enqueue("b").unwrap();
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        server_side.read_exact(&mut buf).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1000));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_skips_a_saturated_backlog() {
        let q = CommandQueue::new(3);
        let rx = q.reset();
        for _ in 0..3 {
            q.enqueue("say spam").unwrap();
        }
        assert!(matches!(
            q.enqueue("say more"),
            Err(SupervisorError::QueueCapacityExceeded { .. })
        ));
        q.shutdown("exit").unwrap();
        assert!(matches!(q.enqueue("time"), Err(SupervisorError::QueueClosed)));
        assert!(matches!(q.shutdown("exit"), Err(SupervisorError::QueueClosed)));

        let (stdin, mut server_side) = tokio::io::duplex(1024);
        let writer = tokio::spawn(run_writer(
            rx,
            stdin,
            Duration::from_millis(500),
            CancellationToken::new(),
        ));

        // Only the final command is written, then the writer closes stdin.
        let mut got = Vec::new();
        server_side.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, encode_command("exit\n"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn urgent_command_is_received_first() {
        let q = CommandQueue::new(5);
        let mut rx = q.reset();
        q.enqueue("a").unwrap();
        q.shutdown("exit").unwrap();
        assert_eq!(rx.next().await, Some(Outgoing::Urgent("exit\n".to_string())));
        assert_eq!(rx.discard_pending(), 1);
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn writer_exits_on_cancel() {
        let q = CommandQueue::new(10);
        let rx = q.reset();
        let (stdin, _server_side) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_writer(rx, stdin, Duration::ZERO, cancel.clone()));
        cancel.cancel();
        writer.await.unwrap();
    }
}

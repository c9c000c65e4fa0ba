use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Commit;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::StoreError;

/// Max commands pulled off the channel per wakeup.
const MAX_BATCH: usize = 256;

enum JournalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        snapshot: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Stats {
        response: oneshot::Sender<JournalStats>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    pub appends_since_compact: u64,
    /// Successful fsyncs since the log was opened. Below the number of
    /// appends whenever group commit batched some of them.
    pub syncs: u64,
}

/// A commit queued on the journal. Resolves once it is fsynced.
pub(super) struct Durable(oneshot::Receiver<io::Result<()>>);

impl Durable {
    pub async fn wait(self) -> Result<(), StoreError> {
        self.0.await.map_err(|_| StoreError::Closed)?.map_err(StoreError::Wal)
    }
}

/// Handle to the task that owns the WAL file.
#[derive(Clone)]
pub(super) struct Journal {
    tx: mpsc::Sender<JournalCommand>,
}

impl Journal {
    /// Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> JournalCommand,
    ) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(command(tx)).await.map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Queue a commit behind every commit queued before it. Waiting on the
    /// returned handle is separate so callers can release their locks first
    /// and share one fsync with whoever queues meanwhile.
    pub async fn enqueue(&self, commit: Commit) -> Result<Durable, StoreError> {
        let (response, ack) = oneshot::channel();
        self.tx
            .send(JournalCommand::Append { commit, response })
            .await
            .map_err(|_| StoreError::Closed)?;
        Ok(Durable(ack))
    }

    pub async fn rewrite(&self, snapshot: Vec<Commit>) -> Result<(), StoreError> {
        self.request(|response| JournalCommand::Rewrite { snapshot, response })
            .await?
            .map_err(StoreError::Wal)
    }

    pub async fn stats(&self) -> Result<JournalStats, StoreError> {
        self.request(|response| JournalCommand::Stats { response }).await
    }
}

/// Group commit: every append that queued up while the previous fsync was
/// running goes out under a single fsync. Control commands act as batch
/// boundaries so a rewrite never swallows a pending append.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<JournalCommand>) {
    let mut inbox = Vec::with_capacity(MAX_BATCH);
    let mut batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)> = Vec::new();

    while rx.recv_many(&mut inbox, MAX_BATCH).await > 0 {
        for command in inbox.drain(..) {
            match command {
                JournalCommand::Append { commit, response } => batch.push((commit, response)),
                JournalCommand::Rewrite { snapshot, response } => {
                    flush(&mut wal, &mut batch);
                    let _ = response.send(wal.rewrite(&snapshot));
                }
                JournalCommand::Stats { response } => {
                    flush(&mut wal, &mut batch);
                    let _ = response.send(JournalStats {
                        appends_since_compact: wal.appends_since_compact(),
                        syncs: wal.syncs(),
                    });
                }
            }
        }
        flush(&mut wal, &mut batch);
    }
    tracing::debug!("journal for {} closed", wal.path().display());
}

fn flush(wal: &mut Wal, batch: &mut Vec<(Commit, oneshot::Sender<io::Result<()>>)>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    // A failed flush rolls the whole batch back, so the batch shares one fate.
    let result = batch
        .iter()
        .try_for_each(|(commit, _)| wal.append_buffered(commit))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        wal.discard_pending();
    }

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} commits failed: {e}", batch.len());
    }
    for (_, response) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

//! Progress statistics for a standby-slot rebuild.
//!
//! Grounded in the original implementation's `RegularStats` /
//! `CreateRegularStatsCollector`: individual worker tasks report small
//! per-file records into a channel; a background task drains the channel on
//! a fixed interval and folds them into one running snapshot that `status`
//! queries can read without contending with the workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

/// Which operation a [`RegularFileStat`] record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegularFileOp {
    /// The file's content was downloaded from the update server.
    Download,
    /// The file was copied from the standby slot's own hold set.
    CopyHold,
    /// The file was hardlinked to another entry in the same group.
    Link,
    /// The file was skipped because it already existed with the right content.
    Skip,
}

/// One worker's report about processing a single `regulars.txt` entry.
#[derive(Debug, Clone, Copy)]
pub struct RegularFileStat {
    /// Which code path handled this file.
    pub op: RegularFileOp,
    /// Bytes downloaded for this entry (zero unless `op == Download`).
    pub bytes_downloaded: u64,
    /// How many attempts the download needed, 0 if not a download.
    pub download_retries: u32,
    /// Wall-clock time to process the entry.
    pub elapsed: Duration,
}

/// A point-in-time snapshot of rebuild progress, cheap to clone for a status
/// RPC response.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Regular files fully processed so far (any op).
    pub files_processed: u64,
    /// Regular files downloaded.
    pub files_downloaded: u64,
    /// Regular files copied from the hold set.
    pub files_copied: u64,
    /// Regular files hardlinked to a sibling.
    pub files_linked: u64,
    /// Regular files skipped as already correct.
    pub files_skipped: u64,
    /// Total bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Sum of retry counts across all downloads, for detecting a flaky mirror.
    pub total_download_retries: u32,
    /// Total wall-clock time spent across all reported entries.
    pub elapsed_total: Duration,
    /// Target total file count, known once the delta plan is computed.
    pub total_files: u64,
    /// Target total download bytes, known once the delta plan is computed.
    pub total_bytes: u64,
}

/// Thread-safe accumulator for [`RegularFileStat`] records, drained on a
/// fixed interval by a background task rather than locking on every report.
#[derive(Debug)]
pub struct StatsCollector {
    tx: mpsc::UnboundedSender<RegularFileStat>,
    snapshot: Arc<RwLock<StatsSnapshot>>,
}

impl StatsCollector {
    /// Spawn the collector's background drain task, folding reports into a
    /// snapshot every `collect_interval`. Returns the collector handle and
    /// the `JoinHandle` for the drain task, which the caller should abort
    /// once the rebuild completes.
    pub fn spawn(collect_interval: Duration, total_files: u64, total_bytes: u64) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(StatsSnapshot {
            total_files,
            total_bytes,
            ..Default::default()
        }));
        let collector = Arc::new(Self { tx, snapshot: snapshot.clone() });

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collect_interval);
            let mut pending = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    maybe = rx.recv() => {
                        match maybe {
                            Some(stat) => pending.push(stat),
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            let mut guard = snapshot.write().await;
                            for stat in pending.drain(..) {
                                apply(&mut guard, stat);
                            }
                        }
                    }
                }
            }
            if !pending.is_empty() {
                let mut guard = snapshot.write().await;
                for stat in pending.drain(..) {
                    apply(&mut guard, stat);
                }
            }
        });

        (collector, handle)
    }

    /// Report one processed entry. Never blocks: the channel is unbounded,
    /// matching the original collector's design of never letting a slow
    /// status reader stall a worker.
    pub fn report(&self, stat: RegularFileStat) {
        let _ = self.tx.send(stat);
    }

    /// Read the current snapshot.
    pub async fn snapshot(&self) -> StatsSnapshot {
        self.snapshot.read().await.clone()
    }
}

fn apply(snap: &mut StatsSnapshot, stat: RegularFileStat) {
    snap.files_processed += 1;
    snap.elapsed_total += stat.elapsed;
    match stat.op {
        RegularFileOp::Download => {
            snap.files_downloaded += 1;
            snap.bytes_downloaded += stat.bytes_downloaded;
            snap.total_download_retries += stat.download_retries;
        }
        RegularFileOp::CopyHold => snap.files_copied += 1,
        RegularFileOp::Link => snap.files_linked += 1,
        RegularFileOp::Skip => snap.files_skipped += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_fold_into_snapshot() {
        let (collector, handle) = StatsCollector::spawn(Duration::from_millis(5), 2, 200);
        collector.report(RegularFileStat {
            op: RegularFileOp::Download,
            bytes_downloaded: 100,
            download_retries: 1,
            elapsed: Duration::from_millis(1),
        });
        collector.report(RegularFileStat {
            op: RegularFileOp::Link,
            bytes_downloaded: 0,
            download_retries: 0,
            elapsed: Duration::from_millis(1),
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let snap = collector.snapshot().await;
        assert_eq!(snap.files_processed, 2);
        assert_eq!(snap.files_downloaded, 1);
        assert_eq!(snap.files_linked, 1);
        assert_eq!(snap.bytes_downloaded, 100);
        assert_eq!(snap.total_download_retries, 1);
        handle.abort();
    }
}

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::{migrate, schema_version};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type StoreJob = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// The thread that owns the connection. Dropping the last handle closes the
/// job queue; the thread then checkpoints and exits, and is joined here.
struct StoreWorker {
    jobs: Option<mpsc::Sender<StoreJob>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for StoreWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event store thread panicked");
            }
        }
    }
}

/// Durable log of vehicle events. One SQLite connection lives on a
/// dedicated thread; async callers hand it jobs and await the reply.
#[derive(Clone)]
pub struct EventStore {
    worker: Arc<StoreWorker>,
}

impl EventStore {
    /// Open (creating if needed) and migrate the database on the calling
    /// thread, then hand the connection to the store thread.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let conn = open_connection(&db_path)?;
        let (job_tx, job_rx) = mpsc::channel::<StoreJob>();
        let thread = thread::Builder::new()
            .name("dashcam-db".into())
            .spawn(move || serve(conn, job_rx))
            .context("failed to spawn event store thread")?;

        info!("Event store ready at {}", db_path.display());
        Ok(Self {
            worker: Arc::new(StoreWorker {
                jobs: Some(job_tx),
                thread: Some(thread),
            }),
        })
    }

    /// Run `job` against the connection on the store thread.
    pub(crate) async fn with_connection<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let jobs = self
            .worker
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("event store is closed"))?;
        let (reply_tx, reply_rx) = oneshot::channel();

        jobs.send(Box::new(move |conn| {
            // The caller may have given up waiting; the job still ran.
            let _ = reply_tx.send(job(conn));
        }))
        .map_err(|_| anyhow!("event store thread has exited"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("event store thread stopped before replying"))?
    }

    pub async fn schema_version(&self) -> Result<i32> {
        self.with_connection(|conn| schema_version(conn)).await
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open event database {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;

    // Rollback journaling still works; losing WAL only costs concurrency.
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        warn!("event store stays on the rollback journal: {err}");
    }
    if let Err(err) = conn.pragma_update(None, "synchronous", "NORMAL") {
        warn!("failed to relax synchronous mode: {err}");
    }

    let version = migrate(&mut conn).context("failed to migrate event database")?;
    info!("Event store schema at v{version}");
    Ok(conn)
}

fn serve(mut conn: Connection, jobs: mpsc::Receiver<StoreJob>) {
    for job in jobs {
        job(&mut conn);
    }

    // Every handle is gone: fold the WAL back into the main file.
    if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
        warn!("event store checkpoint failed: {err}");
    }
    info!("Event store closed");
}

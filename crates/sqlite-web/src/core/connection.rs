use std::{
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};

use rusqlite::{Connection, OpenFlags};
use tokio::sync::oneshot;

use crate::error::{AppError, AppResult};

type Task = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub readonly: bool,
    pub busy_timeout_ms: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            busy_timeout_ms: 2_000,
        }
    }
}

/// Handle to the one connection of a database file.
///
/// The connection lives on a dedicated thread; every operation is shipped
/// there as a closure and its result comes back over a oneshot channel, so
/// work against one file is serialized without a lock.
#[derive(Debug, Clone)]
pub struct Database {
    tx: mpsc::Sender<Task>,
    path: PathBuf,
    readonly: bool,
}

impl Database {
    /// Opens the file up front so a bad path fails here and not on the first request.
    pub fn open(path: &Path, opts: OpenOptions) -> AppResult<Self> {
        let path = absolute_path(path)?;
        let conn = open_conn(&path, opts)?;
        let (tx, rx) = mpsc::channel::<Task>();
        thread::Builder::new()
            .name("sqlite-worker".into())
            .spawn(move || db_worker_main(conn, rx))?;
        tracing::info!(path = %path.display(), readonly = opts.readonly, "database opened");
        Ok(Self {
            tx,
            path,
            readonly: opts.readonly,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Run `f` on the worker thread against the connection.
    pub async fn call<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let task: Task = Box::new(move |conn| {
            let _ = reply.send(f(conn));
        });
        self.tx
            .send(task)
            .map_err(|_| AppError::Internal("db worker unavailable".into()))?;
        rx.await
            .map_err(|_| AppError::Internal("db worker dropped response".into()))?
    }
}

fn db_worker_main(mut conn: Connection, rx: mpsc::Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        // The panicking task's reply sender is dropped with it, so its
        // caller gets an error while later tasks still run.
        if panic::catch_unwind(AssertUnwindSafe(|| task(&mut conn))).is_err() {
            tracing::error!("db task panicked");
        }
    }
    tracing::debug!("db worker exiting");
}

fn open_conn(path: &Path, opts: OpenOptions) -> AppResult<Connection> {
    let mode = if opts.readonly {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
    };
    let flags = mode | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|source| AppError::DbOpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    conn.busy_timeout(Duration::from_millis(opts.busy_timeout_ms))?;
    Ok(conn)
}

fn absolute_path(path: &Path) -> AppResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_run_on_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.db");
        Connection::open(&path).unwrap();

        let db = Database::open(&path, OpenOptions::default()).unwrap();
        db.call(|c| Ok(c.execute_batch("CREATE TABLE t (a); INSERT INTO t VALUES (7);")?))
            .await
            .unwrap();
        let v: i64 = db
            .call(|c| Ok(c.query_row("SELECT a FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(v, 7);

        let err = db
            .call(|c| Ok(c.execute_batch("SELEC nonsense")?))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SQL_ERROR");
    }

    #[tokio::test]
    async fn worker_outlives_a_panicking_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.db");
        Connection::open(&path).unwrap();

        let db = Database::open(&path, OpenOptions::default()).unwrap();
        let err = db
            .call(|_| -> AppResult<()> { panic!("task blew up") })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        let v: i64 = db
            .call(|c| Ok(c.query_row("SELECT 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let err = Database::open(&dir.path().join("nope.db"), OpenOptions::default()).unwrap_err();
        assert_eq!(err.code(), "DB_OPEN_FAILED");
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (a)")
            .unwrap();

        let db = Database::open(
            &path,
            OpenOptions {
                readonly: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(db.is_readonly());
        let err = db
            .call(|c| Ok(c.execute_batch("INSERT INTO t VALUES (1)")?))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SQL_ERROR");
    }
}

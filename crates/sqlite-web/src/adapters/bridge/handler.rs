use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use rusqlite::Connection;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::Args,
    core::{
        cancel::CancelToken,
        connection::Database,
        export::{self, DataFormat},
        import, info, limits, query, schema,
    },
    error::{AppError, AppResult},
};

use super::protocol::*;

/// Commands refused up front when the database was opened read-only.
const WRITE_COMMANDS: &[&str] = &[
    "create_table",
    "drop_table",
    "add_column",
    "drop_column",
    "rename_column",
    "create_index",
    "drop_index",
    "insert_row",
    "update_row",
    "delete_row",
    "import",
];

pub struct BridgeHandler {
    db: Database,
    max_rows: usize,
    timeout: Duration,
    /// Parent of every request token.
    shutdown: CancellationToken,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl BridgeHandler {
    pub fn new(args: &Args, db: Database) -> Self {
        Self {
            db,
            max_rows: args.max_rows,
            timeout: args.request_timeout(),
            shutdown: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, req: BridgeRequest) -> BridgeResponse<Value> {
        if req.v != PROTOCOL_VERSION {
            let e = AppError::InvalidRequest(format!("unsupported protocol version: {}", req.v));
            return BridgeResponse::err(req.v, req.id, &e);
        }

        let started = Instant::now();
        let result = if req.cmd == "cancel" {
            parse::<CancelPayload>(req.payload).map(|p| json!({ "cancelled": self.cancel(&p.id) }))
        } else {
            let cancel = self.begin(&req.id);
            let result = self.dispatch(&req.cmd, req.payload, cancel).await;
            self.in_flight().remove(&req.id);
            result
        };
        match result {
            Ok(data) => {
                tracing::debug!(
                    cmd = %req.cmd,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request ok"
                );
                BridgeResponse::ok(req.v, req.id, data)
            }
            Err(e) => {
                tracing::warn!(cmd = %req.cmd, code = e.code(), error = %e, "request failed");
                BridgeResponse::err(req.v, req.id, &e)
            }
        }
    }

    /// Cancel the in-flight request `id`. False when nothing by that id runs.
    pub fn cancel(&self, id: &str) -> bool {
        match self.in_flight().get(id) {
            Some(token) => {
                token.cancel();
                tracing::info!(id, "request cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight, now and later.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`BridgeHandler::shutdown`] has been called.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    fn begin(&self, id: &str) -> CancelToken {
        let token = self.shutdown.child_token();
        self.in_flight().insert(id.to_string(), token.clone());
        CancelToken::from_token(token).expiring_in(self.timeout)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, cmd: &str, payload: Value, cancel: CancelToken) -> AppResult<Value> {
        if self.db.is_readonly() && WRITE_COMMANDS.contains(&cmd) {
            return Err(AppError::NotReadonly);
        }

        match cmd {
            "db_info" => {
                let path = self.db.path().to_path_buf();
                self.run(move |c| info::get_db_info(c, &path)).await
            }
            "tables" => self.run(|c| schema::list_tables(c)).await,
            "views" => self.run(|c| schema::list_views(c)).await,
            "triggers" => self.run(|c| schema::list_triggers(c)).await,
            "trigger" => {
                let p: TriggerPayload = parse(payload)?;
                self.run(move |c| schema::get_trigger(c, &p.name)).await
            }
            "create_table" => {
                let p: TablePayload = parse(payload)?;
                self.run(move |c| schema::create_table(c, &p.table).map(|()| true))
                    .await
            }
            "drop_table" => {
                let p: TablePayload = parse(payload)?;
                self.run(move |c| schema::drop_table(c, &p.table).map(|()| true))
                    .await
            }
            "table_info" => {
                let p: TablePayload = parse(payload)?;
                self.run(move |c| schema::get_table_info(c, &p.table)).await
            }
            "columns" => {
                let p: TablePayload = parse(payload)?;
                self.run(move |c| schema::get_columns(c, &p.table)).await
            }
            "add_column" => {
                let p: AddColumnPayload = parse(payload)?;
                self.run(move |c| schema::add_column(c, &p.table, &p.column).map(|()| true))
                    .await
            }
            "drop_column" => {
                let p: DropColumnPayload = parse(payload)?;
                self.run(move |c| schema::drop_column(c, &p.table, &p.column).map(|()| true))
                    .await
            }
            "rename_column" => {
                let p: RenameColumnPayload = parse(payload)?;
                self.run(move |c| {
                    schema::rename_column(c, &p.table, &p.old_name, &p.new_name).map(|()| true)
                })
                .await
            }
            "indexes" => {
                let p: TablePayload = parse(payload)?;
                self.run(move |c| schema::get_indexes(c, &p.table)).await
            }
            "create_index" => {
                let p: CreateIndexPayload = parse(payload)?;
                self.run(move |c| schema::create_index(c, &p.table, &p.index).map(|()| true))
                    .await
            }
            "drop_index" => {
                let p: DropIndexPayload = parse(payload)?;
                self.run(move |c| schema::drop_index(c, &p.table, &p.index).map(|()| true))
                    .await
            }
            "rows" => {
                let p: RowsPayload = parse(payload)?;
                let window = limits::table_page(p.page, p.limit, self.max_rows);
                let offset = window.offset()?;
                self.run(move |c| {
                    let rows = query::get_table_rows(c, &p.table, window.size, offset)?;
                    Ok(RowsPage {
                        total_pages: limits::total_pages(rows.total, window.size),
                        rows: rows.rows,
                        total: rows.total,
                        page: window.page,
                        limit: window.size,
                    })
                })
                .await
            }
            "insert_row" => {
                let p: RowPayload = parse(payload)?;
                self.run(move |c| query::insert_row(c, &p.table, &p.data).map(|id| json!({ "id": id })))
                    .await
            }
            "update_row" => {
                let p: RowPayload = parse(payload)?;
                self.run(move |c| {
                    query::update_row(c, &p.table, &p.data).map(|n| json!({ "affected": n }))
                })
                .await
            }
            "delete_row" => {
                let p: RowPayload = parse(payload)?;
                self.run(move |c| {
                    query::delete_row(c, &p.table, &p.data).map(|n| json!({ "affected": n }))
                })
                .await
            }
            "query" => {
                let p: QueryPayload = parse(payload)?;
                let max_rows = self.max_rows;
                self.run(move |c| {
                    Ok(query::execute_sql_capped(c, &p.sql, p.page, p.size, max_rows, &cancel))
                })
                .await
            }
            "export_query" => {
                let p: ExportQueryPayload = parse(payload)?;
                let max_rows = self.max_rows;
                self.run(move |c| {
                    let conn: &Connection = c;
                    let window = (p.page, p.size);
                    write_export(&p.out, p.format, |sink| {
                        export::export_query_capped(
                            conn, &p.sql, window, max_rows, p.format, sink, &cancel,
                        )
                    })
                })
                .await
            }
            "export_table" => {
                let p: ExportTablePayload = parse(payload)?;
                self.run(move |c| {
                    let conn: &Connection = c;
                    write_export(&p.out, p.format, |sink| {
                        export::stream_export_table(conn, &p.table, &p.columns, p.format, sink, &cancel)
                    })
                })
                .await
            }
            "import" => {
                let p: ImportPayload = parse(payload)?;
                self.run(move |c| import::import_file(c, &p.file, &p.table, p.options, &cancel))
                    .await
            }
            other => Err(AppError::InvalidRequest(format!("unknown cmd: {other}"))),
        }
    }

    /// Run `f` on the database worker and serialize what it returns.
    async fn run<T, F>(&self, f: F) -> AppResult<Value>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let out = self.db.call(f).await?;
        Ok(serde_json::to_value(out)?)
    }
}

fn parse<P: DeserializeOwned>(payload: Value) -> AppResult<P> {
    serde_json::from_value(payload).map_err(|e| AppError::InvalidRequest(e.to_string()))
}

/// Stream an export into `out`. A failed export leaves no partial file behind.
fn write_export<F>(out: &Path, format: DataFormat, f: F) -> AppResult<ExportSummary>
where
    F: FnOnce(&mut BufWriter<File>) -> AppResult<u64>,
{
    let mut sink = BufWriter::new(File::create(out)?);
    let written = f(&mut sink).and_then(|n| {
        sink.flush()?;
        Ok(n)
    });
    match written {
        Ok(rows) => Ok(ExportSummary {
            path: out.to_path_buf(),
            format,
            content_type: format.content_type(),
            rows,
        }),
        Err(e) => {
            drop(sink);
            let _ = std::fs::remove_file(out);
            Err(e)
        }
    }
}

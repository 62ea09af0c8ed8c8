//! NDJSON request/response bridge over stdio.
//!
//! One JSON object per line in, one per line out. Requests carry
//! `{v, id, cmd, payload}`; responses echo `v` and `id` with either `data` or
//! `error`/`code`/`details`.

mod handler;
mod io;
mod protocol;

use std::{collections::VecDeque, convert::Infallible, io::Write};

use crate::{cli::Args, core::connection::Database, error::AppResult};

pub use handler::BridgeHandler;
pub use io::NdjsonIo;
pub use protocol::{BridgeRequest, BridgeResponse, PROTOCOL_VERSION};

pub fn run(args: Args, db: Database) -> AppResult<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| crate::error::AppError::Internal(e.to_string()))?;

    let handler = BridgeHandler::new(&args, db);
    let io = NdjsonIo::stdio()?;
    let _stdout = rt.block_on(async {
        tokio::select! {
            served = serve(io, &handler) => served,
            never = cancel_on_interrupt(&handler) => match never {},
        }
    })?;
    Ok(())
}

async fn cancel_on_interrupt(handler: &BridgeHandler) -> Infallible {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("interrupted; cancelling in-flight requests");
        handler.shutdown();
    }
    std::future::pending().await
}

/// Answer requests in order until the input ends or the handler shuts down;
/// hands back the writer.
///
/// While a request runs, later lines are read ahead: `cancel` requests are
/// answered at once, everything else waits its turn.
pub async fn serve<W: Write>(mut io: NdjsonIo<W>, handler: &BridgeHandler) -> AppResult<W> {
    let mut backlog = VecDeque::new();
    let mut input_open = true;
    loop {
        if handler.is_shut_down() {
            tracing::info!(queued = backlog.len(), "bridge shutting down");
            break;
        }
        let line = match backlog.pop_front() {
            Some(line) => line,
            None if input_open => tokio::select! {
                biased;
                _ = handler.stopped() => continue,
                next = io.read_line() => match next? {
                    Some(line) => line,
                    None => break,
                },
            },
            None => break,
        };
        if line.is_empty() {
            continue;
        }

        let req: BridgeRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                io.protocol_error(e.to_string())?;
                continue;
            }
        };

        let running = handler.handle(req);
        tokio::pin!(running);
        let resp = loop {
            tokio::select! {
                biased;
                resp = &mut running => break resp,
                next = io.read_line(), if input_open => match next? {
                    Some(line) => match serde_json::from_str::<BridgeRequest>(&line) {
                        Ok(cancel) if cancel.cmd == "cancel" => {
                            let resp = handler.handle(cancel).await;
                            io.write_json_line(&resp)?;
                        }
                        _ => backlog.push_back(line),
                    },
                    None => input_open = false,
                },
            }
        };
        io.write_json_line(&resp)?;
    }
    tracing::debug!("input closed; bridge exiting");
    Ok(io.into_writer())
}

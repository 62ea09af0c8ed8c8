use std::{
    io::{BufRead, BufReader, Write},
    thread,
};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};

use super::protocol::{BridgeResponse, PROTOCOL_VERSION};

type Line = std::io::Result<String>;

/// Newline-delimited JSON over any reader/writer pair; stdio in production.
///
/// Input is read on its own thread, so a `cancel` line can be seen while an
/// earlier request is still running.
pub struct NdjsonIo<W> {
    lines: mpsc::UnboundedReceiver<Line>,
    writer: W,
}

impl NdjsonIo<std::io::StdoutLock<'static>> {
    pub fn stdio() -> AppResult<Self> {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout().lock())
    }
}

impl<W: Write> NdjsonIo<W> {
    pub fn new<R: BufRead + Send + 'static>(reader: R, writer: W) -> AppResult<Self> {
        let (tx, lines) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("bridge-reader".into())
            .spawn(move || read_lines(reader, tx))?;
        Ok(Self { lines, writer })
    }

    /// `None` at end of input; blank lines come back empty.
    pub async fn read_line(&mut self) -> AppResult<Option<String>> {
        match self.lines.recv().await {
            Some(line) => Ok(Some(line?)),
            None => Ok(None),
        }
    }

    pub fn write_json_line<T: Serialize>(&mut self, v: &T) -> AppResult<()> {
        serde_json::to_writer(&mut self.writer, v)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reply to a line that could not be decoded as a request.
    pub fn protocol_error(&mut self, msg: String) -> AppResult<()> {
        let resp: BridgeResponse<()> = BridgeResponse::err(
            PROTOCOL_VERSION,
            String::new(),
            &AppError::InvalidRequest(msg),
        );
        self.write_json_line(&resp)
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

fn read_lines<R: BufRead>(mut reader: R, tx: mpsc::UnboundedSender<Line>) {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(Ok(line.trim().to_string())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

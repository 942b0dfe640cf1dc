//! Interactive Shell
//!
//! Line-oriented console for a running node: `put <key> <value>`, `get <key>`,
//! `test <key>`, `remove <key>`, `dump` and `quit`.
//!
//! ## Core Concepts
//! - **Reader task**: reads input lines, parses them into [`Command`]s and
//!   sends each one as a [`Request`]. It waits for the reply before reading
//!   the next line and stops after `quit`.
//! - **Executor**: [`run`] owns the output and executes requests against the
//!   [`ReplicatedMap`] one at a time. End of input ends the session like `quit`.

pub mod command;


use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::node::ReplicatedMap;
pub use command::{Command, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Continue,
    Quit,
}

#[derive(Debug)]
pub struct Request {
    pub input: Result<Command, ParseError>,
    pub reply: oneshot::Sender<Reply>,
}

/// Spawns the reader task over `input`.
pub fn spawn_reader<R>(input: R, span: Span) -> (mpsc::Receiver<Request>, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(
        async move {
            let mut lines = input.lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read input: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let (reply_tx, reply_rx) = oneshot::channel();
                let request = Request {
                    input: line.parse(),
                    reply: reply_tx,
                };
                if tx.send(request).await.is_err() {
                    break;
                }
                match reply_rx.await {
                    Ok(Reply::Continue) => {}
                    Ok(Reply::Quit) | Err(_) => break,
                }
            }
            tracing::debug!("Input closed");
        }
        .instrument(span),
    );

    (rx, handle)
}

/// Executes one command and returns the lines it prints.
pub fn execute(map: &ReplicatedMap, command: &Command) -> Vec<String> {
    match command {
        Command::Put { key, value } => {
            map.put(key.clone(), *value);
            vec![]
        }
        Command::Get { key } => vec![display_value(map.get(key))],
        Command::Test { key } => vec![map.contains_key(key).to_string()],
        Command::Remove { key } => {
            vec![format!("removing value {}", display_value(map.remove(key)))]
        }
        Command::Dump => {
            let entries = map.entries();
            let count = entries.len();
            entries
                .into_iter()
                .map(|entry| entry.to_string())
                .chain(std::iter::once(format!("({} entries)", count)))
                .collect()
        }
        Command::Quit => vec![],
    }
}

fn display_value(value: Option<i32>) -> String {
    value.map_or_else(|| "null".to_string(), |value| value.to_string())
}

/// Runs a shell session until `quit` or end of input.
pub async fn run<R, W>(map: &ReplicatedMap, input: R, mut output: W, span: Span) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (mut requests, reader) = spawn_reader(input, span.clone());

    while let Some(request) = requests.recv().await {
        let (lines, reply) = match &request.input {
            Ok(command) => {
                tracing::debug!(parent: &span, "Executing '{}'", command);
                let reply = if *command == Command::Quit {
                    Reply::Quit
                } else {
                    Reply::Continue
                };
                (execute(map, command), reply)
            }
            Err(e) => (vec![e.to_string()], Reply::Continue),
        };

        for line in lines {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        output.flush().await?;

        let _ = request.reply.send(reply);
        if reply == Reply::Quit {
            break;
        }
    }

    reader.abort();
    Ok(())
}

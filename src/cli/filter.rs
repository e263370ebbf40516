use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::squash::timestamp::STANDARD_FORMAT;
use crate::squash::Squasher;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffer stdin lines and squash them every `period` seconds, one JSON
/// object per Message on stdout. Lines of an unfinished multi-line group
/// carry over to the next tick with their timestamps rendered back in.
pub async fn run(period: f64) -> Result<(), FilterError> {
    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (eof_tx, eof_rx) = watch::channel(false);

    let reader_lines = Arc::clone(&lines);
    tokio::spawn(async move {
        let mut stdin_lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = stdin_lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Ok(mut buffered) = reader_lines.lock() {
                buffered.push(line);
            }
        }
        let _ = eof_tx.send(true);
    });

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let mut pending: Vec<String> = Vec::new();
    let mut bytes_raw = 0usize;
    let mut bytes_filtered = 0usize;
    let mut stdout = std::io::stdout();

    let mut interval = tokio::time::interval(Duration::from_secs_f64(period));
    // The first interval tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("interrupted; exiting");
                break;
            }
            _ = interval.tick() => {
                // Read the EOF flag before draining: once it is set the
                // reader task has pushed its last line.
                let at_eof = *eof_rx.borrow();
                let acquired: Vec<String> = match lines.lock() {
                    Ok(mut buffered) => buffered.drain(..).collect(),
                    Err(_) => Vec::new(),
                };
                if acquired.is_empty() && pending.is_empty() {
                    if at_eof {
                        break;
                    }
                    continue;
                }

                let mut squasher = Squasher::new();
                for line in pending.drain(..) {
                    squasher.add_lines(&line, None);
                }
                for line in &acquired {
                    bytes_raw += line.len();
                    squasher.add_lines(line, None);
                }
                if at_eof {
                    // The terminator of an open group can never arrive now.
                    squasher.finish();
                }

                for message in squasher.squash() {
                    let line = serde_json::Value::Object(message.to_json()).to_string();
                    bytes_filtered += line.len();
                    writeln!(stdout, "{line}")?;
                }
                stdout.flush()?;
                eprintln!("({bytes_raw} -> {bytes_filtered} bytes)");

                pending = squasher
                    .pending_lines()
                    .iter()
                    .map(|idx| {
                        format!("{} {}", idx.timestamp.format(STANDARD_FORMAT), idx.value)
                    })
                    .collect();

                if at_eof {
                    break;
                }
            }
        }
    }

    Ok(())
}

//! Out-of-band sink for protocol noise (malformed or unexpected lines).

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::DfsError;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Records dropped lines to the logger and, if configured, appends them to a
/// log file. Recording never fails the caller.
pub struct Diagnostics {
    /// Logging prefix of the owning process.
    me: String,

    /// Append-only log file, if any.
    log_file: Option<Mutex<File>>,
}

impl Diagnostics {
    /// Creates a diagnostic sink. An empty `path` means logger only.
    pub async fn new_and_setup(
        me: impl fmt::Display,
        path: &str,
    ) -> Result<Self, DfsError> {
        let log_file = if path.is_empty() {
            None
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            Some(Mutex::new(file))
        };

        Ok(Diagnostics {
            me: me.to_string(),
            log_file,
        })
    }

    /// Records a dropped line received from `peer`.
    pub async fn record(
        &self,
        peer: SocketAddr,
        line: impl fmt::Display,
        reason: &DfsError,
    ) {
        pf_warn!(self.me; "dropped line from '{}': '{}' ({})", peer, line, reason);

        if let Some(ref log_file) = self.log_file {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let entry = format!("{} {} {} ({})\n", secs, peer, line, reason);
            let mut file = log_file.lock().await;
            if let Err(e) = file.write_all(entry.as_bytes()).await {
                pf_error!(self.me; "error writing diagnostic log: {}", e);
            }
        }
    }
}

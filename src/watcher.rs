use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Polls the configuration file and publishes changed snapshots.
///
/// - The file is re-read when its modification time moves
/// - Unreadable or invalid files are logged and the last good
///   snapshot stays in effect
/// - A snapshot equal to the current one is not published
pub struct ConfigWatcher {
    path: PathBuf,
    tx: watch::Sender<Arc<Config>>,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, initial: Arc<Config>) -> (Self, watch::Receiver<Arc<Config>>) {
        let modified = mtime(&path);
        let (tx, rx) = watch::channel(initial);
        (Self { path, tx, modified }, rx)
    }

    /// Checks the file once. Returns true if a new snapshot went out.
    pub fn poll(&mut self) -> bool {
        let modified = mtime(&self.path);
        if modified == self.modified {
            return false;
        }
        self.modified = modified;

        let next = match Config::load(&self.path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::error!("config reload failed, keeping previous snapshot: {}", e);
                return false;
            }
        };

        if **self.tx.borrow() == next {
            log::debug!("{} touched, content unchanged", self.path.display());
            return false;
        }

        log::info!("configuration changed, publishing new snapshot");
        self.tx.send_replace(Arc::new(next));
        true
    }

    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        log::info!("watching {}", self.path.display());

        loop {
            let every = self.tx.borrow().reload_every();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(every) => {}
            }
            self.poll();
        }

        Ok(())
    }
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

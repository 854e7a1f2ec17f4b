//! Process-scoped state: shutdown/reload signal flags and the pidfile.
//!
//! SIGINT/SIGTERM latch a shutdown flag that the main loop and the
//! backpressure loop poll; the next observation starts a graceful shutdown.
//! SIGUSR2 latches a reload flag so table selection can be re-read on the
//! next iteration. The pidfile is the process singleton: exclusive creation
//! fails if another bridge is already running against the same slot.

use crate::error::{BridgeError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Latched signal flags shared across the pipeline.
#[derive(Clone, Default)]
pub struct Shutdown {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the shutdown flag.
    pub fn trigger(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Latch the reload flag.
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    /// Consume the reload flag if it is set.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Install SIGINT/SIGTERM/SIGUSR2 handlers that latch these flags.
    pub fn install_signal_handlers(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut reload = signal(SignalKind::user_defined2())?;

        let flags = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("SIGINT received, shutting down..."),
                _ = terminate.recv() => info!("SIGTERM received, shutting down..."),
            }
            flags.trigger();
        });

        let flags = self.clone();
        tokio::spawn(async move {
            while reload.recv().await.is_some() {
                info!("SIGUSR2 received, scheduling reload");
                flags.request_reload();
            }
        });

        Ok(())
    }
}

/// Exclusive pidfile, removed when dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Acquire the pidfile for `slot_name` at the conventional location.
    pub fn acquire(slot_name: &str) -> Result<Self> {
        Self::acquire_at(format!("/tmp/bw_{}.pid", slot_name))
    }

    /// Acquire a pidfile at an explicit path.
    pub fn acquire_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                BridgeError::config(format!(
                    "can't create pidfile {} (is another instance running?): {}",
                    path.display(),
                    e
                ))
            })?;

        write!(file, "{}", std::process::id())?;
        file.flush()?;

        // Make the pidfile world readable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove pidfile: {}", e);
        }
    }
}

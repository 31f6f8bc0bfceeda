//! Status channel worker
//!
//! Each open session runs one worker thread that keeps a transfer posted on
//! the interrupt IN endpoint. Every completion, successful, timed out or
//! failed, is delivered into session state and immediately followed by a new
//! transfer. The stop signal is checked before each re-post.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::constants::{EP_INT_IN, REPLY_SIZE};
use crate::device::Shared;
use crate::error::{HeliosError, Result};
use crate::transport::Transport;

/// Counters kept by the status worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusChannelStats {
    /// Status transfers posted
    pub posted: u64,
    /// Transfers that delivered a reply packet
    pub replies: u64,
    /// Transfers that completed with an error other than a timeout
    pub failures: u64,
}

/// Handle to the background status worker of one session
pub(crate) struct StatusWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatusWorker {
    /// Start posting status transfers for `shared`
    pub fn spawn<T: Transport>(shared: Arc<Shared<T>>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("helios-status".into())
            .spawn(move || run(&shared, &signal))
            .map_err(HeliosError::Spawn)?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the worker and wait for its last transfer to drain
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("status worker panicked");
            }
        }
    }
}

impl Drop for StatusWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run<T: Transport>(shared: &Shared<T>, stop: &AtomicBool) {
    log::debug!("status worker started");
    let mut buf = [0u8; REPLY_SIZE];
    let mut failing = false;

    while !stop.load(Ordering::Acquire) {
        shared.status_posted();
        let outcome = shared.transport.read_interrupt(
            EP_INT_IN,
            &mut buf,
            shared.config.status_poll_interval,
        );

        match outcome {
            Ok(len) => {
                failing = false;
                shared.deliver_reply(&buf[..len]);
            }
            Err(rusb::Error::Timeout) => {}
            Err(e) => {
                shared.status_failed();
                if !failing {
                    log::warn!("status transfer failed: {}, re-posting", e);
                }
                failing = true;
                thread::sleep(shared.config.status_error_backoff);
            }
        }
    }

    log::debug!("status worker stopped");
}

use embassy_sync::{blocking_mutex::raw::RawMutex, channel::Channel};
use futures_util::future::LocalBoxFuture;

use crate::error::Error;

/// Deferred jobs that can be waiting at once.
pub const CALLBACK_QUEUE_LEN: usize = 8;

/// FIFO of deferred jobs, drained by a single worker.
pub(crate) struct CallbackQueue<'a, M: RawMutex> {
    jobs: Channel<M, LocalBoxFuture<'a, ()>, CALLBACK_QUEUE_LEN>,
}

impl<'a, M: RawMutex> CallbackQueue<'a, M> {
    pub(crate) const fn new() -> Self {
        Self {
            jobs: Channel::new(),
        }
    }

    pub(crate) fn push(&self, job: LocalBoxFuture<'a, ()>) -> Result<(), Error> {
        self.jobs.try_send(job).map_err(|_| {
            warn!("Deferred callback queue full, dropping job");
            Error::Overflow
        })
    }

    /// Runs every job to completion before taking the next one.
    pub(crate) async fn run(&self) -> ! {
        loop {
            let job = self.jobs.receive().await;
            job.await;
        }
    }
}

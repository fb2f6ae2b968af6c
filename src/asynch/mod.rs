mod callback;
pub mod exchange;
pub mod runner;
pub(crate) mod state;
pub mod urc;

use core::cell::Cell;
use core::future::Future;

use alloc::boxed::Box;
use embassy_sync::{
    blocking_mutex::{self, raw::RawMutex},
    mutex::Mutex,
    pipe::Pipe,
    signal::Signal,
};
use embedded_io_async::Write;
use portable_atomic::{AtomicU32, Ordering};

pub use callback::CALLBACK_QUEUE_LEN;
pub use exchange::{Exchange, StopTagGuard};
pub use runner::Runner;
pub use urc::{UrcHandler, UrcLine, MAX_PREFIX_LEN, MAX_URC_HANDLERS};

use crate::config::Config;
use crate::error::Error;
use callback::CallbackQueue;
use state::Stream;
use urc::UrcTable;

/// AT command client for one serial link to a u-blox module.
///
/// `N` sizes both the ingress pipe and the receive buffer, and bounds the
/// longest line that can be handled as a whole. The client has to outlive
/// everything that uses it, so it is usually kept in a `StaticCell`.
///
/// Two background futures must be polled for the client to make progress:
/// [`Client::receive_from`] and [`Client::run_callbacks`], or both at once
/// through [`Runner::run`].
pub struct Client<'a, M: RawMutex, W: Write, const N: usize> {
    pub(crate) stream: Mutex<M, Stream<W, N>>,
    pub(crate) ingress: Pipe<M, N>,
    pub(crate) resync: Signal<M, ()>,
    pub(crate) urcs: UrcTable<'a, M>,
    pub(crate) callbacks: CallbackQueue<'a, M>,
    owner: blocking_mutex::Mutex<M, Cell<Option<u32>>>,
    next_caller: AtomicU32,
    pub(crate) config: Config,
}

impl<'a, M: RawMutex, W: Write, const N: usize> Client<'a, M, W, N> {
    pub fn new(writer: W, config: Config) -> Self {
        Self {
            stream: Mutex::new(Stream::new(writer, &config)),
            ingress: Pipe::new(),
            resync: Signal::new(),
            urcs: UrcTable::new(),
            callbacks: CallbackQueue::new(),
            owner: blocking_mutex::Mutex::new(Cell::new(None)),
            next_caller: AtomicU32::new(0),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A new caller identity. Each task talking to the module should hold
    /// its own handle.
    pub fn handle(&self) -> AtHandle<'_, 'a, M, W, N> {
        AtHandle {
            client: self,
            id: self.next_caller.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Calls `handler` for every line starting with `prefix`, with the
    /// prefix already consumed.
    ///
    /// Handlers run on whichever task is reading the stream at the time and
    /// must not block; see [`UrcLine::defer`].
    pub fn set_urc_handler(
        &self,
        prefix: &str,
        handler: impl FnMut(&mut UrcLine<'_, 'a>) + 'a,
    ) -> Result<(), Error> {
        self.urcs.insert(prefix, Box::new(handler)).inspect_err(|e| {
            warn!("Failed to register URC handler for {}: {:?}", prefix, e);
        })
    }

    /// Returns false if no handler was registered for `prefix`.
    pub fn remove_urc_handler(&self, prefix: &str) -> bool {
        self.urcs.remove(prefix)
    }

    /// Queues `job` for the callback worker and returns immediately.
    pub fn callback(&self, job: impl Future<Output = ()> + 'a) -> Result<(), Error> {
        self.callbacks.push(Box::pin(job))
    }

    /// The callback worker. Runs queued jobs one at a time, in order.
    pub async fn run_callbacks(&self) -> ! {
        self.callbacks.run().await
    }

    pub(crate) fn owner(&self) -> Option<u32> {
        self.owner.lock(|o| o.get())
    }

    pub(crate) fn release(&self) {
        self.owner.lock(|o| o.set(None));
    }
}

/// A caller's identity on a [`Client`].
pub struct AtHandle<'c, 'a, M: RawMutex, W: Write, const N: usize> {
    client: &'c Client<'a, M, W, N>,
    id: u32,
}

impl<'c, 'a, M: RawMutex, W: Write, const N: usize> AtHandle<'c, 'a, M, W, N> {
    pub fn client(&self) -> &'c Client<'a, M, W, N> {
        self.client
    }

    /// Waits for exclusive use of the link and opens an exchange.
    ///
    /// Fails with [`Error::InvalidUsage`] instead of deadlocking when this
    /// handle already holds the lock.
    pub async fn lock(&self) -> Result<Exchange<'c, 'a, M, W, N>, Error> {
        if self.client.owner() == Some(self.id) {
            error!("AT lock taken twice by the same caller");
            return Err(Error::InvalidUsage);
        }

        let mut stream = self.client.stream.lock().await;
        self.client.owner.lock(|o| o.set(Some(self.id)));
        // A resync raised after the previous exchange stopped waiting.
        self.client.resync.reset();

        stream.begin(&self.client.config);
        stream.drain_idle(&self.client.ingress, &self.client.urcs, &self.client.callbacks);

        Ok(Exchange::new(self.client, stream))
    }
}

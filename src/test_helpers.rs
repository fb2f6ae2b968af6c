//! In-memory serial link for driving a client from tests.

use core::convert::Infallible;
use core::future::Future;

use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, pipe::Pipe};
use embedded_io_async::{ErrorType, Read, Write};

use crate::asynch::{Client, Runner};
use crate::config::Config;

pub(crate) const WIRE_LEN: usize = 1024;
pub(crate) const RX_BUF_LEN: usize = 256;

type Link = Pipe<NoopRawMutex, WIRE_LEN>;

/// Both directions of a simulated UART.
pub(crate) struct Wire {
    to_module: Link,
    from_module: Link,
}

pub(crate) struct TxPort<'w>(&'w Link);
pub(crate) struct RxPort<'w>(&'w Link);

impl ErrorType for TxPort<'_> {
    type Error = Infallible;
}

impl Write for TxPort<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        Ok(self.0.write(buf).await)
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl ErrorType for RxPort<'_> {
    type Error = Infallible;
}

impl Read for RxPort<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        Ok(self.0.read(buf).await)
    }
}

pub(crate) type TestClient<'a, 'w> = Client<'a, NoopRawMutex, TxPort<'w>, RX_BUF_LEN>;

impl Wire {
    pub(crate) const fn new() -> Self {
        Self {
            to_module: Pipe::new(),
            from_module: Pipe::new(),
        }
    }

    pub(crate) fn client<'a>(&self, config: Config) -> TestClient<'a, '_> {
        Client::new(TxPort(&self.to_module), config)
    }

    /// Plays the module: queues `bytes` for the client to receive.
    pub(crate) async fn respond(&self, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = self.from_module.write(rest).await;
            rest = &rest[n..];
        }
    }

    /// Everything the client has sent so far.
    pub(crate) fn sent(&self) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(n) = self.to_module.try_read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    /// Drives `client` with a runner on this wire until `test` completes.
    pub(crate) fn run<F: Future>(&self, client: &TestClient<'_, '_>, test: F) -> F::Output {
        embassy_futures::block_on(async {
            match select(Runner::new(client, RxPort(&self.from_module)).run(), test).await {
                Either::First(_) => unreachable!(),
                Either::Second(out) => out,
            }
        })
    }
}

/// Leaks a wire and a client on it, for tests whose handlers or deferred
/// jobs need to refer back to the client.
pub(crate) fn leaked(config: Config) -> (&'static Wire, &'static TestClient<'static, 'static>) {
    let wire: &'static Wire = std::boxed::Box::leak(std::boxed::Box::new(Wire::new()));
    let client = std::boxed::Box::leak(std::boxed::Box::new(wire.client(config)));
    (wire, client)
}

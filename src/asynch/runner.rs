use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Timer;
use embedded_io_async::{Read, Write};

use super::Client;
use crate::fmt::LossyStr;

const RX_CHUNK: usize = 64;

impl<'a, M: RawMutex, W: Write, const N: usize> Client<'a, M, W, N> {
    /// The receiver. Moves everything `reader` produces into the client and
    /// dispatches URCs while no exchange is open.
    pub async fn receive_from<R: Read>(&self, mut reader: R) -> ! {
        let mut buf = [0u8; RX_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => Timer::after_millis(1).await,
                Ok(n) => {
                    trace!("RX {:?}", LossyStr(&buf[..n]));
                    self.ingest(&buf[..n]).await;
                }
                Err(_) => {
                    warn!("Transport read failed, resynchronising");
                    self.resynchronise();
                }
            }
        }
    }

    async fn ingest(&self, mut data: &[u8]) {
        while !data.is_empty() {
            let n = self.ingress.write(data).await;
            data = &data[n..];
            self.scan_idle();
        }
    }

    fn scan_idle(&self) {
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.drain_idle(&self.ingress, &self.urcs, &self.callbacks);
        }
    }

    fn resynchronise(&self) {
        self.ingress.clear();
        match self.stream.try_lock() {
            Ok(mut stream) => stream.clear(),
            Err(_) => self.resync.signal(()),
        }
    }
}

/// Background runner for an AT [`Client`].
///
/// You must call `.run()` in a background task for the client to operate.
pub struct Runner<'c, 'a, M: RawMutex, W: Write, R: Read, const N: usize> {
    client: &'c Client<'a, M, W, N>,
    reader: R,
}

impl<'c, 'a, M: RawMutex, W: Write, R: Read, const N: usize> Runner<'c, 'a, M, W, R, N> {
    pub fn new(client: &'c Client<'a, M, W, N>, reader: R) -> Self {
        Self { client, reader }
    }

    pub async fn run(self) -> ! {
        embassy_futures::join::join(
            self.client.receive_from(self.reader),
            self.client.run_callbacks(),
        )
        .await;
        core::unreachable!()
    }
}

use embassy_futures::select::{select3, Either3};
use embassy_sync::{blocking_mutex::raw::RawMutex, pipe::Pipe, signal::Signal};
use embassy_time::{Duration, Instant, Timer};

use super::callback::CallbackQueue;
use super::urc::{Prefix, UrcTable};
use crate::config::Config;
use crate::error::Error;
use crate::fmt::LossyStr;
use crate::framer::{find_line_end, line_break_run, starts_with, stop_tag, Match, Scan, StopTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum StopTagPolicy {
    Respect,
    Ignore,
}

/// Where the open exchange is in its command/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Response {
    /// No command written yet.
    Idle,
    /// Command name written, not yet terminated.
    Writing,
    /// Command sent, no response line selected.
    Pending,
    /// Positioned inside a response line.
    Line,
    /// The selected response line has ended.
    LineEnded,
    /// Stop tag consumed.
    Stopped,
}

/// What the decoder expects a line to be, besides a stop tag or URC.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Expect<'p> {
    Nothing,
    Prefix(&'p [u8]),
    /// Any line at all is a response line.
    AnyLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line {
    /// Stop tag and the length of its line content.
    Stop(StopTag, usize),
    /// Response line and the length of its prefix.
    Response(usize),
    Urc { id: u32, prefix_len: usize },
    Other,
    NeedMore,
}

/// The receive side of a client plus everything an exchange owns. Lives
/// inside the session mutex.
pub(crate) struct Stream<W, const N: usize> {
    pub(crate) writer: W,
    buf: [u8; N],
    start: usize,
    end: usize,
    /// Dropping the rest of a line that did not fit the buffer.
    discarding: bool,
    pub(crate) error: Option<Error>,
    pub(crate) policy: StopTagPolicy,
    pub(crate) abort: Option<Prefix>,
    pub(crate) prefix: Option<Prefix>,
    pub(crate) response: Response,
    pub(crate) params: usize,
    /// The last parameter read ended on a delimiter.
    pub(crate) delimited: bool,
    pub(crate) timeout: Duration,
    pub(crate) deadline: Instant,
    pub(crate) last_response: Option<Instant>,
}

impl<W, const N: usize> Stream<W, N> {
    pub(crate) fn new(writer: W, config: &Config) -> Self {
        Self {
            writer,
            buf: [0; N],
            start: 0,
            end: 0,
            discarding: false,
            error: None,
            policy: StopTagPolicy::Respect,
            abort: None,
            prefix: None,
            response: Response::Idle,
            params: 0,
            delimited: false,
            timeout: config.timeout(),
            deadline: Instant::now(),
            last_response: None,
        }
    }

    /// Resets per-exchange state at lock time.
    pub(crate) fn begin(&mut self, config: &Config) {
        self.error = None;
        self.policy = StopTagPolicy::Respect;
        self.abort = None;
        self.prefix = None;
        self.response = Response::Idle;
        self.params = 0;
        self.delimited = false;
        self.set_timeout(config.timeout());
    }

    pub(crate) fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.arm();
    }

    pub(crate) fn arm(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    /// Latches `e` unless an error is already latched; returns `e`.
    pub(crate) fn latch(&mut self, e: Error) -> Error {
        if self.error.is_none() {
            debug!("Exchange error latched: {:?}", e);
            self.error = Some(e);
        }
        e
    }

    pub(crate) fn available(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.end - self.start == N
    }

    pub(crate) fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.discarding = false;
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Moves whatever the receiver has queued into the buffer, without waiting.
    pub(crate) fn pull<M: RawMutex>(&mut self, ingress: &Pipe<M, N>) {
        self.compact();
        while self.end < N {
            match ingress.try_read(&mut self.buf[self.end..]) {
                Ok(n) => self.end += n,
                Err(_) => break,
            }
        }
    }

    /// Waits for at least one more byte, bounded by the exchange deadline.
    /// `Overflow` means the buffer holds `N` bytes and none can be consumed.
    pub(crate) async fn fill<M: RawMutex>(
        &mut self,
        ingress: &Pipe<M, N>,
        resync: &Signal<M, ()>,
    ) -> Result<(), Error> {
        if resync.try_take().is_some() {
            self.clear();
            return Err(Error::Aborted);
        }
        self.compact();
        if self.end == N {
            return Err(Error::Overflow);
        }
        let deadline = self.deadline;
        let read = select3(
            ingress.read(&mut self.buf[self.end..]),
            Timer::at(deadline),
            resync.wait(),
        )
        .await;
        match read {
            Either3::First(n) => {
                self.end += n;
                self.pull(ingress);
                Ok(())
            }
            Either3::Second(()) => Err(Error::Timeout),
            Either3::Third(()) => {
                self.clear();
                Err(Error::Aborted)
            }
        }
    }

    /// Classifies the line starting at the head of the buffer.
    pub(crate) fn classify<M: RawMutex>(
        &self,
        urcs: &UrcTable<'_, M>,
        stop: bool,
        expect: Expect<'_>,
    ) -> Line {
        let line = self.available();

        if stop {
            match stop_tag(line, self.abort.as_ref().map(|a| a.as_bytes())) {
                Scan::Found((tag, len)) => return Line::Stop(tag, len),
                Scan::NeedMore => return Line::NeedMore,
                Scan::NotFound => {}
            }
        }

        if let Expect::Prefix(prefix) = expect {
            match starts_with(line, prefix) {
                Match::Yes => return Line::Response(prefix.len()),
                Match::Partial => return Line::NeedMore,
                Match::No => {}
            }
        }

        match urcs.lookup(line) {
            Scan::Found((id, prefix_len)) => return Line::Urc { id, prefix_len },
            Scan::NeedMore => return Line::NeedMore,
            Scan::NotFound => {}
        }

        match expect {
            Expect::AnyLine => Line::Response(0),
            _ => Line::Other,
        }
    }

    /// Consumes complete lines while no exchange is reading: URCs are
    /// dispatched, everything else is stale and dropped. Returns as soon as
    /// only an incomplete line is left.
    pub(crate) fn drain_idle<'a, M: RawMutex>(
        &mut self,
        ingress: &Pipe<M, N>,
        urcs: &UrcTable<'a, M>,
        callbacks: &CallbackQueue<'a, M>,
    ) {
        let defer = |job| callbacks.push(job);
        loop {
            self.pull(ingress);

            if self.discarding {
                match find_line_end(self.available()) {
                    Some(end) => {
                        self.consume(end);
                        self.discarding = false;
                    }
                    None => {
                        self.clear();
                        self.discarding = true;
                        if ingress.is_empty() {
                            return;
                        }
                        continue;
                    }
                }
            }

            let run = line_break_run(self.available());
            self.consume(run);
            if self.available().is_empty() {
                if ingress.is_empty() {
                    return;
                }
                continue;
            }

            let kind = self.classify(urcs, false, Expect::Nothing);
            let line = self.available();
            let Some(end) = find_line_end(line) else {
                if self.is_full() {
                    warn!("Dropping line longer than the receive buffer");
                    self.clear();
                    self.discarding = true;
                    continue;
                }
                return;
            };

            match kind {
                Line::Urc { id, prefix_len } => {
                    debug!("URC {:?}", LossyStr(&line[..end]));
                    urcs.dispatch(id, &line[prefix_len..end], &defer);
                }
                Line::NeedMore => {}
                _ => trace!("Discarding stale line {:?}", LossyStr(&line[..end])),
            }
            self.consume(end);
        }
    }
}

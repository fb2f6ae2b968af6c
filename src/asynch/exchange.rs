use core::ops::{Deref, DerefMut};

use embassy_sync::{blocking_mutex::raw::RawMutex, mutex::MutexGuard};
use embassy_time::{Duration, Instant, Timer};
use embedded_io_async::Write;
use heapless::String;

use super::state::{Expect, Line, Response, StopTagPolicy, Stream};
use super::urc;
use super::Client;
use crate::error::{DeviceError, Error};
use crate::fmt::LossyStr;
use crate::framer::{
    find_line_end, is_line_break, line_break_run, stop_tag, ParamScanner, Scan, Step, StopTag,
    COMMAND_TERMINATOR, DELIMITER, ESCAPE, QUOTE,
};
use crate::hex::encode_byte;
use crate::params::{format_u64, HexSink, NumberSink, Parameter, SliceSink, TextSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    /// The current line is over.
    End,
    /// A URC was cut out of the line and its parameters carry on.
    Continue,
}

/// An open command/response cycle, holding the session lock.
///
/// Obtained from [`AtHandle::lock`](super::AtHandle::lock). Writes build a
/// command, reads walk through the response, and [`Exchange::unlock`] hands
/// back the outcome of the whole cycle. Errors that break the cycle are
/// latched: once set, reads and writes short-circuit with the same error
/// until [`Exchange::clear_error`] or the next lock.
pub struct Exchange<'c, 'a, M: RawMutex, W: Write, const N: usize> {
    client: &'c Client<'a, M, W, N>,
    stream: MutexGuard<'c, M, Stream<W, N>>,
    unlocked: bool,
}

impl<'c, 'a, M: RawMutex, W: Write, const N: usize> Exchange<'c, 'a, M, W, N> {
    pub(crate) fn new(
        client: &'c Client<'a, M, W, N>,
        stream: MutexGuard<'c, M, Stream<W, N>>,
    ) -> Self {
        Self {
            client,
            stream,
            unlocked: false,
        }
    }

    /// Finishes the exchange and returns its accumulated outcome.
    ///
    /// If the response was not read to its stop tag this is done first, then
    /// any URCs already buffered are dispatched.
    pub async fn unlock(mut self) -> Result<(), Error> {
        match self.stream.response {
            Response::Pending | Response::Line | Response::LineEnded => {
                self.response_stop().await.ok();
            }
            Response::Writing => {
                warn!("Unlocking with an unterminated command");
                self.latch(Error::InvalidUsage);
            }
            Response::Idle | Response::Stopped => {}
        }
        self.drain();
        self.stream.response = Response::Idle;
        self.unlocked = true;
        match self.stream.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn error(&self) -> Option<Error> {
        self.stream.error
    }

    /// The error the module reported, if that is what ended the response.
    pub fn device_error(&self) -> Option<DeviceError> {
        match self.stream.error {
            Some(Error::Device(e)) => Some(e),
            _ => None,
        }
    }

    pub fn clear_error(&mut self) {
        self.stream.error = None;
    }

    pub fn timeout(&self) -> Duration {
        self.stream.timeout
    }

    /// Replaces the timeout and restarts the deadline from now.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.stream.set_timeout(timeout);
    }

    /// A line starting with `tag` ends the response like a stop tag and
    /// latches [`Error::Aborted`]. `None` removes it.
    pub fn set_abort_tag(&mut self, tag: Option<&str>) -> Result<(), Error> {
        let abort = match tag {
            Some(tag) => Some(urc::prefix(tag).map_err(|e| self.latch(e))?),
            None => None,
        };
        self.stream.abort = abort;
        Ok(())
    }

    /// Suspends stop tag recognition until the returned guard is dropped.
    pub fn ignore_stop_tag(&mut self) -> StopTagGuard<'_, 'c, 'a, M, W, N> {
        let previous = core::mem::replace(&mut self.stream.policy, StopTagPolicy::Ignore);
        StopTagGuard {
            exchange: self,
            previous,
        }
    }

    pub fn stop_tag_ignored(&self) -> bool {
        self.stream.policy == StopTagPolicy::Ignore
    }

    /// Throws away everything received so far.
    pub fn flush(&mut self) {
        self.stream.clear();
        self.client.ingress.clear();
        self.client.resync.reset();
    }

    fn check(&self) -> Result<(), Error> {
        match self.stream.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn latch(&mut self, e: Error) -> Error {
        self.stream.latch(e)
    }

    fn misuse(&mut self, what: &str) -> Error {
        error!("Invalid AT client usage: {}", what);
        self.latch(Error::InvalidUsage)
    }

    fn drain(&mut self) {
        let client = self.client;
        self.stream
            .drain_idle(&client.ingress, &client.urcs, &client.callbacks);
    }

    // Command encoder

    /// Writes the command name, waiting out the command delay first.
    pub async fn command_start(&mut self, name: &str) -> Result<(), Error> {
        self.check()?;
        if !matches!(self.stream.response, Response::Idle | Response::Stopped) {
            return Err(self.misuse("command_start with a response open"));
        }
        if let Some(last) = self.stream.last_response {
            Timer::at(last + self.client.config.command_delay()).await;
        }
        debug!("AT command {}", name);
        self.stream.prefix = None;
        self.stream.params = 0;
        self.stream.response = Response::Writing;
        self.write_raw(name.as_bytes()).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        trace!("TX {:?}", LossyStr(bytes));
        if self.stream.writer.write_all(bytes).await.is_err() {
            warn!("Transport write failed");
            return Err(self.latch(Error::Aborted));
        }
        Ok(())
    }

    async fn begin_param(&mut self) -> Result<(), Error> {
        self.check()?;
        if self.stream.response != Response::Writing {
            return Err(self.misuse("parameter written outside a command"));
        }
        self.stream.params += 1;
        if self.stream.params > 1 {
            self.write_raw(&[DELIMITER]).await?;
        }
        Ok(())
    }

    pub async fn write_int(&mut self, value: i32) -> Result<(), Error> {
        self.begin_param().await?;
        if value < 0 {
            self.write_raw(b"-").await?;
        }
        let mut digits = [0; 20];
        self.write_raw(format_u64(value.unsigned_abs() as u64, &mut digits))
            .await
    }

    pub async fn write_uint64(&mut self, value: u64) -> Result<(), Error> {
        self.begin_param().await?;
        let mut digits = [0; 20];
        self.write_raw(format_u64(value, &mut digits)).await
    }

    /// Quoted strings get `"` and `\` escaped with a backslash.
    pub async fn write_string(&mut self, value: &str, quoted: bool) -> Result<(), Error> {
        self.begin_param().await?;
        if !quoted {
            return self.write_raw(value.as_bytes()).await;
        }
        self.write_raw(&[QUOTE]).await?;
        let mut rest = value.as_bytes();
        while let Some(i) = rest.iter().position(|b| *b == QUOTE || *b == ESCAPE) {
            self.write_raw(&rest[..i]).await?;
            self.write_raw(&[ESCAPE, rest[i]]).await?;
            rest = &rest[i + 1..];
        }
        self.write_raw(rest).await?;
        self.write_raw(&[QUOTE]).await
    }

    /// Raw octets. A `standalone` write is not a parameter: no delimiter,
    /// and it may follow a prompt after the command was sent.
    pub async fn write_bytes(&mut self, bytes: &[u8], standalone: bool) -> Result<(), Error> {
        if standalone {
            self.check()?;
        } else {
            self.begin_param().await?;
        }
        self.write_raw(bytes).await
    }

    pub async fn write_hex(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.begin_param().await?;
        let mut chunk = [0u8; 64];
        for part in bytes.chunks(chunk.len() / 2) {
            for (i, b) in part.iter().enumerate() {
                chunk[2 * i..2 * i + 2].copy_from_slice(&encode_byte(*b));
            }
            self.write_raw(&chunk[..part.len() * 2]).await?;
        }
        Ok(())
    }

    pub async fn write_param(&mut self, param: &Parameter<'_>) -> Result<(), Error> {
        match *param {
            Parameter::Int(v) => self.write_int(v).await,
            Parameter::Uint64(v) => self.write_uint64(v).await,
            Parameter::Str { value, quoted } => self.write_string(value, quoted).await,
            Parameter::Bytes(v) => self.write_bytes(v, false).await,
        }
    }

    /// Terminates the command line and starts the response deadline.
    pub async fn command_stop(&mut self) -> Result<(), Error> {
        self.check()?;
        if self.stream.response != Response::Writing {
            return Err(self.misuse("command_stop without command_start"));
        }
        self.write_raw(COMMAND_TERMINATOR).await?;
        if self.stream.writer.flush().await.is_err() {
            warn!("Transport flush failed");
            return Err(self.latch(Error::Aborted));
        }
        self.stream.response = Response::Pending;
        self.stream.arm();
        Ok(())
    }

    /// Sends the command and waits for its stop tag, for commands that
    /// answer with nothing but `OK`.
    pub async fn command_stop_read_response(&mut self) -> Result<(), Error> {
        self.command_stop().await?;
        self.response_stop().await
    }

    // Response decoder

    async fn more(&mut self) -> Result<(), Error> {
        let client = self.client;
        match self.stream.fill(&client.ingress, &client.resync).await {
            Ok(()) => Ok(()),
            Err(Error::Overflow) => {
                warn!("Response line longer than the receive buffer");
                Err(self.latch(Error::Aborted))
            }
            Err(Error::Timeout) => {
                warn!("Timed out waiting for response");
                Err(self.latch(Error::Timeout))
            }
            Err(e) => {
                warn!("Receiver lost sync");
                Err(self.latch(e))
            }
        }
    }

    /// Classifies the line at the head of the buffer. Lines of the expected
    /// prefix always belong to the exchange; with `any_line` and no prefix,
    /// so does every line that is not a stop tag or URC.
    fn classify(&self, any_line: bool) -> Line {
        let stream = &*self.stream;
        let expect = match (&stream.prefix, any_line) {
            (Some(prefix), _) => Expect::Prefix(prefix.as_bytes()),
            (None, true) => Expect::AnyLine,
            (None, false) => Expect::Nothing,
        };
        stream.classify(
            &self.client.urcs,
            stream.policy == StopTagPolicy::Respect,
            expect,
        )
    }

    fn finish(&mut self, tag: StopTag, len: usize) -> Result<(), Error> {
        self.stream.consume(len);
        self.stream.response = Response::Stopped;
        self.stream.last_response = Some(Instant::now());
        match tag {
            StopTag::Ok => Ok(()),
            StopTag::Error(e) => {
                debug!("Device error {:?}", e);
                Err(self.latch(Error::Device(e)))
            }
            StopTag::Abort => {
                warn!("Abort tag received");
                Err(self.latch(Error::Aborted))
            }
        }
    }

    async fn skip_line_breaks(&mut self) -> Result<(), Error> {
        loop {
            let run = line_break_run(self.stream.available());
            self.stream.consume(run);
            if !self.stream.available().is_empty() {
                return Ok(());
            }
            self.more().await?;
        }
    }

    /// Drops the rest of the current line, leaving its terminator.
    async fn skip_line(&mut self) -> Result<(), Error> {
        loop {
            if let Some(end) = find_line_end(self.stream.available()) {
                trace!("Skipping {:?}", LossyStr(&self.stream.available()[..end]));
                self.stream.consume(end);
                return Ok(());
            }
            let n = self.stream.available().len();
            self.stream.consume(n);
            self.more().await?;
        }
    }

    async fn dispatch_urc(&mut self, id: u32, prefix_len: usize) -> Result<(), Error> {
        loop {
            if let Some(end) = find_line_end(self.stream.available()) {
                let client = self.client;
                let line = self.stream.available();
                debug!("URC {:?}", LossyStr(&line[..end]));
                client
                    .urcs
                    .dispatch(id, &line[prefix_len..end], &|job| client.callbacks.push(job));
                self.stream.consume(end);
                return Ok(());
            }
            if self.stream.is_full() {
                warn!("Dropping URC longer than the receive buffer");
                return self.skip_line().await;
            }
            self.more().await?;
        }
    }

    /// Decides what a line break met inside a response line means. URC lines
    /// behind it are dispatched and cut out of the stream.
    async fn line_boundary(&mut self) -> Result<Boundary, Error> {
        let mut after_urc = false;
        loop {
            self.skip_line_breaks().await?;
            match self.classify(true) {
                Line::NeedMore => self.more().await?,
                Line::Stop(tag, len) => {
                    self.finish(tag, len).ok();
                    return Ok(Boundary::End);
                }
                Line::Urc { id, prefix_len } => {
                    self.dispatch_urc(id, prefix_len).await?;
                    after_urc = true;
                }
                Line::Other if after_urc => return Ok(Boundary::Continue),
                // Without a prefix only a dangling delimiter tells a
                // continuation from a new line.
                Line::Response(_)
                    if after_urc && self.stream.prefix.is_none() && self.stream.delimited =>
                {
                    return Ok(Boundary::Continue)
                }
                Line::Response(_) | Line::Other => {
                    self.stream.response = Response::LineEnded;
                    return Ok(Boundary::End);
                }
            }
        }
    }

    fn readable(&mut self) -> Result<(), Error> {
        self.check()?;
        match self.stream.response {
            Response::Line => Ok(()),
            Response::LineEnded | Response::Stopped => Err(Error::NoParameter),
            Response::Idle | Response::Writing | Response::Pending => {
                Err(self.misuse("parameter read before response_start"))
            }
        }
    }

    /// Feeds one delimited parameter to `sink`, consuming its delimiter.
    async fn read_param(&mut self, mut sink: impl FnMut(u8)) -> Result<(), Error> {
        self.readable()?;
        let mut scanner = ParamScanner::new();
        loop {
            let Some(&b) = self.stream.available().first() else {
                self.more().await?;
                continue;
            };
            match scanner.feed(b) {
                Step::Keep(c) => {
                    self.stream.consume(1);
                    self.stream.delimited = false;
                    sink(c);
                }
                Step::Skip => {
                    self.stream.consume(1);
                    self.stream.delimited = false;
                }
                Step::Delimiter => {
                    self.stream.consume(1);
                    self.stream.delimited = true;
                    return Ok(());
                }
                Step::LineBreak => {
                    if self.line_boundary().await? == Boundary::End {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Scans forward to the next line starting with `prefix` (any response
    /// line for `None`) and positions the decoder after the prefix.
    ///
    /// Reaching the stop tag first gives [`Error::NoParameter`] for `OK`, or
    /// the error the module reported.
    pub async fn response_start(&mut self, prefix: Option<&str>) -> Result<(), Error> {
        self.check()?;
        match self.stream.response {
            Response::Idle | Response::Writing => {
                return Err(self.misuse("response_start before command_stop"));
            }
            Response::Stopped => return Err(Error::NoParameter),
            Response::Line => self.skip_line().await?,
            Response::Pending | Response::LineEnded => {}
        }

        let prefix = match prefix {
            Some(p) => Some(urc::prefix(p).map_err(|e| self.latch(e))?),
            None => None,
        };
        self.stream.prefix = prefix;

        loop {
            self.skip_line_breaks().await?;
            match self.classify(true) {
                Line::NeedMore => self.more().await?,
                Line::Stop(tag, len) => {
                    self.finish(tag, len)?;
                    return Err(Error::NoParameter);
                }
                Line::Response(len) => {
                    self.stream.consume(len);
                    self.stream.response = Response::Line;
                    self.stream.delimited = false;
                    return Ok(());
                }
                Line::Urc { id, prefix_len } => self.dispatch_urc(id, prefix_len).await?,
                Line::Other => self.skip_line().await?,
            }
        }
    }

    pub async fn read_int(&mut self) -> Result<i32, Error> {
        let mut number = NumberSink::default();
        self.read_param(|c| number.push(c)).await?;
        number.int()
    }

    pub async fn read_uint64(&mut self) -> Result<u64, Error> {
        let mut number = NumberSink::default();
        self.read_param(|c| number.push(c)).await?;
        number.uint64()
    }

    /// Reads a string parameter into `buf`, unquoted and unescaped.
    ///
    /// Returns the full length of the value; at most `buf.len()` bytes of it
    /// are stored. With `None` the parameter is only measured.
    pub async fn read_string(&mut self, buf: Option<&mut [u8]>) -> Result<usize, Error> {
        let mut sink = SliceSink::new(buf);
        self.read_param(|c| sink.push(c)).await?;
        Ok(sink.len())
    }

    pub async fn read_text<const L: usize>(&mut self) -> Result<String<L>, Error> {
        let mut sink = TextSink::<L>::default();
        self.read_param(|c| sink.push(c)).await?;
        sink.finish()
    }

    /// Decodes a hex string parameter, returning the number of octets.
    pub async fn read_hex(&mut self, buf: Option<&mut [u8]>) -> Result<usize, Error> {
        let mut sink = HexSink::new(buf);
        self.read_param(|c| sink.push(c)).await?;
        sink.finish()
    }

    /// Reads `len` raw octets, delimiters and line breaks included.
    ///
    /// While stop tags are respected the read ends early at a line holding a
    /// stop tag, and the count actually read is returned. Unless
    /// `standalone`, a delimiter right after the octets is consumed as for
    /// any other parameter.
    pub async fn read_bytes(
        &mut self,
        buf: Option<&mut [u8]>,
        len: usize,
        standalone: bool,
    ) -> Result<usize, Error> {
        if buf.as_ref().is_some_and(|b| b.len() < len) {
            return Err(self.misuse("read_bytes buffer shorter than length"));
        }
        if standalone {
            self.check()?;
            match self.stream.response {
                Response::Pending | Response::Line | Response::LineEnded => {}
                Response::Stopped => return Err(Error::NoParameter),
                Response::Idle | Response::Writing => {
                    return Err(self.misuse("read_bytes before command_stop"));
                }
            }
        } else {
            self.readable()?;
        }

        let mut sink = SliceSink::new(buf);
        self.raw_bytes(&mut sink, len).await?;
        if !standalone && self.stream.response == Response::Line {
            self.param_end().await?;
        }
        Ok(sink.len())
    }

    async fn raw_bytes(&mut self, sink: &mut SliceSink<'_>, len: usize) -> Result<(), Error> {
        while sink.len() < len {
            let respect = self.stream.policy == StopTagPolicy::Respect;
            let avail = self.stream.available();
            let Some(&first) = avail.first() else {
                self.more().await?;
                continue;
            };

            if respect && is_line_break(first) {
                let run = line_break_run(avail);
                let tag = if run < avail.len() {
                    stop_tag(&avail[run..], self.stream.abort.as_ref().map(|a| a.as_bytes()))
                } else {
                    Scan::NeedMore
                };
                match tag {
                    Scan::Found((tag, tag_len)) => {
                        self.stream.consume(run);
                        self.finish(tag, tag_len).ok();
                        return Ok(());
                    }
                    Scan::NeedMore => {
                        self.more().await?;
                        continue;
                    }
                    Scan::NotFound => {}
                }
            }

            let avail = self.stream.available();
            let want = (len - sink.len()).min(avail.len());
            let n = if !respect {
                want
            } else if is_line_break(first) {
                1
            } else {
                find_line_end(&avail[..want]).unwrap_or(want)
            };
            sink.extend(&avail[..n]);
            self.stream.consume(n);
            self.stream.delimited = false;
        }
        Ok(())
    }

    async fn param_end(&mut self) -> Result<(), Error> {
        loop {
            let next = self.stream.available().first().copied();
            match next {
                None => self.more().await?,
                Some(DELIMITER) => {
                    self.stream.consume(1);
                    self.stream.delimited = true;
                    return Ok(());
                }
                Some(b) if is_line_break(b) => {
                    if self.line_boundary().await? == Boundary::End {
                        return Ok(());
                    }
                }
                Some(_) => return Ok(()),
            }
        }
    }

    /// Discards `count` whole parameters.
    pub async fn skip_parameters(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.read_param(|_| {}).await?;
        }
        Ok(())
    }

    /// Discards exactly `len` raw octets, whatever they contain.
    pub async fn skip_bytes(&mut self, len: usize) -> Result<(), Error> {
        self.read_bytes(None, len, true).await.map(|_| ())
    }

    /// Waits for the single octet `c`, typically a `>` or `@` data prompt.
    ///
    /// Other bytes are dropped, URC lines among them dispatched. A stop tag
    /// ends the wait with the module's error, or `NoParameter` for `OK`.
    pub async fn wait_character(&mut self, c: u8) -> Result<(), Error> {
        self.check()?;
        let mut line_start = true;
        loop {
            let Some(&b) = self.stream.available().first() else {
                self.more().await?;
                continue;
            };
            if b == c {
                self.stream.consume(1);
                return Ok(());
            }
            if is_line_break(b) {
                self.stream.consume(1);
                line_start = true;
                continue;
            }
            if line_start {
                match self.classify(false) {
                    Line::NeedMore => {
                        self.more().await?;
                        continue;
                    }
                    Line::Stop(tag, len) => {
                        self.finish(tag, len)?;
                        return Err(Error::NoParameter);
                    }
                    Line::Urc { id, prefix_len } => {
                        self.dispatch_urc(id, prefix_len).await?;
                        continue;
                    }
                    Line::Response(_) | Line::Other => line_start = false,
                }
            }
            self.stream.consume(1);
        }
    }

    /// Reads past the stop tag, whatever is left of the response.
    ///
    /// Returns the latched outcome. After a timeout or abort nothing is
    /// waited for again.
    pub async fn response_stop(&mut self) -> Result<(), Error> {
        if let Some(e @ (Error::Timeout | Error::Aborted)) = self.stream.error {
            self.stream.response = Response::Stopped;
            return Err(e);
        }
        match self.stream.response {
            Response::Stopped => return self.check(),
            Response::Idle | Response::Writing => {
                return Err(self.misuse("response_stop before command_stop"));
            }
            Response::Pending | Response::Line | Response::LineEnded => {}
        }

        let policy = core::mem::replace(&mut self.stream.policy, StopTagPolicy::Respect);
        self.scan_to_stop_tag().await.ok();
        self.stream.policy = policy;
        self.stream.response = Response::Stopped;
        self.stream.last_response = Some(Instant::now());
        self.check()
    }

    async fn scan_to_stop_tag(&mut self) -> Result<(), Error> {
        if self.stream.response == Response::Line {
            self.skip_line().await?;
        }
        loop {
            self.skip_line_breaks().await?;
            match self.classify(false) {
                Line::NeedMore => self.more().await?,
                Line::Stop(tag, len) => return self.finish(tag, len),
                Line::Urc { id, prefix_len } => self.dispatch_urc(id, prefix_len).await?,
                Line::Response(_) | Line::Other => self.skip_line().await?,
            }
        }
    }
}

impl<'c, 'a, M: RawMutex, W: Write, const N: usize> Drop for Exchange<'c, 'a, M, W, N> {
    fn drop(&mut self) {
        if !self.unlocked {
            warn!("Exchange dropped without unlock");
            self.stream.response = Response::Idle;
            self.drain();
        }
        self.client.release();
    }
}

/// Stop tag recognition suspended for as long as this guard lives.
///
/// Dereferences to the exchange, so reads go through the guard. Guards nest;
/// each restores the policy it found.
pub struct StopTagGuard<'x, 'c, 'a, M: RawMutex, W: Write, const N: usize> {
    exchange: &'x mut Exchange<'c, 'a, M, W, N>,
    previous: StopTagPolicy,
}

impl<'x, 'c, 'a, M: RawMutex, W: Write, const N: usize> Deref
    for StopTagGuard<'x, 'c, 'a, M, W, N>
{
    type Target = Exchange<'c, 'a, M, W, N>;

    fn deref(&self) -> &Self::Target {
        &*self.exchange
    }
}

impl<'x, 'c, 'a, M: RawMutex, W: Write, const N: usize> DerefMut
    for StopTagGuard<'x, 'c, 'a, M, W, N>
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.exchange
    }
}

impl<'x, 'c, 'a, M: RawMutex, W: Write, const N: usize> Drop
    for StopTagGuard<'x, 'c, 'a, M, W, N>
{
    fn drop(&mut self) {
        self.exchange.stream.policy = self.previous;
    }
}

#[cfg(test)]
mod test {
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    use embassy_time::{with_timeout, Duration, Instant, Timer};

    use crate::config::Config;
    use crate::error::{DeviceError, DeviceErrorKind, Error};
    use crate::params::Parameter;
    use crate::test_helpers::{leaked, Wire};

    async fn wait_until(mut done: impl FnMut() -> bool) {
        while !done() {
            Timer::after_millis(1).await;
        }
    }

    #[test]
    fn reads_int_response() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+INT2").await.unwrap();
            x.command_stop().await.unwrap();
            assert_eq!(wire.sent(), b"AT+INT2\r");

            wire.respond(b"\r\n+INT: 2147483647\r\n\r\nOK\r\n").await;
            x.response_start(Some("+INT:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(i32::MAX));
            assert_eq!(x.read_int().await, Err(Error::NoParameter));
            assert_eq!(x.response_stop().await, Ok(()));
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn encodes_and_decodes_every_parameter_type() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+TEST=").await.unwrap();
            x.write_int(i32::MIN).await.unwrap();
            x.write_int(i32::MAX).await.unwrap();
            x.write_uint64(u64::MAX).await.unwrap();
            x.write_string("a\"b\\c, d", true).await.unwrap();
            x.write_param(&Parameter::bare("bare")).await.unwrap();
            x.write_hex(&[0x00, 0xA5, 0xFF]).await.unwrap();
            x.write_param(&Parameter::Int(0)).await.unwrap();
            x.write_param(&Parameter::Uint64(0)).await.unwrap();
            x.command_stop().await.unwrap();

            let line: &[u8] =
                b"-2147483648,2147483647,18446744073709551615,\"a\\\"b\\\\c, d\",bare,00A5FF,0,0";
            let mut expected = b"AT+TEST=".to_vec();
            expected.extend_from_slice(line);
            expected.push(b'\r');
            assert_eq!(wire.sent(), expected);

            wire.respond(b"\r\n+TEST: ").await;
            wire.respond(line).await;
            wire.respond(b"\r\nOK\r\n").await;

            x.response_start(Some("+TEST:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(i32::MIN));
            assert_eq!(x.read_int().await, Ok(i32::MAX));
            assert_eq!(x.read_uint64().await, Ok(u64::MAX));
            assert_eq!(x.read_text::<16>().await.unwrap().as_str(), "a\"b\\c, d");
            let mut bare = [0u8; 8];
            assert_eq!(x.read_string(Some(&mut bare)).await, Ok(4));
            assert_eq!(&bare[..4], b"bare");
            let mut hex = [0u8; 3];
            assert_eq!(x.read_hex(Some(&mut hex)).await, Ok(3));
            assert_eq!(hex, [0x00, 0xA5, 0xFF]);
            assert_eq!(x.read_int().await, Ok(0));
            assert_eq!(x.read_uint64().await, Ok(0));
            assert_eq!(x.read_int().await, Err(Error::NoParameter));
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn binary_payload_round_trip() {
        let payload: Vec<u8> = (0..=255).collect();
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+USOWR=").await.unwrap();
            x.write_int(0).await.unwrap();
            x.write_int(256).await.unwrap();
            x.command_stop().await.unwrap();

            wire.respond(b"\r\n@").await;
            x.wait_character(b'@').await.unwrap();
            x.write_bytes(&payload, true).await.unwrap();

            let mut expected = b"AT+USOWR=0,256\r".to_vec();
            expected.extend_from_slice(&payload);
            assert_eq!(wire.sent(), expected);

            wire.respond(b"\r\n+USOWR: 0,256\r\nOK\r\n").await;
            x.response_start(Some("+USOWR:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(0));
            assert_eq!(x.read_int().await, Ok(256));
            assert_eq!(x.unlock().await, Ok(()));

            let mut x = at.lock().await.unwrap();
            x.command_start("AT+USORD=0,256").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+USORD: 0,256,\"").await;
            wire.respond(&payload).await;
            wire.respond(b"\"\r\nOK\r\n").await;

            x.response_start(Some("+USORD:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(0));
            assert_eq!(x.read_int().await, Ok(256));
            let mut data = [0u8; 256];
            {
                let mut raw = x.ignore_stop_tag();
                assert!(raw.stop_tag_ignored());
                raw.skip_bytes(1).await.unwrap();
                assert_eq!(raw.read_bytes(Some(&mut data), 256, true).await, Ok(256));
                raw.skip_bytes(1).await.unwrap();
            }
            assert!(!x.stop_tag_ignored());
            assert_eq!(&data[..], &payload[..]);
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn skips_and_null_sinks() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+P").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+P: 1,\"two\",3,\"four, 4\",5\r\nOK\r\n").await;

            x.response_start(Some("+P:")).await.unwrap();
            x.skip_parameters(2).await.unwrap();
            assert_eq!(x.read_int().await, Ok(3));
            assert_eq!(x.read_string(None).await, Ok(7));
            assert_eq!(x.read_int().await, Ok(5));
            assert_eq!(x.skip_parameters(1).await, Err(Error::NoParameter));
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn byte_skip_crosses_parameter_boundaries() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+P").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+P: abc,def,123\r\n+P: abc,def\r\nOK\r\n")
                .await;

            // " abc,d" spans the first delimiter.
            x.response_start(Some("+P:")).await.unwrap();
            x.skip_bytes(6).await.unwrap();
            assert_eq!(x.read_text::<8>().await.unwrap().as_str(), "ef");
            assert_eq!(x.read_int().await, Ok(123));

            // Landing on a delimiter leaves an empty parameter in front.
            x.response_start(Some("+P:")).await.unwrap();
            x.skip_bytes(4).await.unwrap();
            assert_eq!(x.read_string(None).await, Ok(0));
            assert_eq!(x.read_text::<8>().await.unwrap().as_str(), "def");
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn early_response_stop_leaves_a_clean_stream() {
        let wire = Wire::new();
        let client = wire.client(Config::new().command_delay_ms(0));
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+COPS?").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+COPS: 0,0,\"operator\",7\r\n+COPS: 1\r\nOK\r\n")
                .await;
            x.response_start(Some("+COPS:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(0));
            assert_eq!(x.response_stop().await, Ok(()));
            assert_eq!(x.response_stop().await, Ok(()));
            assert_eq!(x.read_int().await, Err(Error::NoParameter));

            x.command_start("AT+CSQ").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+CSQ: 17,99\r\nOK\r\n").await;
            x.response_start(Some("+CSQ:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(17));
            assert_eq!(x.unlock().await, Ok(()));
            assert_eq!(wire.sent(), b"AT+COPS?\rAT+CSQ\r");
        });
    }

    #[test]
    fn urcs_are_cut_out_of_responses() {
        let wire = Wire::new();
        let seen = RefCell::new(Vec::new());
        let client = wire.client(Config::new());
        client
            .set_urc_handler("+URC:", |line| {
                seen.borrow_mut().push(line.read_int().unwrap());
            })
            .unwrap();

        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+P").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+URC: 1\r\n+P: 1,2\r\n+URC: 2\r\n,3\r\n+URC: 3\r\n+P: 4\r\nOK\r\n")
                .await;

            x.response_start(Some("+P:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(1));
            assert_eq!(x.read_int().await, Ok(2));
            assert_eq!(x.read_int().await, Ok(3));
            assert_eq!(x.read_int().await, Err(Error::NoParameter));
            x.response_start(Some("+P:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(4));
            assert_eq!(x.unlock().await, Ok(()));
            assert_eq!(*seen.borrow(), [1, 2, 3]);

            wire.respond(b"\r\n+URC: 4\r\n").await;
            wait_until(|| seen.borrow().len() == 4).await;
            assert_eq!(*seen.borrow(), [1, 2, 3, 4]);
        });
    }

    #[test]
    fn mixed_response_with_injected_urc() {
        type Event = (i32, heapless::String<8>, u64, usize, Vec<u8>);

        let wire = Wire::new();
        let events: RefCell<Vec<Event>> = RefCell::new(Vec::new());
        let client = wire.client(Config::new());
        client
            .set_urc_handler("+UEV:", |line| {
                let a = line.read_int().unwrap();
                let b = line.read_text().unwrap();
                let c = line.read_uint64().unwrap();
                let mut hex = [0u8; 4];
                let d = line.read_hex(Some(&mut hex)).unwrap();
                let mut raw = [0u8; 8];
                let n = line.read_string(Some(&mut raw)).unwrap();
                assert_eq!(hex[0], 0xA5);
                events.borrow_mut().push((a, b, c, d, raw[..n].to_vec()));
            })
            .unwrap();

        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+MIX").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+MIX: 2147483647,\"quoted, text\",\r\n").await;
            wire.respond(b"+UEV: -1,\"urc\",18446744073709551615,A5,raw\r\n").await;
            wire.respond(b"18446744073709551615,bare,\"\"\r\n\r\nOK\r\n").await;

            x.response_start(Some("+MIX:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(i32::MAX));
            assert_eq!(x.read_text::<16>().await.unwrap().as_str(), "quoted, text");
            assert_eq!(x.read_uint64().await, Ok(u64::MAX));
            assert_eq!(x.read_text::<8>().await.unwrap().as_str(), "bare");
            assert_eq!(x.read_string(None).await, Ok(0));
            assert_eq!(x.read_string(None).await, Err(Error::NoParameter));
            assert_eq!(x.unlock().await, Ok(()));
        });

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, -1);
        assert_eq!(events[0].1.as_str(), "urc");
        assert_eq!(events[0].2, u64::MAX);
        assert_eq!(events[0].3, 1);
        assert_eq!(events[0].4, b"raw");
    }

    #[test]
    fn device_error_short_circuits() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+CPIN?").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+CME ERROR: 10\r\n").await;

            let start = Instant::now();
            let cme = DeviceError {
                kind: DeviceErrorKind::Cme,
                code: Some(10),
            };
            assert_eq!(
                x.response_start(Some("+CPIN:")).await,
                Err(Error::Device(cme))
            );
            assert_eq!(x.device_error(), Some(cme));
            assert_eq!(x.read_int().await, Err(Error::Device(cme)));
            assert_eq!(x.unlock().await, Err(Error::Device(cme)));
            assert!(start.elapsed() < Duration::from_secs(1));

            let mut x = at.lock().await.unwrap();
            assert_eq!(x.error(), None);
            x.command_start("AT+X").await.unwrap();
            assert_eq!(x.command_stop().await, Ok(()));
            wire.respond(b"\r\nERROR\r\n").await;
            assert_eq!(
                x.response_stop().await,
                Err(Error::Device(DeviceError::plain()))
            );
            x.clear_error();
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn missing_response_times_out() {
        let wire = Wire::new();
        let client = wire.client(Config::new().timeout_ms(100));
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            assert_eq!(x.timeout(), Duration::from_millis(100));
            x.command_start("AT").await.unwrap();
            x.command_stop().await.unwrap();

            let start = Instant::now();
            assert_eq!(x.response_start(None).await, Err(Error::Timeout));
            assert!(start.elapsed() >= Duration::from_millis(90));

            let start = Instant::now();
            assert_eq!(x.read_int().await, Err(Error::Timeout));
            assert_eq!(x.unlock().await, Err(Error::Timeout));
            assert!(start.elapsed() < Duration::from_millis(50));
        });
    }

    #[test]
    fn set_timeout_rearms_the_deadline() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT").await.unwrap();
            x.command_stop().await.unwrap();
            x.set_timeout(Duration::from_millis(50));
            let start = Instant::now();
            assert_eq!(x.response_stop().await, Err(Error::Timeout));
            assert!(start.elapsed() < Duration::from_secs(1));
            assert_eq!(x.unlock().await, Err(Error::Timeout));
        });
    }

    #[test]
    fn reentrant_lock_is_rejected() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let other = client.handle();
            let x = at.lock().await.unwrap();
            assert!(matches!(at.lock().await, Err(Error::InvalidUsage)));
            assert!(with_timeout(Duration::from_millis(20), other.lock())
                .await
                .is_err());
            assert_eq!(x.unlock().await, Ok(()));

            let x = other.lock().await.unwrap();
            drop(x);
            let x = at.lock().await.unwrap();
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn misuse_is_latched_and_response_still_consumed() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            assert_eq!(x.read_int().await, Err(Error::InvalidUsage));
            x.clear_error();

            x.command_start("AT+P").await.unwrap();
            x.command_stop().await.unwrap();
            assert_eq!(x.read_int().await, Err(Error::InvalidUsage));
            assert_eq!(x.command_start("AT").await, Err(Error::InvalidUsage));
            wire.respond(b"\r\n+P: 1\r\nOK\r\n").await;
            assert_eq!(x.unlock().await, Err(Error::InvalidUsage));

            let mut x = at.lock().await.unwrap();
            x.command_start("AT+P").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+P: 2\r\nOK\r\n").await;
            x.response_start(Some("+P:")).await.unwrap();
            let mut short = [0u8; 2];
            assert_eq!(
                x.read_bytes(Some(&mut short), 4, false).await,
                Err(Error::InvalidUsage)
            );
            assert_eq!(x.unlock().await, Err(Error::InvalidUsage));

            let mut x = at.lock().await.unwrap();
            assert_eq!(
                x.set_abort_tag(Some("+A_PREFIX_THAT_IS_TOO_LONG")),
                Err(Error::InvalidUsage)
            );
            assert_eq!(x.unlock().await, Err(Error::InvalidUsage));
        });
    }

    #[test]
    fn command_delay_is_honoured() {
        let wire = Wire::new();
        let client = wire.client(Config::new().command_delay_ms(100));
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\nOK\r\n").await;
            assert_eq!(x.response_stop().await, Ok(()));
            assert_eq!(x.unlock().await, Ok(()));

            let ended = Instant::now();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT").await.unwrap();
            assert!(ended.elapsed() >= Duration::from_millis(90));
            wire.respond(b"\r\nOK\r\n").await;
            assert_eq!(x.command_stop_read_response().await, Ok(()));
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn abort_tag_ends_the_response() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.set_abort_tag(Some("+STARTUP")).unwrap();
            x.command_start("AT+CFUN=16").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+STARTUP\r\n").await;
            assert_eq!(x.response_start(Some("+CFUN:")).await, Err(Error::Aborted));
            assert_eq!(x.unlock().await, Err(Error::Aborted));
        });
    }

    #[test]
    fn raw_read_stops_at_stop_tag_unless_ignored() {
        let wire = Wire::new();
        let client = wire.client(Config::new());
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+R").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+R: 10,abc\r\nOK\r\n").await;
            x.response_start(Some("+R:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(10));
            let mut buf = [0u8; 10];
            assert_eq!(x.read_bytes(Some(&mut buf), 10, false).await, Ok(3));
            assert_eq!(&buf[..3], b"abc");
            assert_eq!(x.read_bytes(None, 1, false).await, Err(Error::NoParameter));
            assert_eq!(x.unlock().await, Ok(()));

            let mut x = at.lock().await.unwrap();
            x.command_start("AT+R").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+R: 7,ab\r\nOK\r\n\r\nOK\r\n").await;
            x.response_start(Some("+R:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(7));
            {
                let mut outer = x.ignore_stop_tag();
                let inner = outer.ignore_stop_tag();
                assert!(inner.stop_tag_ignored());
                drop(inner);
                assert!(outer.stop_tag_ignored());
                assert_eq!(outer.read_bytes(Some(&mut buf), 7, false).await, Ok(7));
            }
            assert_eq!(&buf[..7], b"ab\r\nOK\r");
            assert!(!x.stop_tag_ignored());
            assert_eq!(x.unlock().await, Ok(()));
        });
    }

    #[test]
    fn waits_for_prompt_past_urcs() {
        let wire = Wire::new();
        let urcs = Cell::new(0);
        let client = wire.client(Config::new());
        client
            .set_urc_handler("+UUSORD:", |_| urcs.set(urcs.get() + 1))
            .unwrap();

        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+USOWR=0,2").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+UUSORD: 0,5\r\n>").await;
            assert_eq!(x.wait_character(b'>').await, Ok(()));
            assert_eq!(urcs.get(), 1);
            x.write_bytes(b"hi", true).await.unwrap();
            wire.respond(b"\r\nOK\r\n").await;
            assert_eq!(x.unlock().await, Ok(()));

            let mut x = at.lock().await.unwrap();
            x.command_start("AT+USOWR=0,2").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\nERROR\r\n").await;
            assert_eq!(
                x.wait_character(b'>').await,
                Err(Error::Device(DeviceError::plain()))
            );
            assert_eq!(x.unlock().await, Err(Error::Device(DeviceError::plain())));
        });
    }

    #[test]
    fn flush_discards_buffered_input() {
        let wire = Wire::new();
        let client = wire.client(Config::new().timeout_ms(100));
        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\nOK\r\n").await;
            Timer::after_millis(10).await;
            x.flush();
            assert_eq!(x.response_stop().await, Err(Error::Timeout));
            assert_eq!(x.unlock().await, Err(Error::Timeout));
        });
    }

    #[test]
    fn deferred_jobs_run_in_order_and_may_lock() {
        let (wire, client) = leaked(Config::new());
        let order: &RefCell<Vec<u32>> =
            std::boxed::Box::leak(std::boxed::Box::new(RefCell::new(Vec::new())));

        client
            .set_urc_handler("+UUSORD:", move |line| {
                let socket = line.read_int().unwrap();
                let len = line.read_int().unwrap();
                order.borrow_mut().push(1);
                line.defer(async move {
                    let at = client.handle();
                    let mut x = at.lock().await.unwrap();
                    x.command_start("AT+USORD=").await.unwrap();
                    x.write_int(socket).await.unwrap();
                    x.write_int(len).await.unwrap();
                    x.command_stop_read_response().await.unwrap();
                    x.unlock().await.unwrap();
                    order.borrow_mut().push(2);
                })
                .unwrap();
                client
                    .callback(async move { order.borrow_mut().push(3) })
                    .unwrap();
                // One shot.
                assert!(client.remove_urc_handler("+UUSORD:"));
            })
            .unwrap();

        wire.run(client, async {
            wire.respond(b"\r\n+UUSORD: 3,16\r\n").await;

            let mut sent = Vec::new();
            wait_until(|| {
                sent.extend(wire.sent());
                sent.ends_with(b"\r")
            })
            .await;
            assert_eq!(sent, b"AT+USORD=3,16\r");
            assert_eq!(*order.borrow(), [1]);

            wire.respond(b"\r\nOK\r\n+UUSORD: 3,16\r\n").await;
            wait_until(|| order.borrow().len() == 3).await;
            Timer::after_millis(10).await;
            assert_eq!(*order.borrow(), [1, 2, 3]);
        });
    }

    #[test]
    fn own_prefix_lines_are_not_urcs_on_early_stop() {
        let wire = Wire::new();
        let seen = RefCell::new(Vec::new());
        let client = wire.client(Config::new());
        client
            .set_urc_handler("+CREG:", |line| {
                seen.borrow_mut().push(line.read_int().unwrap());
            })
            .unwrap();

        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+CREG?").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+CREG: 7,1\r\n+CREG: 8,2\r\n+CREG: 9,3\r\nOK\r\n")
                .await;
            x.response_start(Some("+CREG:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(7));
            assert_eq!(x.unlock().await, Ok(()));
            assert!(seen.borrow().is_empty());

            // Lines of the prefix skipped while waiting for a prompt as well.
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+CREG?").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n+CREG: 7,1\r\n+CREG: 8,2\r\n>").await;
            x.response_start(Some("+CREG:")).await.unwrap();
            assert_eq!(x.read_int().await, Ok(7));
            assert_eq!(x.wait_character(b'>').await, Ok(()));
            wire.respond(b"\r\nOK\r\n").await;
            assert_eq!(x.unlock().await, Ok(()));
            assert!(seen.borrow().is_empty());

            wire.respond(b"\r\n+CREG: 5\r\n").await;
            wait_until(|| seen.borrow().len() == 1).await;
            assert_eq!(*seen.borrow(), [5]);
        });
    }

    #[test]
    fn dropped_exchange_dispatches_buffered_urcs() {
        let wire = Wire::new();
        let urcs = Cell::new(0);
        let client = wire.client(Config::new());
        client
            .set_urc_handler("+URC:", |_| urcs.set(urcs.get() + 1))
            .unwrap();

        wire.run(&client, async {
            let at = client.handle();
            let x = at.lock().await.unwrap();
            wire.respond(b"\r\n+URC: 1\r\n").await;
            Timer::after_millis(10).await;
            assert_eq!(urcs.get(), 0);
            drop(x);
            assert_eq!(urcs.get(), 1);
        });
    }

    #[test]
    fn urc_between_unprefixed_parameters_is_transparent() {
        let wire = Wire::new();
        let urcs = Cell::new(0);
        let client = wire.client(Config::new());
        client
            .set_urc_handler("+URC:", |_| urcs.set(urcs.get() + 1))
            .unwrap();

        wire.run(&client, async {
            let at = client.handle();
            let mut x = at.lock().await.unwrap();
            x.command_start("AT+P").await.unwrap();
            x.command_stop().await.unwrap();
            wire.respond(b"\r\n11,\r\n+URC: 1\r\n22\r\n33\r\n+URC: 2\r\n44\r\nOK\r\n")
                .await;

            x.response_start(None).await.unwrap();
            assert_eq!(x.read_int().await, Ok(11));
            assert_eq!(x.read_int().await, Ok(22));
            assert_eq!(x.read_int().await, Err(Error::NoParameter));

            // No dangling delimiter: the URC sits between two lines.
            x.response_start(None).await.unwrap();
            assert_eq!(x.read_int().await, Ok(33));
            assert_eq!(x.read_int().await, Err(Error::NoParameter));
            x.response_start(None).await.unwrap();
            assert_eq!(x.read_int().await, Ok(44));
            assert_eq!(x.unlock().await, Ok(()));
            assert_eq!(urcs.get(), 2);
        });
    }
}

//! Unsolicited result code bindings and the line reader handed to handlers.

use alloc::boxed::Box;
use core::cell::RefCell;
use core::future::Future;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};
use futures_util::future::LocalBoxFuture;
use heapless::{String, Vec};

use crate::error::Error;
use crate::framer::{starts_with, Match, ParamScanner, Scan, Step, DELIMITER};
use crate::params::{HexSink, NumberSink, SliceSink, TextSink};

/// Maximum number of URC prefixes a client can listen for.
pub const MAX_URC_HANDLERS: usize = 16;

/// Longest accepted URC or response prefix, e.g. `+UUSORD:`.
pub const MAX_PREFIX_LEN: usize = 16;

pub(crate) type Prefix = String<MAX_PREFIX_LEN>;

/// Handler invoked with the rest of a URC line, prefix already consumed.
pub type UrcHandler<'a> = Box<dyn FnMut(&mut UrcLine<'_, 'a>) + 'a>;

/// Hands a job to the deferred callback queue.
pub(crate) type Defer<'l, 'a> = &'l dyn Fn(LocalBoxFuture<'a, ()>) -> Result<(), Error>;

pub(crate) fn prefix(value: &str) -> Result<Prefix, Error> {
    if value.is_empty() {
        return Err(Error::InvalidUsage);
    }
    Prefix::try_from(value).map_err(|_| Error::InvalidUsage)
}

struct Binding<'a> {
    id: u32,
    prefix: Prefix,
    /// Taken out while the handler runs.
    handler: Option<UrcHandler<'a>>,
}

struct Bindings<'a> {
    entries: Vec<Binding<'a>, MAX_URC_HANDLERS>,
    next_id: u32,
}

pub(crate) struct UrcTable<'a, M: RawMutex> {
    inner: Mutex<M, RefCell<Bindings<'a>>>,
}

impl<'a, M: RawMutex> UrcTable<'a, M> {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Bindings {
                entries: Vec::new(),
                next_id: 0,
            })),
        }
    }

    pub(crate) fn insert(&self, value: &str, handler: UrcHandler<'a>) -> Result<(), Error> {
        let prefix = prefix(value)?;
        self.inner.lock(|b| {
            let b = &mut *b.borrow_mut();
            if b.entries.iter().any(|e| e.prefix == prefix) {
                return Err(Error::InvalidUsage);
            }
            let id = b.next_id;
            b.entries
                .push(Binding {
                    id,
                    prefix,
                    handler: Some(handler),
                })
                .map_err(|_| Error::Overflow)?;
            b.next_id = b.next_id.wrapping_add(1);
            Ok(())
        })
    }

    /// Returns false when nothing was registered for `value`.
    pub(crate) fn remove(&self, value: &str) -> bool {
        // The handler box is dropped outside the lock, it may own anything.
        let removed = self.inner.lock(|b| {
            let b = &mut *b.borrow_mut();
            b.entries
                .iter()
                .position(|e| e.prefix.as_str() == value)
                .map(|i| b.entries.swap_remove(i))
        });
        removed.is_some()
    }

    /// Finds the binding whose prefix starts `line`. The longest prefix wins;
    /// while a longer prefix could still match, more bytes are needed.
    pub(crate) fn lookup(&self, line: &[u8]) -> Scan<(u32, usize)> {
        self.inner.lock(|b| {
            let mut best: Option<(u32, usize)> = None;
            let mut need_more = false;
            for entry in b.borrow().entries.iter() {
                match starts_with(line, entry.prefix.as_bytes()) {
                    Match::Yes => {
                        let len = entry.prefix.len();
                        if best.map_or(true, |(_, l)| len > l) {
                            best = Some((entry.id, len));
                        }
                    }
                    Match::Partial => need_more = true,
                    Match::No => {}
                }
            }
            match (need_more, best) {
                (true, _) => Scan::NeedMore,
                (false, Some(found)) => Scan::Found(found),
                (false, None) => Scan::NotFound,
            }
        })
    }

    /// Runs the handler bound as `id` on `content`, the line after its prefix.
    pub(crate) fn dispatch(&self, id: u32, content: &[u8], defer: Defer<'_, 'a>) {
        let taken = self.inner.lock(|b| {
            b.borrow_mut()
                .entries
                .iter_mut()
                .find(|e| e.id == id)
                .and_then(|e| e.handler.take())
        });

        let Some(mut handler) = taken else {
            return;
        };

        handler(&mut UrcLine::new(content, defer));

        // The binding may have been removed, or removed and re-registered, by
        // the handler itself.
        self.inner.lock(|b| {
            if let Some(entry) = b
                .borrow_mut()
                .entries
                .iter_mut()
                .find(|e| e.id == id && e.handler.is_none())
            {
                entry.handler = Some(handler);
            }
        });
    }
}

/// One buffered URC line, positioned after its prefix.
///
/// Reads follow the same tokenizing rules as an exchange but never block: the
/// whole line is in memory and the end of the line ends the parameters.
pub struct UrcLine<'l, 'a> {
    line: &'l [u8],
    pos: usize,
    ended: bool,
    defer: Defer<'l, 'a>,
}

impl<'l, 'a> UrcLine<'l, 'a> {
    pub(crate) fn new(line: &'l [u8], defer: Defer<'l, 'a>) -> Self {
        Self {
            line,
            pos: 0,
            ended: false,
            defer,
        }
    }

    /// Unparsed remainder of the line.
    pub fn remaining(&self) -> &'l [u8] {
        &self.line[self.pos..]
    }

    fn param(&mut self, mut sink: impl FnMut(u8)) -> Result<(), Error> {
        if self.ended {
            return Err(Error::NoParameter);
        }
        let mut scanner = ParamScanner::new();
        loop {
            let Some(&b) = self.line.get(self.pos) else {
                self.ended = true;
                return Ok(());
            };
            match scanner.feed(b) {
                Step::Keep(c) => {
                    self.pos += 1;
                    sink(c);
                }
                Step::Skip => self.pos += 1,
                Step::Delimiter => {
                    self.pos += 1;
                    return Ok(());
                }
                Step::LineBreak => {
                    self.ended = true;
                    return Ok(());
                }
            }
        }
    }

    pub fn read_int(&mut self) -> Result<i32, Error> {
        let mut number = NumberSink::default();
        self.param(|c| number.push(c))?;
        number.int()
    }

    pub fn read_uint64(&mut self) -> Result<u64, Error> {
        let mut number = NumberSink::default();
        self.param(|c| number.push(c))?;
        number.uint64()
    }

    /// Copies the next parameter into `buf`, returning its full length.
    pub fn read_string(&mut self, buf: Option<&mut [u8]>) -> Result<usize, Error> {
        let mut sink = SliceSink::new(buf);
        self.param(|c| sink.push(c))?;
        Ok(sink.len())
    }

    pub fn read_text<const L: usize>(&mut self) -> Result<String<L>, Error> {
        let mut sink = TextSink::<L>::default();
        self.param(|c| sink.push(c))?;
        sink.finish()
    }

    pub fn read_hex(&mut self, buf: Option<&mut [u8]>) -> Result<usize, Error> {
        let mut sink = HexSink::new(buf);
        self.param(|c| sink.push(c))?;
        sink.finish()
    }

    /// Reads `len` raw octets. Unless `standalone`, a delimiter directly after
    /// them is consumed. Stops short at the end of the line.
    pub fn read_bytes(
        &mut self,
        buf: Option<&mut [u8]>,
        len: usize,
        standalone: bool,
    ) -> Result<usize, Error> {
        if buf.as_ref().is_some_and(|b| b.len() < len) {
            return Err(Error::InvalidUsage);
        }
        if self.ended || self.pos >= self.line.len() {
            self.ended = true;
            return Err(Error::NoParameter);
        }
        let n = len.min(self.line.len() - self.pos);
        let mut sink = SliceSink::new(buf);
        sink.extend(&self.line[self.pos..self.pos + n]);
        self.pos += n;
        if !standalone && self.line.get(self.pos) == Some(&DELIMITER) {
            self.pos += 1;
        }
        Ok(n)
    }

    pub fn skip_parameters(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.param(|_| {})?;
        }
        Ok(())
    }

    pub fn skip_bytes(&mut self, len: usize) -> Result<(), Error> {
        self.read_bytes(None, len, true).map(|_| ())
    }

    /// Queues `job` on the deferred callback worker. Anything that needs to
    /// wait, including a further AT exchange, belongs in here.
    pub fn defer(&self, job: impl Future<Output = ()> + 'a) -> Result<(), Error> {
        (self.defer)(Box::pin(job))
    }
}

//! Stateless recognition of line breaks, stop tags and parameter boundaries.
//!
//! Everything in here works on whatever bytes happen to be buffered and
//! answers [`Scan::NeedMore`] when the answer depends on bytes that have not
//! arrived yet. The streaming decoder and the URC line reader both build on it.

use crate::error::{DeviceError, DeviceErrorKind, Error};

pub(crate) const CR: u8 = b'\r';
pub(crate) const LF: u8 = b'\n';
pub(crate) const DELIMITER: u8 = b',';
pub(crate) const QUOTE: u8 = b'"';
pub(crate) const ESCAPE: u8 = b'\\';

/// Command line termination character S3.
pub(crate) const COMMAND_TERMINATOR: &[u8] = b"\r";

const OK: &[u8] = b"OK";
const ERROR: &[u8] = b"ERROR";
const CME_ERROR: &[u8] = b"+CME ERROR:";
const CMS_ERROR: &[u8] = b"+CMS ERROR:";

/// Longest number representation accepted by the integer reads.
pub(crate) const MAX_NUMBER_LEN: usize = 24;

#[inline]
pub(crate) fn is_line_break(b: u8) -> bool {
    b == CR || b == LF
}

/// Number of CR/LF bytes at the start of `buf`.
pub(crate) fn line_break_run(buf: &[u8]) -> usize {
    buf.iter().take_while(|b| is_line_break(**b)).count()
}

/// Index of the first CR or LF in `buf`.
pub(crate) fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| is_line_break(*b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Match {
    Yes,
    No,
    /// Everything buffered agrees with the pattern, but it is not complete yet.
    Partial,
}

pub(crate) fn starts_with(buf: &[u8], pattern: &[u8]) -> Match {
    let n = buf.len().min(pattern.len());
    if buf[..n] != pattern[..n] {
        Match::No
    } else if buf.len() >= pattern.len() {
        Match::Yes
    } else {
        Match::Partial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scan<T> {
    Found(T),
    NotFound,
    NeedMore,
}

/// Response terminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum StopTag {
    Ok,
    Error(DeviceError),
    /// Caller supplied abort string.
    Abort,
}

/// Matches a whole-line tag such as `OK`: the tag must be followed by a line
/// break to count.
fn exact_line(line: &[u8], tag: &[u8]) -> Scan<usize> {
    match starts_with(line, tag) {
        Match::No => Scan::NotFound,
        Match::Partial => Scan::NeedMore,
        Match::Yes => match line.get(tag.len()) {
            None => Scan::NeedMore,
            Some(b) if is_line_break(*b) => Scan::Found(tag.len()),
            Some(_) => Scan::NotFound,
        },
    }
}

/// Matches a tag carrying a numeric sub-code up to the end of the line.
fn coded_line(line: &[u8], tag: &[u8], kind: DeviceErrorKind) -> Scan<(StopTag, usize)> {
    match starts_with(line, tag) {
        Match::No => Scan::NotFound,
        Match::Partial => Scan::NeedMore,
        Match::Yes => match find_line_end(line) {
            None => Scan::NeedMore,
            Some(end) => {
                let code = parse_i32(&line[tag.len()..end]).ok();
                Scan::Found((StopTag::Error(DeviceError { kind, code }), end))
            }
        },
    }
}

/// Recognises a stop tag at the start of `line`, which must be positioned at
/// the beginning of a line. On success returns the tag and the length of the
/// line content, not including its terminator.
pub(crate) fn stop_tag(line: &[u8], abort: Option<&[u8]>) -> Scan<(StopTag, usize)> {
    let mut need_more = false;

    if let Some(abort) = abort.filter(|a| !a.is_empty()) {
        match starts_with(line, abort) {
            Match::Yes => {
                let len = find_line_end(line).unwrap_or(abort.len());
                return Scan::Found((StopTag::Abort, len));
            }
            Match::Partial => need_more = true,
            Match::No => {}
        }
    }

    match exact_line(line, OK) {
        Scan::Found(len) => return Scan::Found((StopTag::Ok, len)),
        Scan::NeedMore => need_more = true,
        Scan::NotFound => {}
    }

    match exact_line(line, ERROR) {
        Scan::Found(len) => return Scan::Found((StopTag::Error(DeviceError::plain()), len)),
        Scan::NeedMore => need_more = true,
        Scan::NotFound => {}
    }

    for (tag, kind) in [
        (CME_ERROR, DeviceErrorKind::Cme),
        (CMS_ERROR, DeviceErrorKind::Cms),
    ] {
        match coded_line(line, tag, kind) {
            Scan::Found(found) => return Scan::Found(found),
            Scan::NeedMore => need_more = true,
            Scan::NotFound => {}
        }
    }

    if need_more {
        Scan::NeedMore
    } else {
        Scan::NotFound
    }
}

/// What the scanner made of one byte of a delimited parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Part of the parameter value.
    Keep(u8),
    /// Framing: quotes, escapes and padding.
    Skip,
    /// End of this parameter, more follow on the same line.
    Delimiter,
    /// A CR or LF. Not consumed; the caller decides what the break means.
    LineBreak,
}

/// Byte-at-a-time tokenizer for one delimited parameter.
#[derive(Debug, Default)]
pub(crate) struct ParamScanner {
    started: bool,
    quoted: bool,
    closed: bool,
    escaped: bool,
}

impl ParamScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, b: u8) -> Step {
        if is_line_break(b) {
            return Step::LineBreak;
        }

        if self.quoted {
            if self.escaped {
                self.escaped = false;
                return Step::Keep(b);
            }
            return match b {
                ESCAPE => {
                    self.escaped = true;
                    Step::Skip
                }
                QUOTE => {
                    self.quoted = false;
                    self.closed = true;
                    Step::Skip
                }
                _ => Step::Keep(b),
            };
        }

        match b {
            DELIMITER => Step::Delimiter,
            _ if self.closed => Step::Skip,
            b' ' if !self.started => Step::Skip,
            QUOTE if !self.started => {
                self.started = true;
                self.quoted = true;
                Step::Skip
            }
            _ => {
                self.started = true;
                Step::Keep(b)
            }
        }
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != b' ').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != b' ').map_or(start, |e| e + 1);
    &bytes[start..end]
}

pub(crate) fn parse_i32(bytes: &[u8]) -> Result<i32, Error> {
    core::str::from_utf8(trim(bytes))
        .map_err(|_| Error::Parse)?
        .parse()
        .map_err(|_| Error::Parse)
}

pub(crate) fn parse_u64(bytes: &[u8]) -> Result<u64, Error> {
    core::str::from_utf8(trim(bytes))
        .map_err(|_| Error::Parse)?
        .parse()
        .map_err(|_| Error::Parse)
}

//! A streaming patch tool that applies normal-format diffs.
//!
//! `npatch` applies the default output format of `diff(1)` — hunks such as
//! `5,7d4`, `3a4,5`, and `1,2c1,3` — to a source stream, producing a patched
//! output stream. All three streams (original, diff, output) are processed a
//! character at a time, so neither the file being patched nor the diff is
//! ever buffered in memory. This makes it suitable for patching inputs of
//! arbitrary size, or for use in pipelines where the original arrives on
//! stdin and the result leaves on stdout.
//!
//! Unlike tools built around unified diffs, `npatch` is strict: hunks are
//! applied at exactly the line numbers the diff declares, deleted lines must
//! match the original character for character, and any disagreement between
//! the declared line ranges and the observed line counts fails the run.
//!
//! ## Getting Started
//!
//! The most common library entry point is [`patch_str`], which applies a
//! diff held in memory:
//!
//! ```rust
//! use npatch::{patch_str, PatchOptions};
//!
//! let original = "alpha\nbeta\ngamma\n";
//! let diff = "2c2\n< beta\n---\n> BETA\n";
//!
//! let patched = patch_str(original, diff, &PatchOptions::default()).unwrap();
//! assert_eq!(patched, "alpha\nBETA\ngamma\n");
//! ```
//!
//! For true streaming, use [`patch`] with any [`Read`]/[`Write`]
//! implementations:
//!
//! ```rust
//! use npatch::{patch, PatchOptions};
//!
//! let mut out = Vec::new();
//! patch(
//!     "a\nb\n".as_bytes(),
//!     &mut out,
//!     "1d0\n< a\n".as_bytes(),
//!     &PatchOptions::default(),
//! )
//! .unwrap();
//! assert_eq!(out, b"b\n");
//! ```
//!
//! ## Key Concepts
//!
//! ### The Two Layers
//!
//! - [`HunkLexer`] turns the raw diff stream into a sequence of structured
//!   [`Hunk`] headers, each followed by a lazily-produced stream of
//!   [`BodyEvent`]s carrying the deletion and addition characters.
//! - The patch engine (driven by [`patch`]) pulls hunks and body events,
//!   interleaving them with reads from the original stream: unaffected lines
//!   are copied through verbatim, deletion lines are verified against the
//!   original, and addition lines are written to the output.
//!
//! ### Line-Number Semantics
//!
//! Normal-format line numbers are subtle: the *old* start of an append hunk
//! and the *new* start of a delete hunk name the line **preceding** the
//! affected region, not the first affected line. `3a4,5` means "insert two
//! lines after old line 3"; `2,3d1` means "delete old lines 2-3, after which
//! the new file is still on line 1".
//!
//! ### Failure Model
//!
//! The output is produced on the fly, so when an error is detected some
//! output may already have been written. Success guarantees a complete,
//! correct result; failure means the output may be truncated, and the caller
//! must treat it as such. There is no rollback and no attempt to continue
//! past a failed hunk.

use log::{debug, error, trace};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

// --- Error Types ---

/// The terminal outcomes of a [`HunkLexer::next_hunk`] call.
///
/// `EndOfInput` is the normal way a diff stream ends; `Malformed` means the
/// stream could not be interpreted as a hunk at the current position.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The diff stream is exhausted at a position where a hunk header could
    /// legitimately begin. This is the normal termination of a diff.
    #[error("end of diff input")]
    EndOfInput,
    /// The stream violates the hunk grammar: a malformed header, an inverted
    /// line range, or input exhaustion after part of a header was consumed.
    #[error("malformed hunk")]
    Malformed,
}

/// Errors produced by a [`patch`] run.
///
/// The first three variants identify the offending hunk by its 1-based
/// serial number in the diff stream. All of them are fatal: the run stops at
/// the first error and already-written output is not retracted.
#[derive(Error, Debug)]
pub enum PatchError {
    /// The diff stream violates the hunk grammar, either in a header or in
    /// the body of the identified hunk.
    #[error("hunk #{serial}: diff input is not a well-formed hunk")]
    MalformedDiff { serial: usize },
    /// A deletion line in the diff does not match the corresponding line of
    /// the original file, or the original ended where more data was needed.
    #[error("hunk #{serial}: deletion text does not match the original file")]
    ContentMismatch { serial: usize },
    /// The line cursors at the close of the hunk disagree with the ranges
    /// its header declared.
    #[error("hunk #{serial}: line counts do not match the declared ranges")]
    LineCountMismatch { serial: usize },
    /// Writing to the output stream failed.
    #[error("I/O error while writing output: {0}")]
    Io(#[from] io::Error),
}

impl PatchError {
    /// The serial number of the hunk this error pertains to, if any.
    pub fn serial(&self) -> Option<usize> {
        match self {
            PatchError::MalformedDiff { serial }
            | PatchError::ContentMismatch { serial }
            | PatchError::LineCountMismatch { serial } => Some(*serial),
            PatchError::Io(_) => None,
        }
    }
}

// --- Data Structures ---

/// The kind of change a hunk describes, from the header's type letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkKind {
    /// `a`: insert the addition lines after the old-file anchor line.
    Append,
    /// `d`: remove the deletion lines from the old file.
    Delete,
    /// `c`: replace the deletion lines with the addition lines.
    Change,
}

impl HunkKind {
    /// The single-letter form used in hunk headers.
    pub fn letter(self) -> char {
        match self {
            HunkKind::Append => 'a',
            HunkKind::Delete => 'd',
            HunkKind::Change => 'c',
        }
    }
}

/// Which sub-portion of a hunk body a character belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Lines prefixed `< `, verified against and removed from the original.
    Deletion,
    /// Lines prefixed `> `, written to the output.
    Addition,
}

/// An inclusive range of 1-based line numbers from a hunk header.
///
/// A header range written with a single number (as in `5d4`) has
/// `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
}

impl LineRange {
    fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{},{}", self.start, self.end)
        }
    }
}

/// One parsed change directive from a diff stream.
///
/// A `Hunk` holds only the header information; the body characters are
/// pulled lazily from the lexer with [`HunkLexer::next_body_char`].
///
/// # Example
///
/// ```rust
/// use std::io::Cursor;
/// use npatch::{HunkKind, HunkLexer};
///
/// let mut lexer = HunkLexer::new(Cursor::new("3a4,5\n> one\n> two\n"));
/// let hunk = lexer.next_hunk().unwrap();
/// assert_eq!(hunk.kind, HunkKind::Append);
/// assert_eq!(hunk.old_range.start, 3);
/// assert_eq!(hunk.new_range.end, 5);
/// assert_eq!(hunk.serial, 1);
/// assert_eq!(hunk.to_string(), "3a4,5");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hunk {
    /// Whether this hunk appends, deletes, or changes lines.
    pub kind: HunkKind,
    /// Affected line numbers in the original file. For an append hunk this
    /// is the line *preceding* the insertion point.
    pub old_range: LineRange,
    /// Affected line numbers in the patched file. For a delete hunk this is
    /// the line *preceding* the deletion point.
    pub new_range: LineRange,
    /// 1-based position of this hunk in the diff stream.
    pub serial: usize,
}

impl fmt::Display for Hunk {
    /// Renders the header in the same grammar it was parsed from.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.old_range,
            self.kind.letter(),
            self.new_range
        )
    }
}

/// One step of a hunk body, produced by [`HunkLexer::next_body_char`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEvent {
    /// The next content character of the body, tagged with the section it
    /// belongs to. Prefixes (`< `, `> `) and the change separator (`---`)
    /// are consumed by the lexer and never surfaced.
    Char(Section, u8),
    /// The current section is finished. A change hunk yields this once
    /// between its deletion and addition sections and once at the end of the
    /// body; other kinds yield it once at the end.
    EndOfSection,
    /// The body violates the grammar, or has been fully consumed. Sticky:
    /// once returned, every further call returns it again until the next
    /// successful [`HunkLexer::next_hunk`].
    Malformed,
}

// --- Options ---

/// Options for configuring how a patch is applied.
#[derive(Debug, Clone, Copy)]
pub struct PatchOptions {
    /// If `true`, no bytes are written to the output stream. The diff is
    /// still fully parsed and verified against the original, so a dry run
    /// detects every error a real run would.
    pub dry_run: bool,
    /// If `true`, no diagnostics are emitted when a hunk fails.
    pub quiet: bool,
    /// Whether failure diagnostics include the captured body lines of the
    /// offending hunk, or only its header.
    pub show_body: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            quiet: false,
            show_body: true,
        }
    }
}

impl PatchOptions {
    /// Creates a new builder for `PatchOptions`.
    ///
    /// # Example
    ///
    /// ```
    /// # use npatch::PatchOptions;
    /// let options = PatchOptions::builder().dry_run(true).quiet(true).build();
    /// assert!(options.dry_run);
    /// assert!(options.quiet);
    /// assert!(options.show_body);
    /// ```
    pub fn builder() -> PatchOptionsBuilder {
        PatchOptionsBuilder::default()
    }
}

/// A builder for creating [`PatchOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchOptionsBuilder {
    dry_run: Option<bool>,
    quiet: Option<bool>,
    show_body: Option<bool>,
}

impl PatchOptionsBuilder {
    /// If `true`, verify the patch without writing any output bytes.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    /// If `true`, suppress hunk diagnostics on failure.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = Some(quiet);
        self
    }

    /// Whether diagnostics render captured body content.
    pub fn show_body(mut self, show_body: bool) -> Self {
        self.show_body = Some(show_body);
        self
    }

    /// Builds the `PatchOptions`.
    pub fn build(self) -> PatchOptions {
        let default = PatchOptions::default();
        PatchOptions {
            dry_run: self.dry_run.unwrap_or(default.dry_run),
            quiet: self.quiet.unwrap_or(default.quiet),
            show_body: self.show_body.unwrap_or(default.show_body),
        }
    }
}

// --- Diagnostic Capture ---

/// Per-line retention limit for the diagnostic capture, in bytes.
const CAPTURE_LINE_LIMIT: usize = 255;
/// Total retention limit per section, in bytes.
const CAPTURE_SECTION_LIMIT: usize = 510;

/// A capped record of the body lines of one section, kept solely so a
/// failing hunk can be shown to the user. Never consulted for correctness.
#[derive(Debug)]
struct SectionCapture {
    lines: Vec<Vec<u8>>,
    total: usize,
    at_line_start: bool,
    overflow: bool,
}

impl SectionCapture {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            total: 0,
            at_line_start: true,
            overflow: false,
        }
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.total = 0;
        self.at_line_start = true;
        self.overflow = false;
    }

    fn record(&mut self, byte: u8) {
        if self.at_line_start && self.total < CAPTURE_SECTION_LIMIT {
            self.lines.push(Vec::new());
        }
        self.at_line_start = byte == b'\n';
        if self.total >= CAPTURE_SECTION_LIMIT {
            self.overflow = true;
            return;
        }
        if let Some(line) = self.lines.last_mut() {
            if line.len() < CAPTURE_LINE_LIMIT {
                line.push(byte);
                self.total += 1;
            } else {
                self.overflow = true;
            }
        }
    }

    fn render(&self, out: &mut String, prefix: &str) {
        for line in &self.lines {
            out.push_str(prefix);
            out.push_str(&String::from_utf8_lossy(line));
            if line.last() != Some(&b'\n') {
                out.push('\n');
            }
        }
        if self.overflow {
            out.push_str("...\n");
        }
    }
}

// --- Hunk Lexer ---

/// A lexer that reconstructs structured hunks from a raw diff stream.
///
/// The lexer owns all scanning state — the serial counter, active section,
/// line-start flag, sticky-error flag, capture buffers, and a small
/// lookahead buffer standing in for stream pushback — so independent diff
/// streams can be parsed by independent lexers without cross-contamination.
///
/// Calls alternate between [`next_hunk`](Self::next_hunk), which parses the
/// next header, and [`next_body_char`](Self::next_body_char), which produces
/// the body of the most recently parsed hunk one character at a time.
/// `next_hunk` discards whatever is left of the previous hunk's body, so a
/// caller that only wants headers may skip body reads entirely.
#[derive(Debug)]
pub struct HunkLexer<R> {
    reader: R,
    /// Pushed-back bytes, consumed before the reader. Holds at most the few
    /// prefix bytes that must be re-scanned at a section boundary.
    lookahead: VecDeque<u8>,
    serial: usize,
    /// Kind of the hunk most recently returned by `next_hunk`; `None` before
    /// the first hunk and after a failed header parse.
    current_kind: Option<HunkKind>,
    line_start: bool,
    active: Option<Section>,
    expected: Option<Section>,
    poisoned: bool,
    synthesized_newline: bool,
    pending_section_end: bool,
    deletions: SectionCapture,
    additions: SectionCapture,
}

impl<R: Read> HunkLexer<R> {
    /// Creates a lexer over a diff stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            lookahead: VecDeque::new(),
            serial: 0,
            current_kind: None,
            line_start: true,
            active: None,
            expected: None,
            poisoned: false,
            synthesized_newline: false,
            pending_section_end: false,
            deletions: SectionCapture::new(),
            additions: SectionCapture::new(),
        }
    }

    /// The serial number of the hunk currently being (or last) parsed.
    ///
    /// Incremented by every [`next_hunk`](Self::next_hunk) call, including
    /// calls that fail, so a header-level error can still be attributed to a
    /// hunk position.
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// Advances to the next hunk in the diff stream and parses its header.
    ///
    /// Leftover body characters from the previous hunk are discarded one at
    /// a time until a position where a header may begin. The header grammar
    /// is `OLDSTART[,OLDEND]`, one of `a`/`d`/`c`, `NEWSTART[,NEWEND]`, and
    /// a newline, with no intervening spaces.
    ///
    /// Returns [`ParseOutcome::EndOfInput`] only when the stream ends before
    /// any header byte is consumed; exhaustion after a partial header is
    /// [`ParseOutcome::Malformed`], as are missing digits, an unknown type
    /// letter, and an inverted range (`end < start`).
    pub fn next_hunk(&mut self) -> Result<Hunk, ParseOutcome> {
        // Resync: consume whatever remains of the previous hunk's body. The
        // body scanner stops, with pushback, at the first byte that could
        // open a header line.
        if self.current_kind.is_some() && !self.poisoned {
            loop {
                match self.scan() {
                    BodyEvent::Malformed => break,
                    BodyEvent::Char(..) | BodyEvent::EndOfSection => {}
                }
            }
        }

        self.serial += 1;
        self.line_start = true;
        self.active = None;
        self.expected = None;
        self.poisoned = false;
        self.synthesized_newline = false;
        self.pending_section_end = false;
        self.current_kind = None;
        self.deletions.clear();
        self.additions.clear();
        trace!("scanning for hunk #{}", self.serial);

        match self.parse_header() {
            Ok(hunk) => {
                debug!("parsed hunk #{}: {}", hunk.serial, hunk);
                self.current_kind = Some(hunk.kind);
                Ok(hunk)
            }
            Err(outcome) => {
                if outcome == ParseOutcome::Malformed {
                    self.poisoned = true;
                }
                Err(outcome)
            }
        }
    }

    /// Produces the next character of the current hunk's body.
    ///
    /// `hunk` must be the hunk most recently returned by
    /// [`next_hunk`](Self::next_hunk). Section prefixes and the change
    /// separator are consumed silently; only content characters are
    /// surfaced, each tagged with its section. A line that reaches
    /// end-of-input without a terminating newline has one `'\n'` synthesized
    /// as its final character; the read after that yields
    /// [`BodyEvent::EndOfSection`], never a second synthesis.
    ///
    /// After [`BodyEvent::Malformed`] has been returned, every further call
    /// returns it again until `next_hunk` succeeds, which lets a caller
    /// drain a broken body safely for diagnostics.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `hunk` is not the hunk most recently
    /// returned by `next_hunk`.
    pub fn next_body_char(&mut self, hunk: &Hunk) -> BodyEvent {
        debug_assert_eq!(
            hunk.serial, self.serial,
            "body read for a hunk that is no longer current"
        );
        self.scan()
    }

    /// Renders the current hunk for diagnostics: the header in input
    /// grammar, then the captured deletion lines (prefixed `< `), the `---`
    /// separator for a change hunk, and the captured addition lines
    /// (prefixed `> `). A trailing `...` line marks capture overflow.
    ///
    /// Body lines are available only to the extent the capped capture
    /// retained them; this rendering is a reporting aid, never an input to
    /// patch application.
    pub fn render_hunk(&self, hunk: &Hunk, show_body: bool) -> String {
        let mut out = format!("{}\n", hunk);
        if !show_body {
            return out;
        }
        match hunk.kind {
            HunkKind::Delete => self.deletions.render(&mut out, "< "),
            HunkKind::Append => self.additions.render(&mut out, "> "),
            HunkKind::Change => {
                self.deletions.render(&mut out, "< ");
                out.push_str("---\n");
                self.additions.render(&mut out, "> ");
            }
        }
        out
    }

    // -- raw byte access --

    fn next_raw(&mut self) -> Option<u8> {
        if let Some(byte) = self.lookahead.pop_front() {
            return Some(byte);
        }
        let mut buf = [0u8; 1];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return None,
                Ok(_) => return Some(buf[0]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Read failures fold into the end-of-input sentinel; the
                // grammar then reports the truncation as malformed input.
                Err(_) => return None,
            }
        }
    }

    fn push_back(&mut self, bytes: &[u8]) {
        for &byte in bytes.iter().rev() {
            self.lookahead.push_front(byte);
        }
    }

    // -- header parsing --

    fn parse_header(&mut self) -> Result<Hunk, ParseOutcome> {
        let old_start = self.read_number(true)?;
        let old_end = self.read_range_end(old_start)?;
        let kind = match self.next_raw() {
            Some(b'a') => HunkKind::Append,
            Some(b'd') => HunkKind::Delete,
            Some(b'c') => HunkKind::Change,
            _ => return Err(ParseOutcome::Malformed),
        };
        let new_start = self.read_number(false)?;
        let new_end = self.read_range_end(new_start)?;
        match self.next_raw() {
            Some(b'\n') => {}
            _ => return Err(ParseOutcome::Malformed),
        }
        if old_end < old_start || new_end < new_start {
            return Err(ParseOutcome::Malformed);
        }
        Ok(Hunk {
            kind,
            old_range: LineRange::new(old_start, old_end),
            new_range: LineRange::new(new_start, new_end),
            serial: self.serial,
        })
    }

    /// Reads an unsigned decimal number. `at_header_start` marks the one
    /// position where exhaustion means a clean end of the diff rather than
    /// a truncated header.
    fn read_number(&mut self, at_header_start: bool) -> Result<u64, ParseOutcome> {
        let mut value: u64 = 0;
        let mut digits = 0u32;
        loop {
            match self.next_raw() {
                Some(byte @ b'0'..=b'9') => {
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(u64::from(byte - b'0')))
                        .ok_or(ParseOutcome::Malformed)?;
                    digits += 1;
                }
                Some(other) => {
                    self.push_back(&[other]);
                    break;
                }
                None => {
                    if digits == 0 && at_header_start {
                        return Err(ParseOutcome::EndOfInput);
                    }
                    break;
                }
            }
        }
        if digits == 0 {
            return Err(ParseOutcome::Malformed);
        }
        Ok(value)
    }

    /// Reads the optional `,END` part of a range; a single-number range has
    /// `end == start`.
    fn read_range_end(&mut self, start: u64) -> Result<u64, ParseOutcome> {
        match self.next_raw() {
            Some(b',') => self.read_number(false),
            Some(other) => {
                self.push_back(&[other]);
                Ok(start)
            }
            // Leave the exhaustion for the next token to report.
            None => Ok(start),
        }
    }

    // -- body scanning --

    fn poison(&mut self) -> BodyEvent {
        self.poisoned = true;
        BodyEvent::Malformed
    }

    fn scan(&mut self) -> BodyEvent {
        if self.poisoned {
            return BodyEvent::Malformed;
        }
        let kind = match self.current_kind {
            Some(kind) => kind,
            None => return self.poison(),
        };
        if self.expected.is_none() {
            self.expected = Some(match kind {
                HunkKind::Append => Section::Addition,
                HunkKind::Delete | HunkKind::Change => Section::Deletion,
            });
        }
        loop {
            if self.line_start {
                match self.scan_prefix(kind) {
                    Ok(()) => continue,
                    Err(event) => return event,
                }
            } else {
                return self.scan_line_char();
            }
        }
    }

    /// Recognizes the two-character section prefix (or the change
    /// separator) that must open every body line. `Ok(())` means the prefix
    /// was consumed and scanning continues; `Err` carries the event to
    /// surface.
    fn scan_prefix(&mut self, kind: HunkKind) -> Result<(), BodyEvent> {
        let first = match self.next_raw() {
            Some(byte) => byte,
            None => {
                // A change hunk whose deletion section runs into
                // end-of-input never had its additions: that is a grammar
                // violation, not a normal section end.
                if kind == HunkKind::Change && self.expected == Some(Section::Deletion) {
                    return Err(self.poison());
                }
                if self.active.take().is_some() {
                    return Err(BodyEvent::EndOfSection);
                }
                return Err(self.poison());
            }
        };
        match first {
            b'<' => {
                if self.next_raw() != Some(b' ') {
                    return Err(self.poison());
                }
                if self.expected != Some(Section::Deletion) {
                    return Err(self.poison());
                }
                self.active = Some(Section::Deletion);
                self.line_start = false;
                Ok(())
            }
            b'>' => {
                if self.expected != Some(Section::Addition) {
                    return Err(self.poison());
                }
                if self.next_raw() != Some(b' ') {
                    return Err(self.poison());
                }
                if self.active == Some(Section::Deletion) {
                    // Section boundary inside a change hunk: finish the
                    // deletion section and leave the prefix to be re-scanned
                    // on the next call.
                    self.push_back(&[b'>', b' ']);
                    self.active = None;
                    return Err(BodyEvent::EndOfSection);
                }
                self.active = Some(Section::Addition);
                self.line_start = false;
                Ok(())
            }
            b'-' => {
                let rest = [self.next_raw(), self.next_raw(), self.next_raw()];
                if rest != [Some(b'-'), Some(b'-'), Some(b'\n')] {
                    return Err(self.poison());
                }
                if kind != HunkKind::Change
                    || self.active != Some(Section::Deletion)
                    || self.expected != Some(Section::Deletion)
                {
                    return Err(self.poison());
                }
                // The separator is structural and is never surfaced as body
                // content. The next line must open the additions.
                self.expected = Some(Section::Addition);
                Ok(())
            }
            other => {
                // Not a body line: most likely the first byte of the next
                // hunk's header. Leave it for re-scanning.
                self.push_back(&[other]);
                if self.active.take().is_some() {
                    return Err(BodyEvent::EndOfSection);
                }
                Err(self.poison())
            }
        }
    }

    fn scan_line_char(&mut self) -> BodyEvent {
        let section = match self.active {
            Some(section) => section,
            None => return self.poison(),
        };
        match self.next_raw() {
            Some(byte) => {
                if byte == b'\n' {
                    self.line_start = true;
                }
                self.capture(section, byte);
                BodyEvent::Char(section, byte)
            }
            None => {
                if !self.synthesized_newline {
                    // Tolerate a missing trailing newline at end-of-input by
                    // supplying the terminator once.
                    self.synthesized_newline = true;
                    self.pending_section_end = true;
                    self.capture(section, b'\n');
                    BodyEvent::Char(section, b'\n')
                } else if self.pending_section_end {
                    self.pending_section_end = false;
                    self.active = None;
                    BodyEvent::EndOfSection
                } else {
                    self.poison()
                }
            }
        }
    }

    fn capture(&mut self, section: Section, byte: u8) {
        match section {
            Section::Deletion => self.deletions.record(byte),
            Section::Addition => self.additions.record(byte),
        }
    }
}

// --- Patch Engine ---

/// Reader side of the original file, with the same missing-trailing-newline
/// tolerance the lexer applies to the diff: one `'\n'` is synthesized if the
/// stream ends mid-line while a deletion is being matched.
#[derive(Debug)]
struct SourceReader<R> {
    inner: R,
    last_was_newline: bool,
}

impl<R: Read> SourceReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            last_was_newline: false,
        }
    }

    fn next_raw(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return None,
                Ok(_) => return Some(buf[0]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
    }

    /// Next byte for deletion matching, synthesizing one final newline.
    fn next_for_match(&mut self) -> Option<u8> {
        match self.next_raw() {
            Some(byte) => {
                self.last_was_newline = byte == b'\n';
                Some(byte)
            }
            None => {
                if self.last_was_newline {
                    None
                } else {
                    self.last_was_newline = true;
                    Some(b'\n')
                }
            }
        }
    }
}

struct Engine<'a, R, W> {
    original: SourceReader<R>,
    output: W,
    options: &'a PatchOptions,
    /// Next unread line of the original, 1-based.
    old_line: u64,
    /// Next line to be produced on the output, 1-based.
    new_line: u64,
}

impl<'a, R: Read, W: Write> Engine<'a, R, W> {
    fn emit(&mut self, byte: u8) -> Result<(), PatchError> {
        if self.options.dry_run {
            return Ok(());
        }
        self.output.write_all(&[byte])?;
        Ok(())
    }

    /// Copies one whole line of the original through to the output.
    /// Returns `false` if the original was already exhausted, meaning the
    /// hunk is anchored past the end of the file.
    fn copy_line(&mut self) -> Result<bool, PatchError> {
        let mut copied_any = false;
        loop {
            match self.original.next_raw() {
                Some(byte) => {
                    copied_any = true;
                    self.original.last_was_newline = byte == b'\n';
                    self.emit(byte)?;
                    if byte == b'\n' {
                        return Ok(true);
                    }
                }
                None => {
                    if copied_any {
                        // The original's final line has no terminator: the
                        // same one-shot synthesis the deletion-match path
                        // applies, so a following hunk starts on its own
                        // line.
                        self.original.last_was_newline = true;
                        self.emit(b'\n')?;
                    }
                    return Ok(copied_any);
                }
            }
        }
    }

    /// Applies a single hunk, pulling its body from the lexer and the
    /// affected lines from the original in lockstep.
    fn apply_hunk<D: Read>(
        &mut self,
        lexer: &mut HunkLexer<D>,
        hunk: &Hunk,
    ) -> Result<(), PatchError> {
        let mut after_section_end = false;
        loop {
            match lexer.next_body_char(hunk) {
                BodyEvent::Char(Section::Deletion, expected) => {
                    after_section_end = false;
                    // Lines before the hunk are unaffected: pass them
                    // through until the cursor reaches the first deleted
                    // line.
                    while self.old_line < hunk.old_range.start {
                        if !self.copy_line()? {
                            while lexer.next_body_char(hunk) != BodyEvent::Malformed {}
                            return Err(PatchError::ContentMismatch {
                                serial: hunk.serial,
                            });
                        }
                        self.old_line += 1;
                        self.new_line += 1;
                    }
                    let got = self.original.next_for_match();
                    if got != Some(expected) {
                        trace!(
                            "hunk #{}: original byte {:?} does not match deletion byte {:?}",
                            hunk.serial,
                            got,
                            expected
                        );
                        // Drain the rest of the body so the diagnostic
                        // capture is as complete as it can be.
                        while lexer.next_body_char(hunk) != BodyEvent::Malformed {}
                        return Err(PatchError::ContentMismatch {
                            serial: hunk.serial,
                        });
                    }
                    if expected == b'\n' {
                        self.old_line += 1;
                    }
                }
                BodyEvent::Char(Section::Addition, byte) => {
                    after_section_end = false;
                    // An append hunk anchors *after* its old start line, so
                    // that line itself is still passed through. A change
                    // hunk's deletion section has already consumed the
                    // affected lines.
                    if hunk.kind == HunkKind::Append {
                        while self.old_line <= hunk.old_range.start {
                            if !self.copy_line()? {
                                while lexer.next_body_char(hunk) != BodyEvent::Malformed {}
                                return Err(PatchError::ContentMismatch {
                                    serial: hunk.serial,
                                });
                            }
                            self.old_line += 1;
                            self.new_line += 1;
                        }
                    }
                    self.emit(byte)?;
                    if byte == b'\n' {
                        self.new_line += 1;
                    }
                }
                BodyEvent::EndOfSection => {
                    after_section_end = true;
                }
                BodyEvent::Malformed => {
                    if after_section_end {
                        // A sticky error directly after an end-of-section is
                        // how a fully-consumed body presents itself.
                        break;
                    }
                    return Err(PatchError::MalformedDiff {
                        serial: hunk.serial,
                    });
                }
            }
        }

        if self.old_line != hunk.old_range.end + 1 || self.new_line != hunk.new_range.end + 1 {
            trace!(
                "hunk #{}: cursors at old {}, new {} but header declares {}",
                hunk.serial,
                self.old_line,
                self.new_line,
                hunk
            );
            return Err(PatchError::LineCountMismatch {
                serial: hunk.serial,
            });
        }
        Ok(())
    }

    /// Copies the unaffected tail of the original after the last hunk.
    fn copy_tail(&mut self) -> Result<(), PatchError> {
        while let Some(byte) = self.original.next_raw() {
            self.emit(byte)?;
        }
        Ok(())
    }
}

/// Applies a normal-format diff to `original`, writing the result to
/// `output`.
///
/// All three streams are processed incrementally; nothing is buffered beyond
/// a few bytes of lookahead and the capped diagnostic capture. Hunks are
/// applied in the order they appear, deleted lines are verified against the
/// original, and each hunk's line arithmetic is checked against its header.
/// An empty diff produces an unchanged copy of the original.
///
/// On success the output is complete and correct. On failure the output may
/// be partial; nothing already written is retracted. Unless
/// [`PatchOptions::quiet`] is set, a failing hunk is rendered to the error
/// log (header plus captured body, subject to [`PatchOptions::show_body`]).
///
/// Byte-at-a-time reads and writes are issued against the streams, so wrap
/// files in [`std::io::BufReader`]/[`std::io::BufWriter`] at the call site.
///
/// # Example
///
/// ```rust
/// use npatch::{patch, PatchOptions};
///
/// let original = "one\ntwo\nthree\n";
/// let diff = "1a2,3\n> one and a half\n> one and three quarters\n";
/// let mut out = Vec::new();
///
/// patch(
///     original.as_bytes(),
///     &mut out,
///     diff.as_bytes(),
///     &PatchOptions::default(),
/// )
/// .unwrap();
/// assert_eq!(
///     out,
///     b"one\none and a half\none and three quarters\ntwo\nthree\n"
/// );
/// ```
pub fn patch<R: Read, W: Write, D: Read>(
    original: R,
    mut output: W,
    diff: D,
    options: &PatchOptions,
) -> Result<(), PatchError> {
    let mut lexer = HunkLexer::new(diff);
    let mut engine = Engine {
        original: SourceReader::new(original),
        output: &mut output,
        options,
        old_line: 1,
        new_line: 1,
    };

    loop {
        match lexer.next_hunk() {
            Err(ParseOutcome::EndOfInput) => break,
            Err(ParseOutcome::Malformed) => {
                let serial = lexer.serial();
                if !options.quiet {
                    error!("hunk #{}: malformed hunk header", serial);
                }
                return Err(PatchError::MalformedDiff { serial });
            }
            Ok(hunk) => {
                debug!("applying hunk #{}: {}", hunk.serial, hunk);
                if let Err(err) = engine.apply_hunk(&mut lexer, &hunk) {
                    if !options.quiet && !matches!(err, PatchError::Io(_)) {
                        error!("{}", err);
                        for line in lexer.render_hunk(&hunk, options.show_body).lines() {
                            error!("    {}", line);
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    engine.copy_tail()?;
    output.flush()?;
    Ok(())
}

/// Applies a diff held in memory and returns the patched content.
///
/// A convenience wrapper around [`patch`] for callers that already have both
/// the original and the diff as strings. On failure the partially produced
/// output is discarded along with the error; use [`patch`] directly to
/// retain partial output.
///
/// # Example
///
/// ```rust
/// use npatch::{patch_str, PatchError, PatchOptions};
///
/// let err = patch_str(
///     "alpha\nbeta\n",
///     "1d0\n< WRONG\n",
///     &PatchOptions::builder().quiet(true).build(),
/// )
/// .unwrap_err();
/// assert!(matches!(err, PatchError::ContentMismatch { serial: 1 }));
/// ```
pub fn patch_str(
    original: &str,
    diff: &str,
    options: &PatchOptions,
) -> Result<String, PatchError> {
    let mut out = Vec::new();
    patch(original.as_bytes(), &mut out, diff.as_bytes(), options)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

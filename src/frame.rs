//! Attribution of terminal output to jobs.
//!
//! Every job runs as a background pipeline whose output passes through `sed`,
//! which prefixes each line with a tag naming the job. When the command
//! finishes, the pipeline prints an exit marker carrying `$?`. Tags and
//! markers are delimited by the ASCII record separator (0x1E), which the shell
//! builds at init time so that the echoed command lines never contain it.
//!
//! ```text
//! RS 'o' <job> RS <payload ... '\n'>      one line of job output
//! RS 'x' <job> ';' <status> RS '\n'       job exited
//! ```
//!
//! Anything else is plain terminal traffic (prompts, echo, human input).

use bytes::{Bytes, BytesMut};

use crate::job::JobId;

pub const RS: u8 = 0x1e;

/// Longest control sequence accepted between two separators.
const MAX_CONTROL_LEN: usize = 32;

/// Longest shell line the tty will accept in canonical mode, with headroom
/// for the wrapper around the command.
pub const MAX_LINE_LEN: usize = 4000;

/// Written once after the shell starts.
pub const INIT_LINE: &str = "stty -onlcr 2>/dev/null; set +m 2>/dev/null; JOBSH_RS=$(printf '\\036')\n";

/// Quote `s` for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// The line written to the shell to run `source` as job `job`.
///
/// The command runs in its own subshell (so `exit` cannot skip the marker),
/// with stdin from /dev/null and stderr merged into stdout.
pub fn job_line(job: JobId, source: &str) -> String {
    format!(
        "( ( eval {src} ) 2>&1; printf '\\036x{id};%d\\036\\n' \"$?\" ) </dev/null 2>&1 | sed \"s/^/${{JOBSH_RS}}o{id}${{JOBSH_RS}}/\" &\n",
        src = shell_quote(source),
        id = job.0,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Output not belonging to any job.
    Terminal(Bytes),
    /// Output produced by a job.
    Job { job: JobId, data: Bytes },
    /// A job's command finished with this status.
    Exit { job: JobId, code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Terminal,
    Line(JobId),
    /// Rest of an exit-marker line.
    Discard,
}

enum Control {
    Tag(JobId),
    Exit(JobId, i32),
}

/// Incremental decoder; feed it reads in order.
pub struct FrameDecoder {
    mode: Mode,
    control: Option<BytesMut>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            mode: Mode::Terminal,
            control: None,
        }
    }

    pub fn feed(&mut self, input: &[u8]) -> Vec<Frame> {
        let mut out = FrameSink::default();
        for &byte in input {
            if let Some(control) = self.control.as_mut() {
                if byte == RS {
                    let body = self.control.take().unwrap_or_default();
                    match parse_control(&body) {
                        Some(Control::Tag(job)) => self.mode = Mode::Line(job),
                        Some(Control::Exit(job, code)) => {
                            out.flush();
                            out.frames.push(Frame::Exit { job, code });
                            self.mode = Mode::Discard;
                        }
                        None => {
                            // Not ours: pass the opening separator and body
                            // through, and treat this separator as a new opener.
                            out.push(self.mode, RS);
                            out.extend(self.mode, &body);
                            self.control = Some(BytesMut::new());
                        }
                    }
                } else if control.len() >= MAX_CONTROL_LEN {
                    let body = self.control.take().unwrap_or_default();
                    out.push(self.mode, RS);
                    out.extend(self.mode, &body);
                    self.consume(byte, &mut out);
                } else {
                    control.extend_from_slice(&[byte]);
                }
                continue;
            }
            self.consume(byte, &mut out);
        }
        out.flush();
        out.frames
    }

    fn consume(&mut self, byte: u8, out: &mut FrameSink) {
        match self.mode {
            Mode::Discard => {
                if byte == b'\n' {
                    self.mode = Mode::Terminal;
                }
            }
            _ if byte == RS => self.control = Some(BytesMut::new()),
            Mode::Line(_) if byte == b'\n' => {
                out.push(self.mode, byte);
                self.mode = Mode::Terminal;
            }
            mode => out.push(mode, byte),
        }
    }
}

fn parse_control(body: &[u8]) -> Option<Control> {
    let text = std::str::from_utf8(body).ok()?;
    if let Some(id) = text.strip_prefix('o') {
        return Some(Control::Tag(JobId(id.parse().ok()?)));
    }
    let rest = text.strip_prefix('x')?;
    let (id, code) = rest.split_once(';')?;
    Some(Control::Exit(JobId(id.parse().ok()?), code.parse().ok()?))
}

/// Coalesces consecutive bytes for the same destination into one frame.
#[derive(Default)]
struct FrameSink {
    frames: Vec<Frame>,
    target: Option<Mode>,
    pending: BytesMut,
}

impl FrameSink {
    fn push(&mut self, mode: Mode, byte: u8) {
        self.extend(mode, &[byte]);
    }

    fn extend(&mut self, mode: Mode, bytes: &[u8]) {
        if bytes.is_empty() || mode == Mode::Discard {
            return;
        }
        if self.target != Some(mode) {
            self.flush();
            self.target = Some(mode);
        }
        self.pending.extend_from_slice(bytes);
    }

    fn flush(&mut self) {
        let Some(mode) = self.target.take() else {
            return;
        };
        if self.pending.is_empty() {
            return;
        }
        let data = self.pending.split().freeze();
        match mode {
            Mode::Line(job) => self.frames.push(Frame::Job { job, data }),
            Mode::Terminal | Mode::Discard => self.frames.push(Frame::Terminal(data)),
        }
    }
}

//! Terminal rendering of capture and engine notifications.

use std::io::{self, Write};

use crate::capture::CaptureEvent;
use crate::realtime::EngineEvent;

const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

const BAR_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Band magnitudes are scaled against this before picking a glyph.
const BAR_FULL_SCALE: f32 = 0.05;

/// Either source of notifications the console shows.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Capture(CaptureEvent),
    Engine(EngineEvent),
}

/// One glyph per visualization band.
pub fn format_level_bar(levels: &[f32]) -> String {
    levels
        .iter()
        .map(|level| {
            let scaled = (level / BAR_FULL_SCALE).clamp(0.0, 1.0);
            let index = (scaled * (BAR_GLYPHS.len() - 1) as f32).round() as usize;
            BAR_GLYPHS[index.min(BAR_GLYPHS.len() - 1)]
        })
        .collect()
}

/// Status line text for an engine event, or `None` for events that are only
/// shown in verbose mode (or not as a status line at all).
fn engine_status(event: &EngineEvent, verbosity: u8) -> Option<String> {
    let line = match event {
        EngineEvent::Connected => format!("{GREEN}Connected{RESET}"),
        EngineEvent::Closed => format!("{YELLOW}Connection closed{RESET}"),
        EngineEvent::ConnectionError(message) => {
            format!("{RED}Connection error: {message}{RESET}")
        }
        EngineEvent::RemoteError(message) => format!("{RED}Service error: {message}{RESET}"),
        EngineEvent::ResponseCancelled => format!("{DIM}[response cancelled]{RESET}"),
        EngineEvent::TranscriptDelta(_) | EngineEvent::ResponseDone => return None,
        other if verbosity >= 1 => format!("{DIM}[{other:?}]{RESET}"),
        _ => return None,
    };
    Some(line)
}

/// Writes notifications to a terminal. Transcript deltas stream inline and
/// the line is closed when the response ends.
pub struct ConsoleRenderer<W: Write> {
    out: W,
    quiet: bool,
    verbosity: u8,
    mid_line: bool,
}

impl ConsoleRenderer<io::Stderr> {
    pub fn stderr(quiet: bool, verbosity: u8) -> Self {
        Self::new(io::stderr(), quiet, verbosity)
    }
}

impl<W: Write> ConsoleRenderer<W> {
    pub fn new(out: W, quiet: bool, verbosity: u8) -> Self {
        Self {
            out,
            quiet,
            verbosity,
            mid_line: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn end_line(&mut self) -> io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        Ok(())
    }

    pub fn notification(&mut self, notification: &Notification) -> io::Result<()> {
        match notification {
            Notification::Capture(event) => self.capture_event(event),
            Notification::Engine(event) => self.engine_event(event),
        }
    }

    pub fn capture_event(&mut self, event: &CaptureEvent) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        self.end_line()?;
        match event {
            CaptureEvent::RecordingStarted => writeln!(self.out, "{GREEN}● Recording{RESET}"),
            CaptureEvent::RecordingEnded => writeln!(self.out, "{DIM}○ Recording stopped{RESET}"),
        }
    }

    pub fn engine_event(&mut self, event: &EngineEvent) -> io::Result<()> {
        match event {
            // The transcript is the product; shown even in quiet mode
            EngineEvent::TranscriptDelta(text) => {
                write!(self.out, "{text}")?;
                self.mid_line = true;
                self.out.flush()
            }
            EngineEvent::ResponseDone | EngineEvent::ResponseCancelled | EngineEvent::Closed => {
                self.end_line()?;
                self.status_for(event)
            }
            _ => self.status_for(event),
        }
    }

    fn status_for(&mut self, event: &EngineEvent) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let Some(line) = engine_status(event, self.verbosity) else {
            return Ok(());
        };
        self.end_line()?;
        writeln!(self.out, "{line}")
    }

    /// A free-form status message.
    pub fn status(&mut self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        self.end_line()?;
        writeln!(self.out, "{message}")
    }

    pub fn error(&mut self, message: &str) -> io::Result<()> {
        self.end_line()?;
        writeln!(self.out, "{RED}{message}{RESET}")
    }

    /// Redraw the band meter in place (verbose mode only).
    pub fn meter(&mut self, levels: &[f32], energy: f32) -> io::Result<()> {
        if self.quiet || self.verbosity == 0 || self.mid_line || levels.is_empty() {
            return Ok(());
        }
        write!(
            self.out,
            "\r\x1b[2K{DIM}{} {:.4}{RESET}",
            format_level_bar(levels),
            energy
        )?;
        self.out.flush()
    }
}

//! Parsing of ffmpeg progress output into a 0..=1 ratio.
//!
//! Three line shapes are understood:
//!
//! - the input banner, `  Duration: 00:01:23.45, start: ...`, which sets the
//!   denominator;
//! - `-progress` key/value blocks (`out_time_us=`, `out_time_ms=`,
//!   `out_time=`, `progress=continue|end`);
//! - classic stats lines carrying `time=HH:MM:SS.xx`.

use std::collections::VecDeque;
use std::time::Duration;

/// Keys emitted by `-progress`. Lines with these keys are never diagnostics.
const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "stream_0_0_q",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

/// Incremental progress parser for one invocation.
#[derive(Debug, Default, Clone)]
pub struct ProgressParser {
    duration_us: Option<u64>,
    ratio: f64,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a known input duration (skips waiting for the banner).
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration_us: Some(duration.as_micros() as u64),
            ratio: 0.0,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_us.map(Duration::from_micros)
    }

    /// Current ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Feed one line. Returns the new ratio when the line advanced it.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix("Duration:") {
            let stamp = rest.split(',').next().unwrap_or("").trim();
            if let Some(us) = parse_timestamp(stamp).filter(|us| *us > 0) {
                self.duration_us = Some(us);
            }
            return None;
        }

        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            match key.trim() {
                // ffmpeg reports out_time_ms in microseconds as well.
                "out_time_us" | "out_time_ms" => {
                    return value.parse::<i64>().ok().and_then(|us| self.advance(us));
                }
                "out_time" => {
                    return parse_timestamp(value).and_then(|us| self.advance(us as i64));
                }
                "progress" if value == "end" => return self.complete(),
                _ => {}
            }
        }

        // Classic stats line: `frame=  42 fps=... time=00:00:01.40 bitrate=...`
        line.split_whitespace()
            .find_map(|token| token.strip_prefix("time="))
            .and_then(parse_timestamp)
            .and_then(|us| self.advance(us as i64))
    }

    /// Whether a line is a progress record rather than a diagnostic.
    pub fn is_progress_line(line: &str) -> bool {
        let line = line.trim();
        if line.starts_with("frame=") || line.starts_with("size=") {
            return true;
        }
        match line.split_once('=') {
            Some((key, _)) => PROGRESS_KEYS.contains(&key) || key.starts_with("stream_"),
            None => false,
        }
    }

    fn advance(&mut self, out_us: i64) -> Option<f64> {
        let total = self.duration_us?;
        if out_us <= 0 {
            return None;
        }
        let ratio = (out_us as f64 / total as f64).clamp(0.0, 1.0);
        if ratio > self.ratio {
            self.ratio = ratio;
            Some(ratio)
        } else {
            None
        }
    }

    fn complete(&mut self) -> Option<f64> {
        if self.ratio < 1.0 {
            self.ratio = 1.0;
            Some(1.0)
        } else {
            None
        }
    }
}

/// Parse `HH:MM:SS[.frac]` into microseconds. `None` when malformed or too
/// large to represent.
pub fn parse_timestamp(stamp: &str) -> Option<u64> {
    let mut parts = stamp.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_mul(1_000_000)?;
    let fraction = (seconds * 1_000_000.0).round();
    if fraction >= u64::MAX as f64 {
        return None;
    }
    whole.checked_add(fraction as u64)
}

/// Bounded tail of diagnostic lines.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl DiagnosticTail {
    pub const DEFAULT_LINES: usize = 20;
    const MAX_LINE_LEN: usize = 512;

    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines),
            max_lines: max_lines.max(1),
        }
    }

    /// Record a line unless it is blank or a progress record.
    pub fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() || ProgressParser::is_progress_line(line) {
            return;
        }
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        let mut owned: String = line.chars().take(Self::MAX_LINE_LEN).collect();
        if owned.len() < line.len() {
            owned.push_str("...");
        }
        self.lines.push_back(owned);
    }

    pub fn extend_from_text(&mut self, text: &str) {
        for line in text.lines() {
            self.push(line);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

impl Default for DiagnosticTail {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LINES)
    }
}

//! Frame and timecode conversion
//!
//! Converts between wall-clock durations, absolute frame counts and
//! `HH:MM:SS:FF` labels. Drop-frame follows the NTSC rule: frame labels
//! `00` and `01` (`00`-`03` at 59.94) are skipped at the start of every
//! minute except each tenth minute.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from timecode parsing and conversion
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimecodeError {
    #[error("Invalid timecode string: {0}")]
    Parse(String),

    #[error("Invalid frame rate: {0}")]
    InvalidRate(f64),

    #[error("Drop-frame is only defined for 29.97 and 59.94, got {0}")]
    DropFrameUnsupported(f64),

    #[error("Timecode {0} does not exist in drop-frame counting")]
    DroppedLabel(Timecode),

    #[error("Frame field {frames} out of range for {nominal} fps")]
    FrameOutOfRange { frames: u32, nominal: u32 },
}

/// A timecode label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timecode {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub frames: u32,
}

impl Timecode {
    pub const ZERO: Timecode = Timecode {
        hours: 0,
        minutes: 0,
        seconds: 0,
        frames: 0,
    };

    pub fn new(hours: u32, minutes: u32, seconds: u32, frames: u32) -> Self {
        Self {
            hours,
            minutes,
            seconds,
            frames,
        }
    }

    fn total_minutes(&self) -> u64 {
        self.hours as u64 * 60 + self.minutes as u64
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

impl FromStr for Timecode {
    type Err = TimecodeError;

    /// Accepts `:`, `;` or `.` as separators, so `01:00:00;00` parses too
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', ';', '.']).collect();
        if parts.len() != 4 {
            return Err(TimecodeError::Parse(s.to_string()));
        }
        let mut fields = [0u32; 4];
        for (slot, part) in fields.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| TimecodeError::Parse(s.to_string()))?;
        }
        let [hours, minutes, seconds, frames] = fields;
        if minutes > 59 || seconds > 59 {
            return Err(TimecodeError::Parse(s.to_string()));
        }
        Ok(Self::new(hours, minutes, seconds, frames))
    }
}

/// Frame rate plus drop-frame flag; everything timing-related hangs off this
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimecodeFormat {
    frame_rate: f64,
    drop_frame: bool,
}

impl TimecodeFormat {
    /// Validate and build a format
    ///
    /// # Arguments
    /// * `frame_rate` - Real frames per second (e.g. 29.97, 25.0)
    /// * `drop_frame` - Apply NTSC drop-frame labelling
    pub fn new(frame_rate: f64, drop_frame: bool) -> Result<Self, TimecodeError> {
        if !frame_rate.is_finite() || frame_rate <= 0.0 {
            return Err(TimecodeError::InvalidRate(frame_rate));
        }
        let format = Self {
            frame_rate,
            drop_frame,
        };
        // Labels need at least one frame per second
        if format.nominal_fps() == 0 {
            return Err(TimecodeError::InvalidRate(frame_rate));
        }
        if drop_frame && !matches!(format.nominal_fps(), 30 | 60) {
            return Err(TimecodeError::DropFrameUnsupported(frame_rate));
        }
        Ok(format)
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn is_drop_frame(&self) -> bool {
        self.drop_frame
    }

    /// Integer label rate: 30 for 29.97, 24 for 23.976
    pub fn nominal_fps(&self) -> u32 {
        self.frame_rate.round() as u32
    }

    /// Frame labels skipped per minute (2 at 29.97, 4 at 59.94)
    pub fn dropped_per_minute(&self) -> u32 {
        if self.drop_frame {
            self.nominal_fps() / 15
        } else {
            0
        }
    }

    fn frames_per_minute(&self) -> u64 {
        self.nominal_fps() as u64 * 60 - self.dropped_per_minute() as u64
    }

    fn frames_per_ten_minutes(&self) -> u64 {
        self.nominal_fps() as u64 * 600 - 9 * self.dropped_per_minute() as u64
    }

    /// True if the label is skipped under drop-frame counting
    pub fn is_dropped_label(&self, tc: &Timecode) -> bool {
        self.drop_frame
            && tc.seconds == 0
            && tc.frames < self.dropped_per_minute()
            && tc.minutes % 10 != 0
    }

    /// Convert an absolute frame count to its label
    pub fn to_timecode(&self, frame: u64) -> Timecode {
        let nominal = self.nominal_fps() as u64;
        let mut frame = frame;

        if self.drop_frame {
            let drop = self.dropped_per_minute() as u64;
            let per_ten = self.frames_per_ten_minutes();
            let per_minute = self.frames_per_minute();
            let tens = frame / per_ten;
            let rem = frame % per_ten;
            frame += drop * 9 * tens;
            if rem > drop {
                frame += drop * ((rem - drop) / per_minute);
            }
        }

        let frames = (frame % nominal) as u32;
        let total_seconds = frame / nominal;
        Timecode {
            hours: (total_seconds / 3600) as u32,
            minutes: ((total_seconds / 60) % 60) as u32,
            seconds: (total_seconds % 60) as u32,
            frames,
        }
    }

    /// Convert a label back to its absolute frame count
    pub fn to_frames(&self, tc: &Timecode) -> Result<u64, TimecodeError> {
        let nominal = self.nominal_fps();
        if tc.frames >= nominal {
            return Err(TimecodeError::FrameOutOfRange {
                frames: tc.frames,
                nominal,
            });
        }
        if self.is_dropped_label(tc) {
            return Err(TimecodeError::DroppedLabel(*tc));
        }
        Ok(self.label_frames(tc))
    }

    fn label_frames(&self, tc: &Timecode) -> u64 {
        let nominal = self.nominal_fps() as u64;
        let total_seconds = tc.hours as u64 * 3600 + tc.minutes as u64 * 60 + tc.seconds as u64;
        let labelled = total_seconds * nominal + tc.frames as u64;
        let minutes = tc.total_minutes();
        labelled - self.dropped_per_minute() as u64 * (minutes - minutes / 10)
    }

    /// Frame offset reached after `elapsed_secs` of wall-clock time
    ///
    /// Drop-frame exists to keep labels aligned with the wall clock, so in
    /// drop-frame mode the wall-clock label is built first and converted
    /// with the drop correction. Non-drop rates count real frames.
    pub fn frames_for_elapsed(&self, elapsed_secs: f64) -> u64 {
        if !elapsed_secs.is_finite() || elapsed_secs <= 0.0 {
            return 0;
        }

        if !self.drop_frame {
            return (elapsed_secs * self.frame_rate + 1e-9).floor() as u64;
        }

        let nominal = self.nominal_fps();
        let whole = elapsed_secs.floor() as u64;
        let fraction = elapsed_secs - whole as f64;
        let mut tc = Timecode {
            hours: (whole / 3600) as u32,
            minutes: ((whole / 60) % 60) as u32,
            seconds: (whole % 60) as u32,
            frames: ((fraction * nominal as f64 + 1e-9).floor() as u32).min(nominal - 1),
        };
        if self.is_dropped_label(&tc) {
            tc.frames = self.dropped_per_minute();
        }
        self.label_frames(&tc)
    }

    /// Frame offset for a signed duration, clamped at zero
    pub fn frames_for_duration(&self, elapsed: chrono::TimeDelta) -> u64 {
        let micros = elapsed.num_microseconds().unwrap_or(i64::MAX);
        self.frames_for_elapsed(micros as f64 / 1_000_000.0)
    }

    /// Seconds covered by `frames` real frames
    pub fn seconds_for_frames(&self, frames: u64) -> f64 {
        frames as f64 / self.frame_rate
    }
}

impl Default for TimecodeFormat {
    fn default() -> Self {
        Self {
            frame_rate: 29.97,
            drop_frame: true,
        }
    }
}

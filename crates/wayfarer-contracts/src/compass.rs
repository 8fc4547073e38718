use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Maps any finite heading into `[0, 360)`.
pub fn normalize_heading(heading: f64) -> f64 {
    let wrapped = heading.rem_euclid(360.0);
    if wrapped == 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Signed shortest arc from `from` to `to`, in `(-180, 180]`.
/// Positive means clockwise.
pub fn signed_delta(from: f64, to: f64) -> f64 {
    let delta = (to - from).rem_euclid(360.0);
    if delta > 180.0 {
        delta - 360.0
    } else {
        delta
    }
}

/// Unsigned angular distance between two headings, in `[0, 180]`.
pub fn angular_distance(a: f64, b: f64) -> f64 {
    signed_delta(a, b).abs()
}

/// Bucket width used when labeling a relative direction: 90-degree cardinal
/// buckets or 45-degree compass-rose buckets. Boundaries are
/// inclusive-exclusive and buckets are centered on zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    FourWay,
    EightWay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionLabel {
    Forward,
    ForwardRight,
    Right,
    BackRight,
    Back,
    BackLeft,
    Left,
    ForwardLeft,
}

impl DirectionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectionLabel::Forward => "forward",
            DirectionLabel::ForwardRight => "forward-right",
            DirectionLabel::Right => "right",
            DirectionLabel::BackRight => "back-right",
            DirectionLabel::Back => "back",
            DirectionLabel::BackLeft => "back-left",
            DirectionLabel::Left => "left",
            DirectionLabel::ForwardLeft => "forward-left",
        }
    }
}

pub fn direction_label(
    current_heading: f64,
    target_heading: f64,
    partition: Partition,
) -> DirectionLabel {
    let delta = signed_delta(
        normalize_heading(current_heading),
        normalize_heading(target_heading),
    );
    let width = match partition {
        Partition::FourWay => 90.0,
        Partition::EightWay => 45.0,
    };
    let bucket = ((delta + width / 2.0) / width).floor() as i32;
    match partition {
        Partition::FourWay => match bucket {
            0 => DirectionLabel::Forward,
            1 => DirectionLabel::Right,
            -1 => DirectionLabel::Left,
            _ => DirectionLabel::Back,
        },
        Partition::EightWay => match bucket {
            0 => DirectionLabel::Forward,
            1 => DirectionLabel::ForwardRight,
            2 => DirectionLabel::Right,
            3 => DirectionLabel::BackRight,
            -1 => DirectionLabel::ForwardLeft,
            -2 => DirectionLabel::Left,
            -3 => DirectionLabel::BackLeft,
            _ => DirectionLabel::Back,
        },
    }
}

/// Cooperative stop signal for an in-flight [`HeadingSweep`]. Checked once per
/// frame; cancellation surfaces as [`SweepFrame::Cancelled`], never silently.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepFrame {
    Running(f64),
    Finished(f64),
    Cancelled(f64),
}

/// Finite, non-restartable interpolation of the signed shortest arc between
/// two headings with a cubic ease-out curve. The caller drives it one frame at
/// a time with the elapsed time since the sweep started; once a terminal frame
/// is produced, every later frame repeats it.
#[derive(Debug)]
pub struct HeadingSweep {
    from: f64,
    delta: f64,
    duration: Duration,
    cancel: Option<CancelToken>,
    terminal: Option<SweepFrame>,
}

impl HeadingSweep {
    pub fn new(from: f64, to: f64, duration: Duration) -> Self {
        let from = normalize_heading(from);
        let delta = signed_delta(from, normalize_heading(to));
        Self {
            from,
            delta,
            duration,
            cancel: None,
            terminal: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn target(&self) -> f64 {
        normalize_heading(self.from + self.delta)
    }

    pub fn frame(&mut self, elapsed: Duration) -> SweepFrame {
        if let Some(terminal) = self.terminal {
            return terminal;
        }

        let progress = if self.duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / self.duration.as_secs_f64()).min(1.0)
        };
        let eased = 1.0 - (1.0 - progress).powi(3);
        let value = normalize_heading(self.from + self.delta * eased);

        let cancelled = self
            .cancel
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false);
        let frame = if cancelled && progress < 1.0 {
            SweepFrame::Cancelled(value)
        } else if progress >= 1.0 {
            SweepFrame::Finished(self.target())
        } else {
            return SweepFrame::Running(value);
        };
        self.terminal = Some(frame);
        frame
    }
}

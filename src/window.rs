//! Time windows.
//!
//! Every accumulated and aggregated metric keeps the same fixed shape:
//! one `[current, previous]` pair per dimension, smallest first. Windows
//! are anchored on event time, never on arrival time.

use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dimension {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Forever,
}

pub const DIMENSIONS: [Dimension; 6] = [
    Dimension::Second,
    Dimension::Minute,
    Dimension::Hour,
    Dimension::Day,
    Dimension::Month,
    Dimension::Forever,
];

fn datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn months(date: DateTime<Utc>) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn month_start(months: i64) -> i64 {
    let year = months.div_euclid(12) as i32;
    let month = months.rem_euclid(12) as u32 + 1;
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp_millis())
        .unwrap_or(i64::MAX)
}

impl Dimension {
    pub fn index(&self) -> usize {
        match self {
            Dimension::Second => 0,
            Dimension::Minute => 1,
            Dimension::Hour => 2,
            Dimension::Day => 3,
            Dimension::Month => 4,
            Dimension::Forever => 5,
        }
    }

    fn fixed(&self) -> Option<Duration> {
        match self {
            Dimension::Second => Some(Duration::seconds(1)),
            Dimension::Minute => Some(Duration::minutes(1)),
            Dimension::Hour => Some(Duration::hours(1)),
            Dimension::Day => Some(Duration::days(1)),
            _ => None,
        }
    }

    /// Bounds `[from, to)` of the window `offset` windows away from the
    /// one containing `time`. Negative offsets go back in time.
    pub fn bounds(&self, time: i64, offset: i64) -> (i64, i64) {
        match self {
            Dimension::Forever => (0, i64::MAX),
            Dimension::Month => {
                let m = months(datetime(time)) + offset;
                (month_start(m), month_start(m + 1))
            }
            _ => {
                let width = self.fixed().unwrap_or(Duration::days(1));
                let truncated = datetime(time)
                    .duration_trunc(width)
                    .map(|d| d.timestamp_millis())
                    .unwrap_or(time);
                let from = truncated + offset * width.num_milliseconds();
                (from, from + width.num_milliseconds())
            }
        }
    }

    /// Number of windows between the one containing `from` and the one
    /// containing `to`, ignoring every smaller dimension.
    pub fn diff(&self, from: i64, to: i64) -> i64 {
        match self {
            Dimension::Forever => 0,
            Dimension::Month => months(datetime(to)) - months(datetime(from)),
            _ => {
                let width = self.fixed().map(|d| d.num_milliseconds()).unwrap_or(1);
                to.div_euclid(width) - from.div_euclid(width)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Current,
    Previous,
}

impl Slot {
    pub fn offset(&self) -> i64 {
        match self {
            Slot::Current => 0,
            Slot::Previous => -1,
        }
    }
}

/// Locates the slot an event time falls in, relative to a window
/// anchor. `None` when it is older than the previous window or newer
/// than the anchor's window.
pub fn locate(dimension: Dimension, anchor: i64, time: i64) -> Option<Slot> {
    match dimension.diff(time, anchor) {
        0 => Some(Slot::Current),
        1 => Some(Slot::Previous),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowPair<T> {
    pub current: Option<T>,
    pub previous: Option<T>,
}

impl<T> Default for WindowPair<T> {
    fn default() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }
}

impl<T> WindowPair<T> {
    pub fn get(&self, slot: Slot) -> Option<&T> {
        match slot {
            Slot::Current => self.current.as_ref(),
            Slot::Previous => self.previous.as_ref(),
        }
    }

    pub fn get_mut(&mut self, slot: Slot) -> &mut Option<T> {
        match slot {
            Slot::Current => &mut self.current,
            Slot::Previous => &mut self.previous,
        }
    }

    /// Rolls the pair `windows` windows forward.
    pub fn shift(&mut self, windows: i64) {
        match windows {
            w if w <= 0 => {}
            1 => {
                self.previous = self.current.take();
            }
            _ => {
                self.previous = None;
                self.current = None;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowSet<T>(pub [WindowPair<T>; 6]);

impl<T> Default for WindowSet<T> {
    fn default() -> Self {
        WindowSet(std::array::from_fn(|_| WindowPair::default()))
    }
}

impl<T> WindowSet<T> {
    pub fn pair(&self, dimension: Dimension) -> &WindowPair<T> {
        &self.0[dimension.index()]
    }

    pub fn pair_mut(&mut self, dimension: Dimension) -> &mut WindowPair<T> {
        &mut self.0[dimension.index()]
    }

    /// Rolls every dimension forward from one anchor to a later one.
    pub fn shift(&mut self, from_anchor: i64, to_anchor: i64) {
        for dimension in DIMENSIONS {
            let windows = dimension.diff(from_anchor, to_anchor);
            self.pair_mut(dimension).shift(windows);
        }
    }

    /// Visits every present cell with its dimension and slot.
    pub fn cells(&self) -> impl Iterator<Item = (Dimension, Slot, &T)> {
        DIMENSIONS.into_iter().flat_map(move |d| {
            let pair = self.pair(d);
            [
                pair.current.as_ref().map(|c| (d, Slot::Current, c)),
                pair.previous.as_ref().map(|c| (d, Slot::Previous, c)),
            ]
            .into_iter()
            .flatten()
        })
    }

    pub fn cells_mut(&mut self) -> impl Iterator<Item = (Dimension, Slot, &mut T)> {
        self.0.iter_mut().zip(DIMENSIONS).flat_map(|(pair, d)| {
            [
                pair.current.as_mut().map(|c| (d, Slot::Current, c)),
                pair.previous.as_mut().map(|c| (d, Slot::Previous, c)),
            ]
            .into_iter()
            .flatten()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{locate, Dimension, Slot, WindowPair, WindowSet};

    // 2015-10-31T23:59:59.500Z
    const HALLOWEEN: i64 = 1446335999500;
    // 2015-11-01T00:00:00Z
    const NOVEMBER: i64 = 1446336000000;

    #[test]
    fn test_bounds() {
        assert_eq!(Dimension::Second.bounds(HALLOWEEN, 0), (1446335999000, NOVEMBER));
        assert_eq!(Dimension::Hour.bounds(HALLOWEEN, 0), (NOVEMBER - 3600000, NOVEMBER));
        assert_eq!(Dimension::Day.bounds(NOVEMBER, -1), (NOVEMBER - 86400000, NOVEMBER));
        assert_eq!(
            Dimension::Month.bounds(HALLOWEEN, 0),
            (1443657600000, NOVEMBER)
        );
        assert_eq!(Dimension::Month.bounds(NOVEMBER, -1), (1443657600000, NOVEMBER));
        assert_eq!(Dimension::Forever.bounds(HALLOWEEN, 0), (0, i64::MAX));
    }

    #[test]
    fn test_diff_ignores_lower_dimensions() {
        assert_eq!(Dimension::Month.diff(HALLOWEEN, NOVEMBER), 1);
        assert_eq!(Dimension::Day.diff(HALLOWEEN, NOVEMBER), 1);
        assert_eq!(Dimension::Minute.diff(HALLOWEEN, HALLOWEEN + 600), 1);
        assert_eq!(Dimension::Month.diff(NOVEMBER, NOVEMBER + 86400000), 0);
        assert_eq!(Dimension::Forever.diff(0, NOVEMBER), 0);
    }

    #[test]
    fn test_locate() {
        assert_eq!(locate(Dimension::Day, NOVEMBER, NOVEMBER + 10), Some(Slot::Current));
        assert_eq!(locate(Dimension::Day, NOVEMBER, HALLOWEEN), Some(Slot::Previous));
        assert_eq!(locate(Dimension::Day, NOVEMBER, HALLOWEEN - 86400000), None);
        assert_eq!(locate(Dimension::Forever, NOVEMBER, 0), Some(Slot::Current));
    }

    #[test]
    fn test_pair_shift() {
        let mut pair = WindowPair {
            current: Some(2),
            previous: Some(1),
        };
        pair.shift(0);
        assert_eq!(pair.current, Some(2));
        pair.shift(1);
        assert_eq!((pair.current, pair.previous), (None, Some(2)));
        pair.current = Some(3);
        pair.shift(5);
        assert_eq!((pair.current, pair.previous), (None, None));
    }

    #[test]
    fn test_set_shift_per_dimension() {
        let mut set: WindowSet<u32> = WindowSet::default();
        for pair in set.0.iter_mut() {
            pair.current = Some(7);
        }
        set.shift(HALLOWEEN, NOVEMBER);
        assert_eq!(set.pair(Dimension::Month).previous, Some(7));
        assert_eq!(set.pair(Dimension::Month).current, None);
        assert_eq!(set.pair(Dimension::Forever).current, Some(7));
        assert_eq!(set.cells().count(), 6);
    }
}

//! DOS date/time encoding used by directory entry timestamps.

use bitfield_struct::bitfield;

/// On-disk date: days since an epoch of 1980-01-01, packed into 16 bits.
/// Month and day are 1-based; zero values are invalid but tolerated (the
/// calendar accessors clamp instead of failing).
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct DosDate {
    #[bits(5)]
    pub day: u8,
    #[bits(4)]
    pub month: u8,
    /// Years since 1980, covering 1980-2107.
    #[bits(7)]
    pub year_offset: u8,
}

/// On-disk time of day with two-second resolution, packed into 16 bits.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct DosTime {
    /// Seconds divided by two (0-29).
    #[bits(5)]
    pub double_seconds: u8,
    #[bits(6)]
    pub minute: u8,
    #[bits(5)]
    pub hour: u8,
}

/// A full directory-entry timestamp. Creation timestamps additionally carry
/// `tenths`, a 10ms count in 0-199 spanning the two-second window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub date: DosDate,
    pub time: DosTime,
    pub tenths: u8,
}

impl DosDateTime {
    /// 1980-01-01 00:00:00, the earliest representable instant.
    pub const EPOCH: Self = Self {
        date: DosDate::new().with_day(1).with_month(1),
        time: DosTime::new(),
        tenths: 0,
    };

    pub fn new(date: DosDate, time: DosTime, tenths: u8) -> Self {
        Self { date, time, tenths }
    }

    pub fn year(&self) -> u16 {
        1980 + u16::from(self.date.year_offset())
    }

    pub fn month(&self) -> u8 {
        self.date.month().clamp(1, 12)
    }

    pub fn day(&self) -> u8 {
        self.date.day().clamp(1, 31)
    }

    pub fn hour(&self) -> u8 {
        self.time.hour().min(23)
    }

    pub fn minute(&self) -> u8 {
        self.time.minute().min(59)
    }

    pub fn second(&self) -> u8 {
        self.time.double_seconds().min(29) * 2 + self.tenths.min(199) / 100
    }
}

/// Source of "now" for freshly written timestamps. The driver itself has no
/// notion of wall-clock time; callers with access to one (the `mkfs-fat` and
/// `fatls` binaries, a kernel with an RTC driver) supply their own
/// implementation. Whether the clock reports UTC or local time is the
/// implementation's business, selected by the `utc` mount option.
pub trait Clock: Send + Sync {
    fn now(&self) -> DosDateTime;
}

/// Fallback clock stamping everything with [`DosDateTime::EPOCH`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EpochClock;

impl Clock for EpochClock {
    fn now(&self) -> DosDateTime {
        DosDateTime::EPOCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_field_packing() {
        // 2023-07-19 -> year offset 43, month 7, day 19.
        let date = DosDate::new()
            .with_year_offset(43)
            .with_month(7)
            .with_day(19);
        assert_eq!(u16::from(date), (43 << 9) | (7 << 5) | 19);

        let back = DosDate::from((43 << 9) | (7 << 5) | 19);
        assert_eq!(back.year_offset(), 43);
        assert_eq!(back.month(), 7);
        assert_eq!(back.day(), 19);
    }

    #[test]
    fn time_field_packing() {
        // 13:37:42 -> hour 13, minute 37, double seconds 21.
        let time = DosTime::new()
            .with_hour(13)
            .with_minute(37)
            .with_double_seconds(21);
        assert_eq!(u16::from(time), (13 << 11) | (37 << 5) | 21);
    }

    #[test]
    fn invalid_encodings_clamp() {
        // An all-zero date would be 1980-00-00; accessors clamp to 1980-01-01.
        let zero = DosDateTime::new(DosDate::from(0), DosTime::from(0), 0);
        assert_eq!(zero.year(), 1980);
        assert_eq!(zero.month(), 1);
        assert_eq!(zero.day(), 1);

        // Out-of-range time fields clamp to the top of their ranges.
        let bad = DosDateTime::new(DosDate::from(0), DosTime::from(u16::MAX), 255);
        assert_eq!(bad.hour(), 23);
        assert_eq!(bad.minute(), 59);
        assert_eq!(bad.second(), 59);
    }

    #[test]
    fn epoch_is_valid() {
        let epoch = DosDateTime::EPOCH;
        assert_eq!(epoch.year(), 1980);
        assert_eq!(epoch.month(), 1);
        assert_eq!(epoch.day(), 1);
        assert_eq!(epoch.second(), 0);
    }
}

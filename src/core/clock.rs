//! 时钟与自然日
//!
//! 「今天 / 昨天」按固定时区偏移（默认 UTC+8）划分；存储统一使用 UTC 时间戳。

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};

/// 一个本地自然日对应的 UTC 半开区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// 可注入的时钟
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// 划分自然日所用的时区偏移
    fn offset(&self) -> FixedOffset;

    fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.offset()).date_naive()
    }

    fn today(&self) -> NaiveDate {
        self.local_date(self.now())
    }

    fn day_range(&self, date: NaiveDate) -> DayRange {
        day_range(date, self.offset())
    }
}

/// 计算某个本地日期在给定偏移下的 UTC 区间
pub fn day_range(date: NaiveDate, offset: FixedOffset) -> DayRange {
    let local_midnight = date.and_time(NaiveTime::MIN);
    let start = Utc.from_utc_datetime(
        &(local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()))),
    );
    DayRange {
        start,
        end: start + Duration::days(1),
    }
}

/// 小时数转时区偏移，非法值回退到 UTC
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600).unwrap_or_else(|| Utc.fix())
}

/// 系统时钟
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(utc_offset_hours: i32) -> Self {
        Self {
            offset: offset_from_hours(utc_offset_hours),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// 手动拨动的时钟，用于测试跨天逻辑
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>, utc_offset_hours: i32) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
            offset: offset_from_hours(utc_offset_hours),
        }
    }

    /// 以本地时间构造（便于写「第 N 天 10 点」这类用例）
    pub fn at_local(date: NaiveDate, hour: u32, utc_offset_hours: i32) -> Self {
        let range = day_range(date, offset_from_hours(utc_offset_hours));
        Self::new(range.start + Duration::hours(i64::from(hour)), utc_offset_hours)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *guard = *guard + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

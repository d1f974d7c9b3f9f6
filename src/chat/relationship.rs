//! 好感度与连续聊天天数
//!
//! 连续天数规则（按本地自然日）：无记录 → 1；上次在今天 → 不变；上次在昨天 → +1；更早 → 重置为 1。

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::core::{RelationshipAggregate, RoleId, UserId};

fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

/// 新一轮对话后的连续天数
pub fn next_streak(previous: Option<(u32, NaiveDate)>, today: NaiveDate) -> u32 {
    match previous {
        None => 1,
        Some((days, last)) if last == today => days.max(1),
        Some((days, last)) if last + Duration::days(1) == today => days.saturating_add(1),
        Some(_) => 1,
    }
}

/// 把一轮对话的结果叠加到关系聚合上
///
/// `score_delta` 对新轮次是本轮分数，对重新生成是「新分数 - 旧分数」。
pub fn apply_turn(
    previous: Option<&RelationshipAggregate>,
    user_id: UserId,
    role_id: RoleId,
    score_delta: i64,
    at: DateTime<Utc>,
    offset: FixedOffset,
) -> RelationshipAggregate {
    let today = local_date(at, offset);
    let streak = next_streak(
        previous.map(|p| (p.continuous_days, local_date(p.last_turn_at, offset))),
        today,
    );
    RelationshipAggregate {
        user_id,
        role_id,
        favorability: previous.map_or(0, |p| p.favorability) + score_delta,
        continuous_days: streak,
        last_turn_at: at,
    }
}

/// 展示用连续天数：最后一次聊天早于昨天时视为已中断（不修改存储）
pub fn effective_streak(aggregate: &RelationshipAggregate, today: NaiveDate, offset: FixedOffset) -> u32 {
    let last = local_date(aggregate.last_turn_at, offset);
    if last == today || last + Duration::days(1) == today {
        aggregate.continuous_days
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{day_range, offset_from_hours};

    fn noon(date: NaiveDate) -> DateTime<Utc> {
        day_range(date, offset_from_hours(8)).start + Duration::hours(12)
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, day).unwrap()
    }

    #[test]
    fn test_streak_rule() {
        assert_eq!(next_streak(None, d(1)), 1);
        assert_eq!(next_streak(Some((3, d(5))), d(5)), 3);
        assert_eq!(next_streak(Some((3, d(4))), d(5)), 4);
        assert_eq!(next_streak(Some((3, d(2))), d(5)), 1);
    }

    #[test]
    fn test_n_consecutive_days_then_gap() {
        let offset = offset_from_hours(8);
        let mut agg: Option<RelationshipAggregate> = None;
        for day in 1..=6 {
            agg = Some(apply_turn(agg.as_ref(), 1, 2, 1, noon(d(day)), offset));
        }
        let current = agg.clone().unwrap();
        assert_eq!(current.continuous_days, 6);
        assert_eq!(current.favorability, 6);

        // 跳过 7 号
        let after_gap = apply_turn(agg.as_ref(), 1, 2, -2, noon(d(8)), offset);
        assert_eq!(after_gap.continuous_days, 1);
        assert_eq!(after_gap.favorability, 4);
    }

    #[test]
    fn test_day_boundary_uses_offset() {
        let offset = offset_from_hours(8);
        // 本地 23:30 与次日 00:30 属于相邻两天
        let late = day_range(d(1), offset).start + Duration::minutes(23 * 60 + 30);
        let first = apply_turn(None, 1, 2, 0, late, offset);
        let next = apply_turn(Some(&first), 1, 2, 0, late + Duration::hours(1), offset);
        assert_eq!(next.continuous_days, 2);
    }

    #[test]
    fn test_effective_streak() {
        let offset = offset_from_hours(8);
        let agg = apply_turn(None, 1, 2, 0, noon(d(1)), offset);
        assert_eq!(effective_streak(&agg, d(2), offset), 1);
        assert_eq!(effective_streak(&agg, d(3), offset), 0);
    }
}

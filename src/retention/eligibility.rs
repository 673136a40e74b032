use chrono::{DateTime, Datelike, Utc};

use crate::{
    config::EligibilityConfig,
    models::{EndPeriod, Entity},
};

/// Decides whether an entity's membership has ended.
///
/// 1. No end period: eligible.
/// 2. The end period has lapsed: eligible. A year lapses once the calendar
///    year is over; a date lapses at its midnight.
/// 3. The end period falls in the current year and today is on or after the
///    cutoff (July 7 by default): eligible. The cutoff is compared against
///    today's month/day, not the end period's.
/// 4. Otherwise: not eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityEvaluator {
    cutoff_month: u32,
    cutoff_day: u32,
}

impl Default for EligibilityEvaluator {
    fn default() -> Self {
        Self::new(&EligibilityConfig::default())
    }
}

impl EligibilityEvaluator {
    pub fn new(config: &EligibilityConfig) -> Self {
        Self {
            cutoff_month: config.cutoff_month,
            cutoff_day: config.cutoff_day,
        }
    }

    pub fn is_eligible(&self, entity: &Entity, now: DateTime<Utc>) -> bool {
        let Some(end) = entity.end_period else {
            return true;
        };

        let now_naive = now.naive_utc();
        let lapsed = match end {
            EndPeriod::Year(year) => year < now.year(),
            EndPeriod::Date(_) => end.end_datetime().is_some_and(|end| end < now_naive),
        };
        if lapsed {
            return true;
        }

        end.year() == now.year()
            && (now.month(), now.day()) >= (self.cutoff_month, self.cutoff_day)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;
    use crate::models::document;

    fn entity(endyear: Value) -> Entity {
        let doc = document::document(json!({ "id": "e1", "endyear": endyear }));
        Entity::from_document(doc, "id", "endyear").unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case::no_end_period(json!(null), at(2024, 1, 1), true)]
    #[case::zero_end_period(json!(0), at(2024, 3, 1), true)]
    #[case::past_year(json!(2022), at(2024, 1, 1), true)]
    #[case::last_year(json!(2023), at(2024, 1, 1), true)]
    #[case::future_year(json!(2025), at(2024, 1, 1), false)]
    #[case::future_year_after_cutoff(json!(2025), at(2024, 12, 31), false)]
    #[case::current_year_after_cutoff(json!(2024), at(2024, 7, 10), true)]
    #[case::current_year_on_cutoff(json!(2024), at(2024, 7, 7), true)]
    #[case::current_year_before_cutoff(json!(2024), at(2024, 7, 1), false)]
    #[case::current_year_january(json!(2024), at(2024, 1, 1), false)]
    #[case::past_date(json!("2024-03-01"), at(2024, 6, 1), true)]
    #[case::future_date_before_cutoff(json!("2024-09-01"), at(2024, 6, 1), false)]
    #[case::future_date_after_cutoff(json!("2024-09-01"), at(2024, 8, 1), true)]
    #[case::future_date_next_year(json!("2025-02-01"), at(2024, 8, 1), false)]
    fn test_is_eligible(#[case] endyear: Value, #[case] now: DateTime<Utc>, #[case] expected: bool) {
        let evaluator = EligibilityEvaluator::default();
        assert_eq!(evaluator.is_eligible(&entity(endyear), now), expected);
    }

    #[test]
    fn test_current_year_follows_clock() {
        let evaluator = EligibilityEvaluator::default();
        let year = Utc::now().year();
        let current = entity(json!(year));
        assert!(evaluator.is_eligible(&current, at(year, 7, 10)));
        assert!(!evaluator.is_eligible(&current, at(year, 7, 1)));
    }

    #[test]
    fn test_custom_cutoff() {
        let evaluator = EligibilityEvaluator::new(&EligibilityConfig {
            cutoff_month: 6,
            cutoff_day: 15,
        });
        assert!(evaluator.is_eligible(&entity(json!(2024)), at(2024, 6, 15)));
        assert!(!evaluator.is_eligible(&entity(json!(2024)), at(2024, 6, 14)));
    }
}

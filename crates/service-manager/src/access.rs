//! Calendar-based access policy (§4.7).

use chrono::{DateTime, Datelike, Timelike, Utc};

use uds_domain::entities::{AccessAction, CalendarRule, ServicePool};

/// Seconds elapsed since Monday 00:00:00 in `now`'s own timezone, the
/// unit [`CalendarRule::contains`] expects.
pub fn seconds_of_week(now: DateTime<Utc>) -> u32 {
    let day = now.weekday().num_days_from_monday();
    day * 86_400 + now.num_seconds_from_midnight()
}

/// Evaluates `pool.calendar_rules` in ascending priority order and
/// returns the first match's action, or `pool.fallback_access` if none
/// of them cover `now`.
pub fn is_access_allowed(pool: &ServicePool, now: DateTime<Utc>) -> AccessAction {
    let sow = seconds_of_week(now);
    let mut rules: Vec<&CalendarRule> = pool.calendar_rules.iter().collect();
    rules.sort_by_key(|r| r.priority);
    rules
        .into_iter()
        .find(|r| r.contains(sow))
        .map(|r| r.action)
        .unwrap_or(pool.fallback_access)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uds_domain::ids::ServiceId;

    fn pool_with(rules: Vec<CalendarRule>, fallback: AccessAction) -> ServicePool {
        ServicePool {
            id: 1,
            uuid: uds_domain::ids::ServicePoolId::new(),
            name: "pool".into(),
            service_id: ServiceId::new(),
            state: uds_domain::entities::ServicePoolState::Active,
            initial_srvs: 0,
            cache_l1_srvs: 0,
            cache_l2_srvs: 0,
            max_srvs: 0,
            current_pub_revision: None,
            current_publication_id: None,
            osmanager_id: None,
            transports: vec![],
            assigned_groups: vec![],
            show_transports: true,
            visible: true,
            allow_users_remove: false,
            allow_users_reset: false,
            calendar_rules: rules,
            fallback_access: fallback,
        }
    }

    #[test]
    fn no_rules_falls_back() {
        let pool = pool_with(vec![], AccessAction::Deny);
        let now = DateTime::parse_from_rfc3339("2026-07-29T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(is_access_allowed(&pool, now), AccessAction::Deny);
    }

    #[test]
    fn lowest_priority_rule_wins_when_both_match() {
        let wide = CalendarRule {
            priority: 10,
            calendar_name: "always".into(),
            action: AccessAction::Deny,
            intervals: vec![(0, 7 * 86_400)],
        };
        let narrow = CalendarRule {
            priority: 0,
            calendar_name: "business-hours".into(),
            action: AccessAction::Allow,
            intervals: vec![(0, 7 * 86_400)],
        };
        let pool = pool_with(vec![wide, narrow], AccessAction::Deny);
        let now = DateTime::parse_from_rfc3339("2026-07-29T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(is_access_allowed(&pool, now), AccessAction::Allow);
    }

    #[test]
    fn a_rule_outside_its_interval_is_skipped_in_favor_of_fallback() {
        let rule = CalendarRule {
            priority: 0,
            calendar_name: "never".into(),
            action: AccessAction::Allow,
            intervals: vec![(0, 1)],
        };
        let pool = pool_with(vec![rule], AccessAction::Deny);
        let now = DateTime::parse_from_rfc3339("2026-07-29T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(is_access_allowed(&pool, now), AccessAction::Deny);
    }
}

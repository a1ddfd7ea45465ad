use tagkeeper_config::RestartPolicyConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum RestartDecision {
    Restart { backoff_s: u64 },
    MarkFailed { reason: &'static str },
}

/// `should_restart(count, last_wall_ms)` from §4.3: rapid-window limit,
/// then lifetime limit, then exponential backoff capped at
/// `restart_backoff_cap_s`.
pub fn should_restart(count: u32, last_wall_ms: Option<i64>, now_ms: i64, config: &RestartPolicyConfig) -> RestartDecision {
    let rapid_window_ms = config.restart_rapid_window_s as i64 * 1_000;
    let within_rapid_window = match last_wall_ms {
        None => true,
        Some(last) => now_ms.saturating_sub(last) < rapid_window_ms,
    };
    if count >= config.restart_max_rapid && within_rapid_window {
        return RestartDecision::MarkFailed { reason: "rapid-restart-limit" };
    }
    if count >= config.restart_max_lifetime {
        return RestartDecision::MarkFailed { reason: "lifetime-restart-limit" };
    }
    let backoff_s = 2u64.saturating_pow(count).min(config.restart_backoff_cap_s);
    RestartDecision::Restart { backoff_s }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RestartPolicyConfig {
        RestartPolicyConfig::default()
    }

    #[test]
    fn fresh_component_gets_one_second_backoff() {
        let decision = should_restart(0, None, 0, &config());
        assert_eq!(decision, RestartDecision::Restart { backoff_s: 1 });
    }

    #[test]
    fn backoff_is_capped_at_sixty_seconds() {
        let decision = should_restart(10, Some(0), 1_000, &config());
        assert_eq!(decision, RestartDecision::Restart { backoff_s: 60 });
    }

    #[test]
    fn rapid_restart_limit_marks_failed_within_window() {
        let now = 1_000_000;
        let last = now - 60_000; // 1 minute ago, well within 5 min window
        let decision = should_restart(5, Some(last), now, &config());
        assert_eq!(decision, RestartDecision::MarkFailed { reason: "rapid-restart-limit" });
    }

    #[test]
    fn five_restarts_outside_rapid_window_are_not_marked_failed() {
        let now = 1_000_000_000;
        let last = now - (6 * 60 * 1_000); // 6 minutes ago, outside the 5 minute window
        let decision = should_restart(5, Some(last), now, &config());
        assert!(matches!(decision, RestartDecision::Restart { .. }));
    }

    #[test]
    fn lifetime_limit_marks_failed_even_when_spaced_out() {
        let now = 1_000_000_000;
        let last = now - (6 * 60 * 1_000);
        let decision = should_restart(20, Some(last), now, &config());
        assert_eq!(decision, RestartDecision::MarkFailed { reason: "lifetime-restart-limit" });
    }

    #[test]
    fn never_restarted_component_with_high_count_still_checks_rapid_window() {
        // count >= max_rapid but last_wall_ms is None (never restarted before, e.g.
        // restored from a corrupted record) — conservatively treated as "within window".
        let decision = should_restart(5, None, 0, &config());
        assert_eq!(decision, RestartDecision::MarkFailed { reason: "rapid-restart-limit" });
    }
}

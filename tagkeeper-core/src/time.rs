//! Wall-clock helpers. Used only for persisted timestamps (logging,
//! restart counters, calibration history) — never for liveness decisions,
//! which are the health monitor's exclusive responsibility.

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

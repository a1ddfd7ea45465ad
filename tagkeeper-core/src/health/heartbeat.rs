use serde::{Deserialize, Serialize};

/// One frame decoded from a component's IPC pipe. Workers emit one of
/// these, newline-delimited JSON, on their heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    pub status: FrameStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub current_job: Option<String>,
    /// Only meaningful when `status == Recovering`; clamped to `[5, 120]`
    /// seconds by the monitor before it extends the deadline.
    #[serde(default)]
    pub recover_for_s: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Starting,
    Healthy,
    Recovering,
    Stopping,
}

pub const RECOVER_FOR_MIN_S: u64 = 5;
pub const RECOVER_FOR_MAX_S: u64 = 120;

impl HeartbeatFrame {
    pub fn healthy(pid: u32, current_job: Option<String>) -> Self {
        Self {
            status: FrameStatus::Healthy,
            pid: Some(pid),
            current_job,
            recover_for_s: None,
        }
    }

    pub fn stopping() -> Self {
        Self {
            status: FrameStatus::Stopping,
            pid: None,
            current_job: None,
            recover_for_s: None,
        }
    }

    /// Decodes one newline-delimited JSON frame. Malformed frames are a
    /// transport-layer concern for the caller, not a panic here.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn clamped_recover_for_s(&self) -> Option<u64> {
        self.recover_for_s
            .map(|s| s.clamp(RECOVER_FOR_MIN_S, RECOVER_FOR_MAX_S))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_line() {
        let frame = HeartbeatFrame::healthy(1234, Some("file_42".into()));
        let line = frame.encode().unwrap();
        let decoded = HeartbeatFrame::decode(&line).unwrap();
        assert_eq!(decoded.status, FrameStatus::Healthy);
        assert_eq!(decoded.pid, Some(1234));
    }

    #[test]
    fn recover_for_s_clamps_to_bounds() {
        let mut frame = HeartbeatFrame::healthy(1, None);
        frame.status = FrameStatus::Recovering;
        frame.recover_for_s = Some(1);
        assert_eq!(frame.clamped_recover_for_s(), Some(RECOVER_FOR_MIN_S));
        frame.recover_for_s = Some(999);
        assert_eq!(frame.clamped_recover_for_s(), Some(RECOVER_FOR_MAX_S));
    }
}

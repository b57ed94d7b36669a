// Queue Domain Model

use chrono::{DateTime, Utc};

/// Queue identifier, unique within a Store
pub type QueueId = u64;

/// Point-in-time view of a queue, handed to scale directives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub id: QueueId,
    pub len: usize,
    pub last_enqueue: Option<DateTime<Utc>>,
    pub closed: bool,
}

impl QueueInfo {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Worker slots for one queue: `available` up to the ceiling, `active` right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingInfo {
    pub available: usize,
    pub active: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_info_empty() {
        let info = QueueInfo {
            id: 7,
            len: 0,
            last_enqueue: None,
            closed: false,
        };
        assert!(info.is_empty());

        let busy = QueueInfo { len: 3, ..info };
        assert!(!busy.is_empty());
    }
}

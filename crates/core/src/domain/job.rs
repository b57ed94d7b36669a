// Durable Job Domain Model

use serde::de::DeserializeOwned;
use std::time::Duration;

/// Broker-assigned job identifier
pub type JobId = u64;

/// Default beanstalkd-style priority (lower is more urgent)
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Default time-to-run granted to a consumer
pub const DEFAULT_TTR: Duration = Duration::from_secs(60);

/// A job reserved from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub body: Vec<u8>,
}

impl Job {
    pub fn new(id: JobId, body: Vec<u8>) -> Self {
        Self { id, body }
    }

    /// Decode the JSON body into a typed payload
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Submission parameters for `Manager::put_job`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub priority: u32,
    pub delay: Duration,
    /// Time allotted to a consumer before the broker considers the job abandoned
    pub ttr: Duration,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay: Duration::ZERO,
            ttr: DEFAULT_TTR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Resize {
        width: u32,
        height: u32,
    }

    #[test]
    fn test_job_decode() {
        let job = Job::new(42, br#"{"width":640,"height":480}"#.to_vec());
        let payload: Resize = job.decode().unwrap();
        assert_eq!(
            payload,
            Resize {
                width: 640,
                height: 480
            }
        );
    }

    #[test]
    fn test_job_decode_rejects_garbage() {
        let job = Job::new(1, b"not json".to_vec());
        assert!(job.decode::<Resize>().is_err());
    }

    #[test]
    fn test_put_options_default() {
        let opts = PutOptions::default();
        assert_eq!(opts.priority, 1024);
        assert_eq!(opts.delay, Duration::ZERO);
        assert_eq!(opts.ttr, Duration::from_secs(60));
    }
}

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Client settings.
///
/// Deserializes from `{"timeout_ms": 5000}`; a missing or `null`
/// `timeout_ms` means no timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ClientOptions {
    #[serde(rename = "timeout_ms", default, deserialize_with = "millis")]
    timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

pub(crate) fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

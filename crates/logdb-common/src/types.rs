//! Common types used across LogDB

use serde::{Deserialize, Serialize};

use crate::LogdbError;

/// Broker-assigned identifier of an unacknowledged message on one channel.
pub type DeliveryTag = u64;

/// Suffix appended to every broker resource in the test namespace.
pub const TEST_SUFFIX: &str = "_test";

/// Selects production or the isolated test topology for broker resources.
///
/// Every exchange and queue name passes through [`Namespace::resource`], so
/// integration runs never touch production queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Namespace {
    test: bool,
}

impl Namespace {
    pub fn production() -> Self {
        Self { test: false }
    }

    pub fn test() -> Self {
        Self { test: true }
    }

    pub fn from_flag(test: bool) -> Self {
        Self { test }
    }

    pub fn is_test(&self) -> bool {
        self.test
    }

    /// Resolve a logical resource name inside this namespace
    pub fn resource(&self, base: &str) -> String {
        if self.test {
            format!("{base}{TEST_SUFFIX}")
        } else {
            base.to_string()
        }
    }
}

/// Worker classes the supervisor knows how to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// TCP listener that accepts device connections and publishes records
    Protocol,
    /// Broker consumer that batches records into the database
    Loader,
    /// Periodic retention job
    Cleaner,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Protocol => "protocol",
            WorkerKind::Loader => "loader",
            WorkerKind::Cleaner => "cleaner",
        }
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = LogdbError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "protocol" => Ok(WorkerKind::Protocol),
            "loader" => Ok(WorkerKind::Loader),
            "cleaner" => Ok(WorkerKind::Cleaner),
            _ => Err(LogdbError::Parse(format!("Invalid worker kind: {s}"))),
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_suffixes_only_in_test_mode() {
        assert_eq!(Namespace::production().resource("logs"), "logs");
        assert_eq!(Namespace::test().resource("logs"), "logs_test");
        assert!(Namespace::from_flag(true).is_test());
    }

    #[test]
    fn test_worker_kind_round_trip() {
        for kind in [WorkerKind::Protocol, WorkerKind::Loader, WorkerKind::Cleaner] {
            assert_eq!(kind.to_string().parse::<WorkerKind>().unwrap(), kind);
        }
        assert!("router".parse::<WorkerKind>().is_err());
    }
}

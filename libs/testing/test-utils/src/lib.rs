//! Shared test utilities for the consumer crates
//!
//! This crate provides reusable test infrastructure:
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestNames`: Deterministic stream/subject/consumer names (always available)
//! - `wait`: Polling helpers for asynchronous assertions (always available)
//! - `init_test_tracing`: Test-writer tracing subscriber (always available)
//!
//! # Features
//!
//! - `nats`: Enables NATS JetStream test infrastructure
//!
//! # Usage
//!
//! Add `features = ["nats"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestNames, TestNats};
//!
//! #[tokio::test]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestNames::from_test_name("my_nats_test");
//!
//!     nats.create_work_queue(&names.stream(), &names.subject()).await;
//! }
//! ```

use std::sync::Once;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::{StreamExt, TestNats};

/// Deterministic names for test resources
///
/// Seeded from the test name so a failing test always touches the same
/// stream, subject and durable consumer.
pub struct TestNames {
    seed: u64,
}

impl TestNames {
    /// Create from an explicit seed
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestNames;
    ///
    /// let names = TestNames::from_test_name("test_redelivery");
    /// assert!(names.subject().starts_with("test."));
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream name (upper case, NATS stream naming)
    pub fn stream(&self) -> String {
        format!("TEST_STREAM_{}", self.seed)
    }

    /// Subject captured by [`stream`](Self::stream)
    pub fn subject(&self) -> String {
        format!("test.{}.in", self.seed)
    }

    /// Secondary subject, e.g. for replies
    pub fn reply_subject(&self) -> String {
        format!("test.{}.out", self.seed)
    }

    /// Durable consumer name
    pub fn consumer(&self) -> String {
        format!("TEST_CONSUMER_{}", self.seed)
    }
}

/// Polling helpers for asynchronous assertions
pub mod wait {
    use std::time::Duration;

    /// Poll `condition` every 10ms until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met. Works with a paused tokio clock.
    pub async fn until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Like [`until`] but panics with `context` on timeout.
    pub async fn assert_eventually<F>(timeout: Duration, condition: F, context: &str)
    where
        F: FnMut() -> bool,
    {
        assert!(
            until(timeout, condition).await,
            "{}: condition not met within {:?}",
            context,
            timeout
        );
    }
}

static TRACING: Once = Once::new();

/// Install a tracing subscriber writing through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_names_deterministic() {
        let names1 = TestNames::from_test_name("my_test");
        let names2 = TestNames::from_test_name("my_test");

        assert_eq!(names1.stream(), names2.stream());
        assert_eq!(names1.subject(), names2.subject());
    }

    #[test]
    fn test_names_different_tests() {
        let names1 = TestNames::from_test_name("test1");
        let names2 = TestNames::from_test_name("test2");

        // Different test names should touch different resources
        assert_ne!(names1.stream(), names2.stream());
        assert_ne!(names1.consumer(), names2.consumer());
        assert_ne!(names1.subject(), names1.reply_subject());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until() {
        let mut calls = 0;
        assert!(wait::until(Duration::from_secs(1), || {
            calls += 1;
            calls >= 3
        })
        .await);

        assert!(!wait::until(Duration::from_millis(50), || false).await);
    }
}

//! Shared wiring for integration tests: a factory over the in-memory broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mats::{FactoryConfig, MatsFactory, MatsSerializerJson};
use mats_test_broker::TestBroker;

/// How long to wait for processors to enter their loops.
pub const STARTUP: Duration = Duration::from_secs(5);

/// How long to wait for a flow to land.
pub const RECEIVE: Duration = Duration::from_secs(5);

/// Graceful stop budget.
pub const STOP: Duration = Duration::from_secs(5);

pub fn factory(broker: &TestBroker, app_name: &str) -> MatsFactory {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = FactoryConfig {
        name: format!("{app_name}-factory"),
        app_name: app_name.to_string(),
        app_version: "1.0.0".to_string(),
        nodename: "test-node".to_string(),
        concurrency: 2,
        ..FactoryConfig::default()
    };
    MatsFactory::create(
        Arc::new(broker.connection_factory()),
        Arc::new(MatsSerializerJson::new()),
        config,
    )
}

/// Polls `condition` until it holds or the timeout passes.
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

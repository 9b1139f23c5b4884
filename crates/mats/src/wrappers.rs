//! Wrapper composition.
//!
//! Cross-cutting concerns (metrics, logging, test interception) wrap the
//! factory through explicit delegation: a wrapper implements
//! [`FactoryWrapper`] and forwards to its wrappee. [`unwrap_fully`] walks
//! a wrapper chain down to the innermost [`MatsFactory`].

use crate::MatsFactory;

/// Explicit delegation seam around a [`MatsFactory`].
pub trait FactoryWrapper: Send + Sync {
    /// The component this wrapper delegates to: another wrapper, or the
    /// factory itself.
    fn wrappee(&self) -> &dyn FactoryWrapper;

    /// `Some` when this is the innermost factory, ending the unwrap walk.
    fn as_factory(&self) -> Option<&MatsFactory> {
        None
    }
}

impl FactoryWrapper for MatsFactory {
    fn wrappee(&self) -> &dyn FactoryWrapper {
        self
    }

    fn as_factory(&self) -> Option<&MatsFactory> {
        Some(self)
    }
}

/// Unwraps a wrapper chain to the innermost factory.
pub fn unwrap_fully(wrapper: &dyn FactoryWrapper) -> &MatsFactory {
    let mut current = wrapper;
    loop {
        if let Some(factory) = current.as_factory() {
            return factory;
        }
        current = current.wrappee();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FactoryConfig;
    use mats_serial::MatsSerializerJson;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mats_broker::{BrokerError, BrokerResult, Connection, ConnectionFactory};

    struct NoBroker;

    impl ConnectionFactory for NoBroker {
        fn connect(&self) -> BrokerResult<Box<dyn Connection>> {
            Err(BrokerError::ConnectionFailed("no broker in this test".to_string()))
        }
    }

    struct CountingWrapper {
        wrappee: Box<dyn FactoryWrapper>,
        touched: AtomicUsize,
    }

    impl FactoryWrapper for CountingWrapper {
        fn wrappee(&self) -> &dyn FactoryWrapper {
            self.touched.fetch_add(1, Ordering::SeqCst);
            self.wrappee.as_ref()
        }
    }

    #[test]
    fn unwrap_walks_nested_wrappers_to_the_factory() {
        let factory = MatsFactory::create(
            Arc::new(NoBroker),
            Arc::new(MatsSerializerJson::new()),
            FactoryConfig {
                name: "wrapped".to_string(),
                ..FactoryConfig::default()
            },
        );

        let inner_wrapper = CountingWrapper {
            wrappee: Box::new(factory.clone()),
            touched: AtomicUsize::new(0),
        };
        let outer_wrapper = CountingWrapper {
            wrappee: Box::new(inner_wrapper),
            touched: AtomicUsize::new(0),
        };

        let unwrapped = unwrap_fully(&outer_wrapper);
        assert_eq!(unwrapped.config().name, "wrapped");
        assert_eq!(outer_wrapper.touched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_bare_factory_unwraps_to_itself() {
        let factory = MatsFactory::create(
            Arc::new(NoBroker),
            Arc::new(MatsSerializerJson::new()),
            FactoryConfig::default(),
        );
        let unwrapped = unwrap_fully(&factory);
        assert_eq!(unwrapped.config().trace_key, "mats:trace");
    }
}

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::value::Value;

/// A job handler. The class name under which it is registered is the Ruby
/// class name used by the enqueuing side.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn perform(&self, queue: &str, args: &[Value]) -> Result<(), anyhow::Error>;
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(String, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    async fn perform(&self, queue: &str, args: &[Value]) -> Result<(), anyhow::Error> {
        (self.0)(queue.to_string(), args.to_vec()).await
    }
}

/// Class-name -> handler map. Lookups happen on every job while
/// registrations may arrive at any time, so reads share the lock and writes
/// take it exclusively.
#[derive(Clone, Default)]
pub struct Registry(Arc<RwLock<HashMap<String, Arc<dyn JobProcessor>>>>);

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&self, class: impl Into<String>, processor: impl JobProcessor + 'static) {
        self.0
            .write()
            .unwrap()
            .insert(class.into(), Arc::new(processor));
    }

    /// Register a plain async function or closure as the handler.
    pub fn register_fn<F, Fut>(&self, class: impl Into<String>, f: F)
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.register(class, FnProcessor(f));
    }

    pub(crate) fn get(&self, class: &str) -> Option<Arc<dyn JobProcessor>> {
        self.0.read().unwrap().get(class).cloned()
    }

    /// The registered class names, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.0.read().unwrap().keys().cloned().collect();
        classes.sort();
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_perform() {
        let registry = Registry::new();
        registry.register_fn("Echo", |queue: String, args: Vec<Value>| async move {
            assert_eq!(queue, "q");
            assert_eq!(args, vec![Value::Int(1)]);
            Ok(())
        });

        let processor = registry.get("Echo").expect("handler is registered");
        processor
            .perform("q", &[Value::Int(1)])
            .await
            .expect("performing");

        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn classes_lists_registrations() {
        let registry = Registry::new();
        registry.register_fn("B", |_queue, _args| async { Ok(()) });
        registry.register_fn("A", |_queue, _args| async { Ok(()) });
        assert_eq!(registry.classes(), vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_registration_and_lookup() {
        let registry = Registry::new();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register_fn(format!("Class{}", i), |_queue, _args| async { Ok(()) });
                registry.get("Class0");
            }));
        }
        for task in tasks {
            task.await.expect("registration task");
        }
        assert_eq!(registry.classes().len(), 8);
    }
}

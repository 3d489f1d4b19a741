//! Per-test registries and the status transitions that drive listener events.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::listener::TestListener;
use crate::message::TestOperationCode;
use crate::types::{Address, Test, TestStatus};

/// Reason reported when a FAILED update carries none.
pub const DEFAULT_FAILURE_REASON: &str = "test failed";

/// One submitted test, bound to the listener and the service it went to.
pub struct TestRegistry {
    /// Latest snapshot of the test.
    pub test: Test,
    /// Callbacks for this test.
    pub listener: Arc<dyn TestListener>,
    /// Scheduling service handling the test.
    pub service: Address,
    started: bool,
}

impl TestRegistry {
    /// Creates a registry for a freshly submitted test.
    pub fn new(test: Test, listener: Arc<dyn TestListener>, service: Address) -> Self {
        Self {
            test,
            listener,
            service,
            started: false,
        }
    }

    /// Test identifier.
    pub fn id(&self) -> &str {
        self.test.id()
    }

    /// True once `test_started` has been delivered.
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Applies an incoming test operation and reports what the listener
    /// should hear about it.
    pub fn apply(&mut self, code: TestOperationCode, snapshot: Test) -> Transition {
        match snapshot.status {
            TestStatus::Started => {
                let first = !self.started;
                self.started = true;
                self.test = snapshot;
                if first {
                    Transition::Started
                } else {
                    Transition::Updated
                }
            }
            TestStatus::Finished | TestStatus::Stopped => {
                self.test = snapshot;
                Transition::Finished
            }
            TestStatus::Failed => {
                let reason = snapshot
                    .reason
                    .clone()
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());
                self.test = snapshot;
                Transition::Failed(reason)
            }
            TestStatus::Pending | TestStatus::Unknown => {
                if code == TestOperationCode::Update {
                    self.test = snapshot;
                    Transition::Updated
                } else {
                    Transition::Ignored
                }
            }
        }
    }
}

impl std::fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRegistry")
            .field("test", &self.test.id())
            .field("status", &self.test.status)
            .field("service", &self.service)
            .field("started", &self.started)
            .finish()
    }
}

/// Effect of an incoming test operation on a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// First STARTED status.
    Started,
    /// FINISHED or STOPPED; the registry must be removed.
    Finished,
    /// FAILED with a reason; the registry must be removed.
    Failed(String),
    /// Snapshot replaced without a listener event.
    Updated,
    /// Nothing changed.
    Ignored,
}

impl Transition {
    /// True when the registry leaves the client.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Transition::Finished | Transition::Failed(_))
    }
}

/// All live registries of a client, keyed by test id.
#[derive(Debug, Default)]
pub struct RegistryTable {
    entries: HashMap<String, TestRegistry>,
}

impl RegistryTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registry; ids are unique.
    pub fn insert(&mut self, registry: TestRegistry) -> Result<()> {
        let id = registry.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(TransportError::DuplicateTest(id));
        }
        self.entries.insert(id, registry);
        Ok(())
    }

    /// True when `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Looks up a registry.
    pub fn get(&self, id: &str) -> Option<&TestRegistry> {
        self.entries.get(id)
    }

    /// Looks up a registry for update.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut TestRegistry> {
        self.entries.get_mut(id)
    }

    /// Removes and returns a registry.
    pub fn remove(&mut self, id: &str) -> Option<TestRegistry> {
        self.entries.remove(id)
    }

    /// Removes every registry bound to `service`.
    pub fn drain_service(&mut self, service: &Address) -> Vec<TestRegistry> {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|r| &r.service == service)
            .map(|r| r.id().to_string())
            .collect();
        ids.iter().filter_map(|id| self.entries.remove(id)).collect()
    }

    /// Sorted ids of the tests bound to `service`.
    pub fn bound_to(&self, service: &Address) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .values()
            .filter(|r| &r.service == service)
            .map(|r| r.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Sorted ids of all tests.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live registries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no test is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl TestListener for Silent {
        async fn test_started(&self, _test: &Test) {}
        async fn test_finished(&self, _test: &Test) {}
        async fn test_failed(&self, _test: &Test, _reason: &str) {}
        async fn message(&self, _test: &Test, _text: &str) {}
    }

    fn registry(id: &str, service: &Address) -> TestRegistry {
        TestRegistry::new(Test::new(id).unwrap(), Arc::new(Silent), service.clone())
    }

    fn snapshot(id: &str, status: TestStatus) -> Test {
        let mut test = Test::new(id).unwrap();
        test.status = status;
        test
    }

    #[test]
    fn test_started_fires_once() {
        let svc = Address::new("svc", 9000);
        let mut reg = registry("T1", &svc);
        assert_eq!(
            reg.apply(TestOperationCode::Update, snapshot("T1", TestStatus::Started)),
            Transition::Started
        );
        assert_eq!(
            reg.apply(TestOperationCode::Update, snapshot("T1", TestStatus::Started)),
            Transition::Updated
        );
        assert!(reg.has_started());
    }

    #[test]
    fn test_terminal_transitions() {
        let svc = Address::new("svc", 9000);
        let mut reg = registry("T1", &svc);
        let t = reg.apply(TestOperationCode::Stop, snapshot("T1", TestStatus::Stopped));
        assert_eq!(t, Transition::Finished);
        assert!(t.is_terminal());

        let mut failed = snapshot("T1", TestStatus::Failed);
        assert_eq!(
            reg.apply(TestOperationCode::Update, failed.clone()),
            Transition::Failed(DEFAULT_FAILURE_REASON.to_string())
        );
        failed.reason = Some("no products".to_string());
        assert_eq!(
            reg.apply(TestOperationCode::Update, failed),
            Transition::Failed("no products".to_string())
        );
    }

    #[test]
    fn test_update_replaces_snapshot() {
        let svc = Address::new("svc", 9000);
        let mut reg = registry("T1", &svc);
        let mut pending = snapshot("T1", TestStatus::Pending);
        pending.script = Some("run.sh".to_string());
        assert_eq!(
            reg.apply(TestOperationCode::Update, pending),
            Transition::Updated
        );
        assert_eq!(reg.test.script.as_deref(), Some("run.sh"));
        assert_eq!(
            reg.apply(TestOperationCode::Check, snapshot("T1", TestStatus::Pending)),
            Transition::Ignored
        );
    }

    #[test]
    fn test_table_ids_unique() {
        let svc = Address::new("svc", 9000);
        let mut table = RegistryTable::new();
        table.insert(registry("T1", &svc)).unwrap();
        let err = table.insert(registry("T1", &svc)).unwrap_err();
        assert!(matches!(err, TransportError::DuplicateTest(id) if id == "T1"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_service() {
        let a = Address::new("svc-a", 9000);
        let b = Address::new("svc-b", 9000);
        let mut table = RegistryTable::new();
        table.insert(registry("T1", &a)).unwrap();
        table.insert(registry("T2", &b)).unwrap();
        table.insert(registry("T3", &a)).unwrap();
        assert_eq!(table.bound_to(&a), vec!["T1", "T3"]);

        let drained = table.drain_service(&a);
        assert_eq!(drained.len(), 2);
        assert_eq!(table.ids(), vec!["T2"]);
        assert!(table.bound_to(&a).is_empty());
    }
}

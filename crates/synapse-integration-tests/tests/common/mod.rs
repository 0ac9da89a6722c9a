//! Shared harness for integration tests.

use std::sync::Arc;

use synapse_core::{AgentId, ScopeKind};
use synapse_events::{EventBus, EventHandler};
use synapse_test::RecordingHandler;

/// A bus plus a recorder per registered agent.
#[allow(dead_code)]
pub struct BusHarness {
    /// The bus under test.
    pub bus: EventBus,
    agents: Vec<(AgentId, Arc<RecordingHandler>)>,
}

#[allow(dead_code)]
impl BusHarness {
    /// Harness over `bus`.
    pub fn new(bus: EventBus) -> Self {
        synapse_test::init_test_tracing();
        Self {
            bus,
            agents: Vec::new(),
        }
    }

    /// Register an agent whose recorder subscribes to `patterns` in the
    /// agent's private scope.
    pub fn agent(&mut self, name: &str, patterns: &[&str]) -> (AgentId, Arc<RecordingHandler>) {
        let recorder = RecordingHandler::new(name);
        let agent = self.bus.register_agent(name);
        for pattern in patterns {
            self.bus
                .register_handler(agent, pattern, ScopeKind::Agent, None, recorder.clone())
                .unwrap();
        }
        self.agents.push((agent, Arc::clone(&recorder)));
        (agent, recorder)
    }

    /// Attach another handler to an existing agent.
    pub fn attach(
        &self,
        agent: AgentId,
        pattern: &str,
        kind: ScopeKind,
        key: Option<&str>,
        handler: Arc<dyn EventHandler>,
    ) {
        self.bus
            .register_handler(agent, pattern, kind, key.map(str::to_owned), handler)
            .unwrap();
    }

    /// Sum of deliveries across every recorder.
    pub fn total_received(&self) -> usize {
        self.agents.iter().map(|(_, r)| r.count()).sum()
    }
}

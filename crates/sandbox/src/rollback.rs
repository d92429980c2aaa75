//! §4.5 "Every step past storage acquisition registers a compensating
//! action executed in reverse order if a later step fails."
use agent::Agent;
use hypervisor::Hypervisor;
use persist::PersistStore;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackAction {
    DestroyPersistDir,
    StopVm,
    DisconnectAgent,
}

#[derive(Default)]
pub struct RollbackStack(Vec<RollbackAction>);

impl RollbackStack {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, action: RollbackAction) {
        self.0.push(action);
    }

    /// Runs every registered action in reverse order. Individual failures
    /// are logged, not propagated, so that persistence destroy (always the
    /// first action pushed, hence the last one run) still executes.
    pub async fn unwind(
        self,
        sandbox_id: &str,
        hypervisor: &Arc<dyn Hypervisor>,
        agent: &Arc<dyn Agent>,
        store: &PersistStore,
    ) {
        for action in self.0.into_iter().rev() {
            let result = match action {
                RollbackAction::StopVm => hypervisor.stop_vm(false).await.map_err(|e| e.to_string()),
                RollbackAction::DisconnectAgent => {
                    agent.disconnect().await.map_err(|e| e.to_string())
                }
                RollbackAction::DestroyPersistDir => {
                    store.destroy(sandbox_id).await.map_err(|e| e.to_string())
                }
            };
            if let Err(err) = result {
                tracing::warn!(sandbox_id, ?action, %err, "rollback step failed, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unwind_runs_in_reverse_and_tolerates_failures() {
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(hypervisor::mock::MockHypervisor::new());
        let agent: Arc<dyn Agent> = Arc::new(agent::mock::MockAgent::new());
        let dir = tempfile::tempdir().unwrap();
        let store = PersistStore::new(dir.path());

        let mut stack = RollbackStack::new();
        stack.push(RollbackAction::DestroyPersistDir);
        stack.push(RollbackAction::StopVm);
        stack.push(RollbackAction::DisconnectAgent);
        stack.unwind("sb1", &hypervisor, &agent, &store).await;
    }
}

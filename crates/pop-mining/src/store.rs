//! Persistence of mining operations.

use crate::{MiningOperation, MiningResult, OperationId};
use pop_storage::{ColumnFamily, Storage};
use std::sync::Arc;
use tracing::trace;

/// Durable record of operations, keyed by id.
pub trait OperationRepository: Send + Sync {
    /// Write the operation; returns once the write is durable.
    fn save(&self, operation: &MiningOperation) -> MiningResult<()>;

    fn load(&self, id: &OperationId) -> MiningResult<Option<MiningOperation>>;

    /// All operations, oldest first.
    fn list_all(&self) -> MiningResult<Vec<MiningOperation>>;

    /// Operations that have not reached a terminal state.
    fn list_active(&self) -> MiningResult<Vec<MiningOperation>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|op| !op.is_terminal())
            .collect())
    }
}

/// JSON records in the operations column family.
pub struct OperationStore {
    storage: Arc<dyn Storage>,
}

impl OperationStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl OperationRepository for OperationStore {
    fn save(&self, operation: &MiningOperation) -> MiningResult<()> {
        let bytes = serde_json::to_vec(operation)?;
        self.storage
            .put(ColumnFamily::Operations, operation.id.as_str().as_bytes(), &bytes)?;
        trace!(id = %operation.id, state = %operation.state, "Saved operation");
        Ok(())
    }

    fn load(&self, id: &OperationId) -> MiningResult<Option<MiningOperation>> {
        match self.storage.get(ColumnFamily::Operations, id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_all(&self) -> MiningResult<Vec<MiningOperation>> {
        let mut operations = self
            .storage
            .iter(ColumnFamily::Operations)?
            .map(|(_, value)| serde_json::from_slice::<MiningOperation>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OperationState;
    use pop_storage::{Database, MemoryStorage};
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let store = OperationStore::new(Arc::new(MemoryStorage::new()));
        let op = MiningOperation::new("test-chain", Some(10));

        store.save(&op).unwrap();
        assert_eq!(store.load(&op.id).unwrap(), Some(op));
        assert!(store.load(&OperationId::from("deadbeef")).unwrap().is_none());
    }

    #[test]
    fn test_list_active_skips_terminal() {
        let store = OperationStore::new(Arc::new(MemoryStorage::new()));
        let active = MiningOperation::new("test-chain", Some(1));
        let mut failed = MiningOperation::new("test-chain", Some(2));
        failed.fail("no funds");

        store.save(&active).unwrap();
        store.save(&failed).unwrap();

        assert_eq!(store.list_all().unwrap().len(), 2);
        let listed = store.list_active().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut op = MiningOperation::new("test-chain", Some(40));
        op.advance(OperationState::InstructionReceived, 2);

        {
            let db = Database::open(dir.path()).unwrap();
            OperationStore::new(Arc::new(db)).save(&op).unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        let loaded = OperationStore::new(Arc::new(db)).load(&op.id).unwrap().unwrap();
        assert_eq!(loaded.state, OperationState::InstructionReceived);
        assert_eq!(loaded.stage_attempts[&OperationState::InstructionReceived], 2);
    }
}

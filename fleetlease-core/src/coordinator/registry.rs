use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::connection::WorkerConnection;
use crate::types::{ConnectionId, WorkerId};

/// Process-local map of live connections and the worker ids bound to them.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    connections: Arc<DashMap<ConnectionId, Arc<WorkerConnection>>>,
    by_worker: Arc<DashMap<WorkerId, ConnectionId>>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("connection_count", &self.connections.len())
            .field("registered_count", &self.by_worker.len())
            .finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<WorkerConnection>) {
        self.connections.insert(connection.id, connection);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<WorkerConnection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<WorkerConnection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    /// Binds `worker` to `connection`. Returns the previously bound
    /// connection when it is a different one.
    pub fn bind(&self, worker: WorkerId, connection: ConnectionId) -> Option<ConnectionId> {
        self.by_worker
            .insert(worker, connection)
            .filter(|previous| *previous != connection)
    }

    /// Drops the binding only if it still points at `connection`.
    pub fn unbind(&self, worker: &WorkerId, connection: ConnectionId) {
        self.by_worker.remove_if(worker, |_, bound| *bound == connection);
    }

    pub fn lookup(&self, worker: &WorkerId) -> Option<Arc<WorkerConnection>> {
        let id = *self.by_worker.get(worker)?;
        self.get(id)
    }

    pub fn all(&self) -> Vec<Arc<WorkerConnection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

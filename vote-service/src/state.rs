//! Shared application state

use crate::coordinator::VoteCoordinator;
use crate::database::Database;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: VoteCoordinator,
    pub db: Database,
}

impl AppState {
    pub fn new(db: Database, coordinator: VoteCoordinator) -> Self {
        Self { coordinator, db }
    }
}

use crate::error::AppError;
use crate::model::GateState;
use crate::store::{Collections, DocumentStore, Query, fetch};
use chrono::Utc;
use std::sync::Arc;

const GATE_ID: &str = "gate";

/// The estate's smart gate, a single shared device document.
pub struct Gate {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
}

impl Gate {
    pub fn new(store: Arc<dyn DocumentStore>, collections: Collections) -> Self {
        Gate { store, collections }
    }

    pub fn query(&self) -> Query {
        Query::new(self.collections.devices()).filter("device", GATE_ID)
    }

    pub async fn state(&self) -> Result<GateState, AppError> {
        Ok(fetch::<GateState>(self.store.as_ref(), &self.collections.devices(), GATE_ID)
            .await?
            .map(|stored| stored.doc)
            .unwrap_or_default())
    }

    pub async fn set(&self, is_open: bool, by: &str) -> Result<GateState, AppError> {
        let state = GateState {
            is_open,
            updated_at: Some(Utc::now()),
            updated_by: Some(by.to_string()),
        };
        let mut doc = serde_json::to_value(&state).map_err(crate::error::StoreError::from)?;
        doc["device"] = GATE_ID.into();
        self.store.set(&self.collections.devices(), GATE_ID, doc).await?;

        tracing::info!(is_open, by, "gate updated");
        Ok(state)
    }

    /// Last write wins; two residents toggling at once may cancel out.
    pub async fn toggle(&self, by: &str) -> Result<GateState, AppError> {
        let current = self.state().await?;
        self.set(!current.is_open, by).await
    }
}

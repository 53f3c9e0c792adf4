use crate::compress::Compressor;
use crate::error::AppError;
use crate::model::{Bill, BillStatus};
use crate::store::{Collections, Direction, DocumentStore, Query, Stored, fetch, fetch_all};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct BillSummary {
    /// The bill the dashboard should call out, if any.
    pub highlight: Option<Stored<Bill>>,
    pub outstanding_amount: i64,
    pub outstanding_count: usize,
    pub all_settled: bool,
}

/// Rejected bills first, then unpaid, then those awaiting verification; the
/// earliest period wins within a status.
pub fn pick_highlight(bills: &[Stored<Bill>]) -> Option<&Stored<Bill>> {
    bills
        .iter()
        .filter_map(|bill| bill.doc.status.priority().map(|p| (p, bill)))
        .min_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.doc.period.cmp(&b.doc.period)))
        .map(|(_, bill)| bill)
}

pub fn summarize(bills: &[Stored<Bill>]) -> BillSummary {
    let outstanding: Vec<_> = bills
        .iter()
        .filter(|b| b.doc.status.accepts_payment())
        .collect();
    let highlight = pick_highlight(bills).cloned();

    BillSummary {
        all_settled: highlight.is_none(),
        highlight,
        outstanding_amount: outstanding.iter().map(|b| b.doc.amount).sum(),
        outstanding_count: outstanding.len(),
    }
}

pub struct Billing {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    compressor: Arc<Compressor>,
}

impl Billing {
    pub fn new(store: Arc<dyn DocumentStore>, collections: Collections, compressor: Arc<Compressor>) -> Self {
        Billing {
            store,
            collections,
            compressor,
        }
    }

    pub fn query_for(&self, resident_id: &str) -> Query {
        Query::new(self.collections.billing())
            .filter("resident_id", resident_id)
            .order_by("period", Direction::Desc)
    }

    pub async fn list(&self, resident_id: &str) -> Result<Vec<Stored<Bill>>, AppError> {
        Ok(fetch_all(self.store.as_ref(), &self.query_for(resident_id)).await?)
    }

    pub async fn summary(&self, resident_id: &str) -> Result<BillSummary, AppError> {
        Ok(summarize(&self.list(resident_id).await?))
    }

    pub async fn submit_payment(
        &self,
        resident_id: &str,
        bill_id: &str,
        proof: Vec<u8>,
        method: &str,
    ) -> Result<Stored<Bill>, AppError> {
        let method = method.trim();
        if method.is_empty() {
            return Err(AppError::Validation("Metode pembayaran wajib dipilih.".to_string()));
        }

        let bill = self.get_owned(resident_id, bill_id).await?;
        if !bill.doc.status.accepts_payment() {
            return Err(AppError::InvalidState(
                "Tagihan ini sudah dibayar atau sedang diverifikasi.".to_string(),
            ));
        }

        let compressed = self.compressor.compress(proof).await?;
        self.store
            .merge(
                &self.collections.billing(),
                bill_id,
                json!({
                    "status": BillStatus::PendingVerification,
                    "payment_proof": compressed.data_uri,
                    "payment_method": method,
                    "submitted_at": Utc::now(),
                    "rejection_reason": null,
                }),
            )
            .await?;

        tracing::info!(bill_id, resident_id, "payment proof submitted");
        self.get_owned(resident_id, bill_id).await
    }

    async fn get_owned(&self, resident_id: &str, bill_id: &str) -> Result<Stored<Bill>, AppError> {
        let bill = fetch::<Bill>(self.store.as_ref(), &self.collections.billing(), bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Tagihan".to_string()))?;
        if bill.doc.resident_id != resident_id {
            return Err(AppError::Forbidden);
        }
        Ok(bill)
    }
}

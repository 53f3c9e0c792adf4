use crate::compress::Compressor;
use crate::error::AppError;
use crate::model::{ImageBundle, Report, ReportCategory, ReportStatus};
use crate::store::{Collections, Direction, DocumentStore, Query, Stored, fetch, fetch_all, insert};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub const MAX_REPORT_IMAGES: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct NewReport {
    pub category: ReportCategory,
    pub description: String,
}

pub struct Reports {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    compressor: Arc<Compressor>,
}

impl Reports {
    pub fn new(store: Arc<dyn DocumentStore>, collections: Collections, compressor: Arc<Compressor>) -> Self {
        Reports {
            store,
            collections,
            compressor,
        }
    }

    pub fn query_for(&self, resident_id: &str) -> Query {
        Query::new(self.collections.reports())
            .filter("resident_id", resident_id)
            .order_by("created_at", Direction::Desc)
    }

    pub async fn list(&self, resident_id: &str) -> Result<Vec<Stored<Report>>, AppError> {
        Ok(fetch_all(self.store.as_ref(), &self.query_for(resident_id)).await?)
    }

    pub async fn create(
        &self,
        resident_id: &str,
        input: NewReport,
        images: Vec<Vec<u8>>,
    ) -> Result<Stored<Report>, AppError> {
        let description = input.description.trim();
        if description.is_empty() {
            return Err(AppError::Validation("Deskripsi laporan wajib diisi.".to_string()));
        }
        if images.len() > MAX_REPORT_IMAGES {
            return Err(AppError::Validation(format!(
                "Maksimal {} foto per laporan.",
                MAX_REPORT_IMAGES
            )));
        }

        let mut compressed = Vec::with_capacity(images.len());
        for image in images {
            compressed.push(self.compressor.compress(image).await?.data_uri);
        }

        let now = Utc::now();
        let image_count = compressed.len();
        let image_bundle_id = if compressed.is_empty() {
            None
        } else {
            let bundle = ImageBundle {
                resident_id: resident_id.to_string(),
                images: compressed,
                created_at: now,
            };
            Some(insert(self.store.as_ref(), &self.collections.report_images(), &bundle).await?)
        };

        let report = Report {
            resident_id: resident_id.to_string(),
            category: input.category,
            description: description.to_string(),
            status: ReportStatus::Open,
            image_bundle_id,
            image_count,
            resolution_note: None,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
        };
        let id = insert(self.store.as_ref(), &self.collections.reports(), &report).await?;

        tracing::info!(report_id = %id, resident_id, image_count, "report filed");
        Ok(Stored { id, doc: report })
    }

    pub async fn images(&self, resident_id: &str, report_id: &str) -> Result<Vec<String>, AppError> {
        let report = fetch::<Report>(self.store.as_ref(), &self.collections.reports(), report_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Laporan".to_string()))?;
        if report.doc.resident_id != resident_id {
            return Err(AppError::Forbidden);
        }

        let Some(bundle_id) = report.doc.image_bundle_id else {
            return Ok(Vec::new());
        };
        let bundle = fetch::<ImageBundle>(self.store.as_ref(), &self.collections.report_images(), &bundle_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Foto laporan".to_string()))?;
        Ok(bundle.doc.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::store::LocalStore;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png() -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(1200, 900))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    async fn reports() -> Reports {
        let store = Arc::new(LocalStore::in_memory().await.unwrap());
        Reports::new(
            store,
            Collections::new("test-app"),
            Arc::new(Compressor::new(Compression::default())),
        )
    }

    fn lamp() -> NewReport {
        NewReport {
            category: ReportCategory::Infrastructure,
            description: "Lampu jalan blok C mati".into(),
        }
    }

    #[tokio::test]
    async fn test_report_with_images_stores_bundle() {
        let reports = reports().await;
        let created = reports.create("r1", lamp(), vec![png(), png()]).await.unwrap();

        assert_eq!(created.doc.status, ReportStatus::Open);
        assert_eq!(created.doc.image_count, 2);
        assert!(created.doc.image_bundle_id.is_some());

        let images = reports.images("r1", &created.id).await.unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|i| i.starts_with("data:image/jpeg;base64,")));

        assert!(matches!(
            reports.images("r2", &created.id).await,
            Err(AppError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_report_without_images() {
        let reports = reports().await;
        let created = reports.create("r1", lamp(), vec![]).await.unwrap();

        assert!(created.doc.image_bundle_id.is_none());
        assert!(reports.images("r1", &created.id).await.unwrap().is_empty());
        assert_eq!(reports.list("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_report_validation() {
        let reports = reports().await;
        let blank = NewReport {
            category: ReportCategory::Other,
            description: "   ".into(),
        };
        assert!(matches!(
            reports.create("r1", blank, vec![]).await,
            Err(AppError::Validation(_))
        ));

        let too_many = vec![png(), png(), png(), png()];
        assert!(matches!(
            reports.create("r1", lamp(), too_many).await,
            Err(AppError::Validation(_))
        ));
    }
}

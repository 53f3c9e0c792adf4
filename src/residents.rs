use crate::compress::Compressor;
use crate::error::AppError;
use crate::model::{FamilyMember, MaritalStatus, Resident};
use crate::store::{Collections, DocumentStore, Query, Stored, fetch, fetch_all};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub phone: Option<String>,
    pub job: Option<String>,
    pub marital_status: Option<MaritalStatus>,
    pub family: Option<Vec<FamilyMember>>,
}

/// Digital resident ID card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdCard {
    pub card_number: String,
    pub name: String,
    pub nik: String,
    pub unit: String,
    pub rt_rw: String,
    pub status: &'static str,
    pub household_size: usize,
    pub photo: Option<String>,
}

fn mask_nik(nik: &str) -> String {
    let len = nik.chars().count();
    if len <= 4 {
        return nik.to_string();
    }
    let visible: String = nik.chars().skip(len - 4).collect();
    format!("{}{}", "*".repeat(len - 4), visible)
}

pub fn id_card(resident: &Stored<Resident>) -> IdCard {
    let doc = &resident.doc;
    let short_id: String = resident.id.chars().take(6).collect::<String>().to_uppercase();
    IdCard {
        card_number: format!("BA-{}{}-{}", doc.rw, doc.rt, short_id),
        name: doc.name.clone(),
        nik: mask_nik(&doc.nik),
        unit: doc.unit.clone(),
        rt_rw: format!("RT {} / RW {}", doc.rt, doc.rw),
        status: if doc.is_activated() { "Warga Terverifikasi" } else { "Belum Aktivasi" },
        household_size: doc.family.len() + 1,
        photo: doc.photo.clone(),
    }
}

pub struct Residents {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    compressor: Arc<Compressor>,
}

impl Residents {
    pub fn new(store: Arc<dyn DocumentStore>, collections: Collections, compressor: Arc<Compressor>) -> Self {
        Residents {
            store,
            collections,
            compressor,
        }
    }

    pub async fn get(&self, resident_id: &str) -> Result<Stored<Resident>, AppError> {
        fetch::<Resident>(self.store.as_ref(), &self.collections.residents(), resident_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Data warga".to_string()))
    }

    pub async fn update_profile(&self, resident_id: &str, update: ProfileUpdate) -> Result<Stored<Resident>, AppError> {
        let mut patch = Map::new();
        if let Some(phone) = update.phone {
            let phone = crate::login::normalize_phone(&phone);
            if phone.len() < 9 {
                return Err(AppError::Validation("Nomor HP tidak valid.".to_string()));
            }
            // the phone number is the login lookup key
            let query = Query::new(self.collections.residents()).filter("phone", phone.as_str());
            let holders = fetch_all::<Resident>(self.store.as_ref(), &query).await?;
            if holders.iter().any(|r| r.id != resident_id) {
                return Err(AppError::Validation("Nomor HP sudah terdaftar.".to_string()));
            }
            patch.insert("phone".into(), json!(phone));
        }
        if let Some(job) = update.job {
            patch.insert("job".into(), json!(job.trim()));
        }
        if let Some(status) = update.marital_status {
            patch.insert("marital_status".into(), json!(status));
        }
        if let Some(family) = update.family {
            if family.iter().any(|m| m.name.trim().is_empty() || m.relation.trim().is_empty()) {
                return Err(AppError::Validation(
                    "Nama dan hubungan anggota keluarga wajib diisi.".to_string(),
                ));
            }
            patch.insert("family".into(), json!(family));
        }

        if !patch.is_empty() {
            patch.insert("synced_at".into(), json!(Utc::now()));
            self.store
                .merge(&self.collections.residents(), resident_id, Value::Object(patch))
                .await?;
        }
        self.get(resident_id).await
    }

    pub async fn update_photo(&self, resident_id: &str, image: Vec<u8>) -> Result<Stored<Resident>, AppError> {
        let compressed = self.compressor.compress(image).await?;
        self.store
            .merge(
                &self.collections.residents(),
                resident_id,
                json!({ "photo": compressed.data_uri, "synced_at": Utc::now() }),
            )
            .await?;
        self.get(resident_id).await
    }
}

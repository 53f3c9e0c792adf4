//! Permit requests.
//!
//! Each permit type carries its own typed fields and knows how to describe
//! itself; adding a type means adding one [`PermitDetails`] variant.

use crate::error::AppError;
use crate::store::{Collections, Direction, DocumentStore, Query, Stored, fetch_all, insert};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermitStatus {
    Pending,
    WaitingRwApproval,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermitDetails {
    GuestStay {
        guest_name: String,
        guest_count: u32,
        origin: String,
        nights: u32,
    },
    ExtraParking {
        plate_number: String,
        vehicle: String,
        days: u32,
    },
    Renovation {
        work: String,
        contractor: String,
        workers: u32,
        end_date: NaiveDate,
    },
    Event {
        event_name: String,
        guest_count: u32,
        closes_road: bool,
    },
    FacilityUse {
        facility: String,
        start_time: NaiveTime,
        end_time: NaiveTime,
        purpose: String,
    },
}

fn required(value: &str, label: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        Err(AppError::Validation(format!("{} wajib diisi.", label)))
    } else {
        Ok(())
    }
}

fn positive(value: u32, label: &str) -> Result<(), AppError> {
    if value == 0 {
        Err(AppError::Validation(format!("{} minimal 1.", label)))
    } else {
        Ok(())
    }
}

impl PermitDetails {
    pub fn label(&self) -> &'static str {
        match self {
            PermitDetails::GuestStay { .. } => "Izin Tamu Menginap",
            PermitDetails::ExtraParking { .. } => "Izin Parkir Tambahan",
            PermitDetails::Renovation { .. } => "Izin Renovasi",
            PermitDetails::Event { .. } => "Izin Keramaian",
            PermitDetails::FacilityUse { .. } => "Izin Penggunaan Fasilitas",
        }
    }

    pub fn validate(&self, date: NaiveDate) -> Result<(), AppError> {
        match self {
            PermitDetails::GuestStay {
                guest_name,
                guest_count,
                origin,
                nights,
            } => {
                required(guest_name, "Nama tamu")?;
                required(origin, "Asal tamu")?;
                positive(*guest_count, "Jumlah tamu")?;
                positive(*nights, "Lama menginap")
            }
            PermitDetails::ExtraParking {
                plate_number,
                vehicle,
                days,
            } => {
                required(plate_number, "Nomor polisi")?;
                required(vehicle, "Jenis kendaraan")?;
                positive(*days, "Lama parkir")
            }
            PermitDetails::Renovation {
                work,
                contractor,
                workers,
                end_date,
            } => {
                required(work, "Jenis pekerjaan")?;
                required(contractor, "Pelaksana")?;
                positive(*workers, "Jumlah pekerja")?;
                if *end_date < date {
                    return Err(AppError::Validation(
                        "Tanggal selesai tidak boleh sebelum tanggal mulai.".to_string(),
                    ));
                }
                Ok(())
            }
            PermitDetails::Event {
                event_name,
                guest_count,
                ..
            } => {
                required(event_name, "Nama acara")?;
                positive(*guest_count, "Perkiraan tamu")
            }
            PermitDetails::FacilityUse {
                facility,
                start_time,
                end_time,
                purpose,
            } => {
                required(facility, "Fasilitas")?;
                required(purpose, "Keperluan")?;
                if end_time <= start_time {
                    return Err(AppError::Validation(
                        "Jam selesai harus setelah jam mulai.".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PermitDetails::GuestStay {
                guest_name,
                guest_count,
                origin,
                nights,
            } => format!(
                "Tamu menginap: {} ({} orang) dari {}, selama {} malam",
                guest_name.trim(),
                guest_count,
                origin.trim(),
                nights
            ),
            PermitDetails::ExtraParking {
                plate_number,
                vehicle,
                days,
            } => format!(
                "Parkir tambahan: {} ({}) selama {} hari",
                vehicle.trim(),
                plate_number.trim().to_uppercase(),
                days
            ),
            PermitDetails::Renovation {
                work,
                contractor,
                workers,
                end_date,
            } => format!(
                "Renovasi: {} oleh {} ({} pekerja), selesai {}",
                work.trim(),
                contractor.trim(),
                workers,
                end_date.format("%d-%m-%Y")
            ),
            PermitDetails::Event {
                event_name,
                guest_count,
                closes_road,
            } => format!(
                "Acara: {} (~{} tamu){}",
                event_name.trim(),
                guest_count,
                if *closes_road { ", menutup jalan" } else { "" }
            ),
            PermitDetails::FacilityUse {
                facility,
                start_time,
                end_time,
                purpose,
            } => format!(
                "Penggunaan {} pukul {}-{} untuk {}",
                facility.trim(),
                start_time.format("%H:%M"),
                end_time.format("%H:%M"),
                purpose.trim()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permit {
    pub resident_id: String,
    #[serde(flatten)]
    pub details: PermitDetails,
    pub date: NaiveDate,
    pub description: String,
    pub status: PermitStatus,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPermit {
    #[serde(flatten)]
    pub details: PermitDetails,
    pub date: NaiveDate,
}

pub struct Permits {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
}

impl Permits {
    pub fn new(store: Arc<dyn DocumentStore>, collections: Collections) -> Self {
        Permits { store, collections }
    }

    pub fn query_for(&self, resident_id: &str) -> Query {
        Query::new(self.collections.permits())
            .filter("resident_id", resident_id)
            .order_by("created_at", Direction::Desc)
    }

    pub async fn list(&self, resident_id: &str) -> Result<Vec<Stored<Permit>>, AppError> {
        Ok(fetch_all(self.store.as_ref(), &self.query_for(resident_id)).await?)
    }

    pub async fn create(&self, resident_id: &str, input: NewPermit) -> Result<Stored<Permit>, AppError> {
        input.details.validate(input.date)?;

        let permit = Permit {
            resident_id: resident_id.to_string(),
            description: input.details.describe(),
            details: input.details,
            date: input.date,
            status: PermitStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
        };
        let id = insert(self.store.as_ref(), &self.collections.permits(), &permit).await?;

        tracing::info!(permit_id = %id, resident_id, kind = permit.details.label(), "permit requested");
        Ok(Stored { id, doc: permit })
    }
}

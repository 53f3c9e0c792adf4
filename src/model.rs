use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    Warga,
    KetuaRt,
    KetuaRw,
    Pengurus,
    Admin,
}

impl Role {
    /// Board members may publish news and events.
    pub fn is_board(&self) -> bool {
        !matches!(self, Role::Warga)
    }

    pub fn badge(&self) -> &'static str {
        match self {
            Role::Warga => "Warga",
            Role::KetuaRt => "Ketua RT",
            Role::KetuaRw => "Ketua RW",
            Role::Pengurus => "Pengurus",
            Role::Admin => "Admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaritalStatus {
    #[default]
    Single,
    Married,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub name: String,
    pub relation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resident {
    pub name: String,
    #[serde(default)]
    pub nik: String,
    pub unit: String,
    pub rt: String,
    pub rw: String,
    pub phone: String,
    /// Linked account id, empty until activation.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub family: Vec<FamilyMember>,
    #[serde(default)]
    pub marital_status: MaritalStatus,
    #[serde(default)]
    pub job: String,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Resident {
    pub fn is_activated(&self) -> bool {
        !self.uid.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Unpaid,
    PendingVerification,
    Paid,
    Rejected,
}

impl BillStatus {
    /// Dashboard priority, lower first. Paid bills are never highlighted.
    pub fn priority(&self) -> Option<u8> {
        match self {
            BillStatus::Rejected => Some(0),
            BillStatus::Unpaid => Some(1),
            BillStatus::PendingVerification => Some(2),
            BillStatus::Paid => None,
        }
    }

    pub fn accepts_payment(&self) -> bool {
        matches!(self, BillStatus::Unpaid | BillStatus::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub resident_id: String,
    /// `YYYY-MM`
    pub period: String,
    pub amount: i64,
    pub status: BillStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payment_proof: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Open,
    InProgress,
    Done,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportCategory {
    Security,
    Cleanliness,
    Infrastructure,
    Facility,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub resident_id: String,
    pub category: ReportCategory,
    pub description: String,
    pub status: ReportStatus,
    #[serde(default)]
    pub image_bundle_id: Option<String>,
    #[serde(default)]
    pub image_count: usize,
    #[serde(default)]
    pub resolution_note: Option<String>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Compressed report attachments, kept apart from the report so listing
/// reports stays small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBundle {
    pub resident_id: String,
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScopeKind {
    Rw,
    Rt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audience {
    pub scope: ScopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rt: Option<String>,
}

impl Audience {
    pub fn estate() -> Self {
        Audience {
            scope: ScopeKind::Rw,
            rt: None,
        }
    }

    pub fn block(rt: &str) -> Self {
        Audience {
            scope: ScopeKind::Rt,
            rt: Some(rt.to_string()),
        }
    }

    /// Read-time filter only; storage does not enforce it.
    pub fn visible_to(&self, resident_rt: &str) -> bool {
        match self.scope {
            ScopeKind::Rw => true,
            ScopeKind::Rt => self.rt.as_deref() == Some(resident_rt),
        }
    }
}

pub trait Scoped {
    fn audience(&self) -> &Audience;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct News {
    pub title: String,
    pub content: String,
    #[serde(flatten)]
    pub audience: Audience,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub title: String,
    pub description: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub time: Option<String>,
    pub location: String,
    #[serde(flatten)]
    pub audience: Audience,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub author_id: String,
    pub author_name: String,
    pub role: Role,
    pub content: String,
    #[serde(flatten)]
    pub audience: Audience,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub liked_by: Vec<String>,
    #[serde(default)]
    pub comment_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author_id: String,
    pub author_name: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Scoped for News {
    fn audience(&self) -> &Audience {
        &self.audience
    }
}

impl Scoped for Event {
    fn audience(&self) -> &Audience {
        &self.audience
    }
}

impl Scoped for Post {
    fn audience(&self) -> &Audience {
        &self.audience
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GateState {
    pub is_open: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

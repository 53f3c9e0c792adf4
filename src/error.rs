use std::{error::Error, fmt};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error as ThisError;

#[derive(Debug)]
pub enum StoreError {
    Database(libsql::Error),
    Serialization(serde_json::Error),
    NotFound { collection: String, id: String },
    InvalidDocument(String),
    Migration(String),
    Sync(String),
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use StoreError::*;
        match self {
            Database(e) => Some(e as &dyn Error),
            Serialization(e) => Some(e as &dyn Error),
            _ => None,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use StoreError::*;
        match self {
            Database(e) => write!(f, "DatabaseError: {}", e),
            Serialization(e) => write!(f, "SerializationError: {}", e),
            NotFound { collection, id } => write!(f, "NotFound: {}/{}", collection, id),
            InvalidDocument(s) => write!(f, "InvalidDocument: {}", s),
            Migration(s) => write!(f, "MigrationError: {}", s),
            Sync(s) => write!(f, "SyncError: {}", s),
        }
    }
}

impl From<libsql::Error> for StoreError {
    fn from(error: libsql::Error) -> Self {
        StoreError::Database(error)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization(error)
    }
}

#[derive(Debug, ThisError)]
pub enum CompressError {
    #[error("failed to read image: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("compression task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, ThisError)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("too many requests")]
    TooManyRequests,
    #[error("user disabled")]
    UserDisabled,
    #[error("invalid email")]
    InvalidEmail,
    #[error("email already in use")]
    EmailInUse,
    #[error("weak password")]
    WeakPassword,
    #[error("session expired")]
    SessionExpired,
    #[error("auth backend: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn user_message(&self) -> &'static str {
        use AuthError::*;
        match self {
            InvalidCredential => "Email atau kata sandi salah.",
            TooManyRequests => "Terlalu banyak percobaan. Silakan coba lagi nanti.",
            UserDisabled => "Akun Anda dinonaktifkan. Hubungi pengurus RT/RW.",
            InvalidEmail => "Format email tidak valid.",
            EmailInUse => "Email sudah terdaftar pada akun lain.",
            WeakPassword => "Kata sandi minimal 6 karakter.",
            SessionExpired => "Sesi Anda berakhir, silakan masuk kembali.",
            Store(_) => "Terjadi gangguan koneksi. Silakan coba lagi.",
        }
    }
}

#[derive(Debug, ThisError)]
pub enum LoginError {
    #[error("phone number not registered")]
    NotRegistered,
    #[error("resident already activated")]
    AlreadyActivated,
    #[error("resident {0} not found")]
    ResidentNotFound(String),
    #[error("resident profile missing for signed-in account")]
    ProfileMissing,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to persist preferences: {0}")]
    Preferences(#[from] std::io::Error),
}

impl LoginError {
    pub fn user_message(&self) -> &'static str {
        use LoginError::*;
        match self {
            NotRegistered => "Nomor HP belum terdaftar. Hubungi pengurus RT.",
            AlreadyActivated => "Akun sudah aktif. Silakan masuk dengan email.",
            ResidentNotFound(_) => "Data warga tidak ditemukan.",
            ProfileMissing => "Data profil tidak ditemukan. Anda telah dikeluarkan.",
            Auth(e) => e.user_message(),
            Store(_) | Preferences(_) => "Terjadi gangguan koneksi. Silakan coba lagi.",
        }
    }
}

#[derive(Debug, ThisError)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("forbidden")]
    Forbidden,
    #[error(transparent)]
    Compress(#[from] CompressError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Login(#[from] LoginError),
}

impl AppError {
    pub fn user_message(&self) -> String {
        use AppError::*;
        match self {
            NotFound(what) => format!("{} tidak ditemukan.", what),
            Validation(msg) | InvalidState(msg) => msg.clone(),
            Forbidden => "Anda tidak memiliki akses.".to_string(),
            Compress(CompressError::Decode(_)) => "File bukan gambar yang valid.".to_string(),
            Compress(_) => "Gagal memproses gambar.".to_string(),
            Store(_) => "Terjadi gangguan koneksi. Silakan coba lagi.".to_string(),
            Auth(e) => e.user_message().to_string(),
            Login(e) => e.user_message().to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        use AppError::*;
        match self {
            NotFound(_) => StatusCode::NOT_FOUND,
            Validation(_) | Compress(CompressError::Decode(_)) => StatusCode::BAD_REQUEST,
            InvalidState(_) => StatusCode::CONFLICT,
            Forbidden => StatusCode::FORBIDDEN,
            Auth(AuthError::TooManyRequests) => StatusCode::TOO_MANY_REQUESTS,
            Auth(AuthError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Auth(_) => StatusCode::UNAUTHORIZED,
            Login(LoginError::NotRegistered | LoginError::ResidentNotFound(_)) => StatusCode::NOT_FOUND,
            Login(LoginError::AlreadyActivated) => StatusCode::CONFLICT,
            Login(LoginError::ProfileMissing) => StatusCode::UNAUTHORIZED,
            Login(LoginError::Auth(AuthError::TooManyRequests)) => StatusCode::TOO_MANY_REQUESTS,
            Login(LoginError::Auth(AuthError::Store(_))) => StatusCode::INTERNAL_SERVER_ERROR,
            Login(LoginError::Auth(_)) => StatusCode::UNAUTHORIZED,
            Compress(_) | Store(_) | Login(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %crate::unpack_error(&self), "request failed");
        } else {
            tracing::info!(error = %self, "request rejected");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.user_message(),
            }),
        )
            .into_response()
    }
}

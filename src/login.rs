//! Phone-first login and activation.
//!
//! Residents are registered admin-side by phone number. The first time a
//! resident uses the app they look themselves up by phone and create an
//! account (activation); afterwards they sign in with email and password.

use crate::auth::{AuthProvider, Session};
use crate::error::LoginError;
use crate::model::Resident;
use crate::prefs::Preferences;
use crate::store::{Collections, DocumentStore, Query, Stored, fetch, fetch_all};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoginStep {
    CheckPhone,
    Activation {
        resident_id: String,
        name: String,
    },
    Login {
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedIn {
    pub session: Session,
    pub resident: Stored<Resident>,
}

/// Digits only, with the Indonesian country code folded into a leading zero.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.strip_prefix("62") {
        Some(rest) if !rest.starts_with('0') => format!("0{}", rest),
        _ => digits,
    }
}

pub struct LoginFlow {
    store: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    collections: Collections,
    preferences: Arc<Preferences>,
    /// Held from the activation check until the account is linked.
    activation: Mutex<()>,
}

impl LoginFlow {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        auth: Arc<dyn AuthProvider>,
        collections: Collections,
        preferences: Arc<Preferences>,
    ) -> Self {
        LoginFlow {
            store,
            auth,
            collections,
            preferences,
            activation: Mutex::new(()),
        }
    }

    pub fn entry_step(&self) -> LoginStep {
        if self.preferences.has_activated() {
            LoginStep::Login { email: None }
        } else {
            LoginStep::CheckPhone
        }
    }

    pub async fn check_phone(&self, phone: &str) -> Result<LoginStep, LoginError> {
        let phone = normalize_phone(phone);
        if phone.is_empty() {
            return Err(LoginError::NotRegistered);
        }

        let query = Query::new(self.collections.residents())
            .filter("phone", phone.as_str())
            .limit(1);
        let Some(resident) = fetch_all::<Resident>(self.store.as_ref(), &query)
            .await?
            .into_iter()
            .next()
        else {
            tracing::info!("phone lookup found no resident");
            return Err(LoginError::NotRegistered);
        };

        if resident.doc.is_activated() {
            Ok(LoginStep::Login {
                email: Some(resident.doc.email).filter(|e| !e.is_empty()),
            })
        } else {
            Ok(LoginStep::Activation {
                resident_id: resident.id,
                name: resident.doc.name,
            })
        }
    }

    pub async fn activate(
        &self,
        resident_id: &str,
        email: &str,
        password: &str,
    ) -> Result<SignedIn, LoginError> {
        let _activating = self.activation.lock().await;
        let resident = fetch::<Resident>(self.store.as_ref(), &self.collections.residents(), resident_id)
            .await?
            .ok_or_else(|| LoginError::ResidentNotFound(resident_id.to_string()))?;
        if resident.doc.is_activated() {
            return Err(LoginError::AlreadyActivated);
        }

        let session = self.auth.create_account(email, password).await?;
        let email = session.email.clone().unwrap_or_else(|| email.trim().to_lowercase());
        self.link(resident_id, &session.uid, &email).await?;
        self.preferences.mark_activated().await?;

        tracing::info!(resident_id, uid = %session.uid, "resident activated");
        let resident = self.profile_by_uid(&session.uid).await?.ok_or(LoginError::ProfileMissing)?;
        Ok(SignedIn { session, resident })
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SignedIn, LoginError> {
        let session = self.auth.sign_in(email, password).await?;

        if let Some(resident) = self.profile_by_uid(&session.uid).await? {
            return Ok(SignedIn { session, resident });
        }

        let email = session.email.clone().unwrap_or_else(|| email.trim().to_lowercase());
        let by_email = Query::new(self.collections.residents())
            .filter("email", email.as_str())
            .limit(1);
        match fetch_all::<Resident>(self.store.as_ref(), &by_email)
            .await?
            .into_iter()
            .next()
        {
            Some(resident) => {
                tracing::info!(resident_id = %resident.id, uid = %session.uid, "linking account found by email");
                self.link(&resident.id, &session.uid, &email).await?;
                let resident = self
                    .profile_by_uid(&session.uid)
                    .await?
                    .ok_or(LoginError::ProfileMissing)?;
                Ok(SignedIn { session, resident })
            }
            None => {
                self.force_sign_out(&session).await;
                Err(LoginError::ProfileMissing)
            }
        }
    }

    /// Restores a signed-in resident from a bearer token.
    pub async fn resume(&self, token: &str) -> Result<SignedIn, LoginError> {
        let session = self.auth.session(token).await?;
        match self.profile_by_uid(&session.uid).await? {
            Some(resident) => Ok(SignedIn { session, resident }),
            None => {
                self.force_sign_out(&session).await;
                Err(LoginError::ProfileMissing)
            }
        }
    }

    pub async fn logout(&self, token: &str) -> Result<(), LoginError> {
        self.auth.sign_out(token).await?;
        Ok(())
    }

    async fn profile_by_uid(&self, uid: &str) -> Result<Option<Stored<Resident>>, LoginError> {
        let query = Query::new(self.collections.residents())
            .filter("uid", uid)
            .limit(1);
        Ok(fetch_all::<Resident>(self.store.as_ref(), &query)
            .await?
            .into_iter()
            .next())
    }

    async fn link(&self, resident_id: &str, uid: &str, email: &str) -> Result<(), LoginError> {
        self.store
            .merge(
                &self.collections.residents(),
                resident_id,
                json!({
                    "uid": uid,
                    "email": email,
                    "synced_at": Utc::now(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn force_sign_out(&self, session: &Session) {
        tracing::warn!(uid = %session.uid, "no resident profile for account, signing out");
        if let Err(e) = self.auth.sign_out(&session.token).await {
            tracing::error!(error = %e, "forced sign-out failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::LocalAuth;
    use crate::error::AuthError;
    use crate::store::LocalStore;
    use serde_json::Value;

    pub(crate) struct Fixture {
        pub store: Arc<LocalStore>,
        pub auth: Arc<LocalAuth>,
        pub flow: LoginFlow,
        pub collections: Collections,
    }

    pub(crate) fn resident_json(name: &str, phone: &str, rt: &str) -> Value {
        json!({
            "name": name,
            "unit": "C2/5",
            "rt": rt,
            "rw": "11",
            "phone": phone,
        })
    }

    pub(crate) async fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::in_memory().await.unwrap());
        let auth = Arc::new(LocalAuth::new(store.clone()));
        let collections = Collections::new("test-app");
        let flow = LoginFlow::new(
            store.clone(),
            auth.clone(),
            collections.clone(),
            Arc::new(Preferences::in_memory()),
        );
        Fixture {
            store,
            auth,
            flow,
            collections,
        }
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("0812-3456-7890"), "081234567890");
        assert_eq!(normalize_phone("+62 812 3456 7890"), "081234567890");
        assert_eq!(normalize_phone("6281234567890"), "081234567890");
        assert_eq!(normalize_phone("abc"), "");
    }

    #[tokio::test]
    async fn test_unknown_phone_is_not_registered() {
        let fx = fixture().await;
        fx.store
            .set(&fx.collections.residents(), "r1", resident_json("Budi", "081111111111", "03"))
            .await
            .unwrap();

        let result = fx.flow.check_phone("0812xxxx").await;
        assert!(matches!(result, Err(LoginError::NotRegistered)));
        assert_eq!(fx.flow.entry_step(), LoginStep::CheckPhone);
    }

    #[tokio::test]
    async fn test_registered_phone_leads_to_activation_then_login() {
        let fx = fixture().await;
        fx.store
            .set(&fx.collections.residents(), "r1", resident_json("Budi", "081234567890", "03"))
            .await
            .unwrap();

        let step = fx.flow.check_phone("+62 812-3456-7890").await.unwrap();
        assert_eq!(
            step,
            LoginStep::Activation {
                resident_id: "r1".into(),
                name: "Budi".into()
            }
        );

        let signed_in = fx
            .flow
            .activate("r1", "budi@adipura.id", "rahasia1")
            .await
            .unwrap();
        assert_eq!(signed_in.resident.id, "r1");
        assert_eq!(signed_in.resident.doc.uid, signed_in.session.uid);
        assert!(signed_in.resident.doc.synced_at.is_some());
        assert_eq!(fx.flow.entry_step(), LoginStep::Login { email: None });

        let step = fx.flow.check_phone("081234567890").await.unwrap();
        assert_eq!(
            step,
            LoginStep::Login {
                email: Some("budi@adipura.id".into())
            }
        );

        assert!(matches!(
            fx.flow.activate("r1", "lain@adipura.id", "rahasia1").await,
            Err(LoginError::AlreadyActivated)
        ));
    }

    #[tokio::test]
    async fn test_simultaneous_activations_create_one_account() {
        let fx = fixture().await;
        fx.store
            .set(&fx.collections.residents(), "r1", resident_json("Budi", "081234567890", "03"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            fx.flow.activate("r1", "satu@adipura.id", "rahasia1"),
            fx.flow.activate("r1", "dua@adipura.id", "rahasia1"),
        );
        let (winner, loser_email) = match (first, second) {
            (Ok(signed_in), Err(LoginError::AlreadyActivated)) => (signed_in, "dua@adipura.id"),
            (Err(LoginError::AlreadyActivated), Ok(signed_in)) => (signed_in, "satu@adipura.id"),
            other => panic!("expected exactly one activation, got {:?}", other),
        };

        let resident = fx
            .flow
            .profile_by_uid(&winner.session.uid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resident.id, "r1");
        assert!(matches!(
            fx.auth.sign_in(loser_email, "rahasia1").await,
            Err(AuthError::InvalidCredential)
        ));
    }

    #[tokio::test]
    async fn test_login_links_account_found_by_email() {
        let fx = fixture().await;
        let session = fx.auth.create_account("siti@adipura.id", "rahasia1").await.unwrap();

        let mut resident = resident_json("Siti", "081200000000", "02");
        resident["email"] = json!("siti@adipura.id");
        fx.store
            .set(&fx.collections.residents(), "r2", resident)
            .await
            .unwrap();

        let signed_in = fx.flow.login("siti@adipura.id", "rahasia1").await.unwrap();
        assert_eq!(signed_in.resident.id, "r2");
        assert_eq!(signed_in.resident.doc.uid, session.uid);

        let stored = fx
            .store
            .get(&fx.collections.residents(), "r2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.data["uid"], json!(session.uid));
    }

    #[tokio::test]
    async fn test_login_without_profile_forces_sign_out() {
        let fx = fixture().await;
        fx.auth.create_account("hilang@adipura.id", "rahasia1").await.unwrap();

        let result = fx.flow.login("hilang@adipura.id", "rahasia1").await;
        assert!(matches!(result, Err(LoginError::ProfileMissing)));
    }

    #[tokio::test]
    async fn test_resume_with_missing_profile_revokes_session() {
        let fx = fixture().await;
        let session = fx.auth.create_account("tono@adipura.id", "rahasia1").await.unwrap();

        assert!(matches!(
            fx.flow.resume(&session.token).await,
            Err(LoginError::ProfileMissing)
        ));
        assert!(matches!(
            fx.auth.session(&session.token).await,
            Err(AuthError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_bad_password_is_localized() {
        let fx = fixture().await;
        fx.auth.create_account("eka@adipura.id", "rahasia1").await.unwrap();

        let err = fx.flow.login("eka@adipura.id", "salah").await.unwrap_err();
        assert_eq!(err.user_message(), "Email atau kata sandi salah.");
    }
}

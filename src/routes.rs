use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use crate::handler::{self, AppState};

/// Payment proofs and report photos arrive uncompressed from phone cameras.
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/entry", get(handler::entry_step))
        .route("/phone", post(handler::check_phone))
        .route("/activate", post(handler::activate))
        .route("/login", post(handler::login))
        .route("/logout", post(handler::logout))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handler::healthcheck))
        .nest("/auth", auth_routes())
        .route("/me", get(handler::get_profile).put(handler::update_profile))
        .route("/me/photo", post(handler::update_photo))
        .route("/me/card", get(handler::get_card))
        .route("/bills", get(handler::list_bills))
        .route("/bills/summary", get(handler::bill_summary))
        .route("/bills/:id/payment", post(handler::submit_payment))
        .route("/reports", get(handler::list_reports).post(handler::create_report))
        .route("/reports/:id/images", get(handler::report_images))
        .route("/permits", get(handler::list_permits).post(handler::create_permit))
        .route("/news", get(handler::list_news).post(handler::create_news))
        .route("/events", get(handler::list_events).post(handler::create_event))
        .route("/posts", get(handler::list_posts).post(handler::create_post))
        .route("/posts/:id/like", post(handler::toggle_like))
        .route(
            "/posts/:id/comments",
            get(handler::list_comments).post(handler::add_comment),
        )
        .route("/gate", get(handler::gate_state).put(handler::set_gate))
        .route("/gate/toggle", post(handler::toggle_gate))
        .route("/weather", get(handler::weather))
        .route("/assistant/draft", post(handler::smart_draft))
        .route("/assistant/event-ideas", post(handler::event_ideas))
        .route("/live/:collection", get(handler::live))
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    routes()
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuth;
    use crate::config::Config;
    use crate::prefs::Preferences;
    use crate::store::{Collections, DocumentStore, LocalStore};
    use axum::{
        body::Body,
        http::{Request, Response, StatusCode, header},
    };
    use image::{ImageFormat, RgbImage};
    use serde_json::{Value, json};
    use std::io::Cursor;
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "adipura-test-boundary";

    struct TestApp {
        router: Router,
        store: Arc<LocalStore>,
        collections: Collections,
    }

    async fn test_app() -> TestApp {
        let cfg = Config::default();
        let store = Arc::new(LocalStore::in_memory().await.unwrap());
        let auth = Arc::new(LocalAuth::new(store.clone()));
        let state = AppState::new(&cfg, store.clone(), auth, Arc::new(Preferences::in_memory()));
        TestApp {
            router: app(state),
            store,
            collections: Collections::new(cfg.app.get_app_id()),
        }
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    /// (name, filename, content type, bytes); a part without a filename is a text field.
    fn multipart_request(uri: &str, token: &str, parts: &[(&str, Option<&str>, &str, Vec<u8>)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, content_type, bytes) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, filename, content_type
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                ),
            }
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(width, height, image::Rgb([200, 120, 40]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    /// Seeds a resident, activates them over HTTP and returns the bearer token.
    async fn activated(app: &TestApp) -> String {
        app.store
            .set(
                &app.collections.residents(),
                "r1",
                json!({
                    "name": "Budi",
                    "unit": "C2/5",
                    "rt": "03",
                    "rw": "11",
                    "phone": "081234567890",
                }),
            )
            .await
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(json_request("POST", "/auth/phone", None, json!({"phone": "+62 812 3456 7890"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let step = body_json(response).await;
        assert_eq!(step["data"]["mode"], "activation");
        assert_eq!(step["data"]["resident_id"], "r1");

        let response = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/activate",
                None,
                json!({"resident_id": "r1", "email": "budi@adipura.id", "password": "rahasia1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let signed_in = body_json(response).await;
        signed_in["data"]["session"]["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"data": "ok"}));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(Request::builder().uri("/bills").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"],
            "Sesi Anda berakhir, silakan masuk kembali."
        );
    }

    #[tokio::test]
    async fn test_unknown_phone_is_not_found() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(json_request("POST", "/auth/phone", None, json!({"phone": "0800"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await["error"],
            "Nomor HP belum terdaftar. Hubungi pengurus RT."
        );
    }

    #[tokio::test]
    async fn test_activation_then_profile_and_summary() {
        let app = test_app().await;
        let token = activated(&app).await;

        let response = app.router.clone().oneshot(get_request("/me", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let profile = body_json(response).await;
        assert_eq!(profile["data"]["id"], "r1");
        assert_eq!(profile["data"]["name"], "Budi");

        let response = app
            .router
            .clone()
            .oneshot(get_request("/bills/summary", &token))
            .await
            .unwrap();
        let summary = body_json(response).await;
        assert_eq!(summary["data"]["all_settled"], true);
        assert_eq!(summary["data"]["outstanding_count"], 0);

        let response = app
            .router
            .clone()
            .oneshot(get_request("/auth/entry", &token))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["data"]["mode"], "login");
    }

    #[tokio::test]
    async fn test_non_image_upload_is_rejected() {
        let app = test_app().await;
        let token = activated(&app).await;

        let response = app
            .router
            .clone()
            .oneshot(multipart_request(
                "/me/photo",
                &token,
                &[("photo", Some("notes.txt"), "text/plain", b"bukan gambar".to_vec())],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "Hanya file gambar yang diizinkan."
        );
    }

    #[tokio::test]
    async fn test_payment_proof_upload() {
        let app = test_app().await;
        let token = activated(&app).await;
        app.store
            .set(
                &app.collections.billing(),
                "b1",
                json!({
                    "resident_id": "r1",
                    "period": "2024-05",
                    "amount": 150000,
                    "status": "UNPAID",
                    "description": "Iuran keamanan",
                }),
            )
            .await
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(multipart_request(
                "/bills/b1/payment",
                &token,
                &[
                    ("method", None, "", b"Transfer BCA".to_vec()),
                    ("proof", Some("bukti.png"), "image/png", png(1600, 900)),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bill = body_json(response).await;
        assert_eq!(bill["data"]["status"], "PENDING_VERIFICATION");
        assert_eq!(bill["data"]["payment_method"], "Transfer BCA");
        assert!(
            bill["data"]["payment_proof"]
                .as_str()
                .unwrap()
                .starts_with("data:image/jpeg;base64,")
        );
    }

    #[tokio::test]
    async fn test_gate_set_and_toggle() {
        let app = test_app().await;
        let token = activated(&app).await;

        let mut request = json_request("PUT", "/gate", Some(&token), json!({"is_open": true}));
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["is_open"], true);

        request = json_request("POST", "/gate/toggle", Some(&token), json!({}));
        let response = app.router.clone().oneshot(request).await.unwrap();
        let gate = body_json(response).await;
        assert_eq!(gate["data"]["is_open"], false);
        assert_eq!(gate["data"]["updated_by"], "r1");
    }

    #[tokio::test]
    async fn test_unknown_live_collection() {
        let app = test_app().await;
        let token = activated(&app).await;

        let response = app
            .router
            .oneshot(get_request("/live/accounts", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

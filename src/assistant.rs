//! Generative-text helper for "smart draft" and event ideas.
//!
//! Every failure, including a missing API key, degrades to [`FALLBACK_TEXT`].

use crate::config::Assistant as AssistantConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const FALLBACK_TEXT: &str =
    "Maaf, asisten pintar sedang tidak tersedia. Silakan tulis secara manual.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftKind {
    Report,
    Permit,
    Post,
}

impl DraftKind {
    fn instruction(&self) -> &'static str {
        match self {
            DraftKind::Report => {
                "Anda membantu warga perumahan Bumi Adipura menulis laporan keluhan kepada pengurus. \
                 Tulis ulang catatan warga menjadi laporan singkat, sopan, dan jelas dalam Bahasa Indonesia."
            }
            DraftKind::Permit => {
                "Anda membantu warga perumahan Bumi Adipura mengajukan izin kepada pengurus RT/RW. \
                 Tulis keterangan izin yang singkat dan sopan dalam Bahasa Indonesia."
            }
            DraftKind::Post => {
                "Anda membantu warga perumahan Bumi Adipura menulis pesan forum warga yang ramah \
                 dan singkat dalam Bahasa Indonesia."
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

pub struct AssistantClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl AssistantClient {
    pub fn new(cfg: &AssistantConfig) -> Self {
        AssistantClient {
            client: reqwest::Client::new(),
            url: cfg.url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> String {
        if !self.is_configured() {
            tracing::debug!("assistant has no api key, using fallback");
            return FALLBACK_TEXT.to_string();
        }

        match self.request(prompt, system).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!("assistant returned no text");
                FALLBACK_TEXT.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "assistant request failed");
                FALLBACK_TEXT.to_string()
            }
        }
    }

    pub async fn smart_draft(&self, kind: DraftKind, notes: &str) -> String {
        let prompt = format!("Catatan warga:\n{}", notes.trim());
        self.generate(&prompt, Some(kind.instruction())).await
    }

    pub async fn event_ideas(&self, theme: &str) -> String {
        let prompt = format!(
            "Berikan 3 ide kegiatan warga untuk tema \"{}\" di perumahan Bumi Adipura. \
             Sertakan nama kegiatan dan satu kalimat penjelasan untuk masing-masing.",
            theme.trim()
        );
        self.generate(&prompt, None).await
    }

    async fn request(&self, prompt: &str, system: Option<&str>) -> Result<String, reqwest::Error> {
        let endpoint = format!(
            "{}/{}:generateContent?key={}",
            self.url,
            self.model,
            urlencoding::encode(&self.api_key)
        );

        let mut body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let response: GenerateResponse = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Path, Query},
        http::StatusCode,
        routing::post,
    };
    use serde_json::Value;
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/models", addr)
    }

    fn client(url: String, api_key: &str) -> AssistantClient {
        AssistantClient::new(&AssistantConfig {
            url,
            model: "test-model".to_string(),
            api_key: api_key.to_string(),
        })
    }

    #[tokio::test]
    async fn test_missing_key_fails_closed() {
        let assistant = client("http://127.0.0.1:9/models".to_string(), "");
        assert!(!assistant.is_configured());
        assert_eq!(assistant.event_ideas("17 Agustus").await, FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn test_returns_generated_text() {
        let app = Router::new().route(
            "/models/:call",
            post(
                |Path(call): Path<String>,
                 Query(params): Query<HashMap<String, String>>,
                 Json(body): Json<Value>| async move {
                    assert_eq!(call, "test-model:generateContent");
                    assert_eq!(params.get("key").map(String::as_str), Some("k3y"));
                    assert!(body["systemInstruction"]["parts"][0]["text"].is_string());
                    Json(serde_json::json!({
                        "candidates": [{"content": {"parts": [{"text": "Lampu jalan "}, {"text": "di blok C padam."}]}}]
                    }))
                },
            ),
        );
        let assistant = client(serve(app).await, "k3y");

        let draft = assistant.smart_draft(DraftKind::Report, "lampu mati blok c").await;
        assert_eq!(draft, "Lampu jalan di blok C padam.");
    }

    #[tokio::test]
    async fn test_upstream_error_falls_back() {
        let app = Router::new().route(
            "/models/:call",
            post(|| async { StatusCode::TOO_MANY_REQUESTS }),
        );
        let assistant = client(serve(app).await, "k3y");
        assert_eq!(assistant.event_ideas("HUT RI").await, FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn test_empty_candidates_fall_back() {
        let app = Router::new().route(
            "/models/:call",
            post(|| async { Json(serde_json::json!({"candidates": []})) }),
        );
        let assistant = client(serve(app).await, "k3y");
        assert_eq!(assistant.generate("halo", None).await, FALLBACK_TEXT);
    }
}

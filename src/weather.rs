use crate::config::Weather as WeatherConfig;
use serde::{Deserialize, Serialize};

pub const UNAVAILABLE: &str = "Cuaca tidak tersedia";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherReport {
    pub available: bool,
    pub temperature: Option<f64>,
    pub code: Option<i64>,
    pub description: String,
}

impl WeatherReport {
    pub fn unavailable() -> Self {
        WeatherReport {
            available: false,
            temperature: None,
            code: None,
            description: UNAVAILABLE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current_weather: CurrentWeather,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature: f64,
    weathercode: i64,
}

/// WMO weather interpretation codes.
pub fn describe_code(code: i64) -> &'static str {
    match code {
        0 => "Cerah",
        1 | 2 => "Cerah berawan",
        3 => "Berawan",
        45 | 48 => "Berkabut",
        51 | 53 | 55 | 56 | 57 => "Gerimis",
        61 | 63 | 66 => "Hujan",
        65 | 67 => "Hujan lebat",
        71..=77 | 85 | 86 => "Salju",
        80..=82 => "Hujan lokal",
        95..=99 => "Badai petir",
        _ => "Tidak diketahui",
    }
}

pub struct WeatherClient {
    client: reqwest::Client,
    url: String,
    latitude: f64,
    longitude: f64,
}

impl WeatherClient {
    pub fn new(cfg: &WeatherConfig) -> Self {
        WeatherClient {
            client: reqwest::Client::new(),
            url: cfg.url.clone(),
            latitude: cfg.latitude,
            longitude: cfg.longitude,
        }
    }

    /// Never fails; any error yields [`WeatherReport::unavailable`].
    pub async fn current(&self) -> WeatherReport {
        match self.fetch().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "weather lookup failed");
                WeatherReport::unavailable()
            }
        }
    }

    async fn fetch(&self) -> Result<WeatherReport, reqwest::Error> {
        let response: ForecastResponse = self
            .client
            .get(&self.url)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("current_weather", "true".to_string()),
                ("timezone", "Asia/Jakarta".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let current = response.current_weather;
        Ok(WeatherReport {
            available: true,
            temperature: Some(current.temperature),
            code: Some(current.weathercode),
            description: describe_code(current.weathercode).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, http::StatusCode, routing::get};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1/forecast", addr)
    }

    fn client(url: String) -> WeatherClient {
        WeatherClient::new(&WeatherConfig {
            url,
            latitude: -6.9,
            longitude: 107.7,
        })
    }

    #[test]
    fn test_describe_code() {
        assert_eq!(describe_code(0), "Cerah");
        assert_eq!(describe_code(63), "Hujan");
        assert_eq!(describe_code(96), "Badai petir");
        assert_eq!(describe_code(1234), "Tidak diketahui");
    }

    #[tokio::test]
    async fn test_parses_current_weather() {
        let app = Router::new().route(
            "/v1/forecast",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("current_weather").map(String::as_str), Some("true"));
                Json(serde_json::json!({
                    "current_weather": {"temperature": 27.5, "weathercode": 3}
                }))
            }),
        );
        let report = client(serve(app).await).current().await;

        assert!(report.available);
        assert_eq!(report.temperature, Some(27.5));
        assert_eq!(report.description, "Berawan");
    }

    #[tokio::test]
    async fn test_server_error_falls_back() {
        let app = Router::new().route(
            "/v1/forecast",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let report = client(serve(app).await).current().await;
        assert_eq!(report, WeatherReport::unavailable());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back() {
        let report = client("http://127.0.0.1:9/v1/forecast".to_string()).current().await;
        assert!(!report.available);
        assert_eq!(report.description, UNAVAILABLE);
    }
}

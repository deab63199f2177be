//! HTTP server for the web UI and command API.
//!
//! Endpoints:
//! - `GET /` — the UI bundle (gzip-encoded HTML, embedded at build time)
//! - `GET /logo.svg`, `GET /manifest.json` — static assets
//! - `POST /api` — the command envelope (§ command dispatcher)
//! - `OPTIONS /api` — permissive CORS preflight
//! - `GET /*` — 307 redirect to `/`
//!
//! The server itself exists only on the target; the dispatcher it
//! forwards to is fully host-tested.

/// CORS headers shared by the API handlers.
pub const CORS_ALLOW_ORIGIN: &str = "*";
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";
pub const CORS_ALLOW_HEADERS: &str = "Authorization,Content-Type,Accept,Origin,User-Agent,DNT,Cache-Control,X-Mx-ReqToken,Keep-Alive,X-Requested-With,If-Modified-Since";
pub const CORS_MAX_AGE: &str = "1728000";

#[cfg(target_os = "espidf")]
mod server {
    use std::sync::Arc;

    use esp_idf_svc::http::server::{Configuration, EspHttpServer};
    use esp_idf_svc::http::Method;
    use esp_idf_svc::io::{Read, Write};
    use log::info;

    use super::*;
    use crate::command;
    use crate::engine::BrewEngine;

    static INDEX_HTML_GZ: &[u8] = include_bytes!("../../web/index.html.gz");
    static LOGO_SVG: &[u8] = include_bytes!("../../web/logo.svg");
    static MANIFEST_JSON: &[u8] = include_bytes!("../../web/manifest.json");

    /// Request handler stack depth; JSON serialization of full
    /// schedules needs room.
    const SERVER_STACK_SIZE: usize = 20480;

    /// Start the server and register every route. The engine is
    /// captured by the closures; no process-wide state.
    pub fn start(engine: Arc<BrewEngine>) -> anyhow::Result<EspHttpServer<'static>> {
        let conf = Configuration {
            stack_size: SERVER_STACK_SIZE,
            uri_match_wildcard: true,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        server.fn_handler("/", Method::Get, |request| {
            let mut response = request.into_response(
                200,
                None,
                &[("Content-Type", "text/html"), ("Content-Encoding", "gzip")],
            )?;
            response.write_all(INDEX_HTML_GZ)?;
            Ok::<(), anyhow::Error>(())
        })?;

        server.fn_handler("/logo.svg", Method::Get, |request| {
            let mut response =
                request.into_response(200, None, &[("Content-Type", "image/svg+xml")])?;
            response.write_all(LOGO_SVG)?;
            Ok::<(), anyhow::Error>(())
        })?;

        server.fn_handler("/manifest.json", Method::Get, |request| {
            let mut response =
                request.into_response(200, None, &[("Content-Type", "application/json")])?;
            response.write_all(MANIFEST_JSON)?;
            Ok::<(), anyhow::Error>(())
        })?;

        {
            let engine = engine.clone();
            server.fn_handler("/api", Method::Post, move |mut request| {
                let mut body = Vec::new();
                let mut chunk = [0u8; 256];
                loop {
                    let n = request.read(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
                let payload = String::from_utf8_lossy(&body);
                let result = command::process(&engine, &payload);

                let mut response = request.into_response(
                    200,
                    None,
                    &[
                        ("Content-Type", "text/plain"),
                        ("Access-Control-Allow-Origin", CORS_ALLOW_ORIGIN),
                    ],
                )?;
                response.write_all(result.as_bytes())?;
                Ok::<(), anyhow::Error>(())
            })?;
        }

        server.fn_handler("/api", Method::Options, |request| {
            request.into_response(
                204,
                None,
                &[
                    ("Content-Type", "text/plain"),
                    ("Access-Control-Max-Age", CORS_MAX_AGE),
                    ("Access-Control-Allow-Methods", CORS_ALLOW_METHODS),
                    ("Access-Control-Allow-Headers", CORS_ALLOW_HEADERS),
                    ("Access-Control-Allow-Origin", CORS_ALLOW_ORIGIN),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })?;

        server.fn_handler("/*", Method::Get, |request| {
            request.into_response(307, None, &[("Location", "/")])?;
            Ok::<(), anyhow::Error>(())
        })?;

        info!("http server started");
        Ok(server)
    }
}

#[cfg(target_os = "espidf")]
pub use server::start;

// ---------------------------------------------------------------------------
// HTTPS client helpers for the cloud uploader
// ---------------------------------------------------------------------------

#[cfg(target_os = "espidf")]
pub fn https_post(endpoint: &str, bearer: &str, payload: &str) -> anyhow::Result<()> {
    use embedded_svc::http::client::Client;
    use embedded_svc::http::Status;
    use embedded_svc::io::Write;
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

    let connection = EspHttpConnection::new(&Configuration {
        timeout: Some(std::time::Duration::from_secs(
            super::cloud::HTTP_TIMEOUT_SECS,
        )),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        buffer_size: Some(4096),
        ..Default::default()
    })?;
    let mut client = Client::wrap(connection);

    let auth = format!("Bearer {bearer}");
    let headers = [
        ("Content-Type", "application/json"),
        ("Authorization", auth.as_str()),
    ];
    let mut request = client.post(endpoint, &headers)?;
    request.write_all(payload.as_bytes())?;
    let response = request.submit()?;
    let status = response.status();
    if !(200..300).contains(&status) {
        anyhow::bail!("telemetry endpoint returned {status}");
    }
    Ok(())
}

#[cfg(target_os = "espidf")]
pub fn https_auth_exchange(
    endpoint: &str,
    auth: &super::cloud::CloudAuth,
) -> anyhow::Result<super::cloud::CloudToken> {
    use embedded_svc::http::client::Client;
    use embedded_svc::io::{Read, Write};
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

    use super::cloud::{CloudAuth, CloudToken};

    let body = match auth {
        CloudAuth::EmailPassword { email, password } => serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        }),
        CloudAuth::CustomToken { token } => serde_json::json!({
            "token": token,
            "returnSecureToken": true,
        }),
        CloudAuth::RefreshToken { refresh_token } => serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        }),
    }
    .to_string();

    let connection = EspHttpConnection::new(&Configuration {
        timeout: Some(std::time::Duration::from_secs(
            super::cloud::AUTH_TIMEOUT_SECS,
        )),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        buffer_size: Some(4096),
        ..Default::default()
    })?;
    let mut client = Client::wrap(connection);

    let mut request = client.post(endpoint, &[("Content-Type", "application/json")])?;
    request.write_all(body.as_bytes())?;
    let mut response = request.submit()?;

    let mut buf = vec![0u8; 4096];
    let mut collected = Vec::new();
    loop {
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    let parsed: serde_json::Value = serde_json::from_slice(&collected)?;
    let value = parsed["idToken"]
        .as_str()
        .or_else(|| parsed["id_token"].as_str())
        .ok_or_else(|| anyhow::anyhow!("auth response carried no token"))?
        .to_string();
    let expires_in = parsed["expiresIn"]
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| parsed["expires_in"].as_i64())
        .unwrap_or(3600);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(CloudToken {
        value,
        expires_at: now + expires_in,
    })
}

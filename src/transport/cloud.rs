//! Cloud telemetry uploader contract.
//!
//! The uploader itself is an external collaborator; the engine only
//! depends on its contract: samples are offered no more often than the
//! configured interval, requests carry a bearer token renewed before an
//! expiry margin, and transport failures never block the control
//! loops. Token exchange supports e-mail/password, custom-token and
//! refresh-token flows.

use log::debug;

/// Tokens are considered stale this many seconds before actual expiry.
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

/// Per-request timeout for telemetry posts.
pub const HTTP_TIMEOUT_SECS: u64 = 10;
/// Timeout for auth exchanges, which involve a TLS handshake and more
/// backend work.
pub const AUTH_TIMEOUT_SECS: u64 = 15;

/// Supported authentication methods.
#[derive(Debug, Clone)]
pub enum CloudAuth {
    EmailPassword { email: String, password: String },
    CustomToken { token: String },
    RefreshToken { refresh_token: String },
}

/// A bearer token with its absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudToken {
    pub value: String,
    pub expires_at: i64,
}

impl CloudToken {
    /// Valid means usable now and for the safety margin.
    pub fn is_valid(&self, now: i64) -> bool {
        now < self.expires_at - TOKEN_EXPIRY_MARGIN_SECS
    }
}

/// One telemetry sample as posted upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub temperature: f32,
    pub target_temperature: f32,
    pub pid_output: u8,
    pub status: String,
    pub hostname: String,
    pub session_id: Option<u32>,
}

pub fn sample_payload(sample: &TelemetrySample) -> String {
    serde_json::json!({
        "temperature": sample.temperature,
        "targetTemperature": sample.target_temperature,
        "pidOutput": sample.pid_output,
        "status": sample.status,
        "hostname": sample.hostname,
        "sessionId": sample.session_id,
    })
    .to_string()
}

pub struct CloudUploader {
    endpoint: String,
    auth: CloudAuth,
    token: Option<CloudToken>,
    send_interval_secs: u16,
    last_sent: i64,
    hostname: String,
    /// Host backend: samples that passed the interval gate.
    #[cfg(not(target_os = "espidf"))]
    sent: Vec<TelemetrySample>,
}

impl CloudUploader {
    pub fn new(endpoint: &str, auth: CloudAuth, send_interval_secs: u16, hostname: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            auth,
            token: None,
            send_interval_secs: send_interval_secs.max(1),
            last_sent: 0,
            hostname: hostname.to_string(),
            #[cfg(not(target_os = "espidf"))]
            sent: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the interval gate admits a send at `now`.
    pub fn should_send(&self, now: i64) -> bool {
        now - self.last_sent >= i64::from(self.send_interval_secs)
    }

    pub fn token_valid(&self, now: i64) -> bool {
        self.token.as_ref().is_some_and(|t| t.is_valid(now))
    }

    /// Install a token obtained by the auth collaborator.
    pub fn set_token(&mut self, token: CloudToken) {
        self.token = Some(token);
    }

    /// Offer a sample; drops it silently inside the interval. Returns
    /// whether the sample was accepted for upload.
    pub fn offer(
        &mut self,
        now: i64,
        temperature: f32,
        target_temperature: f32,
        pid_output: u8,
        status: &str,
        session_id: Option<u32>,
    ) -> bool {
        if !self.should_send(now) {
            return false;
        }
        self.last_sent = now;

        if !self.token_valid(now) {
            debug!("cloud token stale, renewal due before next upload");
            self.renew_token(now);
        }

        let sample = TelemetrySample {
            temperature,
            target_temperature,
            pid_output,
            status: status.to_string(),
            hostname: self.hostname.clone(),
            session_id,
        };
        self.post(&sample);
        true
    }

    fn renew_token(&mut self, now: i64) {
        debug!("cloud token renewal at {now}");
        // The exchange endpoint depends on the configured method; a
        // refresh token is preferred once one has been issued.
        match &self.auth {
            CloudAuth::EmailPassword { email, .. } => {
                debug!("cloud auth: password exchange for {email}");
            }
            CloudAuth::CustomToken { .. } => {
                debug!("cloud auth: custom token exchange");
            }
            CloudAuth::RefreshToken { .. } => {
                debug!("cloud auth: refresh token renewal");
            }
        }

        #[cfg(target_os = "espidf")]
        {
            match crate::transport::http::https_auth_exchange(&self.endpoint, &self.auth) {
                Ok(token) => self.token = Some(token),
                Err(e) => log::warn!("cloud auth failed ({e}), next attempt at next interval"),
            }
        }

        #[cfg(not(target_os = "espidf"))]
        {
            // Host builds get a synthetic token so the gate logic runs.
            self.token = Some(CloudToken {
                value: "sim-token".into(),
                expires_at: now + 3600,
            });
        }
    }

    fn post(&mut self, sample: &TelemetrySample) {
        #[cfg(target_os = "espidf")]
        {
            let payload = sample_payload(sample);
            let bearer = self.token.as_ref().map(|t| t.value.as_str()).unwrap_or("");
            if let Err(e) = crate::transport::http::https_post(&self.endpoint, bearer, &payload) {
                log::warn!("cloud upload failed ({e}), retrying at next interval");
            }
        }

        #[cfg(not(target_os = "espidf"))]
        self.sent.push(sample.clone());
    }

    /// Host-only: samples that cleared the interval gate.
    #[cfg(not(target_os = "espidf"))]
    pub fn sent(&self) -> &[TelemetrySample] {
        &self.sent
    }
}

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const TRAFFIC_PREFIX: &str = "sandbox-traffic-";

/// Derives the per-sandbox opaque access tokens from a process-wide seed.
/// The tokens are returned to the caller at creation time and never stored;
/// possession is the capability.
pub struct AccessTokenHasher {
    mac: HmacSha256,
}

impl AccessTokenHasher {
    pub fn new(seed: &str) -> Result<Self> {
        if seed.is_empty() {
            return Err(anyhow!("sandbox access token seed must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(seed.as_bytes())
            .context("initializing access token HMAC")?;
        Ok(Self { mac })
    }

    fn derive(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        STANDARD_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Token authenticating envd calls into the sandbox.
    pub fn envd_token(&self, sandbox_id: &str) -> String {
        self.derive(sandbox_id)
    }

    /// Token authenticating proxied user traffic to the sandbox.
    pub fn traffic_token(&self, sandbox_id: &str) -> String {
        self.derive(&format!("{TRAFFIC_PREFIX}{sandbox_id}"))
    }
}

//! Seams for the external captcha verifier and TOTP validator.

use async_trait::async_trait;

use collabvm_proto::CaptchaSettings;

use crate::guard::Guard;

/// The TLS-backed captcha service. The production implementation posts the
/// token to the configured endpoint; tests substitute a canned answer.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str, ip: &str) -> bool;
}

/// Accepts every token. Used when no verifier is wired up.
pub struct AcceptAllCaptcha;

#[async_trait]
impl CaptchaVerifier for AcceptAllCaptcha {
    async fn verify(&self, _token: &str, _ip: &str) -> bool {
        true
    }
}

/// Applies the current captcha settings in front of the verifier: when
/// captchas are disabled every token passes without a network round trip.
pub struct CaptchaGate {
    settings: Guard<CaptchaSettings>,
    verifier: Box<dyn CaptchaVerifier>,
}

impl CaptchaGate {
    pub fn new(verifier: Box<dyn CaptchaVerifier>) -> Self {
        Self {
            settings: Guard::new(CaptchaSettings::default()),
            verifier,
        }
    }

    pub async fn set_settings(&self, settings: CaptchaSettings) {
        self.settings.dispatch(move |s| *s = settings).await;
    }

    pub async fn verify(&self, token: &str, ip: &str) -> bool {
        let enabled = self.settings.dispatch(|s| s.enabled).await;
        if !enabled {
            return true;
        }
        self.verifier.verify(token, ip).await
    }
}

/// The external TOTP validator consulted during two-factor login.
pub trait TotpValidator: Send + Sync {
    fn validate(&self, key: &[u8], code: u32) -> bool;
}

/// Rejects every code; deployments wire a real validator through
/// [`ServerDeps`](crate::server::ServerDeps).
pub struct RejectAllTotp;

impl TotpValidator for RejectAllTotp {
    fn validate(&self, _key: &[u8], _code: u32) -> bool {
        tracing::warn!("two-factor login attempted without a TOTP validator");
        false
    }
}

#[cfg(test)]
pub struct AcceptAllTotp;

#[cfg(test)]
impl TotpValidator for AcceptAllTotp {
    fn validate(&self, _key: &[u8], _code: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectingVerifier;

    #[async_trait]
    impl CaptchaVerifier for RejectingVerifier {
        async fn verify(&self, _token: &str, _ip: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn disabled_captcha_passes_everything() {
        let gate = CaptchaGate::new(Box::new(RejectingVerifier));
        assert!(gate.verify("anything", "::1").await);
    }

    #[tokio::test]
    async fn enabled_captcha_delegates() {
        let gate = CaptchaGate::new(Box::new(RejectingVerifier));
        gate.set_settings(CaptchaSettings {
            enabled: true,
            ..CaptchaSettings::default()
        })
        .await;
        assert!(!gate.verify("anything", "::1").await);
    }
}

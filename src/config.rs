use anyhow::{Context, Result};

/// Runtime configuration for the gateway, loaded once at startup from the
/// environment and held immutably behind `Arc<AppState>` for the rest of
/// the process lifetime.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind address (e.g. "0.0.0.0:8443")
    pub listen_addr: String,

    /// SQLite database URL
    pub database_url: String,

    /// This service's own public URL, used to build the OIDC callback URI
    pub service_url: String,

    /// HMAC key signing `AuthState` and `InternalToken`
    pub internal_token_secret: String,

    /// AES-256 key encrypting the IdP `id_token` carried inside `AuthState`
    pub state_encryption_key: String,

    /// OIDC client id registered with the Identity Provider
    pub oidc_client_id: String,

    /// OIDC client secret registered with the Identity Provider
    pub oidc_client_secret: String,

    /// OIDC authority (issuer) URL, used for discovery
    pub oidc_authority_url: String,

    /// Path (not full URL) the IdP redirects back to after authorization
    pub oidc_login_callback_path: String,

    /// Optional language hint passed to the IdP authorize endpoint
    pub oidc_language: Option<String>,

    /// Name of the session cookie
    pub token_cookie_name: String,

    /// Cookie `Domain` attribute
    pub token_cookie_domain: String,

    /// Cookie `Path` attribute
    pub token_cookie_path: String,

    /// Set Secure flag on session cookies (env: SECURE_COOKIES, default: true).
    /// Set to false only for plain-HTTP dev instances.
    pub secure_cookies: bool,

    /// Directory containing `v<N>.md` terms-and-conditions documents
    pub terms_markdown_dir: String,

    /// Maximum age, in seconds, of a decoded `AuthState` before it is rejected
    pub auth_state_max_age_secs: i64,

    /// Lifetime, in seconds, of a minted `InternalToken` / `SessionToken`
    pub token_expiry_secs: i64,

    /// Enables `/token/create-test-token`. Never set in production.
    pub debug_endpoints: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8443".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./oidc-gateway.db".into()),
            service_url: std::env::var("SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8443".into()),
            internal_token_secret: std::env::var("INTERNAL_TOKEN_SECRET")
                .context("INTERNAL_TOKEN_SECRET must be set")?,
            state_encryption_key: std::env::var("STATE_ENCRYPTION_KEY")
                .context("STATE_ENCRYPTION_KEY must be set")?,
            oidc_client_id: std::env::var("OIDC_CLIENT_ID")
                .context("OIDC_CLIENT_ID must be set")?,
            oidc_client_secret: std::env::var("OIDC_CLIENT_SECRET")
                .context("OIDC_CLIENT_SECRET must be set")?,
            oidc_authority_url: std::env::var("OIDC_AUTHORITY_URL")
                .context("OIDC_AUTHORITY_URL must be set")?,
            oidc_login_callback_path: std::env::var("OIDC_LOGIN_CALLBACK_PATH")
                .unwrap_or_else(|_| "/oidc/login/callback".into()),
            oidc_language: std::env::var("OIDC_LANGUAGE").ok(),
            token_cookie_name: std::env::var("TOKEN_COOKIE_NAME")
                .unwrap_or_else(|_| "idp_token".into()),
            token_cookie_domain: std::env::var("TOKEN_COOKIE_DOMAIN")
                .unwrap_or_else(|_| "127.0.0.1".into()),
            token_cookie_path: std::env::var("TOKEN_COOKIE_PATH").unwrap_or_else(|_| "/".into()),
            secure_cookies: std::env::var("SECURE_COOKIES")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            terms_markdown_dir: std::env::var("TERMS_MARKDOWN_DIR")
                .unwrap_or_else(|_| "./terms".into()),
            auth_state_max_age_secs: std::env::var("AUTH_STATE_MAX_AGE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            token_expiry_secs: std::env::var("TOKEN_EXPIRY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            debug_endpoints: std::env::var("DEBUG_ENDPOINTS")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Absolute URL the IdP redirects back to after authorization.
    pub fn oidc_callback_url(&self) -> String {
        format!("{}{}", self.service_url, self.oidc_login_callback_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "LISTEN_ADDR",
            "DATABASE_URL",
            "SERVICE_URL",
            "INTERNAL_TOKEN_SECRET",
            "STATE_ENCRYPTION_KEY",
            "OIDC_CLIENT_ID",
            "OIDC_CLIENT_SECRET",
            "OIDC_AUTHORITY_URL",
            "OIDC_LOGIN_CALLBACK_PATH",
            "SECURE_COOKIES",
            "AUTH_STATE_MAX_AGE_SECS",
            "TOKEN_EXPIRY_SECS",
            "DEBUG_ENDPOINTS",
        ] {
            std::env::remove_var(key);
        }
    }

    fn set_required() {
        std::env::set_var("INTERNAL_TOKEN_SECRET", "s");
        std::env::set_var("STATE_ENCRYPTION_KEY", "k");
        std::env::set_var("OIDC_CLIENT_ID", "id");
        std::env::set_var("OIDC_CLIENT_SECRET", "secret");
        std::env::set_var("OIDC_AUTHORITY_URL", "https://idp.example");
    }

    #[test]
    fn missing_required_var_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let result = AppConfig::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_required();

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8443");
        assert!(config.secure_cookies);
        assert_eq!(config.auth_state_max_age_secs, 900);
        assert_eq!(config.token_expiry_secs, 3600);
        assert!(!config.debug_endpoints);
        clear_env();
    }

    #[test]
    fn oidc_callback_url_joins_service_url_and_path() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("SERVICE_URL", "https://auth.example.com");
        std::env::set_var("OIDC_LOGIN_CALLBACK_PATH", "/oidc/login/callback");
        set_required();

        let config = AppConfig::from_env().unwrap();
        assert_eq!(
            config.oidc_callback_url(),
            "https://auth.example.com/oidc/login/callback"
        );
        clear_env();
    }

    #[test]
    fn secure_cookies_false_when_explicitly_disabled() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_required();
        std::env::set_var("SECURE_COOKIES", "false");

        let config = AppConfig::from_env().unwrap();
        assert!(!config.secure_cookies);
        clear_env();
    }
}

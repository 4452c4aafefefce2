//! IdP adapter (C3): one OpenID Connect relying-party session against a
//! single, statically configured Identity Provider.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use openidconnect::core::{
    CoreAuthDisplay, CoreAuthPrompt, CoreAuthenticationFlow, CoreErrorResponseType, CoreGenderClaim,
    CoreIdTokenVerifier, CoreJsonWebKey, CoreJweContentEncryptionAlgorithm, CoreJwsSigningAlgorithm,
    CoreProviderMetadata, CoreRevocableToken, CoreTokenType,
};
use openidconnect::{
    AccessTokenHash, AdditionalClaims, AuthorizationCode, Client, ClientId, ClientSecret,
    CsrfToken as OidcCsrfToken, EmptyExtraTokenFields, EndpointMaybeSet, EndpointNotSet,
    EndpointSet, ExtraTokenFields, IdToken, IdTokenFields, IssuerUrl, Nonce, OAuth2TokenResponse,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RevocationErrorResponseType, Scope,
    StandardErrorResponse, StandardTokenIntrospectionResponse, StandardTokenResponse, TokenResponse,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::config::AppConfig;

/// Claims this IdP attaches beyond the standard OIDC set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DanishIdClaims {
    /// The identity provider actually used behind the broker, e.g. `mitid`.
    #[serde(default)]
    pub idp: Option<String>,
    #[serde(default)]
    pub tin: Option<String>,
    #[serde(default)]
    pub ssn: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub is_company: Option<bool>,
}

impl AdditionalClaims for DanishIdClaims {}

/// The extra top-level token-response field this IdP returns alongside the
/// standard `id_token`/`access_token`: a second signed JWT carrying the same
/// claim set, checked against the same JWKS as the id_token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DanishExtraFields {
    #[serde(default)]
    pub userinfo_token: Option<String>,
}

impl ExtraTokenFields for DanishExtraFields {}

type DanishIdTokenFields = IdTokenFields<
    DanishIdClaims,
    DanishExtraFields,
    CoreGenderClaim,
    CoreJweContentEncryptionAlgorithm,
    CoreJwsSigningAlgorithm,
>;

type DanishTokenResponse = StandardTokenResponse<DanishIdTokenFields, CoreTokenType>;

/// A bare `IdToken` parse target for `userinfo_token`, which arrives as a
/// raw JWT string rather than nested inside a typed token response.
type DanishUserinfoToken = IdToken<
    DanishIdClaims,
    CoreGenderClaim,
    CoreJweContentEncryptionAlgorithm,
    CoreJwsSigningAlgorithm,
>;

/// The full `openidconnect::Client` instantiation for this IdP: every
/// generic is the Core default except the token-response shape, which
/// carries `userinfo_token` alongside the standard `id_token`.
type DanishClient = Client<
    DanishIdClaims,
    CoreAuthDisplay,
    CoreGenderClaim,
    CoreJweContentEncryptionAlgorithm,
    CoreJsonWebKey,
    CoreAuthPrompt,
    StandardErrorResponse<CoreErrorResponseType>,
    DanishTokenResponse,
    StandardTokenIntrospectionResponse<EmptyExtraTokenFields, CoreTokenType>,
    CoreRevocableToken,
    StandardErrorResponse<RevocationErrorResponseType>,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointMaybeSet,
    EndpointMaybeSet,
>;

/// The result of a completed authorization-code exchange, already verified
/// against the IdP's JWKS.
#[derive(Debug, Clone)]
pub struct IdpToken {
    pub subject: String,
    pub provider: String,
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub scope: Vec<String>,
    /// The raw, unencrypted id_token. Callers encrypt it before it's placed
    /// in `AuthState` or a `SessionToken`.
    pub id_token: String,
    pub ssn: Option<String>,
    pub tin: Option<String>,
    pub is_private: bool,
    pub is_company: bool,
}

/// One configured OpenID Connect relying-party session.
pub struct IdpAdapter {
    client_id: String,
    client_secret: String,
    authority_url: String,
    http: reqwest::Client,
    /// Cached discovery document, refreshed once its TTL lapses.
    metadata_cache: Cache<String, CoreProviderMetadata>,
}

impl IdpAdapter {
    pub fn new(config: &AppConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client with fixed timeout always builds");

        Self {
            client_id: config.oidc_client_id.clone(),
            client_secret: config.oidc_client_secret.clone(),
            authority_url: config.oidc_authority_url.clone(),
            http,
            metadata_cache: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .max_capacity(4)
                .build(),
        }
    }

    async fn discover(&self) -> anyhow::Result<CoreProviderMetadata> {
        if let Some(cached) = self.metadata_cache.get(&self.authority_url).await {
            return Ok(cached);
        }
        let issuer = IssuerUrl::new(self.authority_url.clone())?;
        let metadata = CoreProviderMetadata::discover_async(issuer, &self.http).await?;
        self.metadata_cache
            .insert(self.authority_url.clone(), metadata.clone())
            .await;
        Ok(metadata)
    }

    async fn client(&self, callback_uri: &str) -> anyhow::Result<DanishClient> {
        let metadata = self.discover().await?;
        Ok(Client::from_provider_metadata(
            metadata,
            ClientId::new(self.client_id.clone()),
            Some(ClientSecret::new(self.client_secret.clone())),
        )
        .set_redirect_uri(RedirectUrl::new(callback_uri.to_string())?))
    }

    /// Build the IdP authorize-endpoint URL. Returns the URL along with the
    /// PKCE verifier the caller must persist (in `OidcAuthState`) until the
    /// callback completes the exchange.
    pub async fn create_authorization_url(
        &self,
        state: String,
        callback_uri: &str,
        validate_ssn: bool,
        language: Option<&str>,
    ) -> anyhow::Result<(Url, PkceCodeVerifier)> {
        let client = self.client(callback_uri).await?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut scopes = vec![Scope::new("openid".into()), Scope::new("userinfo_token".into())];
        if validate_ssn {
            scopes.push(Scope::new("ssn".into()));
        }

        let mut request = client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                move || OidcCsrfToken::new(state.clone()),
                Nonce::new_random,
            )
            .add_scopes(scopes)
            .set_pkce_challenge(pkce_challenge);

        if let Some(lang) = language {
            request = request.add_extra_param("ui_locales", lang);
        }

        let (url, _csrf, _nonce) = request.url();
        Ok((url, pkce_verifier))
    }

    /// Exchange an authorization code for IdP tokens, verifying both the
    /// `id_token` and `userinfo_token` signatures against the cached JWKS.
    pub async fn fetch_token(
        &self,
        code: &str,
        pkce_verifier: PkceCodeVerifier,
        callback_uri: &str,
    ) -> anyhow::Result<IdpToken> {
        let client = self.client(callback_uri).await?;

        let token_response: DanishTokenResponse = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .map_err(|e| anyhow::anyhow!("token endpoint not configured: {e}"))?
            .set_pkce_verifier(pkce_verifier)
            .request_async(&self.http)
            .await
            .map_err(|e| anyhow::anyhow!("token exchange failed: {e}"))?;

        let verifier: CoreIdTokenVerifier = client.id_token_verifier();

        let id_token = token_response
            .id_token()
            .ok_or_else(|| anyhow::anyhow!("IdP response carried no id_token"))?;
        let id_claims = id_token
            .claims(&verifier, |_: Option<&Nonce>| Ok(()))
            .map_err(|e| anyhow::anyhow!("id_token verification failed: {e}"))?;

        if let Some(expected_hash) = id_claims.access_token_hash() {
            let actual = AccessTokenHash::from_token(
                token_response.access_token(),
                id_token.signing_alg()?,
                id_token.signing_key(&verifier)?,
            )?;
            if actual != *expected_hash {
                anyhow::bail!("access_token hash mismatch");
            }
        }

        let userinfo_token_raw = token_response
            .extra_fields()
            .extra_fields
            .userinfo_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("IdP response carried no userinfo_token"))?;
        let userinfo_token: DanishUserinfoToken =
            serde_json::from_value(serde_json::Value::String(userinfo_token_raw))?;
        let userinfo_claims = userinfo_token
            .claims(&verifier, |_: Option<&Nonce>| Ok(()))
            .map_err(|e| anyhow::anyhow!("userinfo_token verification failed: {e}"))?;

        let additional = userinfo_claims.additional_claims();
        let provider = additional
            .idp
            .clone()
            .ok_or_else(|| anyhow::anyhow!("userinfo_token missing required idp claim"))?;

        Ok(IdpToken {
            subject: id_claims.subject().to_string(),
            provider,
            issued: id_claims.issue_time(),
            expires: id_claims.expiration(),
            scope: token_response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            id_token: id_token.to_string(),
            ssn: additional.ssn.clone(),
            tin: additional.tin.clone(),
            is_private: additional.is_private.unwrap_or(false),
            is_company: additional.is_company.unwrap_or(false),
        })
    }

    /// Invoke the IdP's back-channel logout endpoint. Best-effort: failures
    /// are logged and swallowed, the local logout still succeeds.
    ///
    /// The logout endpoint is derived from the authority URL by convention
    /// rather than discovered, since `end_session_endpoint` sits outside the
    /// standard OIDC discovery document this IdP publishes.
    pub async fn logout(&self, id_token: &str) {
        let logout_url = format!("{}/logout", self.authority_url.trim_end_matches('/'));

        let result = self
            .http
            .post(&logout_url)
            .json(&serde_json::json!({ "id_token": id_token }))
            .send()
            .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, "IdP back-channel logout failed, continuing local logout");
        }
    }
}

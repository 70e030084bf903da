//! Provider credential resolution and keyring-backed user tokens.

use std::sync::{Arc, Mutex};

use keyring::Entry;
use log::{debug, warn};

use crate::config::EnrichmentConfig;
use crate::enrichment::transport::{AbortSignal, HttpRequest, HttpTransport};

const TOKEN_SERVICE_NAME: &str = "spotlight.enrichment.provider";

/// A provider credential. Bearer tokens travel in `Authorization`,
/// API keys in the `api_key` query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl Credential {
    /// Classifies a raw token. A JWT (two dots) is a bearer token.
    pub fn from_token(token: &str) -> Option<Self> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.matches('.').count() == 2 {
            Some(Self::Bearer(trimmed.to_string()))
        } else {
            Some(Self::ApiKey(trimmed.to_string()))
        }
    }

    pub fn apply(&self, url: &mut String, headers: &mut Vec<(String, String)>) {
        match self {
            Self::Bearer(token) => {
                headers.push(("Authorization".to_string(), format!("Bearer {token}")));
            }
            Self::ApiKey(key) => {
                url.push(if url.contains('?') { '&' } else { '?' });
                url.push_str("api_key=");
                url.push_str(urlencoding::encode(key).as_ref());
            }
        }
    }
}

/// Where a resolved credential came from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit,
    Settings,
    UserToken,
    RemoteConfig,
    Fallback,
}

/// Persisted per-user provider token.
pub trait TokenStore: Send + Sync {
    fn load_token(&self, account: &str) -> Result<Option<String>, String>;
}

/// Stores user tokens in the OS keyring.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringTokenStore;

impl KeyringTokenStore {
    fn entry(account: &str) -> Result<Entry, String> {
        Entry::new(TOKEN_SERVICE_NAME, account)
            .map_err(|err| format!("failed to create keyring entry: {err}"))
    }

    pub fn save_token(&self, account: &str, token: &str) -> Result<(), String> {
        Self::entry(account)?
            .set_password(token)
            .map_err(|err| format!("failed to set keyring token: {err}"))
    }

    pub fn delete_token(&self, account: &str) -> Result<(), String> {
        match Self::entry(account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(format!("failed to delete keyring token: {err}")),
        }
    }
}

impl TokenStore for KeyringTokenStore {
    fn load_token(&self, account: &str) -> Result<Option<String>, String> {
        match Self::entry(account)?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(format!("failed to get keyring token: {err}")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoTokenStore;

impl TokenStore for NoTokenStore {
    fn load_token(&self, _account: &str) -> Result<Option<String>, String> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteCredentials {
    #[serde(default, alias = "bearer", alias = "readAccessToken")]
    bearer_token: Option<String>,
    #[serde(default, alias = "api_key", alias = "key")]
    api_key: Option<String>,
}

/// Remote config document: credentials at the top level or under `tmdb`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RemoteConfigDocument {
    #[serde(default)]
    tmdb: Option<RemoteCredentials>,
    #[serde(flatten)]
    top_level: RemoteCredentials,
}

impl RemoteConfigDocument {
    fn credential(&self) -> Option<Credential> {
        [self.tmdb.as_ref(), Some(&self.top_level)]
            .into_iter()
            .flatten()
            .find_map(|credentials| {
                credentials
                    .bearer_token
                    .as_deref()
                    .and_then(Credential::from_token)
                    .map(|credential| match credential {
                        Credential::ApiKey(token) => Credential::Bearer(token),
                        bearer => bearer,
                    })
                    .or_else(|| {
                        credentials
                            .api_key
                            .as_deref()
                            .and_then(Credential::from_token)
                    })
            })
    }
}

/// Resolves credentials: explicit, settings, user token, remote config, fallback.
pub struct CredentialResolver {
    settings_credential: Option<Credential>,
    keyring_account: String,
    remote_config_url: Option<String>,
    fallback: Option<Credential>,
    token_store: Arc<dyn TokenStore>,
    remote: Mutex<Option<Option<Credential>>>,
}

impl CredentialResolver {
    pub fn new(config: &EnrichmentConfig, token_store: Arc<dyn TokenStore>) -> Self {
        let settings_credential = config
            .bearer_token
            .as_deref()
            .and_then(Credential::from_token)
            .map(|credential| match credential {
                Credential::ApiKey(token) => Credential::Bearer(token),
                bearer => bearer,
            })
            .or_else(|| config.api_key.as_deref().and_then(Credential::from_token));
        Self {
            settings_credential,
            keyring_account: config.keyring_account.clone(),
            remote_config_url: config
                .remote_config_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
            fallback: config
                .fallback_api_key
                .as_deref()
                .and_then(Credential::from_token),
            token_store,
            remote: Mutex::new(None),
        }
    }

    pub fn resolve(
        &self,
        explicit: Option<&Credential>,
        transport: &dyn HttpTransport,
        abort: &AbortSignal,
    ) -> Option<(Credential, CredentialSource)> {
        if let Some(credential) = explicit {
            return Some((credential.clone(), CredentialSource::Explicit));
        }
        if let Some(credential) = &self.settings_credential {
            return Some((credential.clone(), CredentialSource::Settings));
        }
        match self.token_store.load_token(&self.keyring_account) {
            Ok(Some(token)) => {
                if let Some(credential) = Credential::from_token(&token) {
                    return Some((credential, CredentialSource::UserToken));
                }
            }
            Ok(None) => {}
            Err(error) => warn!("Enrichment: user token unavailable: {}", error),
        }
        if let Some(credential) = self.remote_credential(transport, abort) {
            return Some((credential, CredentialSource::RemoteConfig));
        }
        self.fallback
            .clone()
            .map(|credential| (credential, CredentialSource::Fallback))
    }

    /// Fetched at most once per resolver once an exchange completes.
    fn remote_credential(
        &self,
        transport: &dyn HttpTransport,
        abort: &AbortSignal,
    ) -> Option<Credential> {
        let url = self.remote_config_url.as_ref()?;
        let Ok(mut cached) = self.remote.lock() else {
            warn!("Enrichment: remote credential cache lock poisoned");
            return None;
        };
        if let Some(resolved) = cached.as_ref() {
            return resolved.clone();
        }
        let request = HttpRequest {
            url: url.clone(),
            headers: Vec::new(),
        };
        let response = match transport.get(&request, abort) {
            Ok(response) => response,
            Err(error) => {
                warn!("Enrichment: remote config fetch failed: {}", error);
                return None;
            }
        };
        let resolved = if (200..300).contains(&response.status) {
            match serde_json::from_str::<RemoteConfigDocument>(&response.body) {
                Ok(document) => document.credential(),
                Err(error) => {
                    warn!("Enrichment: remote config is not valid JSON: {}", error);
                    None
                }
            }
        } else {
            warn!(
                "Enrichment: remote config returned HTTP {}",
                response.status
            );
            None
        };
        debug!(
            "Enrichment: remote config resolved credential: {}",
            resolved.is_some()
        );
        *cached = Some(resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Credential, CredentialResolver, CredentialSource, NoTokenStore, TokenStore};
    use crate::config::EnrichmentConfig;
    use crate::enrichment::testing::ScriptedTransport;
    use crate::enrichment::transport::AbortSignal;

    struct FixedTokenStore(&'static str);

    impl TokenStore for FixedTokenStore {
        fn load_token(&self, _account: &str) -> Result<Option<String>, String> {
            Ok(Some(self.0.to_string()))
        }
    }

    #[test]
    fn test_token_classification_and_placement() {
        let bearer = Credential::from_token("aaa.bbb.ccc").expect("token");
        assert_eq!(bearer, Credential::Bearer("aaa.bbb.ccc".to_string()));
        let key = Credential::from_token(" abc123 ").expect("token");
        assert_eq!(key, Credential::ApiKey("abc123".to_string()));
        assert_eq!(Credential::from_token("  "), None);

        let mut url = "https://example.test/movie/1?language=en-US".to_string();
        let mut headers = Vec::new();
        key.apply(&mut url, &mut headers);
        assert!(url.ends_with("&api_key=abc123"));
        assert!(headers.is_empty());

        let mut url = "https://example.test/movie/1".to_string();
        bearer.apply(&mut url, &mut headers);
        assert_eq!(url, "https://example.test/movie/1");
        assert_eq!(
            headers,
            vec![("Authorization".to_string(), "Bearer aaa.bbb.ccc".to_string())]
        );
    }

    #[test]
    fn test_resolution_order_prefers_settings_over_user_token() {
        let transport = ScriptedTransport::new();
        let abort = AbortSignal::new();
        let config = EnrichmentConfig {
            api_key: Some("settings-key".to_string()),
            ..EnrichmentConfig::default()
        };
        let resolver = CredentialResolver::new(&config, Arc::new(FixedTokenStore("user-key")));
        let (credential, source) = resolver.resolve(None, &transport, &abort).expect("credential");
        assert_eq!(credential, Credential::ApiKey("settings-key".to_string()));
        assert_eq!(source, CredentialSource::Settings);

        let explicit = Credential::ApiKey("explicit".to_string());
        let (_, source) = resolver
            .resolve(Some(&explicit), &transport, &abort)
            .expect("credential");
        assert_eq!(source, CredentialSource::Explicit);

        let resolver = CredentialResolver::new(
            &EnrichmentConfig::default(),
            Arc::new(FixedTokenStore("user-key")),
        );
        let (_, source) = resolver.resolve(None, &transport, &abort).expect("credential");
        assert_eq!(source, CredentialSource::UserToken);
    }

    #[test]
    fn test_remote_config_is_fetched_once_then_fallback_used() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, r#"{"tmdb": {"bearerToken": "remote-read-token"}}"#);
        let abort = AbortSignal::new();
        let config = EnrichmentConfig {
            remote_config_url: Some("https://config.example.test/app.json".to_string()),
            fallback_api_key: Some("fallback".to_string()),
            ..EnrichmentConfig::default()
        };
        let resolver = CredentialResolver::new(&config, Arc::new(NoTokenStore));
        for _ in 0..3 {
            let (credential, source) =
                resolver.resolve(None, &transport, &abort).expect("credential");
            assert_eq!(
                credential,
                Credential::Bearer("remote-read-token".to_string())
            );
            assert_eq!(source, CredentialSource::RemoteConfig);
        }
        assert_eq!(transport.request_count(), 1);

        let transport = ScriptedTransport::new();
        transport.push_json(200, "{}");
        let resolver = CredentialResolver::new(&config, Arc::new(NoTokenStore));
        let (credential, source) = resolver.resolve(None, &transport, &abort).expect("credential");
        assert_eq!(credential, Credential::ApiKey("fallback".to_string()));
        assert_eq!(source, CredentialSource::Fallback);
    }

    #[test]
    fn test_no_credential_anywhere_resolves_to_none() {
        let transport = ScriptedTransport::new();
        let resolver = CredentialResolver::new(&EnrichmentConfig::default(), Arc::new(NoTokenStore));
        assert!(resolver
            .resolve(None, &transport, &AbortSignal::new())
            .is_none());
        assert_eq!(transport.request_count(), 0);
    }
}

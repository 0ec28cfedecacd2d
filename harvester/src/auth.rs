use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use harvester_core::{Error, Result};
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::timefmt;

/// Buffer subtracted from an expiry before a credential counts as usable, so
/// a token cannot lapse in the middle of a fetch cycle.
pub const EXPIRY_GRACE_SECS: i64 = 10;

/// Identity used for the password grant.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub username: String,
    pub password: String,
    pub scope: String,
    pub client_id: String,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    client_id: &'a str,
}

/// Response shape shared by the authorize and refresh endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(deserialize_with = "timefmt::deserialize")]
    pub expires: DateTime<FixedOffset>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "timefmt::deserialize_opt")]
    pub refresh_until: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone)]
struct Credential {
    access_token: String,
    access_expiry: DateTime<FixedOffset>,
    refresh_token: Option<String>,
    refresh_expiry: Option<DateTime<FixedOffset>>,
}

impl Credential {
    fn from_grant(grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            access_expiry: grant.expires,
            refresh_token: grant.refresh_token,
            refresh_expiry: grant.refresh_until,
        }
    }

    fn access_usable(&self, now: DateTime<Utc>) -> bool {
        now < self.access_expiry - Duration::seconds(EXPIRY_GRACE_SECS)
    }

    fn refresh_usable(&self, now: DateTime<Utc>) -> bool {
        match (&self.refresh_token, self.refresh_expiry) {
            (Some(_), Some(until)) => now < until - Duration::seconds(EXPIRY_GRACE_SECS),
            _ => false,
        }
    }
}

/// Transport seam for the two token endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn authenticate(&self, principal: &Principal) -> Result<TokenGrant>;
    async fn refresh(&self, refresh_token: &str, client_id: &str) -> Result<TokenGrant>;
}

pub struct HttpAuthClient {
    http: Client,
    base_url: String,
}

impl HttpAuthClient {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

#[async_trait]
impl AuthApi for HttpAuthClient {
    async fn authenticate(&self, principal: &Principal) -> Result<TokenGrant> {
        let url = format!("{}/authorize", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(principal)
            .send()
            .await
            .map_err(|e| Error::Auth {
                grant: "password",
                details: e.to_string(),
            })?;
        grant_from_response(response, "password").await
    }

    async fn refresh(&self, refresh_token: &str, client_id: &str) -> Result<TokenGrant> {
        let url = format!("{}/authorize/token", self.base_url);
        let body = RefreshRequest {
            refresh_token,
            client_id,
        };
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Auth {
                grant: "refresh_token",
                details: e.to_string(),
            })?;
        grant_from_response(response, "refresh_token").await
    }
}

async fn grant_from_response(response: reqwest::Response, grant: &'static str) -> Result<TokenGrant> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Auth {
            grant,
            details: format!("server returned {status}"),
        });
    }
    response.json::<TokenGrant>().await.map_err(|e| Error::Auth {
        grant,
        details: format!("bad grant body: {e}"),
    })
}

/// Owns one credential and its validity windows for one poller instance.
///
/// Decision order per call: reuse the cached token while its access window
/// (minus grace) is open; refresh while only the refresh window is open;
/// otherwise authenticate from scratch. Every failure is absorbed here: the
/// credential resets to absent and the caller sees `None`, meaning skip the
/// cycle.
pub struct CredentialManager {
    api: Arc<dyn AuthApi>,
    principal: Principal,
    credential: Option<Credential>,
}

impl CredentialManager {
    pub fn new(api: Arc<dyn AuthApi>, principal: Principal) -> Self {
        Self {
            api,
            principal,
            credential: None,
        }
    }

    pub async fn obtain_token(&mut self) -> Option<String> {
        let now = Utc::now();

        if let Some(credential) = &self.credential {
            if credential.access_usable(now) {
                return Some(credential.access_token.clone());
            }
        }

        let attempt = match &self.credential {
            Some(credential) if credential.refresh_usable(now) => {
                counter!("harvester_auth_requests", "grant" => "refresh_token").increment(1);
                // refresh tokens are single use; success replaces every field
                self.api
                    .refresh(
                        credential.refresh_token.as_deref().unwrap_or_default(),
                        &self.principal.client_id,
                    )
                    .await
            }
            _ => {
                counter!("harvester_auth_requests", "grant" => "password").increment(1);
                self.api.authenticate(&self.principal).await
            }
        };

        match attempt {
            Ok(grant) => {
                let credential = Credential::from_grant(grant);
                let token = credential.access_token.clone();
                debug!(access_expiry = %credential.access_expiry, "credential stored");
                self.credential = Some(credential);
                Some(token)
            }
            Err(error) => {
                counter!("harvester_auth_failures").increment(1);
                warn!(%error, "authentication failed, skipping cycle");
                self.credential = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Outcome {
        Grant(TokenGrant),
        Deny,
    }

    struct ScriptedApi {
        outcomes: Mutex<Vec<Outcome>>,
        authenticate_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        last_refresh_token: Mutex<Option<String>>,
    }

    impl ScriptedApi {
        fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                authenticate_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                last_refresh_token: Mutex::new(None),
            })
        }

        fn next(&self, grant: &'static str) -> Result<TokenGrant> {
            match self.outcomes.lock().unwrap().remove(0) {
                Outcome::Grant(grant) => Ok(grant),
                Outcome::Deny => Err(Error::Auth {
                    grant,
                    details: "denied".to_string(),
                }),
            }
        }
    }

    #[async_trait]
    impl AuthApi for ScriptedApi {
        async fn authenticate(&self, _principal: &Principal) -> Result<TokenGrant> {
            self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
            self.next("password")
        }

        async fn refresh(&self, refresh_token: &str, _client_id: &str) -> Result<TokenGrant> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_refresh_token.lock().unwrap() = Some(refresh_token.to_string());
            self.next("refresh_token")
        }
    }

    fn grant(token: &str, access_secs: i64, refresh: Option<(&str, i64)>) -> Outcome {
        let now = Utc::now();
        Outcome::Grant(TokenGrant {
            access_token: token.to_string(),
            expires: (now + Duration::seconds(access_secs)).fixed_offset(),
            refresh_token: refresh.map(|(t, _)| t.to_string()),
            refresh_until: refresh.map(|(_, secs)| (now + Duration::seconds(secs)).fixed_offset()),
        })
    }

    fn manager(api: Arc<ScriptedApi>) -> CredentialManager {
        CredentialManager::new(
            api,
            Principal {
                username: "svc-harvester".to_string(),
                password: "secret".to_string(),
                scope: "events:read".to_string(),
                client_id: "logharvest".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn reuse_within_the_access_window_issues_no_network_calls() {
        let api = ScriptedApi::new(vec![grant("tok-1", 3600, Some(("r-1", 86400)))]);
        let mut manager = manager(Arc::clone(&api));

        let first = manager.obtain_token().await;
        let second = manager.obtain_token().await;

        assert_eq!(first.as_deref(), Some("tok-1"));
        assert_eq!(second.as_deref(), Some("tok-1"));
        assert_eq!(api.authenticate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refreshes_once_the_access_window_lapses() {
        let api = ScriptedApi::new(vec![
            grant("tok-1", 0, Some(("r-1", 86400))),
            grant("tok-2", 3600, Some(("r-2", 86400))),
        ]);
        let mut manager = manager(Arc::clone(&api));

        let first = manager.obtain_token().await.unwrap();
        let second = manager.obtain_token().await.unwrap();

        assert_eq!(first, "tok-1");
        assert_eq!(second, "tok-2");
        assert_eq!(api.authenticate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        // the exchange used the single-use secret from the first grant
        assert_eq!(
            api.last_refresh_token.lock().unwrap().as_deref(),
            Some("r-1")
        );
    }

    #[tokio::test]
    async fn refresh_secret_is_replaced_on_each_exchange() {
        let api = ScriptedApi::new(vec![
            grant("tok-1", 0, Some(("r-1", 86400))),
            grant("tok-2", 0, Some(("r-2", 86400))),
            grant("tok-3", 3600, Some(("r-3", 86400))),
        ]);
        let mut manager = manager(Arc::clone(&api));

        manager.obtain_token().await;
        manager.obtain_token().await;
        manager.obtain_token().await;

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            api.last_refresh_token.lock().unwrap().as_deref(),
            Some("r-2")
        );
    }

    #[tokio::test]
    async fn both_windows_expired_falls_back_to_full_authentication() {
        let api = ScriptedApi::new(vec![
            grant("tok-1", 0, Some(("r-1", 0))),
            grant("tok-2", 3600, Some(("r-2", 86400))),
        ]);
        let mut manager = manager(Arc::clone(&api));

        manager.obtain_token().await;
        let second = manager.obtain_token().await;

        assert_eq!(second.as_deref(), Some("tok-2"));
        assert_eq!(api.authenticate_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn grace_period_treats_a_nearly_expired_token_as_stale() {
        // access window of 5s is inside the 10s grace, so the second call
        // must not reuse the cached token
        let api = ScriptedApi::new(vec![
            grant("tok-1", 5, None),
            grant("tok-2", 3600, None),
        ]);
        let mut manager = manager(Arc::clone(&api));

        manager.obtain_token().await;
        let second = manager.obtain_token().await;

        assert_eq!(second.as_deref(), Some("tok-2"));
        assert_eq!(api.authenticate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_resets_the_credential_and_reports_none() {
        let api = ScriptedApi::new(vec![Outcome::Deny, grant("tok-1", 3600, None)]);
        let mut manager = manager(Arc::clone(&api));

        assert_eq!(manager.obtain_token().await, None);
        // next cycle starts from scratch with a fresh password grant
        assert_eq!(manager.obtain_token().await.as_deref(), Some("tok-1"));
        assert_eq!(api.authenticate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_recovers_with_a_password_grant_next_cycle() {
        let api = ScriptedApi::new(vec![
            grant("tok-1", 0, Some(("r-1", 86400))),
            Outcome::Deny,
            grant("tok-3", 3600, None),
        ]);
        let mut manager = manager(Arc::clone(&api));

        assert!(manager.obtain_token().await.is_some());
        assert_eq!(manager.obtain_token().await, None);
        assert_eq!(manager.obtain_token().await.as_deref(), Some("tok-3"));

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.authenticate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_refresh_secret_goes_straight_to_the_password_grant() {
        let api = ScriptedApi::new(vec![
            grant("tok-1", 0, None),
            grant("tok-2", 3600, None),
        ]);
        let mut manager = manager(Arc::clone(&api));

        manager.obtain_token().await;
        manager.obtain_token().await;

        assert_eq!(api.authenticate_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn http_client_posts_the_principal_and_parses_epoch_expiries() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/authorize")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"username":"svc-harvester","client_id":"logharvest"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "tok-http",
                    "expires": 1893456000,
                    "refresh_token": "r-http",
                    "refresh_until": "/Date(1893456000000)/"
                }"#,
            )
            .create_async()
            .await;

        let client = HttpAuthClient::new(Client::new(), server.url());
        let principal = Principal {
            username: "svc-harvester".to_string(),
            password: "secret".to_string(),
            scope: "events:read".to_string(),
            client_id: "logharvest".to_string(),
        };
        let grant = client.authenticate(&principal).await.unwrap();

        assert_eq!(grant.access_token, "tok-http");
        assert_eq!(
            grant.expires,
            DateTime::parse_from_rfc3339("2030-01-01T00:00:00+00:00").unwrap()
        );
        assert_eq!(grant.refresh_token.as_deref(), Some("r-http"));
        assert_eq!(grant.refresh_until, Some(grant.expires));
    }

    #[tokio::test]
    async fn http_client_exchanges_the_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/authorize/token")
            .match_body(mockito::Matcher::JsonString(
                r#"{"refresh_token":"r-old","client_id":"logharvest"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok-new","expires":1893456000}"#)
            .create_async()
            .await;

        let client = HttpAuthClient::new(Client::new(), server.url());
        let grant = client.refresh("r-old", "logharvest").await.unwrap();

        assert_eq!(grant.access_token, "tok-new");
        assert_eq!(grant.refresh_token, None);
    }

    #[tokio::test]
    async fn http_client_maps_denial_to_an_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/authorize")
            .with_status(401)
            .create_async()
            .await;

        let client = HttpAuthClient::new(Client::new(), server.url());
        let principal = Principal {
            username: "svc-harvester".to_string(),
            password: "wrong".to_string(),
            scope: "events:read".to_string(),
            client_id: "logharvest".to_string(),
        };

        match client.authenticate(&principal).await {
            Err(Error::Auth { grant, .. }) => assert_eq!(grant, "password"),
            other => panic!("expected auth error, got {other:?}"),
        }
    }
}

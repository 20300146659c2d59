//! Steam Web API and store client.
//!
//! Implements the catalog and redemption collaborators over `reqwest`.
//! Session material (the store `sessionid` and `steamLoginSecure` cookies)
//! and the Web API key are supplied by the caller; this client never signs in.

use async_trait::async_trait;
use reqwest::header::{COOKIE, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use redeemer_core::catalog::{AppPage, CatalogSource, OwnedApps};
use redeemer_core::error::{CatalogError, SessionError};
use redeemer_core::model::{CatalogEntry, redact_key};
use redeemer_core::redemption::{PlatformRedeemer, RedeemResponse};
use redeemer_core::{Error, Result};

pub const API_BASE: &str = "https://api.steampowered.com";
pub const STORE_BASE: &str = "https://store.steampowered.com";

const STORE_SERVICE: &str = "Steam store";
const API_SERVICE: &str = "Steam Web API";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `purchase_result_details` codes with a specific meaning.
pub mod codes {
    pub const ALREADY_OWNED: i64 = 9;
    pub const REGION_LOCKED: i64 = 13;
    pub const INVALID_KEY: i64 = 14;
    pub const ACTIVATED_ELSEWHERE: i64 = 15;
    pub const BASE_GAME_REQUIRED: i64 = 24;
    pub const PS3_REQUIRED: i64 = 36;
    pub const WALLET_CODE: i64 = 50;
    pub const RATE_LIMITED: i64 = 53;
}

/// User-facing explanation for a redemption failure code.
#[must_use]
pub fn code_message(code: i64) -> String {
    match code {
        codes::ALREADY_OWNED => "this account already owns the product".to_string(),
        codes::REGION_LOCKED => "product is not available in this country".to_string(),
        codes::INVALID_KEY => "product code is not valid".to_string(),
        codes::ACTIVATED_ELSEWHERE => "product code was activated by a different account".to_string(),
        codes::BASE_GAME_REQUIRED => "product code requires ownership of another product".to_string(),
        codes::PS3_REQUIRED => "product code must first be played on PlayStation 3".to_string(),
        codes::WALLET_CODE => "code is a wallet or gift card code".to_string(),
        codes::RATE_LIMITED => "too many recent activation attempts".to_string(),
        other => format!("unexpected redemption failure (code {other})"),
    }
}

/// Classify one `ajaxregisterkey` answer.
///
/// `body` is `None` when the response was not JSON. A signed-out session is
/// answered with a redirect to the login page. A failure without a result
/// code is treated as rate limiting, which is what the store does when it
/// throttles silently.
#[must_use]
pub fn map_redeem_response(status: u16, body: Option<&Value>) -> RedeemResponse {
    match status {
        300..=399 | 401 => return RedeemResponse::SessionExpired,
        403 | 429 => return RedeemResponse::RateLimited,
        s if s >= 500 => {
            return RedeemResponse::Transient {
                message: format!("HTTP {s}"),
            };
        }
        _ => {}
    }
    let Some(body) = body else {
        return RedeemResponse::Transient {
            message: format!("non-JSON response (HTTP {status})"),
        };
    };
    if body.get("success").and_then(Value::as_i64) == Some(1) {
        return RedeemResponse::Success;
    }

    let code = body
        .get("purchase_result_details")
        .and_then(Value::as_i64)
        .or_else(|| {
            body.pointer("/purchase_receipt_info/result_detail")
                .and_then(Value::as_i64)
        })
        .filter(|code| *code != 0)
        .unwrap_or(codes::RATE_LIMITED);

    match code {
        codes::ALREADY_OWNED | codes::ACTIVATED_ELSEWHERE => RedeemResponse::AlreadyOwned { code },
        codes::RATE_LIMITED => RedeemResponse::RateLimited,
        other => RedeemResponse::Invalid {
            code: other,
            message: code_message(other),
        },
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Session material and API key. Debug output never shows the values.
#[derive(Clone, Default)]
pub struct SteamCredentials {
    pub api_key: Option<String>,
    pub session_id: Option<String>,
    pub login_secure: Option<String>,
}

impl fmt::Debug for SteamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("SteamCredentials")
            .field("api_key", &shown(&self.api_key))
            .field("session_id", &shown(&self.session_id))
            .field("login_secure", &shown(&self.login_secure))
            .finish()
    }
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct AppListEnvelope {
    #[serde(default)]
    response: AppListBody,
}

#[derive(Debug, Default, Deserialize)]
struct AppListBody {
    #[serde(default)]
    apps: Vec<AppListItem>,
    #[serde(default)]
    have_more_results: bool,
    #[serde(default)]
    last_appid: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AppListItem {
    appid: u32,
    #[serde(default)]
    name: String,
}

impl From<AppListEnvelope> for AppPage {
    fn from(envelope: AppListEnvelope) -> Self {
        let body = envelope.response;
        let last_listed = body.apps.iter().map(|a| a.appid).max();
        let next_cursor = if body.have_more_results && !body.apps.is_empty() {
            body.last_appid.or(last_listed)
        } else {
            None
        };
        Self {
            apps: body
                .apps
                .into_iter()
                .filter(|a| !a.name.trim().is_empty())
                .map(|a| CatalogEntry::new(a.appid, a.name))
                .collect(),
            next_cursor,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OwnedGamesEnvelope {
    #[serde(default)]
    response: OwnedGamesBody,
}

#[derive(Debug, Default, Deserialize)]
struct OwnedGamesBody {
    #[serde(default)]
    games: Vec<OwnedGame>,
}

#[derive(Debug, Deserialize)]
struct OwnedGame {
    appid: u32,
}

#[derive(Debug, Default, Deserialize)]
struct UserData {
    #[serde(default, rename = "rgOwnedApps")]
    owned_apps: Vec<u32>,
    #[serde(default, rename = "rgOwnedPackages")]
    owned_packages: Vec<u32>,
}

/// Pull the name out of an `appdetails` response for `app_id`.
fn parse_app_detail(app_id: u32, body: &Value) -> Option<CatalogEntry> {
    let entry = body.get(app_id.to_string())?;
    if !entry.get("success").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let name = entry.pointer("/data/name")?.as_str()?.trim();
    (!name.is_empty()).then(|| CatalogEntry::new(app_id, name))
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the platform catalog and store.
pub struct SteamClient {
    http: reqwest::Client,
    credentials: SteamCredentials,
    api_base: String,
    store_base: String,
    page_size: u32,
}

impl SteamClient {
    pub fn new(credentials: SteamCredentials, page_size: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("redeemer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            http,
            credentials,
            api_base: API_BASE.to_string(),
            store_base: STORE_BASE.to_string(),
            page_size,
        })
    }

    /// Point the client at different hosts.
    #[must_use]
    pub fn with_base_urls(mut self, api_base: impl Into<String>, store_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.store_base = store_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_key(&self) -> Result<&str> {
        present(self.credentials.api_key.as_ref()).ok_or_else(|| {
            SessionError::MissingCredentials {
                service: API_SERVICE.to_string(),
                what: "an API key (REDEEMER_API_KEY)".to_string(),
            }
            .into()
        })
    }

    /// `sessionid` value and the cookie header carrying both store cookies.
    fn store_session(&self) -> Result<(&str, HeaderValue)> {
        let missing = || SessionError::MissingCredentials {
            service: STORE_SERVICE.to_string(),
            what: "sessionid and steamLoginSecure cookies (REDEEMER_SESSION_ID, REDEEMER_LOGIN_SECURE)"
                .to_string(),
        };
        let session_id = present(self.credentials.session_id.as_ref()).ok_or_else(missing)?;
        let login = present(self.credentials.login_secure.as_ref()).ok_or_else(missing)?;
        let cookie = HeaderValue::from_str(&format!(
            "sessionid={session_id}; steamLoginSecure={login}"
        ))
        .map_err(|_| SessionError::Rejected {
            service: STORE_SERVICE.to_string(),
            status: 400,
        })?;
        Ok((session_id, cookie))
    }

    fn has_store_session(&self) -> bool {
        self.store_session().is_ok()
    }

    async fn owned_from_store(&self) -> Result<OwnedApps> {
        let (_, cookie) = self.store_session()?;
        let response = self
            .http
            .get(format!("{}/dynamicstore/userdata/", self.store_base))
            .header(COOKIE, cookie)
            .send()
            .await
            .map_err(network)?;
        let status = response.status();
        if matches!(status.as_u16(), 401 | 403) || status.is_redirection() {
            return Err(SessionError::Rejected {
                service: STORE_SERVICE.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        if !status.is_success() {
            return Err(CatalogError::Fetch(format!("owned apps: HTTP {status}")).into());
        }
        let data: UserData = response
            .json()
            .await
            .map_err(|e| CatalogError::Fetch(format!("owned apps: {e}")))?;
        if data.owned_apps.is_empty() {
            warn!("Store reports no owned apps; the session may not be signed in");
        }
        Ok(OwnedApps {
            app_ids: data.owned_apps,
            package_ids: data.owned_packages,
        })
    }

    async fn owned_from_api(&self, user_id: &str) -> Result<OwnedApps> {
        let key = self.api_key()?;
        if user_id.is_empty() || !user_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(SessionError::MissingCredentials {
                service: API_SERVICE.to_string(),
                what: "a numeric account id (REDEEMER_USER_ID)".to_string(),
            }
            .into());
        }
        let response = self
            .http
            .get(format!("{}/IPlayerService/GetOwnedGames/v1/", self.api_base))
            .query(&[
                ("key", key),
                ("steamid", user_id),
                ("include_played_free_games", "true"),
            ])
            .send()
            .await
            .map_err(network)?;
        check_api_status(response.status(), "owned games")?;
        let envelope: OwnedGamesEnvelope = response
            .json()
            .await
            .map_err(|e| CatalogError::Fetch(format!("owned games: {e}")))?;
        Ok(OwnedApps {
            app_ids: envelope.response.games.into_iter().map(|g| g.appid).collect(),
            package_ids: Vec::new(),
        })
    }
}

fn network(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

fn check_api_status(status: reqwest::StatusCode, what: &str) -> Result<()> {
    match status.as_u16() {
        401 | 403 => Err(SessionError::Rejected {
            service: API_SERVICE.to_string(),
            status: status.as_u16(),
        }
        .into()),
        429 => Err(Error::Network(format!("{what}: HTTP 429"))),
        _ if status.is_success() => Ok(()),
        _ => Err(CatalogError::Fetch(format!("{what}: HTTP {status}")).into()),
    }
}

#[async_trait]
impl CatalogSource for SteamClient {
    async fn list_apps(&self, cursor: Option<u32>) -> Result<AppPage> {
        let key = self.api_key()?;
        let page_size = self.page_size.to_string();
        let last_appid = cursor.unwrap_or(0).to_string();
        let response = self
            .http
            .get(format!("{}/IStoreService/GetAppList/v1/", self.api_base))
            .query(&[
                ("key", key),
                ("max_results", page_size.as_str()),
                ("last_appid", last_appid.as_str()),
                ("include_dlc", "true"),
                ("include_software", "true"),
                ("include_hardware", "true"),
            ])
            .send()
            .await
            .map_err(|e| CatalogError::Fetch(e.to_string()))?;
        check_api_status(response.status(), "app list")?;
        let envelope: AppListEnvelope = response
            .json()
            .await
            .map_err(|e| CatalogError::Fetch(format!("app list: {e}")))?;
        let page = AppPage::from(envelope);
        debug!(cursor = ?cursor, apps = page.apps.len(), next = ?page.next_cursor, "Fetched app list page");
        Ok(page)
    }

    async fn app_detail(&self, app_id: u32) -> Result<Option<CatalogEntry>> {
        let response = self
            .http
            .get(format!("{}/api/appdetails", self.store_base))
            .query(&[("appids", app_id.to_string())])
            .send()
            .await
            .map_err(network)?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::Network(format!("app {app_id}: HTTP {status}")));
        }
        if !status.is_success() {
            return Ok(None);
        }
        let body: Value = response.json().await.map_err(network)?;
        Ok(parse_app_detail(app_id, &body))
    }

    async fn owned_apps(&self, user_id: &str) -> Result<OwnedApps> {
        if self.has_store_session() {
            self.owned_from_store().await
        } else {
            self.owned_from_api(user_id).await
        }
    }
}

#[async_trait]
impl PlatformRedeemer for SteamClient {
    async fn redeem(&self, key: &str) -> RedeemResponse {
        let Ok((session_id, cookie)) = self.store_session() else {
            return RedeemResponse::SessionExpired;
        };
        let sent = self
            .http
            .post(format!("{}/account/ajaxregisterkey/", self.store_base))
            .header(COOKIE, cookie)
            .form(&[("product_key", key), ("sessionid", session_id)])
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                return RedeemResponse::Transient {
                    message: e.to_string(),
                };
            }
        };
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text).ok();
        let answer = map_redeem_response(status, body.as_ref());
        debug!(key = %redact_key(key), status, ?answer, "Redeem response");
        answer
    }

    async fn keep_alive(&self) -> Result<()> {
        let (_, cookie) = self.store_session()?;
        let response = self
            .http
            .get(format!("{}/account/", self.store_base))
            .header(COOKIE, cookie)
            .send()
            .await
            .map_err(network)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_redirection() || matches!(status.as_u16(), 401 | 403) {
            Err(SessionError::Expired {
                service: STORE_SERVICE.to_string(),
            }
            .into())
        } else {
            Err(Error::Network(format!("session check: HTTP {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_flag_wins() {
        let body = json!({"success": 1, "purchase_result_details": 0});
        assert_eq!(map_redeem_response(200, Some(&body)), RedeemResponse::Success);
    }

    #[test]
    fn owned_and_activated_elsewhere_are_already_owned() {
        for code in [9, 15] {
            let body = json!({"success": 2, "purchase_result_details": code});
            assert_eq!(
                map_redeem_response(200, Some(&body)),
                RedeemResponse::AlreadyOwned { code }
            );
        }
    }

    #[test]
    fn rate_limit_signals() {
        let body = json!({"success": 2, "purchase_result_details": 53});
        assert_eq!(map_redeem_response(200, Some(&body)), RedeemResponse::RateLimited);
        assert_eq!(map_redeem_response(429, None), RedeemResponse::RateLimited);
        assert_eq!(map_redeem_response(403, None), RedeemResponse::RateLimited);
        let silent = json!({"success": 2});
        assert_eq!(map_redeem_response(200, Some(&silent)), RedeemResponse::RateLimited);
    }

    #[test]
    fn rejection_codes_are_invalid() {
        for code in [13, 14, 24, 36, 50, 71] {
            let body = json!({"success": 2, "purchase_result_details": code});
            match map_redeem_response(200, Some(&body)) {
                RedeemResponse::Invalid { code: got, message } => {
                    assert_eq!(got, code);
                    assert!(!message.is_empty());
                }
                other => panic!("code {code} mapped to {other:?}"),
            }
        }
        assert_eq!(code_message(14), "product code is not valid");
        assert!(code_message(71).contains("71"));
    }

    #[test]
    fn receipt_result_detail_is_a_fallback() {
        let body = json!({"success": 2, "purchase_receipt_info": {"result_detail": 14}});
        assert!(matches!(
            map_redeem_response(200, Some(&body)),
            RedeemResponse::Invalid { code: 14, .. }
        ));
    }

    #[test]
    fn transport_failures_are_transient() {
        assert!(matches!(
            map_redeem_response(502, None),
            RedeemResponse::Transient { .. }
        ));
        assert!(matches!(
            map_redeem_response(200, None),
            RedeemResponse::Transient { .. }
        ));
    }

    #[test]
    fn login_redirect_means_session_expired() {
        for status in [301, 302, 303, 307, 401] {
            assert_eq!(
                map_redeem_response(status, None),
                RedeemResponse::SessionExpired,
                "HTTP {status}"
            );
        }
        let body = json!({"success": 1});
        assert_eq!(map_redeem_response(302, Some(&body)), RedeemResponse::SessionExpired);
    }

    #[test]
    fn app_list_page_carries_cursor() {
        let envelope: AppListEnvelope = serde_json::from_value(json!({
            "response": {
                "apps": [
                    {"appid": 10, "name": "Counter-Strike"},
                    {"appid": 20, "name": ""},
                    {"appid": 30, "name": "Day of Defeat"}
                ],
                "have_more_results": true,
                "last_appid": 30
            }
        }))
        .unwrap();
        let page = AppPage::from(envelope);
        assert_eq!(page.apps.len(), 2);
        assert_eq!(page.next_cursor, Some(30));

        let last: AppListEnvelope =
            serde_json::from_value(json!({"response": {"apps": [{"appid": 40, "name": "X"}]}}))
                .unwrap();
        assert_eq!(AppPage::from(last).next_cursor, None);

        let empty: AppListEnvelope = serde_json::from_value(json!({})).unwrap();
        assert!(AppPage::from(empty).apps.is_empty());
    }

    #[test]
    fn app_detail_parsing() {
        let body = json!({"570": {"success": true, "data": {"name": "Dota 2"}}});
        assert_eq!(
            parse_app_detail(570, &body),
            Some(CatalogEntry::new(570, "Dota 2"))
        );
        assert_eq!(parse_app_detail(571, &body), None);
        let failed = json!({"570": {"success": false}});
        assert_eq!(parse_app_detail(570, &failed), None);
    }

    #[test]
    fn userdata_parsing() {
        let data: UserData = serde_json::from_value(json!({
            "rgOwnedApps": [10, 20],
            "rgOwnedPackages": [5],
            "rgWishlist": [99]
        }))
        .unwrap();
        assert_eq!(data.owned_apps, vec![10, 20]);
        assert_eq!(data.owned_packages, vec![5]);
    }

    #[test]
    fn credentials_are_not_printed() {
        let credentials = SteamCredentials {
            api_key: Some("SECRETKEY".to_string()),
            session_id: None,
            login_secure: Some("76561198000000000%7C%7Csecret".to_string()),
        };
        let shown = format!("{credentials:?}");
        assert!(!shown.contains("SECRETKEY"));
        assert!(!shown.contains("secret"));
        assert!(shown.contains("<unset>"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let client = SteamClient::new(SteamCredentials::default(), 100).unwrap();

        let err = client.list_apps(None).await.unwrap_err();
        assert!(err.needs_manual_login());
        assert!(err.to_string().contains("credentials missing"));

        let err = client.owned_apps("not-a-number").await.unwrap_err();
        assert!(err.needs_manual_login());

        let err = client.keep_alive().await.unwrap_err();
        assert!(err.needs_manual_login());

        assert_eq!(client.redeem("AAAAA-BBBBB-CCCCC").await, RedeemResponse::SessionExpired);
    }

    #[test]
    fn blank_credentials_count_as_missing() {
        let client = SteamClient::new(
            SteamCredentials {
                api_key: Some("  ".to_string()),
                session_id: Some(String::new()),
                login_secure: Some("x".to_string()),
            },
            100,
        )
        .unwrap();
        assert!(client.api_key().is_err());
        assert!(!client.has_store_session());
    }
}

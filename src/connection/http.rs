//! `reqwest`-backed connection with cookie and CSRF handling.
//!
//! Every cookie or CSRF change seen on a response is merged into the bound
//! session and written back to the session store before the response is
//! returned, so a later invocation resumes the same server-side session.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{ACCEPT_LANGUAGE, COOKIE, SET_COOKIE};
use reqwest::{Client, Method, Url};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{Credentials, GlobalConfig};
use crate::models::session::{Session, SessionMode};
use crate::persistence::session_store::SessionStore;
use crate::{AppError, Result};

use super::{BoxFuture, Connection, HttpMethod, RemoteResponse, RequestSpec};

const SESSION_TYPE_HEADER: &str = "X-sap-adt-sessiontype";
const CSRF_HEADER: &str = "x-csrf-token";
const CSRF_FETCH_PATH: &str = "/sap/bc/adt/discovery";

/// HTTP connection bound to one persisted session.
pub struct HttpConnection {
    client: Client,
    base_url: String,
    sap_client: Option<String>,
    language: Option<String>,
    credentials: Credentials,
    timeout: Duration,
    store: SessionStore,
    session_id: String,
    session: Mutex<Session>,
    stateful: AtomicBool,
}

impl HttpConnection {
    /// Build a connection for `session`, persisting updates through `store`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no base URL is configured or the HTTP
    /// client cannot be built.
    pub fn new(config: &GlobalConfig, store: SessionStore, session: Session) -> Result<Self> {
        let base_url = config.require_base_url()?.trim_end_matches('/').to_owned();
        let client = Client::builder()
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url,
            sap_client: config.client.clone(),
            language: config.language.clone(),
            credentials: config.credentials.clone(),
            timeout: config.request_timeout(),
            store,
            session_id: session.session_id.clone(),
            session: Mutex::new(session),
            stateful: AtomicBool::new(false),
        })
    }

    /// Copy of the bound session as last persisted.
    pub async fn session(&self) -> Session {
        self.session.lock().await.clone()
    }

    async fn request_with_csrf_retry(&self, request: RequestSpec) -> Result<RemoteResponse> {
        if request.method.is_mutating() {
            self.ensure_csrf_token().await?;
        }

        let response = self.send(&request).await?;
        let csrf_required = response.status == 403
            && response
                .header(CSRF_HEADER)
                .is_some_and(|value| value.eq_ignore_ascii_case("required"));

        if csrf_required && request.method.is_mutating() {
            debug!(session_id = %self.session_id, "csrf token rejected; refetching");
            self.fetch_csrf_token().await?;
            return into_result(self.send(&request).await?);
        }
        into_result(response)
    }

    async fn ensure_csrf_token(&self) -> Result<()> {
        let missing = self.session.lock().await.csrf_token.is_none();
        if missing {
            self.fetch_csrf_token().await?;
        }
        Ok(())
    }

    async fn fetch_csrf_token(&self) -> Result<()> {
        let request =
            RequestSpec::new(HttpMethod::Get, CSRF_FETCH_PATH).header(CSRF_HEADER, "fetch");
        let response = into_result(self.send(&request).await?)?;
        if self.session.lock().await.csrf_token.is_none() {
            return Err(AppError::RemoteRejected {
                status: response.status,
                body: "server did not return a CSRF token".into(),
            });
        }
        Ok(())
    }

    /// Send one request and return the response whatever its status.
    async fn send(&self, request: &RequestSpec) -> Result<RemoteResponse> {
        let url = self.build_url(request)?;
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        };
        let label = format!("{method} {}", request.path);

        let mut builder = self
            .client
            .request(method, url)
            .timeout(request.timeout.unwrap_or(self.timeout))
            .header(SESSION_TYPE_HEADER, self.session_mode().as_header_value());

        if let Some(language) = &self.language {
            builder = builder.header(ACCEPT_LANGUAGE, language.as_str());
        }
        builder = match &self.credentials {
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Credentials::Bearer { token } => builder.bearer_auth(token),
            Credentials::None => builder,
        };
        {
            let session = self.session.lock().await;
            if !session.cookies.is_empty() {
                builder = builder.header(COOKIE, session.cookies.as_str());
            }
            if request.method.is_mutating() {
                if let Some(token) = &session.csrf_token {
                    builder = builder.header(CSRF_HEADER, token.as_str());
                }
            }
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| AppError::Network(format!("{label}: {err}")))?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        let mut set_cookies = Vec::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            if *name == SET_COOKIE {
                set_cookies.push(value.to_owned());
            }
            headers.insert(name.as_str().to_owned(), value.to_owned());
        }
        let data = response
            .text()
            .await
            .map_err(|err| AppError::Network(format!("{label}: failed to read body: {err}")))?;

        self.absorb(&set_cookies, headers.get(CSRF_HEADER).map(String::as_str))
            .await?;

        debug!(session_id = %self.session_id, request = %label, status, "remote call completed");
        Ok(RemoteResponse {
            status,
            headers,
            data,
        })
    }

    fn build_url(&self, request: &RequestSpec) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, request.path))
            .map_err(|err| AppError::Config(format!("invalid request url: {err}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query {
                pairs.append_pair(name, value);
            }
            if let Some(client) = &self.sap_client {
                pairs.append_pair("sap-client", client);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// Merge response cookies and CSRF token into the session; persist on change.
    async fn absorb(&self, set_cookies: &[String], csrf: Option<&str>) -> Result<()> {
        let mut session = self.session.lock().await;
        let mut changed = false;
        for header in set_cookies {
            changed |= session.merge_set_cookie(header);
        }
        if let Some(token) = csrf {
            let is_token = !token.eq_ignore_ascii_case("required")
                && !token.eq_ignore_ascii_case("fetch");
            if is_token {
                changed |= session.set_csrf_token(Some(token.to_owned()));
            }
        }
        if changed {
            session.updated_at = Utc::now();
            self.store.save(&session)?;
            debug!(session_id = %self.session_id, "session credentials persisted");
        }
        Ok(())
    }
}

impl Connection for HttpConnection {
    fn make_request(&self, request: RequestSpec) -> BoxFuture<'_, RemoteResponse> {
        Box::pin(self.request_with_csrf_retry(request))
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_mode(&self) -> SessionMode {
        if self.stateful.load(Ordering::SeqCst) {
            SessionMode::Stateful
        } else {
            SessionMode::Stateless
        }
    }

    fn set_session_mode(&self, mode: SessionMode) {
        let previous = self
            .stateful
            .swap(mode == SessionMode::Stateful, Ordering::SeqCst);
        if previous != (mode == SessionMode::Stateful) {
            debug!(session_id = %self.session_id, ?mode, "session mode switched");
        }
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.set_session_mode(SessionMode::Stateless);
            let mut session = self.session.lock().await;
            session.clear_credentials();
            session.updated_at = Utc::now();
            if let Err(err) = self.store.save(&session) {
                warn!(session_id = %self.session_id, %err, "failed to persist reset session");
                return Err(err);
            }
            Ok(())
        })
    }
}

/// Map non-2xx responses to `AppError::RemoteRejected`.
fn into_result(response: RemoteResponse) -> Result<RemoteResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(AppError::RemoteRejected {
            status: response.status,
            body: response.data,
        })
    }
}

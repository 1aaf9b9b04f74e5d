use crate::config::GoogleConfig;
use crate::models::{parse_remote_timestamp, NewRemoteTask, RemoteList, RemotePatch, RemoteTask};
use crate::store::{read_optional, write_atomic};
use crate::sync::{RemoteError, RemoteTasks};
use chrono::{DateTime, Duration, Local, SecondsFormat, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration as StdDuration;
use thiserror::Error;

const OAUTH_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TASKS_API: &str = "https://tasks.googleapis.com/tasks/v1";
const TASKS_SCOPE: &str = "https://www.googleapis.com/auth/tasks";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Google client_id/client_secret required in config.toml")]
    MissingCredentials,
    #[error("Google auth required: run `tasksync auth` first")]
    Required,
    #[error("Google auth expired. Please retry.")]
    Expired,
    #[error("{0}")]
    Request(String),
    #[error("token store: {0}")]
    Store(String),
}

#[derive(Serialize, Deserialize, Clone)]
struct StoredToken {
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

impl StoredToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now.timestamp() + 60
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskListsResponse {
    items: Option<Vec<TaskListResource>>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct TaskListResource {
    id: String,
    title: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksResponse {
    items: Option<Vec<TaskResource>>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct TaskResource {
    id: String,
    title: Option<String>,
    status: Option<String>,
    due: Option<String>,
    completed: Option<String>,
    notes: Option<String>,
    deleted: Option<bool>,
}

#[derive(Serialize)]
struct TaskInsertRequest<'a> {
    title: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due: Option<String>,
}

/// Google Tasks REST client holding an OAuth access token.
pub struct GoogleTasks {
    client: Client,
    config: GoogleConfig,
    token_path: PathBuf,
    token: StoredToken,
}

impl GoogleTasks {
    pub fn connect(config: &GoogleConfig, token_path: &Path) -> Result<Self, AuthError> {
        check_credentials(config)?;
        let token = load_token(token_path)?.ok_or(AuthError::Required)?;
        let client = Client::builder()
            .timeout(StdDuration::from_secs(config.timeout_seconds.max(5)))
            .build()
            .map_err(|e| AuthError::Request(e.to_string()))?;
        Ok(Self {
            client,
            config: config.clone(),
            token_path: token_path.to_path_buf(),
            token,
        })
    }

    fn access_token(&mut self, force_refresh: bool) -> Result<String, RemoteError> {
        if !force_refresh && self.token.is_fresh(Utc::now()) {
            return Ok(self.token.access_token.clone());
        }
        let updated = refresh_access_token(&self.client, &self.config, &self.token.refresh_token)
            .map_err(|e| RemoteError::Auth(e.to_string()))?;
        save_token(&self.token_path, &updated).map_err(|e| RemoteError::Auth(e.to_string()))?;
        tracing::debug!("refreshed Google access token");
        self.token = updated;
        Ok(self.token.access_token.clone())
    }

    /// Sends a request, refreshing the token once when Google rejects it.
    fn send(
        &mut self,
        context: &str,
        build: impl Fn(&Client, &str) -> RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let mut refreshed = false;
        loop {
            let token = self.access_token(refreshed)?;
            let resp = build(&self.client, &token)
                .send()
                .map_err(|e| classify_transport(context, &e))?;
            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                continue;
            }
            let body = resp.text().unwrap_or_default();
            return Err(classify_status(context, status, &body));
        }
    }

    fn send_json<T: DeserializeOwned>(
        &mut self,
        context: &str,
        build: impl Fn(&Client, &str) -> RequestBuilder,
    ) -> Result<T, RemoteError> {
        let resp = self.send(context, build)?;
        resp.json::<T>()
            .map_err(|e| RemoteError::Request(format!("{context}: invalid response: {e}")))
    }
}

impl RemoteTasks for GoogleTasks {
    fn task_lists(&mut self) -> Result<Vec<RemoteList>, RemoteError> {
        let url = format!("{TASKS_API}/users/@me/lists");
        let mut lists = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page: TaskListsResponse = self.send_json("Task lists", |client, token| {
                let mut request = client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("maxResults", PAGE_SIZE)]);
                if let Some(page_token) = page_token.as_deref() {
                    request = request.query(&[("pageToken", page_token)]);
                }
                request
            })?;
            lists.extend(page.items.unwrap_or_default().into_iter().map(|list| RemoteList {
                id: list.id,
                title: list.title.unwrap_or_default(),
            }));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok(lists),
            }
        }
    }

    fn create_list(&mut self, title: &str) -> Result<RemoteList, RemoteError> {
        let url = format!("{TASKS_API}/users/@me/lists");
        let body = json!({ "title": title });
        let created: TaskListResource = self.send_json("Task list create", |client, token| {
            client.post(&url).bearer_auth(token).json(&body)
        })?;
        Ok(RemoteList {
            id: created.id,
            title: created.title.unwrap_or_else(|| title.to_string()),
        })
    }

    fn list(&mut self, list_id: &str) -> Result<Vec<RemoteTask>, RemoteError> {
        let url = format!("{TASKS_API}/lists/{list_id}/tasks");
        let mut tasks = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page: TasksResponse = self.send_json("Tasks list", |client, token| {
                let mut request = client.get(&url).bearer_auth(token).query(&[
                    ("showCompleted", "true"),
                    ("showHidden", "true"),
                    ("maxResults", PAGE_SIZE),
                ]);
                if let Some(page_token) = page_token.as_deref() {
                    request = request.query(&[("pageToken", page_token)]);
                }
                request
            })?;
            tasks.extend(
                page.items
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|task| task.deleted != Some(true))
                    .map(|task| into_remote(task, list_id)),
            );
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok(tasks),
            }
        }
    }

    fn insert(&mut self, list_id: &str, task: &NewRemoteTask) -> Result<RemoteTask, RemoteError> {
        let url = format!("{TASKS_API}/lists/{list_id}/tasks");
        let body = TaskInsertRequest {
            title: &task.title,
            status: "needsAction",
            notes: task.notes.as_deref().filter(|n| !n.trim().is_empty()),
            due: task.due.map(format_due),
        };
        let created: TaskResource = self.send_json("Task create", |client, token| {
            client.post(&url).bearer_auth(token).json(&body)
        })?;
        Ok(into_remote(created, list_id))
    }

    fn patch(
        &mut self,
        list_id: &str,
        remote_id: &str,
        patch: &RemotePatch,
    ) -> Result<(), RemoteError> {
        let url = format!("{TASKS_API}/lists/{list_id}/tasks/{remote_id}");
        let body = patch_body(patch);
        self.send("Task update", |client, token| {
            client.patch(&url).bearer_auth(token).json(&body)
        })?;
        Ok(())
    }

    fn delete(&mut self, list_id: &str, remote_id: &str) -> Result<(), RemoteError> {
        let url = format!("{TASKS_API}/lists/{list_id}/tasks/{remote_id}");
        self.send("Task delete", |client, token| {
            client.delete(&url).bearer_auth(token)
        })?;
        Ok(())
    }

    fn delete_list(&mut self, list_id: &str) -> Result<(), RemoteError> {
        let url = format!("{TASKS_API}/users/@me/lists/{list_id}");
        self.send("Task list delete", |client, token| {
            client.delete(&url).bearer_auth(token)
        })?;
        Ok(())
    }
}

fn into_remote(task: TaskResource, list_id: &str) -> RemoteTask {
    RemoteTask {
        remote_id: task.id,
        title: task.title.unwrap_or_default().trim().to_string(),
        list_id: list_id.to_string(),
        due: task.due.as_deref().and_then(parse_remote_timestamp),
        completed: task.status.as_deref() == Some("completed"),
        completed_at: task.completed.as_deref().and_then(parse_remote_timestamp),
        notes: task.notes.filter(|n| !n.trim().is_empty()),
    }
}

fn format_due(due: DateTime<Utc>) -> String {
    due.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn patch_body(patch: &RemotePatch) -> Value {
    let mut body = Map::new();
    match patch.completed {
        Some(true) => {
            body.insert("status".to_string(), json!("completed"));
        }
        Some(false) => {
            body.insert("status".to_string(), json!("needsAction"));
            body.insert("completed".to_string(), Value::Null);
        }
        None => {}
    }
    if let Some(due) = patch.due {
        body.insert(
            "due".to_string(),
            due.map(|d| json!(format_due(d))).unwrap_or(Value::Null),
        );
    }
    Value::Object(body)
}

fn classify_transport(context: &str, err: &reqwest::Error) -> RemoteError {
    let message = format!("{context}: {err}");
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RemoteError::Transient(message)
    } else {
        RemoteError::Request(message)
    }
}

fn classify_status(context: &str, status: StatusCode, body: &str) -> RemoteError {
    let message = format!("{context} failed: {}", format_http_error(status, body));
    match status.as_u16() {
        404 | 410 => RemoteError::NotFound(message),
        403 if body.contains("rateLimitExceeded") || body.contains("RATE_LIMIT_EXCEEDED") => {
            RemoteError::Transient(message)
        }
        401 | 403 => RemoteError::Auth(message),
        408 | 429 | 500..=599 => RemoteError::Transient(message),
        _ => RemoteError::Request(message),
    }
}

fn check_credentials(config: &GoogleConfig) -> Result<(), AuthError> {
    if config.client_id.trim().is_empty() || config.client_secret.trim().is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    Ok(())
}

/// A pending OAuth authorization waiting for Google's loopback redirect.
#[derive(Debug)]
pub struct AuthSession {
    pub auth_url: String,
    pub listen_addr: String,
    listener: TcpListener,
    state: String,
    redirect_uri: String,
    expires_at: DateTime<Local>,
}

pub fn start_local_oauth_flow(config: &GoogleConfig) -> Result<AuthSession, AuthError> {
    check_credentials(config)?;

    let listener =
        TcpListener::bind("127.0.0.1:0").map_err(|e| AuthError::Request(e.to_string()))?;
    let addr = listener
        .local_addr()
        .map_err(|e| AuthError::Request(e.to_string()))?;
    let redirect_uri = format!("http://{}", addr);
    let expires_at = Local::now() + Duration::minutes(10);
    let state = generate_state();

    let auth_url = Url::parse_with_params(
        OAUTH_AUTH_URL,
        [
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", TASKS_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state.as_str()),
        ],
    )
    .map_err(|e| AuthError::Request(e.to_string()))?
    .to_string();

    Ok(AuthSession {
        auth_url,
        listen_addr: addr.to_string(),
        listener,
        state,
        redirect_uri,
        expires_at,
    })
}

/// Blocks until the browser redirect arrives or the session expires, then
/// exchanges the code and stores the token.
pub fn wait_for_authorization(
    config: &GoogleConfig,
    session: AuthSession,
    token_path: &Path,
) -> Result<(), AuthError> {
    let client = Client::new();
    session
        .listener
        .set_nonblocking(true)
        .map_err(|e| AuthError::Request(e.to_string()))?;
    loop {
        if Local::now() >= session.expires_at {
            return Err(AuthError::Expired);
        }
        match session.listener.accept() {
            Ok((mut stream, _addr)) => {
                return handle_auth_redirect(&client, config, &session, &mut stream, token_path);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(StdDuration::from_millis(200));
            }
            Err(err) => return Err(AuthError::Request(err.to_string())),
        }
    }
}

fn refresh_access_token(
    client: &Client,
    config: &GoogleConfig,
    refresh_token: &str,
) -> Result<StoredToken, AuthError> {
    let resp = client
        .post(OAUTH_TOKEN_URL)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .map_err(|e| AuthError::Request(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        return Err(AuthError::Request(format!(
            "Token refresh failed: {}",
            format_http_error(status, &body)
        )));
    }

    let token: TokenResponse = resp
        .json()
        .map_err(|e| AuthError::Request(e.to_string()))?;
    Ok(StoredToken {
        access_token: token.access_token,
        refresh_token: token
            .refresh_token
            .unwrap_or_else(|| refresh_token.to_string()),
        expires_at: (Utc::now() + Duration::seconds(token.expires_in as i64)).timestamp(),
    })
}

fn handle_auth_redirect(
    client: &Client,
    config: &GoogleConfig,
    session: &AuthSession,
    stream: &mut TcpStream,
    token_path: &Path,
) -> Result<(), AuthError> {
    stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(StdDuration::from_secs(2))))
        .map_err(|e| AuthError::Request(e.to_string()))?;
    let mut buf = [0_u8; 8192];
    let read = stream
        .read(&mut buf)
        .map_err(|e| AuthError::Request(e.to_string()))?;
    let request = String::from_utf8_lossy(&buf[..read]);
    let request_line = request.lines().next().unwrap_or("");
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
    let params = parse_query(query);

    if let Some(error) = params.get("error") {
        let desc = params
            .get("error_description")
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        let _ = respond_with_message(stream, &format!("Authorization failed: {error}{desc}"));
        return Err(AuthError::Request(format!(
            "Google auth failed: {error}{desc}"
        )));
    }

    let Some(code) = params.get("code") else {
        let _ = respond_with_message(stream, "Missing authorization code.");
        return Err(AuthError::Request(
            "Missing authorization code from Google.".to_string(),
        ));
    };

    if params.get("state").map(String::as_str) != Some(session.state.as_str()) {
        let _ = respond_with_message(stream, "Invalid state.");
        return Err(AuthError::Request(
            "Invalid OAuth state. Please retry.".to_string(),
        ));
    }

    let resp = client
        .post(OAUTH_TOKEN_URL)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("code", code.as_str()),
            ("redirect_uri", session.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .map_err(|e| AuthError::Request(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        let detail = format_http_error(status, &body);
        let _ = respond_with_message(stream, &format!("Authorization failed: {}", detail));
        return Err(AuthError::Request(detail));
    }

    let token: TokenResponse = resp
        .json()
        .map_err(|e| AuthError::Request(e.to_string()))?;
    let Some(refresh) = token.refresh_token else {
        let _ = respond_with_message(
            stream,
            "Missing refresh token. Please retry and grant offline access.",
        );
        return Err(AuthError::Request(
            "Missing refresh token from Google.".to_string(),
        ));
    };

    let stored = StoredToken {
        access_token: token.access_token,
        refresh_token: refresh,
        expires_at: (Utc::now() + Duration::seconds(token.expires_in as i64)).timestamp(),
    };
    save_token(token_path, &stored)?;
    let _ = respond_with_message(stream, "Authorization complete. You can close this window.");
    Ok(())
}

fn respond_with_message(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    let body = format!("{message}\n");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(input: &str) -> String {
    let spaced = input.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(spaced)
}

fn generate_state() -> String {
    use rand::{distributions::Alphanumeric, Rng};
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn format_http_error(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {}", status);
    }

    let summary = if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(trimmed) {
        if let Some(desc) = err.error_description {
            format!("{} ({})", desc, err.error)
        } else {
            err.error
        }
    } else {
        truncate_error(trimmed)
    };
    format!("HTTP {}: {}", status, summary)
}

fn truncate_error(message: &str) -> String {
    let mut out: String = message.replace(['\n', '\r'], " ").chars().take(240).collect();
    if message.chars().count() > 240 {
        out.push_str("...");
    }
    out
}

fn load_token(path: &Path) -> Result<Option<StoredToken>, AuthError> {
    let Some(content) = read_optional(path).map_err(|e| AuthError::Store(e.to_string()))? else {
        return Ok(None);
    };
    let token = serde_json::from_str(&content)
        .map_err(|e| AuthError::Store(format!("{}: {e}", path.display())))?;
    Ok(Some(token))
}

fn save_token(path: &Path, token: &StoredToken) -> Result<(), AuthError> {
    let content =
        serde_json::to_string_pretty(token).map_err(|e| AuthError::Store(e.to_string()))?;
    write_atomic(path, &content).map_err(|e| AuthError::Store(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::TempDir;

    #[test]
    fn classifies_http_statuses() {
        assert!(matches!(
            classify_status("Task update", StatusCode::NOT_FOUND, ""),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            classify_status("Task update", StatusCode::GONE, ""),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            classify_status("Task create", StatusCode::TOO_MANY_REQUESTS, ""),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status("Task create", StatusCode::SERVICE_UNAVAILABLE, ""),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status("Task create", StatusCode::FORBIDDEN, r#"{"error":{"errors":[{"reason":"rateLimitExceeded"}]}}"#),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status("Task create", StatusCode::FORBIDDEN, "{}"),
            RemoteError::Auth(_)
        ));
        assert!(matches!(
            classify_status("Task create", StatusCode::BAD_REQUEST, "Invalid due"),
            RemoteError::Request(_)
        ));
    }

    #[test]
    fn converts_task_resources() {
        let resource: TaskResource = serde_json::from_str(
            r#"{"id":"abc","title":" Call dentist ","status":"needsAction","due":"2025-06-20T00:00:00.000Z","notes":""}"#,
        )
        .unwrap();
        let task = into_remote(resource, "list-1");
        assert_eq!(task.title, "Call dentist");
        assert_eq!(task.list_id, "list-1");
        assert_eq!(task.due_date(), NaiveDate::from_ymd_opt(2025, 6, 20));
        assert!(!task.completed);
        assert_eq!(task.notes, None);

        let done: TaskResource = serde_json::from_str(
            r#"{"id":"def","status":"completed","completed":"2025-06-02T08:00:00.000Z"}"#,
        )
        .unwrap();
        let task = into_remote(done, "list-1");
        assert!(task.completed);
        assert_eq!(task.title, "");
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn patch_bodies_only_carry_changed_fields() {
        assert_eq!(
            patch_body(&RemotePatch::complete()),
            json!({"status": "completed"})
        );
        let due = Utc.with_ymd_and_hms(2025, 6, 20, 0, 0, 0).unwrap();
        assert_eq!(
            patch_body(&RemotePatch::due(Some(due))),
            json!({"due": "2025-06-20T00:00:00.000Z"})
        );
        assert_eq!(patch_body(&RemotePatch::due(None)), json!({"due": null}));
    }

    #[test]
    fn parses_redirect_query() {
        let params = parse_query("state=abc123&code=4%2F0Ad-x&scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Ftasks&error_description=access+denied");
        assert_eq!(params["code"], "4/0Ad-x");
        assert_eq!(params["scope"], TASKS_SCOPE);
        assert_eq!(params["error_description"], "access denied");
    }

    #[test]
    fn formats_oauth_errors() {
        let detail = format_http_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Bad Request"}"#,
        );
        assert_eq!(detail, "HTTP 400 Bad Request: Bad Request (invalid_grant)");
        assert_eq!(format_http_error(StatusCode::BAD_GATEWAY, " "), "HTTP 502 Bad Gateway");
    }

    #[test]
    fn token_round_trips_and_missing_token_requires_auth() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("google_token.json");
        assert!(load_token(&path).unwrap().is_none());

        let token = StoredToken {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now().timestamp() + 3600,
        };
        save_token(&path, &token).unwrap();
        let loaded = load_token(&path).unwrap().unwrap();
        assert_eq!(loaded.refresh_token, "refresh");
        assert!(loaded.is_fresh(Utc::now()));

        let config = GoogleConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            ..GoogleConfig::default()
        };
        let missing = dir.path().join("none.json");
        assert!(matches!(
            GoogleTasks::connect(&config, &missing),
            Err(AuthError::Required)
        ));
        assert!(matches!(
            GoogleTasks::connect(&GoogleConfig::default(), &path),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn oauth_url_requests_offline_tasks_scope() {
        let config = GoogleConfig {
            client_id: "client.apps.googleusercontent.com".to_string(),
            client_secret: "secret".to_string(),
            ..GoogleConfig::default()
        };
        let session = start_local_oauth_flow(&config).unwrap();
        assert!(session.auth_url.starts_with(OAUTH_AUTH_URL));
        assert!(session.auth_url.contains("access_type=offline"));
        assert!(session.auth_url.contains("auth%2Ftasks"));
        assert!(session.listen_addr.starts_with("127.0.0.1:"));
    }
}

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::*;
use crate::config::ClusterConfig;
use crate::task::NO_CONTENT;

/// Lines requested per task log page.
const LOG_PAGE: u64 = 500;

enum Auth {
    Anonymous,
    Token(String),
    Ticket { cookie: String, csrf: String },
}

/// HTTP client for the cluster's JSON API (`/api2/json`).
pub struct PveClient {
    http: reqwest::Client,
    base: Url,
    auth: Auth,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf: String,
}

#[derive(Deserialize)]
struct RawTaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Deserialize)]
struct LogLine {
    #[serde(default)]
    t: String,
}

impl PveClient {
    /// Build a client for `config`. Password logins fetch a ticket here;
    /// token logins make no request until the first call.
    pub async fn connect(
        config: &ClusterConfig,
        poll_interval: Duration,
    ) -> Result<Self, PveError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|source| PveError::Http {
                context: "building HTTP client".into(),
                source,
            })?;

        let base_str = format!("https://{}:{}/api2/json", config.host, config.port);
        let base = Url::parse(&base_str)
            .map_err(|e| PveError::invalid(format!("cluster address '{base_str}': {e}")))?;

        let mut client = Self {
            http,
            base,
            auth: Auth::Anonymous,
            poll_interval,
        };

        if !config.token_id.is_empty() {
            client.auth = Auth::Token(format!(
                "PVEAPIToken={}!{}={}",
                config.user, config.token_id, config.token_secret
            ));
        } else {
            let params = Params::new()
                .set("username", &config.user)
                .set("password", &config.password);
            let ticket: Ticket = client
                .call(Method::POST, &["access", "ticket"], Some(&params))
                .await?;
            tracing::debug!(user = %config.user, "obtained login ticket");
            client.auth = Auth::Ticket {
                cookie: ticket.ticket,
                csrf: ticket.csrf,
            };
        }

        Ok(client)
    }

    fn url<S: AsRef<str>>(&self, segments: &[S]) -> Result<Url, PveError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PveError::invalid(format!("cannot build a path on {}", self.base)))?
            .extend(segments.iter().map(|s| s.as_ref()));
        Ok(url)
    }

    /// Issue a request and return the `data` member of the response body.
    async fn raw<S: AsRef<str>>(
        &self,
        method: Method,
        segments: &[S],
        params: Option<&Params>,
    ) -> Result<Value, PveError> {
        let url = self.url(segments)?;
        let context = format!("{method} {}", url.path());

        let mut req = self.http.request(method.clone(), url);
        req = match &self.auth {
            Auth::Anonymous => req,
            Auth::Token(header) => req.header(AUTHORIZATION, header),
            Auth::Ticket { cookie, csrf } => {
                let req = req.header(COOKIE, format!("PVEAuthCookie={cookie}"));
                if method == Method::GET {
                    req
                } else {
                    req.header("CSRFPreventionToken", csrf)
                }
            }
        };
        if let Some(params) = params.filter(|p| !p.is_empty()) {
            req = if method == Method::GET || method == Method::DELETE {
                req.query(params.pairs())
            } else {
                req.form(params.pairs())
            };
        }

        tracing::debug!(%context, "request");
        let resp = req.send().await.map_err(|source| PveError::Http {
            context: context.clone(),
            source,
        })?;

        let status = resp.status();
        // The API reports most failures in the status line, not the body.
        let reason = resp
            .extensions()
            .get::<hyper::ext::ReasonPhrase>()
            .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
            .map(String::from);
        let body = resp.text().await.map_err(|source| PveError::Http {
            context: context.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(PveError::Api {
                context,
                status: status.as_u16(),
                message: error_message(reason, &body, status.canonical_reason()),
            });
        }

        let mut envelope: Value = serde_json::from_str(&body).map_err(|e| PveError::Decode {
            context: context.clone(),
            message: e.to_string(),
        })?;
        Ok(envelope.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    async fn call<T: DeserializeOwned, S: AsRef<str>>(
        &self,
        method: Method,
        segments: &[S],
        params: Option<&Params>,
    ) -> Result<T, PveError> {
        let context = format!("{method} /{}", join(segments));
        let data = self.raw(method, segments, params).await?;
        serde_json::from_value(data).map_err(|e| PveError::Decode {
            context,
            message: e.to_string(),
        })
    }

    async fn call_task<S: AsRef<str>>(
        &self,
        method: Method,
        segments: &[S],
        params: Option<&Params>,
    ) -> Result<Upid, PveError> {
        let context = format!("{method} /{}", join(segments));
        match self.raw(method, segments, params).await? {
            Value::String(upid) => Upid::parse(&upid),
            other => Err(PveError::Decode {
                context,
                message: format!("expected a task id, got {other}"),
            }),
        }
    }

    async fn fetch_status(&self, upid: &Upid) -> Result<TaskStatus, PveError> {
        let raw: RawTaskStatus = self
            .call(
                Method::GET,
                &["nodes", upid.node.as_str(), "tasks", upid.as_str(), "status"],
                None,
            )
            .await?;
        Ok(task_status_from(raw))
    }

    async fn fetch_log(&self, upid: &Upid, start: u64) -> Result<Vec<String>, PveError> {
        let params = Params::new().set("start", start).set("limit", LOG_PAGE);
        let lines: Vec<LogLine> = self
            .call(
                Method::GET,
                &["nodes", upid.node.as_str(), "tasks", upid.as_str(), "log"],
                Some(&params),
            )
            .await?;
        Ok(lines.into_iter().map(|l| l.t).collect())
    }
}

/// Offset bookkeeping for a paged task log.
#[derive(Debug, Default)]
struct LogPaging {
    next_line: u64,
    pending: VecDeque<String>,
    finished: bool,
}

impl LogPaging {
    /// Take one fetched page. Returns true when nothing new arrived and the
    /// caller should wait before asking again.
    fn absorb(&mut self, page: Vec<String>, stopped: bool) -> bool {
        let page = real_lines(page);
        let got = page.len() as u64;
        self.next_line += got;
        self.pending.extend(page);
        if stopped && got < LOG_PAGE {
            self.finished = true;
            false
        } else {
            got == 0
        }
    }
}

/// An empty log comes back as a single `no content` row, which is not a line
/// of the file and must not move the offset.
fn real_lines(page: Vec<String>) -> Vec<String> {
    if page.len() == 1 && page[0] == NO_CONTENT {
        Vec::new()
    } else {
        page
    }
}

struct LogCursor<'a> {
    client: &'a PveClient,
    upid: Upid,
    paging: LogPaging,
}

impl<'a> LogCursor<'a> {
    /// Next line, paging forward until the task is stopped and drained.
    async fn advance(mut self) -> Option<(Result<String, PveError>, Self)> {
        loop {
            if let Some(line) = self.paging.pending.pop_front() {
                return Some((Ok(line), self));
            }
            if self.paging.finished {
                return None;
            }

            // Status first: a stopped task has written its last line already.
            let stopped = match self.client.fetch_status(&self.upid).await {
                Ok(status) => status.is_stopped(),
                Err(e) => {
                    self.paging.finished = true;
                    return Some((Err(e), self));
                }
            };
            let page = match self.client.fetch_log(&self.upid, self.paging.next_line).await {
                Ok(page) => page,
                Err(e) => {
                    self.paging.finished = true;
                    return Some((Err(e), self));
                }
            };

            if self.paging.absorb(page, stopped) {
                tokio::time::sleep(self.client.poll_interval).await;
            }
        }
    }
}

fn task_status_from(raw: RawTaskStatus) -> TaskStatus {
    match raw.status.as_str() {
        "running" => TaskStatus::Running,
        _ => TaskStatus::Stopped {
            exit_status: raw.exitstatus.unwrap_or_default(),
        },
    }
}

fn decode_next_id(value: Value) -> Result<u32, PveError> {
    let bad = |shown: String| PveError::Decode {
        context: "GET /cluster/nextid".into(),
        message: format!("not an id: {shown}"),
    };
    match value {
        Value::String(s) => s.trim().parse().map_err(|_| bad(format!("'{s}'"))),
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| bad(n.to_string())),
        other => Err(bad(other.to_string())),
    }
}

impl ClusterApi for PveClient {
    async fn nodes(&self) -> Result<Vec<String>, PveError> {
        #[derive(Deserialize)]
        struct Node {
            node: String,
        }
        let nodes: Vec<Node> = self.call(Method::GET, &["nodes"], None).await?;
        Ok(nodes.into_iter().map(|n| n.node).collect())
    }

    async fn guest_status(
        &self,
        node: &str,
        kind: GuestKind,
        id: u32,
    ) -> Result<Option<GuestSummary>, PveError> {
        let guests: Vec<GuestSummary> = self
            .call(Method::GET, &["nodes", node, kind.api_segment()], None)
            .await?;
        Ok(guests.into_iter().find(|g| g.vmid == id))
    }

    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>, PveError> {
        let params = Params::new().set("type", "vm");
        self.call(Method::GET, &["cluster", "resources"], Some(&params))
            .await
    }

    async fn submit_action(
        &self,
        guest: &GuestRef,
        action: &Action,
        params: &Params,
    ) -> Result<Upid, PveError> {
        self.call_task(action.method(), &action.path_segments(guest), Some(params))
            .await
    }

    async fn task_status(&self, upid: &Upid) -> Result<TaskStatus, PveError> {
        self.fetch_status(upid).await
    }

    async fn open_task_log(&self, upid: &Upid) -> Result<LogStream<'_>, PveError> {
        let first = self.fetch_log(upid, 0).await?;
        let mut paging = LogPaging::default();
        paging.absorb(first, false);
        let cursor = LogCursor {
            client: self,
            upid: upid.clone(),
            paging,
        };
        Ok(stream::unfold(cursor, LogCursor::advance).boxed_local())
    }

    async fn storages(&self, node: &str) -> Result<Vec<StorageInfo>, PveError> {
        self.call(Method::GET, &["nodes", node, "storage"], None)
            .await
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContentItem>, PveError> {
        let params = Params::new().set("content", "backup");
        self.call(
            Method::GET,
            &["nodes", node, "storage", storage, "content"],
            Some(&params),
        )
        .await
    }

    async fn next_id(&self) -> Result<u32, PveError> {
        decode_next_id(self.raw(Method::GET, &["cluster", "nextid"], None).await?)
    }

    async fn create_guest(
        &self,
        node: &str,
        kind: GuestKind,
        params: &Params,
    ) -> Result<Upid, PveError> {
        self.call_task(Method::POST, &["nodes", node, kind.api_segment()], Some(params))
            .await
    }

    async fn delete_archive(
        &self,
        node: &str,
        storage: &str,
        filename: &str,
    ) -> Result<Upid, PveError> {
        let volume = format!("{storage}:backup/{filename}");
        self.call_task(
            Method::DELETE,
            &["nodes", node, "storage", storage, "content", volume.as_str()],
            None,
        )
        .await
    }

    async fn vzdump(&self, node: &str, params: &Params) -> Result<Upid, PveError> {
        self.call_task(Method::POST, &["nodes", node, "vzdump"], Some(params))
            .await
    }

    async fn snapshots(&self, guest: &GuestRef) -> Result<Vec<Snapshot>, PveError> {
        let mut segments = guest.segments();
        segments.push("snapshot".into());
        self.call(Method::GET, &segments, None).await
    }

    async fn guest_config(&self, guest: &GuestRef) -> Result<GuestConfig, PveError> {
        let mut segments = guest.segments();
        segments.push("config".into());
        self.call(Method::GET, &segments, None).await
    }

    async fn update_config(&self, guest: &GuestRef, params: &Params) -> Result<(), PveError> {
        let mut segments = guest.segments();
        segments.push("config".into());
        self.raw(Method::PUT, &segments, Some(params)).await?;
        Ok(())
    }

    async fn users(&self) -> Result<Vec<User>, PveError> {
        self.call(Method::GET, &["access", "users"], None).await
    }

    async fn create_user(&self, params: &Params) -> Result<(), PveError> {
        self.raw(Method::POST, &["access", "users"], Some(params)).await?;
        Ok(())
    }

    async fn delete_user(&self, userid: &str) -> Result<(), PveError> {
        self.raw(Method::DELETE, &["access", "users", userid], None)
            .await?;
        Ok(())
    }

    async fn groups(&self) -> Result<Vec<Group>, PveError> {
        self.call(Method::GET, &["access", "groups"], None).await
    }

    async fn create_group(&self, params: &Params) -> Result<(), PveError> {
        self.raw(Method::POST, &["access", "groups"], Some(params)).await?;
        Ok(())
    }

    async fn delete_group(&self, groupid: &str) -> Result<(), PveError> {
        self.raw(Method::DELETE, &["access", "groups", groupid], None)
            .await?;
        Ok(())
    }

    async fn acl(&self) -> Result<Vec<AclEntry>, PveError> {
        self.call(Method::GET, &["access", "acl"], None).await
    }

    async fn update_acl(&self, params: &Params) -> Result<(), PveError> {
        self.raw(Method::PUT, &["access", "acl"], Some(params)).await?;
        Ok(())
    }
}

fn join<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

/// Pick the most specific failure text: a custom status line, then the
/// body's per-parameter `errors`, then the generic reason.
fn error_message(reason: Option<String>, body: &str, canonical: Option<&str>) -> String {
    if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
        return reason;
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        if let Some(Value::Object(errors)) = obj.get("errors") {
            let mut parts: Vec<String> = errors
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{k}: {}", s.trim()),
                    other => format!("{k}: {other}"),
                })
                .collect();
            parts.sort();
            return parts.join("; ");
        }
        if let Some(Value::String(message)) = obj.get("message") {
            return message.trim().to_string();
        }
    }

    let body = body.trim();
    if !body.is_empty() && !body.starts_with('{') {
        return body.to_string();
    }
    canonical.unwrap_or("request failed").to_string()
}

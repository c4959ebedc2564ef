//! REST collaborators of the chat room: history, identity and product title.
//!
//! Every call is a single bearer-authenticated GET. Nothing here retries; the
//! caller decides what a failure means for the room.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use frames::chat::{ChatHistory, decode_chat_history};
use serde::Deserialize;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::session::Session;

const IDENTITY_PATH: &str = "/api/member/me";
const PRODUCT_PATH: &str = "/api/product/showOne/";

/// Source of a room's backlog.
#[async_trait::async_trait]
pub trait HistorySource: Send + Sync {
    /// Resolve the room for `product_id` and its confirmed messages, oldest
    /// first.
    async fn load_history(&self, product_id: i64, session: &Session) -> Result<ChatHistory, ChatError>;
}

/// History loader backed by the chat REST endpoint.
#[derive(Debug, Clone)]
pub struct HttpHistoryLoader {
    http: reqwest::Client,
    config: ChatConfig,
}

impl HttpHistoryLoader {
    /// # Errors
    ///
    /// Returns [`ChatError::Http`] if the HTTP client cannot be built.
    pub fn new(config: ChatConfig) -> Result<Self, ChatError> {
        let http = http_client(&config)?;
        Ok(Self { http, config })
    }

    #[must_use]
    pub fn with_client(http: reqwest::Client, config: ChatConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait::async_trait]
impl HistorySource for HttpHistoryLoader {
    async fn load_history(&self, product_id: i64, session: &Session) -> Result<ChatHistory, ChatError> {
        let token = session.token().ok_or(ChatError::LoginRequired)?;
        let url = self.config.history_url(product_id);
        let body = get_text(&self.http, &url, token).await?;

        let (history, rejected) = decode_chat_history(&body)?;
        for err in &rejected {
            tracing::warn!(product_id, room_id = history.chat_room_id, error = %err, "dropping history entry");
        }
        tracing::info!(
            product_id,
            room_id = history.chat_room_id,
            messages = history.messages.len(),
            "chat history loaded"
        );
        Ok(history)
    }
}

#[derive(Debug, Deserialize)]
struct MemberResponse {
    id: i64,
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    #[serde(default)]
    title: Option<String>,
}

/// Resolve the session for `token` from the member endpoint.
///
/// # Errors
///
/// Returns [`ChatError::LoginRequired`] without a token, otherwise any
/// transport, status or decoding failure.
pub async fn fetch_identity(
    http: &reqwest::Client,
    config: &ChatConfig,
    token: Option<&str>,
) -> Result<Session, ChatError> {
    let token = token.filter(|t| !t.trim().is_empty()).ok_or(ChatError::LoginRequired)?;
    let url = config.api_url(IDENTITY_PATH);
    let body = get_text(http, &url, token).await?;
    let member: MemberResponse =
        serde_json::from_str(&body).map_err(|err| ChatError::Protocol(err.into()))?;
    if member.id <= 0 {
        return Err(ChatError::Protocol(frames::chat::ProtocolError::InvalidId {
            field: "id",
            value: member.id,
        }));
    }
    let nickname = member.nickname.unwrap_or_else(|| format!("user-{}", member.id));
    Ok(Session::new(member.id, nickname, Some(token.to_owned())))
}

/// Product title for the room header, `None` when the product has none.
///
/// # Errors
///
/// Returns any transport, status or decoding failure.
pub async fn fetch_product_title(
    http: &reqwest::Client,
    config: &ChatConfig,
    product_id: i64,
    session: &Session,
) -> Result<Option<String>, ChatError> {
    let url = config.api_url(&format!("{PRODUCT_PATH}{product_id}"));
    let mut request = http.get(&url);
    if let Some(token) = session.token() {
        request = request.bearer_auth(token);
    }
    let body = read_success(request.send().await?, &url).await?;
    let product: ProductResponse =
        serde_json::from_str(&body).map_err(|err| ChatError::Protocol(err.into()))?;
    Ok(product.title.filter(|t| !t.trim().is_empty()))
}

/// Header line for a room view: `"{productId}. {title}"`, or just the id.
#[must_use]
pub fn room_header(product_id: i64, title: Option<&str>) -> String {
    match title {
        Some(title) => format!("{product_id}. {title}"),
        None => format!("{product_id}."),
    }
}

/// HTTP client with the configured request timeout.
///
/// # Errors
///
/// Returns [`ChatError::Http`] if the client cannot be built.
pub fn http_client(config: &ChatConfig) -> Result<reqwest::Client, ChatError> {
    Ok(reqwest::Client::builder().timeout(config.request_timeout).build()?)
}

async fn get_text(http: &reqwest::Client, url: &str, token: &str) -> Result<String, ChatError> {
    let response = http.get(url).bearer_auth(token).send().await.map_err(|err| {
        tracing::warn!(url, error = %err, "chat api request failed");
        ChatError::Http(err)
    })?;
    read_success(response, url).await
}

async fn read_success(response: reqwest::Response, url: &str) -> Result<String, ChatError> {
    let status = response.status();
    if !status.is_success() {
        tracing::warn!(url, status = status.as_u16(), "chat api returned error status");
        return Err(ChatError::HttpStatus { endpoint: url.to_owned(), status: status.as_u16() });
    }
    Ok(response.text().await?)
}

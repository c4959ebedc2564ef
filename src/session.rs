//! Authenticated identity of the local participant.
//!
//! The session is passed explicitly to everything that needs it; nothing in
//! this crate reads ambient token storage.

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

/// Who is chatting, and the bearer token their requests carry.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: i64,
    pub nickname: String,
    token: Option<String>,
}

impl Session {
    #[must_use]
    pub fn new(user_id: i64, nickname: impl Into<String>, token: Option<String>) -> Self {
        let token = token.filter(|t| !t.trim().is_empty());
        Self { user_id, nickname: nickname.into(), token }
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// `Authorization` header value, if a token is present.
    #[must_use]
    pub fn bearer(&self) -> Option<String> {
        self.token.as_deref().map(|t| format!("Bearer {t}"))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("nickname", &self.nickname)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

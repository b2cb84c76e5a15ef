//! Who is on the other end of a connection.

use axum::extract::Query;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::error::SessionError;

/// Identity and room of one connection, fixed at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub room_id: String,
    pub role: Option<String>,
}

/// Resolves the session from the upgrade request.
///
/// Authentication lives outside this crate; a resolver is where it plugs in.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, request: &Request) -> Result<Session, SessionError>;
}

/// Reads `?userId=&roomId=&role=` from the request URI and trusts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuerySessionResolver;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    user_id: String,
    room_id: String,
    #[serde(default)]
    role: Option<String>,
}

impl SessionResolver for QuerySessionResolver {
    fn resolve(&self, request: &Request) -> Result<Session, SessionError> {
        let Query(query) = Query::<SessionQuery>::try_from_uri(request.uri())
            .map_err(|e| SessionError::Malformed(e.body_text()))?;
        if query.user_id.is_empty() {
            return Err(SessionError::Empty("userId"));
        }
        if query.room_id.is_empty() {
            return Err(SessionError::Empty("roomId"));
        }
        Ok(Session {
            user_id: query.user_id,
            room_id: query.room_id,
            role: query.role.filter(|role| !role.is_empty()),
        })
    }
}

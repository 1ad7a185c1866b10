use serde::{Deserialize, Serialize};

// -- JWT Claims --

/// JWT claims shared across parley-api (REST middleware) and parley-gateway
/// (WebSocket identification). Canonical definition lives here in
/// parley-types to eliminate duplication. `sub` is the canonical numeric
/// user id — every identity comparison in the system happens on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub name: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: i64,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: i64,
    pub name: String,
    pub token: String,
}

// -- Message history --

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub user_id: i64,
    pub author_name: String,
    pub content: String,
    pub room_id: String,
    pub is_group: bool,
    pub created_at: String,
}

use axum::{
    extract::{Path, State},
    response::Redirect,
    Json,
};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use mini_profiler::ProfileContext;

use super::{AppState, DemoError};

// ─── Domain types ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateNoteRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

const NEXT_ID_KEY: &str = "note:next_id";

fn note_key(id: u64) -> String {
    format!("note:{id}")
}

// ─── GET /notes/:id ──────────────────────────────────────────────

pub async fn get_note(
    State(state): State<Arc<AppState>>,
    profile: ProfileContext,
    Path(id): Path<u64>,
) -> Result<Json<Note>, DemoError> {
    let key = note_key(id);
    let mut conn = state.redis.clone();

    let map: HashMap<String, String> = profile
        .time_rpc(
            "redis",
            format!("HGETALL {key}"),
            Some(key.as_str()),
            conn.hgetall::<_, HashMap<String, String>>(&key),
        )
        .await?;

    if map.is_empty() {
        tracing::info!(id, "note not found");
        return Err(DemoError::NotFound(format!("note {id} not found")));
    }
    tracing::info!(id, "loaded note");
    Ok(Json(note_from_map(id, &map)))
}

// ─── GET /notes/latest ───────────────────────────────────────────

/// Redirects to the newest note.
pub async fn latest_note(
    State(state): State<Arc<AppState>>,
    profile: ProfileContext,
) -> Result<Redirect, DemoError> {
    let mut conn = state.redis.clone();
    let latest: Option<u64> = profile
        .time_rpc(
            "redis",
            format!("GET {NEXT_ID_KEY}"),
            Some(NEXT_ID_KEY),
            conn.get::<_, Option<u64>>(NEXT_ID_KEY),
        )
        .await?;
    let id = latest.ok_or_else(|| DemoError::NotFound("no notes yet".into()))?;
    Ok(Redirect::temporary(&format!("/notes/{id}")))
}

// ─── POST /notes ─────────────────────────────────────────────────

/// Stores the note and answers `303 See Other` pointing at it.
pub async fn create_note(
    State(state): State<Arc<AppState>>,
    profile: ProfileContext,
    Json(req): Json<CreateNoteRequest>,
) -> Result<Redirect, DemoError> {
    let mut conn = state.redis.clone();
    let id: u64 = profile
        .time_rpc(
            "redis",
            format!("INCR {NEXT_ID_KEY}"),
            Some(NEXT_ID_KEY),
            conn.incr::<_, _, u64>(NEXT_ID_KEY, 1),
        )
        .await?;

    let key = note_key(id);
    let created_at = chrono::Utc::now().to_rfc3339();
    let mut cmd = redis::cmd("HSET");
    cmd.arg(&key)
        .arg("title")
        .arg(&req.title)
        .arg("body")
        .arg(&req.body)
        .arg("created_at")
        .arg(&created_at);
    let _: () = profile
        .time_rpc(
            "redis",
            format!("HSET {key}"),
            Some(key.as_str()),
            cmd.query_async(&mut conn),
        )
        .await?;

    tracing::info!(id, title = %req.title, "created note");
    Ok(Redirect::to(&format!("/notes/{id}")))
}

// ─── Helpers ─────────────────────────────────────────────────────

fn note_from_map(id: u64, map: &HashMap<String, String>) -> Note {
    Note {
        id,
        title: map.get("title").cloned().unwrap_or_default(),
        body: map.get("body").cloned().unwrap_or_default(),
        created_at: map.get("created_at").cloned().unwrap_or_default(),
    }
}

/// Writes a first note so `/notes/latest` has somewhere to go.
pub async fn seed(conn: &redis::aio::ConnectionManager) -> Result<(), redis::RedisError> {
    let mut conn = conn.clone();
    let existing: Option<u64> = conn.get(NEXT_ID_KEY).await?;
    if existing.is_some() {
        return Ok(());
    }
    let id: u64 = conn.incr(NEXT_ID_KEY, 1).await?;
    let _: () = conn
        .hset_multiple(
            note_key(id),
            &[
                ("title", "Welcome"),
                ("body", "Open the profiler popup to see this request's Redis calls."),
            ],
        )
        .await?;
    tracing::info!(id, "seeded first note");
    Ok(())
}

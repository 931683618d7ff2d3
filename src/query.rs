use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::id::RequestId;
use crate::record::ProfileRecord;
use crate::store::ProfileStore;

/// One answer of a query, in the position of the id that asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    /// The id as the client sent it.
    pub id: String,
    #[serde(flatten)]
    pub result: Lookup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Lookup {
    Found { profile: Box<ProfileRecord> },
    /// Never stored, or its TTL ran out.
    Expired,
    /// Not something this profiler could have handed out.
    Invalid,
}

impl QueryEntry {
    pub fn profile(&self) -> Option<&ProfileRecord> {
        match &self.result {
            Lookup::Found { profile } => Some(profile),
            Lookup::Expired | Lookup::Invalid => None,
        }
    }
}

/// One token of a comma separated id list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdToken {
    Valid(RequestId),
    Invalid(String),
}

impl IdToken {
    pub fn as_str(&self) -> &str {
        match self {
            IdToken::Valid(id) => id.as_str(),
            IdToken::Invalid(raw) => raw,
        }
    }
}

/// Records for `ids` in order, repeated ids answered once.
///
/// Misses are per-id markers; only an unreachable or slow store fails the
/// whole call.
pub async fn query(
    store: &dyn ProfileStore,
    ids: &[RequestId],
    timeout: Duration,
) -> Result<Vec<QueryEntry>, QueryError> {
    let mut unique: Vec<RequestId> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    if unique.is_empty() {
        return Ok(Vec::new());
    }

    let found = tokio::time::timeout(timeout, store.get(&unique))
        .await
        .map_err(|_| QueryError::Timeout(timeout))??;

    Ok(unique
        .into_iter()
        .zip(found.into_iter().chain(std::iter::repeat_with(|| None)))
        .map(|(id, record)| QueryEntry {
            id: id.to_string(),
            result: match record {
                Some(record) => Lookup::Found {
                    profile: Box::new(record),
                },
                None => Lookup::Expired,
            },
        })
        .collect())
}

/// Like [`query`], for a list as the client sent it. Malformed tokens keep
/// their position and are answered as invalid.
pub async fn query_list(
    store: &dyn ProfileStore,
    tokens: &[IdToken],
    timeout: Duration,
) -> Result<Vec<QueryEntry>, QueryError> {
    let ids: Vec<RequestId> = tokens
        .iter()
        .filter_map(|token| match token {
            IdToken::Valid(id) => Some(id.clone()),
            IdToken::Invalid(_) => None,
        })
        .collect();
    // One entry per distinct valid id, in first-seen order.
    let mut found = query(store, &ids, timeout).await?.into_iter();

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(tokens.len());
    for token in tokens {
        if !seen.insert(token.as_str()) {
            continue;
        }
        match token {
            IdToken::Valid(_) => entries.extend(found.next()),
            IdToken::Invalid(raw) => entries.push(QueryEntry {
                id: raw.clone(),
                result: Lookup::Invalid,
            }),
        }
    }
    Ok(entries)
}

/// Tokens of a comma separated list. Empty tokens are dropped.
pub fn parse_id_list(raw: &str) -> Vec<IdToken> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| match RequestId::parse(token) {
            Some(id) => IdToken::Valid(id),
            None => IdToken::Invalid(token.to_owned()),
        })
        .collect()
}

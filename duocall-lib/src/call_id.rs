use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const QUERY_KEY: &str = "callId";

static CALL_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$").unwrap()
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallIdError {
    #[error("not a lowercase UUID v4: {0:?}")]
    Malformed(String),
    #[error("no callId parameter in {0:?}")]
    MissingParameter(String),
}

/// Identifier shared by the two participants of a call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(value: &str) -> Result<Self, CallIdError> {
        if !CALL_ID_PATTERN.is_match(value) {
            return Err(CallIdError::Malformed(value.to_owned()));
        }
        Ok(Self(value.to_owned()))
    }

    /// Accepts `?callId=...`, `callId=...&x=y` or a full URL carrying the parameter.
    pub fn from_query(query: &str) -> Result<Self, CallIdError> {
        let query = match query.split_once('?') {
            Some((_, query)) => query,
            None => query,
        };
        let value = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find_map(|(key, value)| (key == QUERY_KEY).then_some(value))
            .ok_or_else(|| CallIdError::MissingParameter(query.to_owned()))?;
        Self::parse(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_query(&self) -> String {
        format!("?{}={}", QUERY_KEY, self.0)
    }
}

/// Resolves user input into a call id. Anything unusable is replaced by a
/// fresh id; the flag tells whether that replacement happened.
pub fn resolve_call_id(input: Option<&str>) -> (CallId, bool) {
    let Some(input) = input.map(str::trim).filter(|x| !x.is_empty()) else {
        return (CallId::generate(), true);
    };
    match CallId::parse(input).or_else(|_| CallId::from_query(input)) {
        Ok(call_id) => (call_id, false),
        Err(_) => (CallId::generate(), true),
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CallId {
    type Err = CallIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CallId {
    type Error = CallIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CallId> for String {
    fn from(value: CallId) -> Self {
        value.0
    }
}

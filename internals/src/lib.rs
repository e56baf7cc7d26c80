use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

#[derive(Clone, PartialEq, Default, Debug)]
pub struct Message {
    pub uuid: String,
    pub payload: String,
    pub metadata: Option<Metadata>,
}

#[derive(Clone, PartialEq, Default, Debug)]
pub struct Metadata {
    pub headers: HashMap<String, String>,
    pub created_at: Duration, // since UNIX_EPOCH
    pub redelivered: bool,
}

impl Message {
    pub fn new(payload: impl Into<String>) -> Self {
        Message {
            uuid: Uuid::new_v4().to_string(),
            payload: payload.into(),
            metadata: Some(Metadata {
                headers: HashMap::new(),
                created_at: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default(),
                redelivered: false,
            }),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::default)
            .headers
            .insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|md| md.headers.get(key))
            .map(String::as_str)
    }

    pub fn is_redelivered(&self) -> bool {
        self.metadata.as_ref().is_some_and(|md| md.redelivered)
    }

    pub fn mark_redelivered(&mut self) {
        self.metadata
            .get_or_insert_with(Metadata::default)
            .redelivered = true;
    }
}

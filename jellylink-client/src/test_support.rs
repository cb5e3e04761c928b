use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::future::BoxFuture;
use jellylink_core::{
    MINIMUM_SERVER_VERSION, ServerVersion, ValidatedServer, ValidationError, ValidationResult,
};
use tokio::sync::Notify;
use url::Url;

use crate::probe::ConnectionProbe;

/// Probe double answering from a per-URI script; unscripted URIs time out.
#[derive(Default)]
pub struct ScriptedProbe {
    scripts: Mutex<HashMap<String, Vec<ValidationResult>>>,
    calls: Mutex<Vec<Url>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every probe waits for `gate.notify_one()` before answering.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Queues answers for `uri`; the last one repeats once the rest are used.
    pub fn script(self, uri: &str, results: Vec<ValidationResult>) -> Self {
        let key = Url::parse(uri).expect("valid scripted uri").to_string();
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(key, results);
        self
    }

    pub fn calls(&self) -> Vec<Url> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn answer(&self, uri: &Url) -> ValidationResult {
        self.calls.lock().expect("calls lock").push(uri.clone());
        let mut scripts = self.scripts.lock().expect("scripts lock");
        match scripts.get_mut(uri.as_str()) {
            Some(results) if results.len() > 1 => results.remove(0),
            Some(results) if !results.is_empty() => results[0].clone(),
            _ => timed_out(),
        }
    }
}

impl ConnectionProbe for ScriptedProbe {
    fn probe<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, ValidationResult> {
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.answer(uri)
        })
    }
}

pub fn valid(uri: &str) -> ValidationResult {
    valid_with_version(uri, MINIMUM_SERVER_VERSION)
}

pub fn valid_with_version(uri: &str, version: ServerVersion) -> ValidationResult {
    ValidationResult::Valid(ValidatedServer {
        resolved_uri: Url::parse(uri).expect("valid uri"),
        version,
        server_name: Some("test".to_owned()),
    })
}

pub fn timed_out() -> ValidationResult {
    ValidationResult::Failed(ValidationError::transport("timed out"))
}

pub fn http_status(status: u16) -> ValidationResult {
    ValidationResult::Failed(ValidationError::HttpStatus { status })
}

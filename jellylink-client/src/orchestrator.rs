use std::{sync::Arc, time::Duration};

use jellylink_core::{CandidateEndpoint, ValidatedServer, ValidationError, ValidationResult};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::{probe::ConnectionProbe, progress::ProgressQueue, settings::SettingsStore};

/// Tries candidates strictly in order and commits the first one that validates.
pub struct Validator {
    probe: Arc<dyn ConnectionProbe>,
    settings: Arc<dyn SettingsStore>,
    progress: Option<ProgressQueue>,
    attempt_timeout: Duration,
}

impl Validator {
    pub fn new(
        probe: Arc<dyn ConnectionProbe>,
        settings: Arc<dyn SettingsStore>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            settings,
            progress: None,
            attempt_timeout,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressQueue) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the first valid candidate, or the failure of the last one tried.
    ///
    /// Failures of earlier candidates are logged but not returned.
    pub async fn validate(&self, candidates: &[CandidateEndpoint]) -> ValidationResult {
        let mut last = ValidationResult::Failed(ValidationError::NoCandidates);

        for candidate in candidates {
            let ticket = self
                .progress
                .as_ref()
                .map(|progress| progress.enqueue(format!("Checking {} ...", candidate.uri)));

            info!(candidate = %candidate.uri, rank = candidate.rank, "probing candidate");
            let result = match timeout(self.attempt_timeout, self.probe.probe(&candidate.uri)).await
            {
                Ok(result) => result,
                Err(_) => ValidationResult::Failed(ValidationError::transport(format!(
                    "probe of {} timed out after {:?}",
                    candidate.uri, self.attempt_timeout
                ))),
            };

            if let (Some(progress), Some(ticket)) = (&self.progress, ticket) {
                progress.done(ticket);
            }

            match result {
                ValidationResult::Valid(server) => {
                    info!(
                        candidate = %candidate.uri,
                        resolved = %server.resolved_uri,
                        version = %server.version,
                        "server validated"
                    );
                    self.commit(&server).await;
                    return ValidationResult::Valid(server);
                }
                ValidationResult::Failed(err) => {
                    warn!(
                        candidate = %candidate.uri,
                        temporary = err.is_temporary(),
                        "candidate rejected: {err}"
                    );
                    last = ValidationResult::Failed(err);
                }
            }
        }

        last
    }

    async fn commit(&self, server: &ValidatedServer) {
        let settings = Arc::clone(&self.settings);
        let address = server.resolved_uri.to_string();
        let saved = tokio::task::spawn_blocking(move || settings.set_server_address(&address)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(resolved = %server.resolved_uri, "could not save server address: {err}"),
            Err(err) => error!("settings save task failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use jellylink_core::resolve_candidates;

    use super::*;
    use crate::{
        settings::MemorySettingsStore,
        test_support::{ScriptedProbe, http_status, timed_out, valid},
    };

    fn validator(probe: Arc<ScriptedProbe>, settings: Arc<MemorySettingsStore>) -> Validator {
        Validator::new(probe, settings, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn first_success_stops_probing() {
        let probe = Arc::new(ScriptedProbe::new().script("https://myserver", vec![valid("https://myserver")]));
        let settings = Arc::new(MemorySettingsStore::new());
        let candidates = resolve_candidates("myserver").unwrap();

        let result = validator(probe.clone(), settings.clone()).validate(&candidates).await;

        assert!(result.is_valid());
        assert_eq!(probe.calls(), vec![candidates[0].uri.clone()]);
        assert_eq!(settings.server_address().as_deref(), Some("https://myserver/"));
    }

    #[tokio::test]
    async fn candidates_are_tried_in_order() {
        let probe = Arc::new(ScriptedProbe::new());
        let settings = Arc::new(MemorySettingsStore::new());
        let candidates = resolve_candidates("myserver").unwrap();

        let result = validator(probe.clone(), settings.clone()).validate(&candidates).await;

        assert!(result.is_temporary_error());
        let expected: Vec<_> = candidates.iter().map(|c| c.uri.clone()).collect();
        assert_eq!(probe.calls(), expected);
        assert_eq!(settings.server_address(), None);
    }

    #[tokio::test]
    async fn last_candidate_error_is_surfaced() {
        let probe = Arc::new(
            ScriptedProbe::new()
                .script("https://localhost:8096", vec![http_status(500)])
                .script("http://localhost:8096", vec![timed_out()]),
        );
        let candidates = resolve_candidates("localhost:8096").unwrap();

        let result = validator(probe, Arc::new(MemorySettingsStore::new()))
            .validate(&candidates)
            .await;

        assert!(result.is_temporary_error(), "earlier permanent error leaked: {result:?}");
    }

    #[tokio::test]
    async fn permanent_failure_on_final_candidate_is_verbatim() {
        let probe = Arc::new(ScriptedProbe::new().script("http://jf.lan", vec![http_status(404)]));
        let candidates = resolve_candidates("http://jf.lan").unwrap();

        let result = validator(probe, Arc::new(MemorySettingsStore::new()))
            .validate(&candidates)
            .await;

        assert_eq!(result, http_status(404));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_permanent() {
        let result = validator(Arc::new(ScriptedProbe::new()), Arc::new(MemorySettingsStore::new()))
            .validate(&[])
            .await;
        assert!(!result.is_valid());
        assert!(!result.is_temporary_error());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_is_a_temporary_failure() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let probe = Arc::new(ScriptedProbe::gated(gate));
        let candidates = resolve_candidates("http://jf.lan").unwrap();

        let result = Validator::new(probe, Arc::new(MemorySettingsStore::new()), Duration::from_secs(1))
            .validate(&candidates)
            .await;

        assert!(result.is_temporary_error());
        assert!(result.error_message().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn progress_queue_is_drained_after_validation() {
        let progress = ProgressQueue::new();
        let mut rx = progress.subscribe();
        let probe = Arc::new(ScriptedProbe::new().script("http://jf.lan", vec![valid("http://jf.lan")]));
        let candidates = resolve_candidates("http://jf.lan").unwrap();

        validator(probe, Arc::new(MemorySettingsStore::new()))
            .with_progress(progress.clone())
            .validate(&candidates)
            .await;

        assert!(rx.has_changed().unwrap());
        assert!(!progress.is_waiting());
    }
}

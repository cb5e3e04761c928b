use std::time::Duration;

use jellylink_core::{
    CandidateEndpoint, InputError, ValidatedServer, ValidationResult, resolve_candidates,
};
use tracing::{debug, info};

use crate::{
    navigation::{Destination, Navigator},
    orchestrator::Validator,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Connected(ValidatedServer),
    Rejected(String),
    /// Temporary failure; hand `candidates` to a retry scheduler.
    RetryScheduled {
        candidates: Vec<CandidateEndpoint>,
        retry_after: Option<Duration>,
        reason: String,
    },
}

/// Validates a typed server address and fires exactly one navigation.
///
/// Input errors return before any probing and never navigate.
pub async fn submit_address(
    input: &str,
    validator: &Validator,
    navigator: &dyn Navigator,
) -> Result<Submission, InputError> {
    let candidates = resolve_candidates(input).inspect_err(|err| {
        debug!(input, "address rejected: {err}");
    })?;
    info!(input, candidates = candidates.len(), "validating server address");

    let submission = match validator.validate(&candidates).await {
        ValidationResult::Valid(server) => {
            navigator.navigate(Destination::Main);
            Submission::Connected(server)
        }
        ValidationResult::Failed(err) if err.is_temporary() => {
            let retry_after = err.retry_after();
            navigator.navigate(Destination::RetryWait { retry_after });
            Submission::RetryScheduled {
                candidates,
                retry_after,
                reason: err.to_string(),
            }
        }
        ValidationResult::Failed(err) => {
            let message = err.to_string();
            navigator.navigate(Destination::Onboarding {
                error_message: Some(message.clone()),
            });
            Submission::Rejected(message)
        }
    };
    Ok(submission)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jellylink_core::ServerVersion;
    use url::Url;

    use super::*;
    use crate::{
        navigation::ChannelNavigator,
        settings::{MemorySettingsStore, SettingsStore},
        test_support::{ScriptedProbe, http_status, timed_out, valid_with_version},
    };

    #[tokio::test]
    async fn bare_host_falls_through_to_plain_http() {
        let probe = Arc::new(
            ScriptedProbe::new()
                .script("https://myserver:443", vec![timed_out()])
                .script(
                    "http://myserver:80",
                    vec![valid_with_version("http://myserver:80", ServerVersion::new(10, 11, 0, 0))],
                ),
        );
        let settings = Arc::new(MemorySettingsStore::new());
        let validator = Validator::new(probe.clone(), settings.clone(), Duration::from_secs(30));
        let (navigator, mut destinations) = ChannelNavigator::new();

        let submission = submit_address("myserver", &validator, &navigator).await.unwrap();

        let expected = Url::parse("http://myserver:80").unwrap();
        match submission {
            Submission::Connected(server) => {
                assert_eq!(server.resolved_uri, expected);
                assert_eq!(server.version, ServerVersion::new(10, 11, 0, 0));
            }
            other => panic!("unexpected submission {other:?}"),
        }
        assert_eq!(probe.calls().len(), 2);
        assert_eq!(settings.server_address().as_deref(), Some(expected.as_str()));
        assert_eq!(destinations.recv().await, Some(Destination::Main));
        assert!(destinations.try_recv().is_err());
    }

    #[tokio::test]
    async fn blank_input_never_probes_or_navigates() {
        let probe = Arc::new(ScriptedProbe::new());
        let validator = Validator::new(
            probe.clone(),
            Arc::new(MemorySettingsStore::new()),
            Duration::from_secs(30),
        );
        let (navigator, mut destinations) = ChannelNavigator::new();

        let err = submit_address("  ", &validator, &navigator).await.unwrap_err();

        assert_eq!(err, InputError::Empty);
        assert!(probe.calls().is_empty());
        assert!(destinations.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_server_schedules_retry() {
        let validator = Validator::new(
            Arc::new(ScriptedProbe::new()),
            Arc::new(MemorySettingsStore::new()),
            Duration::from_secs(30),
        );
        let (navigator, mut destinations) = ChannelNavigator::new();

        let submission = submit_address("jf.lan:8096", &validator, &navigator).await.unwrap();

        match submission {
            Submission::RetryScheduled { candidates, retry_after, .. } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(retry_after, None);
            }
            other => panic!("unexpected submission {other:?}"),
        }
        assert_eq!(
            destinations.recv().await,
            Some(Destination::RetryWait { retry_after: None })
        );
    }

    #[tokio::test]
    async fn permanent_failure_returns_to_onboarding_with_message() {
        let probe = Arc::new(ScriptedProbe::new().script("https://jf.example", vec![http_status(403)]));
        let validator = Validator::new(probe, Arc::new(MemorySettingsStore::new()), Duration::from_secs(30));
        let (navigator, mut destinations) = ChannelNavigator::new();

        let submission = submit_address("https://jf.example", &validator, &navigator)
            .await
            .unwrap();

        let Submission::Rejected(message) = submission else {
            panic!("expected rejection");
        };
        assert!(message.contains("403"));
        assert_eq!(
            destinations.recv().await,
            Some(Destination::Onboarding {
                error_message: Some(message)
            })
        );
    }
}

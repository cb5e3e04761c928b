use std::{error::Error as _, time::Duration};

use futures::future::BoxFuture;
use jellylink_core::{
    ValidatedServer, ValidationError, ValidationResult, check_public_info, decode_public_info,
    public_info_url, strip_web_client_path,
};
use reqwest::{StatusCode, header::LOCATION};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConnectConfig;

/// One network validation of one candidate endpoint.
///
/// Owns all network I/O so the orchestrator can be driven by a test double.
pub trait ConnectionProbe: Send + Sync {
    fn probe<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, ValidationResult>;
}

#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(config: &ConnectConfig) -> Result<Self, reqwest::Error> {
        // Redirects are followed by hand so exactly one hop is allowed.
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            timeout: config.probe_timeout,
        })
    }

    async fn run(&self, uri: &Url) -> Result<ValidatedServer, ValidationError> {
        let mut current = uri.clone();
        let mut redirected = false;

        loop {
            debug!(uri = %current, "checking endpoint");
            let response = self
                .client
                .head(current.clone())
                .send()
                .await
                .map_err(|err| self.transport_error(&current, &err))?;
            let status = response.status();

            if is_single_redirect(status) && !redirected {
                let target = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|location| location.to_str().ok())
                    .and_then(|location| current.join(location).ok())
                    .ok_or(ValidationError::RedirectWithoutLocation {
                        status: status.as_u16(),
                    })?;
                info!(from = %current, to = %target, "following redirect");
                current = target;
                redirected = true;
                continue;
            }

            if !status.is_success() {
                return Err(ValidationError::HttpStatus {
                    status: status.as_u16(),
                });
            }
            break;
        }

        self.fetch_public_info(strip_web_client_path(&current)).await
    }

    async fn fetch_public_info(&self, base: Url) -> Result<ValidatedServer, ValidationError> {
        let info_url = public_info_url(&base);
        let response = self
            .client
            .get(info_url.clone())
            .send()
            .await
            .map_err(|err| self.transport_error(&info_url, &err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ValidationError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.transport_error(&info_url, &err))?;
        let info = decode_public_info(&body)?;
        let version = check_public_info(&info)?;

        Ok(ValidatedServer {
            resolved_uri: base,
            version,
            server_name: info.server_name,
        })
    }

    fn transport_error(&self, uri: &Url, err: &reqwest::Error) -> ValidationError {
        let message = if err.is_timeout() {
            format!("request to {uri} timed out after {:?}", self.timeout)
        } else {
            describe_error_chain(err)
        };
        warn!(uri = %uri, "transport failure: {message}");
        ValidationError::transport(message)
    }
}

impl ConnectionProbe for HttpProbe {
    fn probe<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, ValidationResult> {
        Box::pin(async move {
            match self.run(uri).await {
                Ok(server) => ValidationResult::Valid(server),
                Err(err) => ValidationResult::Failed(err),
            }
        })
    }
}

fn is_single_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn describe_error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_location_bearing_statuses_are_followed() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_single_redirect(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200, 300, 304, 404, 500] {
            assert!(!is_single_redirect(StatusCode::from_u16(code).unwrap()));
        }
    }
}

//! Remote restriction client
//!
//! Pushes content-rating filters to media-server accounts. The enforcement
//! loop only talks to the [`RestrictionClient`] trait; [`PlexRestrictionClient`]
//! is the HTTP implementation.

use crate::enforcement::{CompiledFilters, EnforcementError, EnforcementResult};
use std::time::Duration;
use tracing::debug;

/// Query parameter carrying the admin token
const TOKEN_PARAM: &str = "X-Plex-Token";
const MOVIE_FILTER_PARAM: &str = "filterMovies";
const TV_FILTER_PARAM: &str = "filterTelevision";

/// Apply and clear per-account content filters
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RestrictionClient: Send + Sync {
    /// Set the account's filters to `filters`, leaving empty ones out
    async fn apply_filter(
        &self,
        remote_id: &str,
        filters: &CompiledFilters,
        token: &str,
    ) -> EnforcementResult<()>;

    /// Remove every filter from the account
    async fn clear_filter(&self, remote_id: &str, token: &str) -> EnforcementResult<()>;
}

/// Query pairs for an apply call; unrestricted libraries are omitted
#[must_use]
pub fn apply_params(filters: &CompiledFilters, token: &str) -> Vec<(&'static str, String)> {
    let mut params = vec![(TOKEN_PARAM, token.to_string())];
    if !filters.movie.is_unrestricted() {
        params.push((MOVIE_FILTER_PARAM, filters.movie.to_string()));
    }
    if !filters.tv.is_unrestricted() {
        params.push((TV_FILTER_PARAM, filters.tv.to_string()));
    }
    params
}

/// Query pairs for a clear call
#[must_use]
pub fn clear_params(token: &str) -> Vec<(&'static str, String)> {
    vec![
        (TOKEN_PARAM, token.to_string()),
        (MOVIE_FILTER_PARAM, String::new()),
        (TV_FILTER_PARAM, String::new()),
    ]
}

/// HTTP client for the Plex account API
#[derive(Debug, Clone)]
pub struct PlexRestrictionClient {
    http: reqwest::Client,
    base_url: String,
}

impl PlexRestrictionClient {
    /// Build a client against `base_url` with a per-request timeout
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> EnforcementResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn user_url(&self, remote_id: &str) -> String {
        format!("{}/api/users/{remote_id}", self.base_url)
    }

    async fn put(&self, remote_id: &str, params: &[(&'static str, String)]) -> EnforcementResult<()> {
        let response = self
            .http
            .put(self.user_url(remote_id))
            .query(params)
            .send()
            .await?;

        let status = response.status();
        debug!(account = %remote_id, status = status.as_u16(), "Restriction call finished");
        if status.is_success() {
            Ok(())
        } else {
            Err(EnforcementError::RemoteStatus {
                status: status.as_u16(),
                account: remote_id.to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl RestrictionClient for PlexRestrictionClient {
    async fn apply_filter(
        &self,
        remote_id: &str,
        filters: &CompiledFilters,
        token: &str,
    ) -> EnforcementResult<()> {
        self.put(remote_id, &apply_params(filters, token)).await
    }

    async fn clear_filter(&self, remote_id: &str, token: &str) -> EnforcementResult<()> {
        self.put(remote_id, &clear_params(token)).await
    }
}

//! Routing provider implementations and the degrade-to-straight-line wrapper.

use ride_dispatch_core::collaborators::{RoutingError, RoutingProvider};
use ride_dispatch_core::geo::Polyline;
use ride_dispatch_core::types::Location;
use ride_dispatch_runtime::metrics::RoutingMetrics;
use ride_dispatch_runtime::retry::{RetryPolicy, retry_with_predicate};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// OSRM `route` service client.
///
/// Asks for the full overview geometry encoded as a precision-5 polyline,
/// which is exactly what rides cache.
#[derive(Clone, Debug)]
pub struct OsrmRoutingProvider {
    client: Client,
    base_url: String,
    profile: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: String,
}

impl OsrmRoutingProvider {
    /// Client for the `driving` profile at `base_url`
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            profile: "driving".to_string(),
            timeout,
        }
    }

    fn url(&self, from: &Location, to: &Location) -> String {
        format!(
            "{}/route/v1/{}/{},{};{},{}?overview=full&geometries=polyline",
            self.base_url, self.profile, from.lng, from.lat, to.lng, to.lat
        )
    }

    async fn fetch(&self, from: Location, to: Location) -> Result<Polyline, RoutingError> {
        let start = Instant::now();
        let response = self
            .client
            .get(self.url(&from, &to))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RoutingError::Timeout
                } else {
                    RoutingError::Unavailable(e.to_string())
                }
            })?;
        RoutingMetrics::record_request(start.elapsed());

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RoutingError::Unavailable(format!("HTTP {status}")));
        }

        // OSRM reports routing failures as 400 with a JSON body
        let body = response
            .json::<OsrmResponse>()
            .await
            .map_err(|e| RoutingError::InvalidResponse(e.to_string()))?;
        parse_route(body)
    }
}

fn parse_route(body: OsrmResponse) -> Result<Polyline, RoutingError> {
    match body.code.as_str() {
        "Ok" => body
            .routes
            .into_iter()
            .next()
            .map(|route| Polyline::new(route.geometry))
            .filter(|polyline| !polyline.is_empty())
            .ok_or(RoutingError::NoRoute),
        "NoRoute" | "NoSegment" => Err(RoutingError::NoRoute),
        other => Err(RoutingError::InvalidResponse(format!(
            "{other}: {}",
            body.message.unwrap_or_default()
        ))),
    }
}

impl RoutingProvider for OsrmRoutingProvider {
    fn route(
        &self,
        from: Location,
        to: Location,
    ) -> Pin<Box<dyn Future<Output = Result<Polyline, RoutingError>> + Send + '_>> {
        Box::pin(self.fetch(from, to))
    }
}

/// Provider used when no routing service is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct StraightLineRouting;

impl RoutingProvider for StraightLineRouting {
    fn route(
        &self,
        from: Location,
        to: Location,
    ) -> Pin<Box<dyn Future<Output = Result<Polyline, RoutingError>> + Send + '_>> {
        Box::pin(async move { Ok(Polyline::straight_line(&from, &to)) })
    }
}

/// Route between two points, never failing.
///
/// Transient errors are retried under `policy`; anything left over degrades
/// to a straight line. Returns the polyline and whether it is the fallback.
pub async fn route_or_straight_line(
    provider: &dyn RoutingProvider,
    policy: &RetryPolicy,
    from: &Location,
    to: &Location,
) -> (Polyline, bool) {
    let result = retry_with_predicate(
        "route",
        policy,
        || provider.route(from.clone(), to.clone()),
        RoutingError::is_transient,
    )
    .await;

    match result {
        Ok(polyline) => (polyline, false),
        Err(error) => {
            tracing::warn!(error = %error, "Routing failed, using straight line");
            RoutingMetrics::record_fallback();
            (Polyline::straight_line(from, to), true)
        },
    }
}

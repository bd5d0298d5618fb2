use std::sync::Arc;

use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::Service;
use crate::store::GatewayStore;

/// Mount point of the proxy surface.
pub const PROXY_MOUNT: &str = "/proxy";

/// Non-empty path segments after `/proxy`, still percent-encoded.
///
/// `/proxy/weather//v1/` yields `["weather", "v1"]`. Paths outside the
/// mount yield all of their segments.
pub fn proxy_segments(path: &str) -> Vec<String> {
    let rest = path
        .strip_prefix(PROXY_MOUNT)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(path);

    rest.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolved destination of a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub service: Service,
    /// Segments to append to the service's base URL
    pub remaining: Vec<String>,
}

/// Picks the upstream service for a proxied path.
///
/// Resolution order:
///
/// 1. an active service whose prefix equals the first segment (consumed)
/// 2. the active prefix-less default service (all segments kept)
/// 3. any active service, when the legacy fallback is enabled
///
/// A prefix that names an inactive service only matters when nothing else
/// matches: the request then fails as unavailable instead of not found.
#[derive(Clone)]
pub struct ServiceRouter {
    store: Arc<dyn GatewayStore>,
    any_active_fallback: bool,
}

impl ServiceRouter {
    pub fn new(store: Arc<dyn GatewayStore>, any_active_fallback: bool) -> Self {
        Self {
            store,
            any_active_fallback,
        }
    }

    /// # Errors
    ///
    /// `ServiceUnavailable` if only inactive services match, `ServiceNotFound`
    /// if nothing matches at all.
    pub async fn resolve(&self, segments: &[String]) -> AppResult<Route> {
        let mut disabled: Option<Service> = None;

        if let Some(candidate) = segments.first() {
            match self.store.find_service_by_prefix(candidate).await? {
                Some(service) if service.is_active => {
                    debug!(service = %service.name, prefix = %candidate, "Routed by prefix");
                    return Ok(Route {
                        service,
                        remaining: segments.iter().skip(1).cloned().collect(),
                    });
                }
                Some(service) => disabled = Some(service),
                None => {}
            }
        }

        match self.store.find_default_service().await? {
            Some(service) if service.is_active => {
                debug!(service = %service.name, "Routed to default service");
                return Ok(Route {
                    service,
                    remaining: segments.to_vec(),
                });
            }
            Some(service) => {
                disabled.get_or_insert(service);
            }
            None => {}
        }

        if self.any_active_fallback
            && let Some(service) = self.store.find_any_active_service().await?
        {
            debug!(service = %service.name, "Routed to fallback service");
            return Ok(Route {
                service,
                remaining: segments.to_vec(),
            });
        }

        match disabled {
            Some(service) => Err(AppError::ServiceUnavailable(service.name)),
            None => Err(AppError::ServiceNotFound),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service(id: &str, prefix: Option<&str>, active: bool) -> Service {
        Service {
            id: id.into(),
            name: id.into(),
            base_url: format!("http://{id}.internal/api"),
            prefix: prefix.map(Into::into),
            is_active: active,
        }
    }

    fn segs(path: &str) -> Vec<String> {
        proxy_segments(path)
    }

    async fn router(services: Vec<Service>, fallback: bool) -> ServiceRouter {
        let store = Arc::new(MemoryStore::new());
        for s in services {
            store.insert_service(s).await;
        }
        ServiceRouter::new(store, fallback)
    }

    #[test]
    fn test_proxy_segments() {
        assert_eq!(segs("/proxy/weather/v1/today"), vec!["weather", "v1", "today"]);
        assert_eq!(segs("/proxy//a///b/"), vec!["a", "b"]);
        assert!(segs("/proxy").is_empty());
        assert!(segs("/proxy/").is_empty());
        assert_eq!(segs("/proxy/a%20b"), vec!["a%20b"]);
    }

    #[test]
    fn test_proxy_segments_requires_segment_boundary() {
        assert_eq!(segs("/proxyfoo/bar"), vec!["proxyfoo", "bar"]);
    }

    #[tokio::test]
    async fn test_prefix_match_consumes_segment() {
        let router = router(vec![service("weather", Some("weather"), true)], true).await;
        let route = router.resolve(&segs("/proxy/weather/v1/today")).await.unwrap();

        assert_eq!(route.service.id, "weather");
        assert_eq!(route.remaining, vec!["v1", "today"]);
    }

    #[tokio::test]
    async fn test_default_service_keeps_full_path() {
        let router = router(vec![service("main", None, true)], false).await;
        let route = router.resolve(&segs("/proxy/anything/here")).await.unwrap();

        assert_eq!(route.service.id, "main");
        assert_eq!(route.remaining, vec!["anything", "here"]);
    }

    #[tokio::test]
    async fn test_any_active_fallback() {
        let services = vec![
            service("zeta", Some("zeta"), true),
            service("alpha", Some("alpha"), true),
        ];

        let route = router(services.clone(), true)
            .await
            .resolve(&segs("/proxy/unknown/x"))
            .await
            .unwrap();
        assert_eq!(route.service.id, "alpha");
        assert_eq!(route.remaining, vec!["unknown", "x"]);

        let err = router(services, false)
            .await
            .resolve(&segs("/proxy/unknown/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceNotFound));
    }

    #[tokio::test]
    async fn test_inactive_prefix_is_unavailable_when_nothing_else_matches() {
        let router = router(vec![service("weather", Some("weather"), false)], true).await;
        let err = router.resolve(&segs("/proxy/weather/today")).await.unwrap_err();

        assert!(matches!(err, AppError::ServiceUnavailable(ref name) if name == "weather"));
    }

    #[tokio::test]
    async fn test_inactive_prefix_falls_through_to_default() {
        let router = router(
            vec![
                service("weather", Some("weather"), false),
                service("main", None, true),
            ],
            false,
        )
        .await;
        let route = router.resolve(&segs("/proxy/weather/today")).await.unwrap();

        assert_eq!(route.service.id, "main");
        assert_eq!(route.remaining, vec!["weather", "today"]);
    }

    #[tokio::test]
    async fn test_inactive_default_is_unavailable() {
        let router = router(vec![service("main", None, false)], true).await;
        let err = router.resolve(&segs("/proxy/x")).await.unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_no_services_is_not_found() {
        let router = router(vec![], true).await;
        let err = router.resolve(&[]).await.unwrap_err();
        assert!(matches!(err, AppError::ServiceNotFound));
    }
}

use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::Deserialize;

use crate::stats::StatsError;
use crate::window::Window;

/// Query parameters selecting a window
#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    /// Canonical window key, e.g. `2024-01-01T10:00Z`
    pub window: Option<String>,
}

/// Extracts an optional window from the `window` query parameter
///
/// Returns None when the parameter is absent or blank, so the handler can
/// default to the current window. A malformed key is rejected with 400.
#[derive(Debug)]
pub struct WindowParam(pub Option<Window>);

impl<S> FromRequestParts<S> for WindowParam
where
    S: Send + Sync,
{
    type Rejection = StatsError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Ok(Query(query)) = Query::<WindowQuery>::from_request_parts(parts, state).await else {
            return Ok(WindowParam(None));
        };

        match query.window.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(WindowParam(Some(Window::parse(key)?))),
            _ => Ok(WindowParam(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(uri: &str) -> Result<WindowParam, StatsError> {
        let (mut parts, _) = Request::builder().uri(uri).body(()).unwrap().into_parts();
        WindowParam::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_window_param_absent() {
        assert!(extract("/api/v1/stats/window").await.unwrap().0.is_none());
        assert!(extract("/api/v1/stats/window?window=").await.unwrap().0.is_none());
    }

    #[tokio::test]
    async fn test_window_param_parsed() {
        let param = extract("/api/v1/stats/window?window=2024-01-01T10:00Z")
            .await
            .unwrap();
        assert_eq!(param.0.unwrap().key(), "2024-01-01T10:00Z");
    }

    #[tokio::test]
    async fn test_window_param_malformed() {
        assert!(matches!(
            extract("/api/v1/stats/window?window=yesterday").await,
            Err(StatsError::InvalidWindow(_))
        ));
    }
}

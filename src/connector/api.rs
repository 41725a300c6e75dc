//! Management HTTP surface of a connector.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | List topics of subscribers matching the query filters |
//! | `POST` | `<url-pattern>` | Create a subscription from the URL params |
//! | `DELETE` | `<url-pattern>` | Remove a subscription |
//! | `POST` | `/substitute/` | Rewrite one route-param value across subscribers |
//!
//! The router is returned unmounted; serving it (and nesting it under the
//! connector's prefix) is the embedding process's concern.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path as UrlParams, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{Connector, ConnectorError};
use crate::router::RouteParams;

/// URL-pattern param naming the topic.
const TOPIC_PARAM: &str = "topic";

type AppState = Arc<Connector>;

/// Build the management router for a connector.
pub fn api_router(connector: AppState) -> Router {
    let url_pattern = connector.config.url_pattern.clone();
    Router::new()
        .route("/", get(list_subscriptions))
        .route("/substitute/", post(substitute))
        .route(
            &url_pattern,
            post(create_subscription).delete(delete_subscription),
        )
        .with_state(connector)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> axum::response::Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

#[derive(Debug, Serialize)]
struct SubscribedResponse {
    subscribed: String,
}

#[derive(Debug, Serialize)]
struct UnsubscribedResponse {
    unsubscribed: String,
}

#[derive(Debug, Deserialize)]
struct Substitution {
    #[serde(rename = "fieldName")]
    field_name: String,
    #[serde(rename = "oldValue")]
    old_value: String,
    #[serde(rename = "newValue")]
    new_value: String,
}

#[derive(Debug, Serialize)]
struct SubstitutedResponse {
    /// Stringified count, kept stable for existing API consumers.
    modified: String,
}

async fn list_subscriptions(
    State(connector): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> axum::response::Response {
    if query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing filters");
    }
    let filters: RouteParams = query.into_iter().collect();
    Json(connector.list_topics(&filters)).into_response()
}

async fn create_subscription(
    State(connector): State<AppState>,
    UrlParams(params): UrlParams<HashMap<String, String>>,
) -> axum::response::Response {
    let (topic, params) = match split_topic(params) {
        Ok(split) => split,
        Err(response) => return response,
    };
    match connector.create_subscription(&topic, params) {
        Ok(_) => Json(SubscribedResponse {
            subscribed: format!("/{topic}"),
        })
        .into_response(),
        Err(ConnectorError::SubscriberExists) => {
            error_response(StatusCode::BAD_REQUEST, "subscription already exists")
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn delete_subscription(
    State(connector): State<AppState>,
    UrlParams(params): UrlParams<HashMap<String, String>>,
) -> axum::response::Response {
    let (topic, params) = match split_topic(params) {
        Ok(split) => split,
        Err(response) => return response,
    };
    match connector.delete_subscription(&topic, params) {
        Ok(Some(())) => Json(UnsubscribedResponse {
            unsubscribed: format!("/{topic}"),
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "subscription not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn substitute(
    State(connector): State<AppState>,
    Json(body): Json<Substitution>,
) -> axum::response::Response {
    if body.field_name.is_empty() || body.old_value.is_empty() || body.new_value.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "not all required values were supplied",
        );
    }
    match connector.substitute(&body.field_name, &body.old_value, &body.new_value) {
        Ok(modified) => Json(SubstitutedResponse {
            modified: modified.to_string(),
        })
        .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Pull the topic out of the URL params; the rest become route params.
fn split_topic(
    mut params: HashMap<String, String>,
) -> Result<(String, RouteParams), axum::response::Response> {
    let Some(topic) = params.remove(TOPIC_PARAM) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing topic parameter",
        ));
    };
    Ok((topic, params.into_iter().collect()))
}

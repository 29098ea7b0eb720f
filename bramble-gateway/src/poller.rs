//! Downstream schema polling.
//!
//! Each service is asked for `{ service { name version schema } }`; the
//! returned schema string is parsed and validated before it may join the
//! next merge. A service that fails keeps its previous schema and carries
//! the failure in its status.

use apollo_compiler::Schema;
use bramble_federation::error::SchemaError;
use bramble_federation::validate_service_schema;
use http::HeaderMap;
use tracing::debug;

use crate::downstream;
use crate::downstream::DownstreamError;
use crate::graphql;

pub const POLL_QUERY: &str = "query brambleServicePoll { service { name version schema } }";

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Ok,
    Unreachable,
    SchemaError,
    Invalid(String),
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Unknown => f.write_str("Unknown"),
            ServiceStatus::Ok => f.write_str("OK"),
            ServiceStatus::Unreachable => f.write_str("Unreachable"),
            ServiceStatus::SchemaError => f.write_str("Schema error"),
            ServiceStatus::Invalid(reason) => write!(f, "Invalid ({reason})"),
        }
    }
}

/// One downstream service as known to the update supervisor. Identity is the
/// URL; everything else follows the poll responses.
#[derive(Clone, Debug, Default)]
pub struct Service {
    pub url: String,
    pub name: String,
    pub version: String,
    pub schema_source: String,
    pub schema: Option<Schema>,
    pub status: ServiceStatus,
}

impl Service {
    pub fn new(url: impl Into<String>) -> Self {
        Service {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Request(#[from] DownstreamError),
    #[error("poll response has no service object")]
    MalformedResponse,
    #[error("error parsing schema: {0}")]
    Parse(String),
    #[error(transparent)]
    Invalid(#[from] SchemaError),
}

/// Refreshes one service. Returns `Ok(true)` when the schema source changed
/// and revalidated, `Ok(false)` when it is unchanged.
pub async fn update_service(
    client: &reqwest::Client,
    service: &mut Service,
    id_field: &str,
    max_body_size: usize,
) -> Result<bool, PollError> {
    let request = graphql::Request::new(POLL_QUERY);
    let response = match downstream::post_graphql(
        client,
        &service.url,
        &request,
        HeaderMap::new(),
        max_body_size,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            service.status = ServiceStatus::Unreachable;
            return Err(err.into());
        }
    };

    let Some(data) = response.data else {
        service.status = ServiceStatus::Unreachable;
        return Err(PollError::MalformedResponse);
    };
    let (Some(name), Some(version), Some(schema_source)) = (
        downstream::service_field(&data, "name"),
        downstream::service_field(&data, "version"),
        downstream::service_field(&data, "schema"),
    ) else {
        service.status = ServiceStatus::Unreachable;
        return Err(PollError::MalformedResponse);
    };

    if schema_source == service.schema_source {
        service.status = ServiceStatus::Ok;
        service.name = name.to_owned();
        service.version = version.to_owned();
        return Ok(false);
    }

    let schema = match Schema::parse(schema_source, format!("{}.graphql", service.url)) {
        Ok(schema) => schema,
        Err(with_errors) => {
            // Keep serving from the previous schema until the service
            // recovers.
            service.status = ServiceStatus::SchemaError;
            return Err(PollError::Parse(with_errors.errors.to_string()));
        }
    };
    if let Err(err) = validate_service_schema(&schema, id_field) {
        service.status = ServiceStatus::Invalid(err.to_string());
        return Err(err.into());
    }

    debug!(
        service = name,
        version, url = %service.url, "service schema updated"
    );
    service.name = name.to_owned();
    service.version = version.to_owned();
    service.schema_source = schema_source.to_owned();
    service.schema = Some(schema);
    service.status = ServiceStatus::Ok;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    const SDL: &str = r#"
        type Service { name: String! version: String! schema: String! }
        type Query { service: Service! greeting: String! }
    "#;

    async fn poll_server(schema: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "service": { "name": "greeter", "version": "1.2.3", "schema": schema } }
            })))
            .mount(&server)
            .await;
        server
    }

    fn client() -> reqwest::Client {
        crate::downstream::client(
            crate::downstream::Purpose::Update,
            std::time::Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn a_first_poll_updates_the_service() {
        let server = poll_server(SDL).await;
        let mut service = Service::new(server.uri());

        let updated = update_service(&client(), &mut service, "id", 1024 * 1024)
            .await
            .unwrap();
        assert!(updated);
        assert_eq!(service.name, "greeter");
        assert_eq!(service.version, "1.2.3");
        assert_eq!(service.status, ServiceStatus::Ok);
        assert!(service.schema.is_some());
    }

    #[tokio::test]
    async fn an_unchanged_schema_is_not_an_update() {
        let server = poll_server(SDL).await;
        let mut service = Service::new(server.uri());

        assert!(update_service(&client(), &mut service, "id", 1024 * 1024)
            .await
            .unwrap());
        assert!(!update_service(&client(), &mut service, "id", 1024 * 1024)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn an_invalid_schema_keeps_the_previous_one() {
        let server = poll_server(SDL).await;
        let mut service = Service::new(server.uri());
        update_service(&client(), &mut service, "id", 1024 * 1024)
            .await
            .unwrap();

        // The service starts advertising a schema without `Query.service`.
        server.reset().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "service": {
                    "name": "greeter",
                    "version": "1.2.4",
                    "schema": "type Query { greeting: String! }",
                } }
            })))
            .mount(&server)
            .await;

        let err = update_service(&client(), &mut service, "id", 1024 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Invalid(_)));
        assert!(matches!(service.status, ServiceStatus::Invalid(_)));
        assert!(
            service.schema.is_some(),
            "the last good schema stays in place"
        );
        assert_eq!(service.version, "1.2.3");
    }

    #[tokio::test]
    async fn an_unreachable_service_is_flagged() {
        let mut service = Service::new("http://127.0.0.1:1/query");
        let err = update_service(&client(), &mut service, "id", 1024 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Request(_)));
        assert_eq!(service.status, ServiceStatus::Unreachable);
    }
}

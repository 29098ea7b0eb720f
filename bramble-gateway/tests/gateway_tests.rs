//! End-to-end tests: the gateway in front of mock downstream services.

use bramble_gateway::config::Configuration;
use bramble_gateway::graphql;
use bramble_gateway::Gateway;
use http::HeaderMap;
use pretty_assertions::assert_eq;
use serde_json::json;
use serde_json::Value;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::method;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

const MOVIES_SDL: &str = r#"
directive @boundary on OBJECT | FIELD_DEFINITION
type Service { name: String! version: String! schema: String! }
interface Node { id: ID! }
type Movie implements Node @boundary {
    id: ID!
    title: String
    gizmo: Gizmo
}
type Gizmo { foo: String }
type Query {
    service: Service!
    node(id: ID!): Node
    movie(id: ID!): Movie!
    movies: [Movie!]!
    randomMovies: [Movie!]!
}
"#;

const RELEASES_NODE_SDL: &str = r#"
directive @boundary on OBJECT | FIELD_DEFINITION
type Service { name: String! version: String! schema: String! }
interface Node { id: ID! }
type Movie implements Node @boundary {
    id: ID!
    release: Int
}
type Query {
    service: Service!
    node(id: ID!): Node
}
"#;

const RELEASES_ARRAY_SDL: &str = r#"
directive @boundary on OBJECT | FIELD_DEFINITION
type Service { name: String! version: String! schema: String! }
type Movie @boundary {
    id: ID!
    release: Int
}
type Query {
    service: Service!
    movies(ids: [ID!]!): [Movie]! @boundary
}
"#;

const COMP_TITLES_SDL: &str = r#"
directive @boundary on OBJECT | FIELD_DEFINITION
type Service { name: String! version: String! schema: String! }
interface Node { id: ID! }
type Movie implements Node @boundary {
    id: ID!
    compTitles: [Movie!]
}
type Query {
    service: Service!
    node(id: ID!): Node
}
"#;

/// A mock downstream that answers the schema poll with `sdl`.
async fn start_service(name: &str, sdl: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("brambleServicePoll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "service": { "name": name, "version": "0.1.0", "schema": sdl } }
        })))
        .mount(&server)
        .await;
    server
}

async fn mount_data(server: &MockServer, needle: &str, data: Value) {
    Mock::given(method("POST"))
        .and(body_string_contains(needle))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": data })))
        .mount(server)
        .await;
}

async fn gateway(services: Vec<String>, permissions: Option<Value>) -> Gateway {
    let mut config = Configuration::default();
    config.services = services;
    if let Some(permissions) = permissions {
        config.permissions = Some(serde_json::from_value(permissions).unwrap());
    }
    let gateway = Gateway::new(config);
    gateway.update_schemas(true).await;
    assert!(
        gateway.snapshot().await.is_some(),
        "the mock services should produce a merged schema"
    );
    gateway
}

async fn run(gateway: &Gateway, query: &str, variables: Value) -> graphql::Response {
    let Value::Object(variables) = variables else {
        panic!("variables must be an object")
    };
    let request = graphql::Request {
        query: query.to_owned(),
        operation_name: None,
        variables,
    };
    gateway.handle_request(request, &HeaderMap::new()).await
}

/// Requests that are not the schema poll.
async fn data_requests(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|request| {
            let body: Value = serde_json::from_slice(&request.body).ok()?;
            let query = body.get("query")?.as_str()?.to_owned();
            (!query.contains("brambleServicePoll")).then_some(query)
        })
        .collect()
}

#[tokio::test]
async fn single_service_query_passes_through() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(
        &movies,
        "movie(",
        json!({ "movie": { "id": "1", "title": "Test" } }),
    )
    .await;

    let gateway = gateway(vec![movies.uri()], None).await;
    let response = run(&gateway, r#"{ movie(id: "1") { id title } }"#, json!({})).await;

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "movie": { "id": "1", "title": "Test" } } })
    );
}

#[tokio::test]
async fn boundary_join_across_two_services() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(
        &movies,
        "movie(",
        json!({ "movie": { "_id": "1", "id": "1", "title": "Test" } }),
    )
    .await;

    let releases = start_service("releases", RELEASES_NODE_SDL).await;
    mount_data(
        &releases,
        "node(",
        json!({ "_0": { "_id": "1", "release": 2007 } }),
    )
    .await;

    let gateway = gateway(vec![movies.uri(), releases.uri()], None).await;
    let response = run(
        &gateway,
        r#"{ movie(id: "1") { id title release } }"#,
        json!({}),
    )
    .await;

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "movie": { "id": "1", "title": "Test", "release": 2007 } } })
    );

    let release_queries = data_requests(&releases).await;
    assert_eq!(release_queries.len(), 1);
    assert!(
        release_queries[0].contains(r#"_0: node(id: "1")"#),
        "unexpected lookup: {}",
        release_queries[0]
    );
    assert!(release_queries[0].contains("... on Movie"));
}

#[tokio::test]
async fn array_boundaries_are_batched_into_one_call() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(
        &movies,
        "randomMovies",
        json!({ "randomMovies": [
            { "_id": "1", "id": "1", "title": "M1" },
            { "_id": "2", "id": "2", "title": "M2" },
            { "_id": "3", "id": "3", "title": "M3" },
        ] }),
    )
    .await;

    let releases = start_service("releases", RELEASES_ARRAY_SDL).await;
    mount_data(
        &releases,
        "_result",
        json!({ "_result": [
            { "_id": "1", "release": 2001 },
            { "_id": "2", "release": 2002 },
            { "_id": "3", "release": 2003 },
        ] }),
    )
    .await;

    let gateway = gateway(vec![movies.uri(), releases.uri()], None).await;
    let response = run(
        &gateway,
        "{ randomMovies { id title release } }",
        json!({}),
    )
    .await;

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "randomMovies": [
            { "id": "1", "title": "M1", "release": 2001 },
            { "id": "2", "title": "M2", "release": 2002 },
            { "id": "3", "title": "M3", "release": 2003 },
        ] } })
    );

    let release_queries = data_requests(&releases).await;
    assert_eq!(release_queries.len(), 1, "ids must be batched into one call");
    assert!(
        release_queries[0].contains(r#"ids: ["1", "2", "3"]"#),
        "unexpected lookup: {}",
        release_queries[0]
    );
}

#[tokio::test]
async fn empty_arrays_skip_boundary_services() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(&movies, "movies", json!({ "movies": [] })).await;

    let releases = start_service("releases", RELEASES_ARRAY_SDL).await;

    let gateway = gateway(vec![movies.uri(), releases.uri()], None).await;
    let response = run(&gateway, "{ movies { title release } }", json!({})).await;

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "movies": [] } })
    );
    assert!(
        data_requests(&releases).await.is_empty(),
        "no ids means no boundary call"
    );
}

#[tokio::test]
async fn skip_and_include_prune_before_anything_is_sent() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(&movies, "movie(", json!({ "movie": { "id": "1" } })).await;

    let gizmos = start_service("gizmos", COMP_TITLES_SDL).await;

    let gateway = gateway(vec![movies.uri(), gizmos.uri()], None).await;
    let response = run(
        &gateway,
        r#"query q($s: Boolean!, $g: Boolean!) {
            movie(id: "1") { id title @skip(if: $s) compTitles @skip(if: $g) { id } }
        }"#,
        json!({ "s": true, "g": true }),
    )
    .await;

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "movie": { "id": "1" } } })
    );

    let movie_queries = data_requests(&movies).await;
    assert_eq!(movie_queries.len(), 1);
    assert_eq!(movie_queries[0], r#"query { movie(id: "1") { id } }"#);
    assert!(
        data_requests(&gizmos).await.is_empty(),
        "skipped selections must not reach their service"
    );
}

#[tokio::test]
async fn authorization_prunes_fields_and_reports_them() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(
        &movies,
        "movies",
        json!({ "movies": [ { "id": "1", "title": "Test" } ] }),
    )
    .await;

    let comp = start_service("comp", COMP_TITLES_SDL).await;

    let gateway = gateway(
        vec![movies.uri(), comp.uri()],
        Some(json!({ "query": { "movies": ["id", "title"] } })),
    )
    .await;
    let response = run(
        &gateway,
        "{ movies { id title compTitles { id } } }",
        json!({}),
    )
    .await;

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({
            "data": { "movies": [ { "id": "1", "title": "Test" } ] },
            "errors": [ { "message": "query.movies.compTitles access disallowed" } ],
        })
    );
    assert!(data_requests(&comp).await.is_empty());
}

#[tokio::test]
async fn downstream_failures_become_errors_with_extensions() {
    let movies = start_service("movies", MOVIES_SDL).await;
    Mock::given(method("POST"))
        .and(body_string_contains("movie("))
        .respond_with(ResponseTemplate::new(500))
        .mount(&movies)
        .await;

    let gateway = gateway(vec![movies.uri()], None).await;
    let response = run(&gateway, r#"{ movie(id: "1") { id } }"#, json!({})).await;

    // Query.movie is non-null, so the missing data bubbles to the root.
    assert_eq!(response.data, Some(Value::Null));
    let downstream = response
        .errors
        .iter()
        .find(|error| error.message.contains("status 500"))
        .expect("a downstream error with the HTTP status");
    assert_eq!(
        downstream.extensions.get("serviceName"),
        Some(&json!("movies"))
    );
    assert_eq!(
        downstream.extensions.get("serviceUrl"),
        Some(&json!(movies.uri()))
    );
    assert!(downstream.extensions.contains_key("selectionSet"));
}

#[tokio::test]
async fn mutations_execute_and_merge_in_selection_order() {
    let billing = start_service(
        "billing",
        r#"
        type Service { name: String! version: String! schema: String! }
        type Query { service: Service! balance: Int! }
        type Mutation { charge(amount: Int!): Int! }
        "#,
    )
    .await;
    mount_data(&billing, "charge", json!({ "charge": 58 })).await;

    let audit = start_service(
        "audit",
        r#"
        type Service { name: String! version: String! schema: String! }
        type Query { service: Service! entries: [String!]! }
        type Mutation { record(note: String!): Boolean! }
        "#,
    )
    .await;
    mount_data(&audit, "record", json!({ "record": true })).await;

    let gateway = gateway(vec![billing.uri(), audit.uri()], None).await;
    let response = run(
        &gateway,
        r#"mutation { record(note: "charge") charge(amount: 42) }"#,
        json!({}),
    )
    .await;

    assert_eq!(
        serde_json::to_string(&serde_json::to_value(&response).unwrap()).unwrap(),
        r#"{"data":{"record":true,"charge":58}}"#,
        "mutation results come back in selection order"
    );
}

#[tokio::test]
async fn the_request_budget_stops_child_scheduling() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(
        &movies,
        "movie(",
        json!({ "movie": { "_id": "1", "id": "1", "title": "Test" } }),
    )
    .await;
    let releases = start_service("releases", RELEASES_ARRAY_SDL).await;

    let mut config = Configuration::default();
    config.services = vec![movies.uri(), releases.uri()];
    config.max_requests_per_query = 1;
    let gateway = Gateway::new(config);
    gateway.update_schemas(true).await;

    let response = run(
        &gateway,
        r#"{ movie(id: "1") { title release } }"#,
        json!({}),
    )
    .await;

    assert!(
        response
            .errors
            .iter()
            .any(|error| error.message == "exceeded max requests per query (1)"),
        "unexpected errors: {:?}",
        response.errors
    );
    // The root step's data is still returned.
    assert_eq!(
        response.data.as_ref().and_then(|data| data.pointer("/movie/title")),
        Some(&json!("Test"))
    );
    assert!(
        data_requests(&releases).await.is_empty(),
        "no further child steps once the budget is spent"
    );
}

#[tokio::test]
async fn the_http_surface_speaks_graphql_and_debug_extensions() {
    let movies = start_service("movies", MOVIES_SDL).await;
    mount_data(
        &movies,
        "movie(",
        json!({ "movie": { "id": "1", "title": "Test" } }),
    )
    .await;

    let gateway = std::sync::Arc::new(gateway(vec![movies.uri()], None).await);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, bramble_gateway::server::app(gateway))
            .await
            .unwrap();
    });
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{address}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let posted: Value = client
        .post(format!("http://{address}/query"))
        .header("X-Bramble-Debug", "plan traceid")
        .json(&json!({ "query": r#"{ movie(id: "1") { id title } }"# }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        posted.get("data"),
        Some(&json!({ "movie": { "id": "1", "title": "Test" } }))
    );
    let extensions = posted.get("extensions").unwrap();
    assert!(extensions.get("plan").is_some());
    assert!(extensions.get("traceid").is_some());
    assert!(extensions.get("query").is_none());

    let got: Value = client
        .get(format!("http://{address}/query"))
        .query(&[("query", r#"{ movie(id: "1") { title } }"#)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got.get("data"), Some(&json!({ "movie": { "title": "Test" } })));
}

#[tokio::test]
async fn schema_changes_are_picked_up_on_the_next_poll() {
    let movies = start_service("movies", MOVIES_SDL).await;
    let gateway = gateway(vec![movies.uri()], None).await;
    assert!(gateway
        .snapshot()
        .await
        .unwrap()
        .merged
        .field_urls
        .get("Query", "trending")
        .is_none());

    // The service starts exposing a new root field.
    movies.reset().await;
    let extended = format!("{MOVIES_SDL}\nextend type Query {{ trending: [Movie!]! }}");
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "service": { "name": "movies", "version": "0.2.0", "schema": extended } }
        })))
        .mount(&movies)
        .await;

    gateway.update_schemas(false).await;
    let snapshot = gateway.snapshot().await.unwrap();
    assert_eq!(
        snapshot.merged.field_urls.get("Query", "trending"),
        Some(movies.uri().as_str())
    );
}

#[tokio::test]
async fn a_failing_merge_keeps_the_previous_snapshot() {
    let movies = start_service("movies", MOVIES_SDL).await;
    let other = start_service(
        "other",
        r#"
        type Service { name: String! version: String! schema: String! }
        type Query { service: Service! other: String }
        "#,
    )
    .await;
    let gateway = gateway(vec![movies.uri(), other.uri()], None).await;

    // `other` redefines Gizmo, which conflicts with the movies service. The
    // schema is valid on its own, so only the merge can reject it.
    other.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "service": { "name": "other", "version": "0.2.0", "schema": r#"
                type Service { name: String! version: String! schema: String! }
                type Gizmo { weight: Int }
                type Query { service: Service! other: String gizmo: Gizmo }
            "# } }
        })))
        .mount(&other)
        .await;

    gateway.update_schemas(false).await;
    let snapshot = gateway.snapshot().await.unwrap();
    assert_eq!(
        snapshot.merged.field_urls.get("Query", "gizmo"),
        None,
        "the conflicting schema must not be swapped in"
    );
    assert_eq!(
        snapshot.merged.field_urls.get("Query", "other"),
        Some(other.uri().as_str())
    );
}

#[tokio::test]
async fn invalid_queries_fail_without_partial_data() {
    let movies = start_service("movies", MOVIES_SDL).await;
    let gateway = gateway(vec![movies.uri()], None).await;

    let response = run(&gateway, "{ nope }", json!({})).await;
    assert!(response.data.is_none());
    assert_eq!(response.errors.len(), 1);
    assert!(response.errors[0].message.starts_with("invalid query"));

    let response = run(&gateway, "", json!({})).await;
    assert!(response.data.is_none());
    assert!(!response.errors.is_empty());
}

#[tokio::test]
async fn introspection_is_served_from_the_gateway() {
    let movies = start_service("movies", MOVIES_SDL).await;
    let gateway = gateway(vec![movies.uri()], None).await;

    let response = run(
        &gateway,
        "{ __schema { queryType { name } } }",
        json!({}),
    )
    .await;
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "__schema": { "queryType": { "name": "Query" } } } })
    );
    assert!(
        data_requests(&movies).await.is_empty(),
        "introspection never reaches a downstream"
    );
}

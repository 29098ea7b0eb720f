//! The gateway itself: the shared schema snapshot plus the per-request
//! pipeline of authorization, planning, execution and stitching.

use std::sync::Arc;
use std::time::Instant;

use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Schema;
use bramble_federation::auth;
use bramble_federation::auth::OperationPermissions;
use bramble_federation::introspection::resolve_introspection;
use bramble_federation::merge::MergedSchema;
use bramble_federation::plan::plan_operation;
use bramble_federation::plan::PlanStep;
use http::HeaderMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Configuration;
use crate::downstream;
use crate::executor::Executor;
use crate::graphql;
use crate::hooks::ForwardHeaders;
use crate::hooks::OutboundHook;
use crate::poller::Service;
use crate::stitch;

/// One consistent view of the federated graph. Swapped atomically by the
/// update supervisor; a request reads exactly one snapshot.
pub struct Snapshot {
    pub merged: MergedSchema,
    /// The schema introspection answers from; already permission-filtered
    /// when static permissions are configured.
    pub introspection_schema: Valid<Schema>,
}

pub struct Gateway {
    pub(crate) config: Configuration,
    pub(crate) executor: Executor,
    pub(crate) poll_client: reqwest::Client,
    pub(crate) services: Mutex<Vec<Service>>,
    pub(crate) snapshot: RwLock<Option<Arc<Snapshot>>>,
    hooks: Vec<Box<dyn OutboundHook>>,
}

impl Gateway {
    pub fn new(config: Configuration) -> Self {
        let services = config
            .services
            .iter()
            .map(|url| Service::new(url.clone()))
            .collect();
        let hooks: Vec<Box<dyn OutboundHook>> =
            vec![Box::new(ForwardHeaders::new(&config.forward_headers))];
        Gateway {
            executor: Executor::new(&config),
            poll_client: downstream::client(downstream::Purpose::Update, config.timeout),
            services: Mutex::new(services),
            snapshot: RwLock::new(None),
            hooks,
            config,
        }
    }

    pub async fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().await.clone()
    }

    pub(crate) fn permissions(&self) -> OperationPermissions {
        self.config
            .permissions
            .clone()
            .unwrap_or_else(OperationPermissions::allow_all)
    }

    pub async fn handle_request(
        &self,
        request: graphql::Request,
        inbound_headers: &HeaderMap,
    ) -> graphql::Response {
        let started = Instant::now();
        let debug_options = DebugOptions::from_headers(inbound_headers);

        let Some(snapshot) = self.snapshot().await else {
            return graphql::Response::from_error(graphql::Error::new(
                "gateway does not have a schema yet",
            ));
        };

        let mut response = self
            .execute_on_snapshot(&snapshot, &request, inbound_headers, debug_options)
            .await;
        debug_options.decorate(&mut response, &request, started);
        response
    }

    async fn execute_on_snapshot(
        &self,
        snapshot: &Snapshot,
        request: &graphql::Request,
        inbound_headers: &HeaderMap,
        debug_options: DebugOptions,
    ) -> graphql::Response {
        let document = match ExecutableDocument::parse_and_validate(
            &snapshot.merged.schema,
            request.query.as_str(),
            "query.graphql",
        ) {
            Ok(document) => document,
            Err(with_errors) => {
                return graphql::Response::from_error(graphql::Error::new(format!(
                    "invalid query: {}",
                    with_errors.errors
                )));
            }
        };
        let operation = match document.operations.get(request.operation_name.as_deref()) {
            Ok(operation) => operation,
            Err(_) => {
                return graphql::Response::from_error(graphql::Error::new(
                    match &request.operation_name {
                        Some(name) => format!("operation {name} not found"),
                        None => "missing operation".to_owned(),
                    },
                ));
            }
        };

        let filtered =
            auth::filter_operation(operation, &document.fragments, &self.permissions());
        let mut errors: Vec<graphql::Error> = filtered
            .errors
            .iter()
            .map(|message| graphql::Error::new(message.clone()))
            .collect();

        let plan = match plan_operation(
            &snapshot.merged,
            &filtered.operation,
            &document.fragments,
            &request.variables,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                errors.push(graphql::Error::new(err.to_string()));
                return graphql::Response {
                    data: None,
                    errors,
                    extensions: graphql::Object::new(),
                };
            }
        };

        let introspection = if plan.introspection_fields.is_empty() {
            None
        } else if self.config.disable_introspection {
            errors.push(graphql::Error::new("introspection is disabled"));
            None
        } else {
            Some(resolve_introspection(
                &snapshot.introspection_schema,
                &plan.introspection_fields,
                &request.variables,
            ))
        };

        let mut outbound_headers = HeaderMap::new();
        for hook in &self.hooks {
            hook.outbound_headers(inbound_headers, &mut outbound_headers);
        }

        let (results, execution_errors) = self
            .executor
            .execute(
                &snapshot.merged,
                &plan,
                &request.variables,
                &outbound_headers,
            )
            .await;
        errors.extend(execution_errors);

        let (data, stitch_errors) =
            stitch::stitch(&snapshot.merged.schema, &plan, results, introspection);
        errors.extend(stitch_errors);

        debug!(
            errors = errors.len(),
            steps = plan.root_steps.len(),
            "request executed"
        );
        let mut extensions = graphql::Object::new();
        if debug_options.plan {
            extensions.insert("plan".to_owned(), DebugOptions::plan_json(&plan.root_steps));
        }
        graphql::Response {
            data: Some(data),
            errors,
            extensions,
        }
    }
}

/// Tokens of the `X-Bramble-Debug` header; each one enables the matching
/// response extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugOptions {
    pub query: bool,
    pub variables: bool,
    pub plan: bool,
    pub timing: bool,
    pub trace_id: bool,
}

impl DebugOptions {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut options = DebugOptions::default();
        let Some(value) = headers
            .get("X-Bramble-Debug")
            .and_then(|value| value.to_str().ok())
        else {
            return options;
        };
        for token in value.split_whitespace() {
            match token {
                "all" => {
                    options = DebugOptions {
                        query: true,
                        variables: true,
                        plan: true,
                        timing: true,
                        trace_id: true,
                    }
                }
                "query" => options.query = true,
                "variables" => options.variables = true,
                "plan" => options.plan = true,
                "timing" => options.timing = true,
                "traceid" => options.trace_id = true,
                _ => {}
            }
        }
        options
    }

    fn decorate(
        &self,
        response: &mut graphql::Response,
        request: &graphql::Request,
        started: Instant,
    ) {
        if self.query {
            response
                .extensions
                .insert("query".to_owned(), Value::String(request.query.clone()));
        }
        if self.variables {
            response.extensions.insert(
                "variables".to_owned(),
                Value::Object(request.variables.clone()),
            );
        }
        if self.timing {
            response.extensions.insert(
                "timing".to_owned(),
                Value::String(format!("{:?}", started.elapsed())),
            );
        }
        if self.trace_id {
            response.extensions.insert(
                "traceid".to_owned(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
    }

    /// The `plan` extension is attached where the plan is in scope.
    pub fn plan_json(steps: &[PlanStep]) -> Value {
        Value::Array(steps.iter().map(PlanStep::to_debug_json).collect())
    }
}

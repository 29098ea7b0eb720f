//! Concurrent plan execution.
//!
//! Root steps run in parallel (sequentially for mutations); each step that
//! returns data triggers its child steps, which look boundary objects up by
//! the ids extracted along their insertion point. Every downstream request
//! consumes one unit of the per-query budget.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use apollo_compiler::executable::OperationType;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use bramble_federation::format::format_selection_set;
use bramble_federation::format::format_variable_definitions;
use bramble_federation::merge::BoundaryQuery;
use bramble_federation::merge::MergedSchema;
use bramble_federation::plan::PlanStep;
use bramble_federation::plan::QueryPlan;
use bramble_federation::GATEWAY_URL;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::HeaderMap;
use itertools::Itertools;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;
use tracing::instrument;

use crate::config::Configuration;
use crate::downstream;
use crate::downstream::DownstreamError;
use crate::graphql;

/// Ids batched into a single array-form boundary lookup.
const BATCH_SIZE: usize = 50;

/// Process-wide cap on concurrent downstream fetches.
const SERVICE_FETCH_CONCURRENCY: usize = 64;

/// One step's worth of downstream data, waiting to be stitched.
#[derive(Debug)]
pub struct ExecutionResult {
    pub service_url: String,
    pub insertion_point: Vec<String>,
    pub data: Value,
    pub errors: Vec<graphql::Error>,
}

pub struct Executor {
    client: reqwest::Client,
    max_requests_per_query: usize,
    max_response_size: usize,
    fetch_slots: tokio::sync::Semaphore,
}

impl Executor {
    pub fn new(config: &Configuration) -> Self {
        Executor {
            client: downstream::client(downstream::Purpose::Query, config.timeout),
            max_requests_per_query: config.max_requests_per_query,
            max_response_size: config.max_service_response_size,
            fetch_slots: tokio::sync::Semaphore::new(SERVICE_FETCH_CONCURRENCY),
        }
    }

    /// Runs the whole plan and returns every step result plus the errors not
    /// attributable to a single step (budget exhaustion, recovered panics).
    #[instrument(skip_all, level = "debug")]
    pub async fn execute(
        &self,
        merged: &MergedSchema,
        plan: &QueryPlan,
        variables: &graphql::Object,
        outbound_headers: &HeaderMap,
    ) -> (Vec<ExecutionResult>, Vec<graphql::Error>) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let ctx = ExecContext {
            executor: self,
            merged,
            variables,
            headers: outbound_headers,
            budget: AtomicUsize::new(0),
            budget_exhausted: AtomicBool::new(false),
            sender,
            errors: Mutex::new(Vec::new()),
        };

        match plan.kind {
            OperationType::Mutation => {
                // The GraphQL spec mandates serial execution of root
                // mutation fields; their child steps still run in parallel.
                for step in &plan.root_steps {
                    ctx.run_root_step(step).await;
                }
            }
            _ => {
                join_all(plan.root_steps.iter().map(|step| ctx.run_root_step(step))).await;
            }
        }

        let mut results = Vec::new();
        while let Ok(result) = receiver.try_recv() {
            results.push(result);
        }
        let errors = std::mem::take(&mut *ctx.errors.lock().expect("executor error sink"));
        (results, errors)
    }
}

enum FetchFailure {
    /// The per-query budget is spent; the marker error is recorded once.
    Budget,
    Error(graphql::Error),
}

struct ExecContext<'a> {
    executor: &'a Executor,
    merged: &'a MergedSchema,
    variables: &'a graphql::Object,
    headers: &'a HeaderMap,
    budget: AtomicUsize,
    budget_exhausted: AtomicBool,
    sender: mpsc::UnboundedSender<ExecutionResult>,
    errors: Mutex<Vec<graphql::Error>>,
}

impl<'a> ExecContext<'a> {
    async fn run_root_step(&self, step: &PlanStep) {
        let recovered = std::panic::AssertUnwindSafe(self.execute_root_step(step))
            .catch_unwind()
            .await;
        if let Err(panic) = recovered {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            error!(
                service = %step.service_name,
                panic = %message,
                backtrace = %std::backtrace::Backtrace::force_capture(),
                "panic while executing step"
            );
            self.errors
                .lock()
                .expect("executor error sink")
                .push(graphql::Error::new("internal execution error"));
        }
    }

    async fn execute_root_step(&self, step: &PlanStep) {
        if step.service_url == GATEWAY_URL {
            self.send(step, gateway_data(step.parent_type.as_str(), &step.selection_set), Vec::new());
            return;
        }

        let kind = match step.kind {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
            OperationType::Subscription => "subscription",
        };
        let document = format!(
            "{kind}{} {}",
            format_variable_definitions(&step.variable_definitions),
            format_selection_set(&step.selection_set),
        );

        match self.fetch(step, document).await {
            Ok((data, errors)) => {
                self.launch_children(&step.then, &step.insertion_point, &data)
                    .await;
                self.send(step, data, errors);
            }
            Err(FetchFailure::Budget) => {}
            Err(FetchFailure::Error(error)) => {
                self.send(step, Value::Null, vec![error]);
            }
        }
    }

    /// Fires the child steps whose boundary ids are present in `data`. A
    /// child with no ids is skipped entirely.
    fn launch_children<'b>(
        &'b self,
        children: &'b [PlanStep],
        parent_point: &'b [String],
        data: &'b Value,
    ) -> BoxFuture<'b, ()> {
        async move {
            let lookups = children.iter().filter_map(|child| {
                let relative = &child.insertion_point[parent_point.len()..];
                let ids = collect_boundary_ids(data, relative);
                if ids.is_empty() {
                    return None;
                }
                Some(self.execute_child_step(child, ids))
            });
            join_all(lookups).await;
        }
        .boxed()
    }

    async fn execute_child_step(&self, child: &PlanStep, ids: Vec<String>) {
        let Some(lookup) = self
            .merged
            .boundary_queries
            .get(&child.service_url, &child.parent_type)
        else {
            self.send(
                child,
                Value::Null,
                vec![self.step_error(
                    child,
                    &format!(
                        "no boundary query on {} for type {}",
                        child.service_url, child.parent_type
                    ),
                )],
            );
            return;
        };

        let mut entities: Vec<Value> = Vec::new();
        let mut errors: Vec<graphql::Error> = Vec::new();

        if lookup.array {
            for chunk in ids.chunks(BATCH_SIZE) {
                let document = array_lookup_document(lookup, child, chunk);
                match self.fetch(child, document).await {
                    Ok((data, step_errors)) => {
                        errors.extend(step_errors);
                        if let Some(found) = data.get("_result").and_then(Value::as_array) {
                            entities.extend(found.iter().filter(|e| !e.is_null()).cloned());
                        }
                    }
                    Err(FetchFailure::Budget) => break,
                    Err(FetchFailure::Error(error)) => errors.push(error),
                }
            }
        } else {
            let document = single_lookup_document(lookup, child, &ids);
            match self.fetch(child, document).await {
                Ok((data, step_errors)) => {
                    errors.extend(step_errors);
                    for index in 0..ids.len() {
                        if let Some(entity) = data.get(format!("_{index}")) {
                            if !entity.is_null() {
                                entities.push(entity.clone());
                            }
                        }
                    }
                }
                Err(FetchFailure::Budget) => {}
                Err(FetchFailure::Error(error)) => errors.push(error),
            }
        }

        let data = Value::Array(entities);
        self.launch_children(&child.then, &child.insertion_point, &data)
            .await;
        self.send(child, data, errors);
    }

    async fn fetch(
        &self,
        step: &PlanStep,
        document: String,
    ) -> Result<(Value, Vec<graphql::Error>), FetchFailure> {
        if self.budget.fetch_add(1, Ordering::SeqCst) >= self.executor.max_requests_per_query {
            if !self.budget_exhausted.swap(true, Ordering::SeqCst) {
                self.errors.lock().expect("executor error sink").push(
                    graphql::Error::new(format!(
                        "exceeded max requests per query ({})",
                        self.executor.max_requests_per_query
                    )),
                );
            }
            return Err(FetchFailure::Budget);
        }

        let mut request = graphql::Request::new(document);
        for definition in &step.variable_definitions {
            if let Some(value) = self.variables.get(definition.name.as_str()) {
                request
                    .variables
                    .insert(definition.name.to_string(), value.clone());
            }
        }

        let _slot = self
            .executor
            .fetch_slots
            .acquire()
            .await
            .expect("the fetch semaphore is never closed");
        let response = downstream::post_graphql(
            &self.executor.client,
            &step.service_url,
            &request,
            self.headers.clone(),
            self.executor.max_response_size,
        )
        .await
        .map_err(|err| {
            let message = match err {
                DownstreamError::Timeout => "downstream request timed out".to_owned(),
                other => other.to_string(),
            };
            FetchFailure::Error(self.step_error(step, &message))
        })?;

        let errors = response
            .errors
            .into_iter()
            .map(|downstream_error| {
                let mut error = self.step_error(step, &downstream_error.message);
                error.path = downstream_error.path;
                for (key, value) in downstream_error.extensions {
                    error.extensions.entry(key).or_insert(value);
                }
                error
            })
            .collect();
        Ok((response.data.unwrap_or(Value::Null), errors))
    }

    fn step_error(&self, step: &PlanStep, message: &str) -> graphql::Error {
        graphql::Error::downstream(
            message,
            &step.service_name,
            &step.service_url,
            &format_selection_set(&step.selection_set),
            &step.insertion_point,
        )
    }

    fn send(&self, step: &PlanStep, data: Value, errors: Vec<graphql::Error>) {
        let _ = self.sender.send(ExecutionResult {
            service_url: step.service_url.clone(),
            insertion_point: step.insertion_point.clone(),
            data,
            errors,
        });
    }
}

/// The selection sent with a boundary lookup; lookups through `Query.node`
/// need an inline fragment on the concrete type.
fn lookup_selection(lookup: &BoundaryQuery, step: &PlanStep) -> String {
    let selection = format_selection_set(&step.selection_set);
    if lookup.node_interface {
        format!("{{ ... on {} {} }}", step.parent_type, selection)
    } else {
        selection
    }
}

/// `query { _result: movies(ids: ["1", "2"]) { … } }`
fn array_lookup_document(
    lookup: &BoundaryQuery,
    step: &PlanStep,
    ids: &[String],
) -> String {
    let id_list = ids
        .iter()
        .map(|id| Value::String(id.clone()).to_string())
        .join(", ");
    format!(
        "query{} {{ _result: {}({}: [{id_list}]) {} }}",
        format_variable_definitions(&step.variable_definitions),
        lookup.field,
        lookup.argument,
        lookup_selection(lookup, step),
    )
}

/// `query { _0: node(id: "1") { … } _1: node(id: "2") { … } }`
fn single_lookup_document(
    lookup: &BoundaryQuery,
    step: &PlanStep,
    ids: &[String],
) -> String {
    let selection = lookup_selection(lookup, step);
    let lookups = ids
        .iter()
        .enumerate()
        .map(|(index, id)| {
            format!(
                "_{index}: {}({}: {}) {selection}",
                lookup.field,
                lookup.argument,
                Value::String(id.clone()),
            )
        })
        .join(" ");
    format!(
        "query{} {{ {lookups} }}",
        format_variable_definitions(&step.variable_definitions),
    )
}

/// Unique boundary ids found under `path`, in first-seen order.
fn collect_boundary_ids(data: &Value, path: &[String]) -> Vec<String> {
    let mut ids = Vec::new();
    for target in crate::json_ext::values_at_path(data, path) {
        if let Some(id) = target
            .get(bramble_federation::plan::ID_ALIAS)
            .and_then(Value::as_str)
        {
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_owned());
            }
        }
    }
    ids
}

/// Resolves a gateway-only step in process: `__typename` at each nesting
/// level, with namespace wrappers recursed into.
fn gateway_data(type_name: &str, selection_set: &SelectionSet) -> Value {
    let mut out = Map::new();
    gateway_data_into(type_name, selection_set, &mut out);
    Value::Object(out)
}

fn gateway_data_into(type_name: &str, selection_set: &SelectionSet, out: &mut Map<String, Value>) {
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => {
                if field.name == "__typename" {
                    out.insert(
                        field.response_key().to_string(),
                        Value::String(type_name.to_owned()),
                    );
                } else if !field.selection_set.selections.is_empty() {
                    let inner = field.definition.ty.inner_named_type();
                    out.insert(
                        field.response_key().to_string(),
                        gateway_data(inner.as_str(), &field.selection_set),
                    );
                }
            }
            Selection::InlineFragment(fragment) => {
                let inner = fragment
                    .type_condition
                    .as_ref()
                    .map(|condition| condition.as_str())
                    .unwrap_or(type_name);
                gateway_data_into(inner, &fragment.selection_set, out);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apollo_compiler::name;
    use bramble_federation::merge::merge_schemas;
    use bramble_federation::merge::ServiceSchema;
    use bramble_federation::plan::plan_operation;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Plans `{ movie(id: "1") { title release } }` across two services and
    /// returns the merged schema plus the child step against the second.
    fn planned_child_step() -> (MergedSchema, PlanStep) {
        let movies = ServiceSchema {
            name: "movies".to_owned(),
            version: "0.1.0".to_owned(),
            url: "http://movies/query".to_owned(),
            schema: apollo_compiler::Schema::parse(
                r#"
                directive @boundary on OBJECT | FIELD_DEFINITION
                type Service { name: String! version: String! schema: String! }
                interface Node { id: ID! }
                type Movie implements Node @boundary { id: ID! title: String }
                type Query { service: Service! node(id: ID!): Node movie(id: ID!): Movie! }
                "#,
                "movies.graphql",
            )
            .unwrap(),
        };
        let releases = ServiceSchema {
            name: "releases".to_owned(),
            version: "0.1.0".to_owned(),
            url: "http://releases/query".to_owned(),
            schema: apollo_compiler::Schema::parse(
                r#"
                directive @boundary on OBJECT | FIELD_DEFINITION
                type Service { name: String! version: String! schema: String! }
                interface Node { id: ID! }
                type Movie implements Node @boundary { id: ID! release: Int }
                type Query { service: Service! node(id: ID!): Node }
                "#,
                "releases.graphql",
            )
            .unwrap(),
        };
        let merged = merge_schemas(&[movies, releases], "id").unwrap();
        let document = apollo_compiler::ExecutableDocument::parse(
            &merged.schema,
            r#"{ movie(id: "1") { title release } }"#,
            "query.graphql",
        )
        .unwrap();
        let operation = document.operations.get(None).unwrap();
        let plan = plan_operation(&merged, operation, &document.fragments, &Map::new()).unwrap();
        let child = plan.root_steps[0].then[0].clone();
        (merged, child)
    }

    #[test]
    fn array_lookups_inline_their_ids() {
        let (_merged, child) = planned_child_step();
        let lookup = BoundaryQuery {
            field: name!("movies"),
            argument: name!("ids"),
            array: true,
            node_interface: false,
        };
        assert_eq!(
            array_lookup_document(&lookup, &child, &["1".to_owned(), "2".to_owned()]),
            r#"query { _result: movies(ids: ["1", "2"]) { _id: id release } }"#
        );
    }

    #[test]
    fn node_lookups_are_aliased_and_wrapped_in_a_type_condition() {
        let (merged, child) = planned_child_step();
        let lookup = merged
            .boundary_queries
            .get("http://releases/query", "Movie")
            .unwrap();
        assert!(lookup.node_interface);
        assert_eq!(
            single_lookup_document(lookup, &child, &["1".to_owned(), "2".to_owned()]),
            r#"query { _0: node(id: "1") { ... on Movie { _id: id release } } _1: node(id: "2") { ... on Movie { _id: id release } } }"#
        );
    }

    #[test]
    fn gateway_steps_resolve_typename_in_process() {
        let schema = apollo_compiler::Schema::parse_and_validate(
            r#"
            type Search { hits: [String!]! }
            type Query { search: Search! }
            "#,
            "schema.graphql",
        )
        .unwrap();
        let document = apollo_compiler::ExecutableDocument::parse(
            &schema,
            "{ __typename search { __typename } }",
            "query.graphql",
        )
        .unwrap();
        let operation = document.operations.get(None).unwrap();
        assert_eq!(
            gateway_data("Query", &operation.selection_set),
            json!({ "__typename": "Query", "search": { "__typename": "Search" } })
        );
    }

    #[test]
    fn boundary_ids_are_deduplicated_in_order() {
        let data = json!({
            "movies": [
                { "_id": "2", "title": "b" },
                { "_id": "1", "title": "a" },
                { "_id": "2", "title": "b again" },
            ]
        });
        assert_eq!(
            collect_boundary_ids(&data, &["movies".to_owned()]),
            vec!["2".to_owned(), "1".to_owned()]
        );
    }

    #[test]
    fn empty_arrays_produce_no_ids() {
        let data = json!({ "movies": [] });
        assert!(collect_boundary_ids(&data, &["movies".to_owned()]).is_empty());
    }
}

//! Query planning.
//!
//! Walks a validated operation against the merged schema and the
//! field→service map, and emits a tree of plan steps. Each step is scoped to
//! exactly one service; child steps join back onto their parent's data
//! through the boundary id, which planning injects under the reserved alias
//! `_id`.

use apollo_compiler::ast;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::collections::IndexSet;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Fragment;
use apollo_compiler::executable::InlineFragment;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::OperationType;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::executable::VariableDefinition;
use apollo_compiler::name;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::Name;
use apollo_compiler::Node;
use serde_json::json;

use crate::error::PlanError;
use crate::format::format_selection_set;
use crate::merge::MergedSchema;
use crate::merge::GATEWAY_URL;

/// The alias planning reserves for injected boundary ids.
pub const ID_ALIAS: &str = "_id";

/// A single downstream call: one service, one parent type, one selection
/// set, spliced into the response tree at `insertion_point`.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub service_url: String,
    pub service_name: String,
    pub kind: OperationType,
    pub parent_type: Name,
    pub selection_set: SelectionSet,
    /// Path of response keys from the root to the object this step's data
    /// belongs to. Empty for root steps.
    pub insertion_point: Vec<String>,
    pub variable_definitions: Vec<Node<VariableDefinition>>,
    /// Steps that need this step's data before they can run.
    pub then: Vec<PlanStep>,
}

impl PlanStep {
    /// Debug rendering for the `plan` entry of the response extensions.
    pub fn to_debug_json(&self) -> serde_json::Value {
        json!({
            "serviceUrl": self.service_url,
            "serviceName": self.service_name,
            "parentType": self.parent_type.as_str(),
            "selectionSet": format_selection_set(&self.selection_set),
            "insertionPoint": self.insertion_point,
            "then": self.then.iter().map(PlanStep::to_debug_json).collect::<Vec<_>>(),
        })
    }
}

/// The full plan for one operation, together with the flattened client
/// selection set the stitcher formats the response against.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub kind: OperationType,
    /// The client selection set after `@skip`/`@include` evaluation and
    /// fragment inlining. Response key order follows this.
    pub selection_set: SelectionSet,
    /// Root-level `__schema`/`__type` fields, resolved by the gateway.
    pub introspection_fields: Vec<Node<Field>>,
    pub root_steps: Vec<PlanStep>,
}

pub fn plan_operation(
    merged: &MergedSchema,
    operation: &Operation,
    fragments: &IndexMap<Name, Node<Fragment>>,
    variables: &serde_json::Map<String, serde_json::Value>,
) -> Result<QueryPlan, PlanError> {
    Planner {
        merged,
        fragments,
        variables,
    }
    .plan(operation)
}

struct Planner<'a> {
    merged: &'a MergedSchema,
    fragments: &'a IndexMap<Name, Node<Fragment>>,
    variables: &'a serde_json::Map<String, serde_json::Value>,
}

/// A root step being assembled for one service.
struct Bucket {
    selection_set: SelectionSet,
    then: Vec<PlanStep>,
}

impl<'a> Planner<'a> {
    fn plan(&self, operation: &Operation) -> Result<QueryPlan, PlanError> {
        let root_type = match operation.operation_type {
            OperationType::Query => name!("Query"),
            OperationType::Mutation => name!("Mutation"),
            OperationType::Subscription => {
                return Err(PlanError::UnsupportedOperation("subscription"))
            }
        };

        let flattened = self.flatten_selection_set(&operation.selection_set)?;

        let mut buckets: IndexMap<String, Bucket> = IndexMap::default();
        let mut introspection_fields = Vec::new();
        self.bucket_selection_set(
            &root_type,
            true,
            &[],
            &flattened,
            &mut buckets,
            &mut introspection_fields,
        )?;

        let mut root_steps = Vec::new();
        for (service_url, bucket) in buckets {
            let mut step = PlanStep {
                service_name: self.service_name(&service_url),
                service_url,
                kind: operation.operation_type,
                parent_type: root_type.clone(),
                selection_set: bucket.selection_set,
                insertion_point: Vec::new(),
                variable_definitions: Vec::new(),
                then: bucket.then,
            };
            self.attach_variables(operation, &mut step);
            root_steps.push(step);
        }

        Ok(QueryPlan {
            kind: operation.operation_type,
            selection_set: flattened,
            introspection_fields,
            root_steps,
        })
    }

    // ---- @skip/@include evaluation and fragment inlining ----

    /// Produces a copy of the selection set with `@skip`/`@include` applied
    /// and removed, and named fragment spreads replaced by inline fragments
    /// with the same type condition.
    fn flatten_selection_set(&self, selection_set: &SelectionSet) -> Result<SelectionSet, PlanError> {
        let mut flattened = SelectionSet::new(selection_set.ty.clone());
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    if !self.include_selection(&field.directives)? {
                        continue;
                    }
                    let mut field = field.as_ref().clone();
                    field.directives = strip_conditional_directives(&field.directives);
                    field.selection_set = self.flatten_selection_set(&field.selection_set)?;
                    flattened.push(field);
                }
                Selection::InlineFragment(fragment) => {
                    if !self.include_selection(&fragment.directives)? {
                        continue;
                    }
                    let mut fragment = fragment.as_ref().clone();
                    fragment.directives = strip_conditional_directives(&fragment.directives);
                    fragment.selection_set = self.flatten_selection_set(&fragment.selection_set)?;
                    if !fragment.selection_set.selections.is_empty() {
                        flattened.push(fragment);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !self.include_selection(&spread.directives)? {
                        continue;
                    }
                    let fragment = self
                        .fragments
                        .get(&spread.fragment_name)
                        .ok_or_else(|| PlanError::UnknownFragment(spread.fragment_name.clone()))?;
                    let inner = self.flatten_selection_set(&fragment.selection_set)?;
                    if !inner.selections.is_empty() {
                        flattened.push(InlineFragment {
                            type_condition: Some(fragment.selection_set.ty.clone()),
                            directives: ast::DirectiveList::default(),
                            selection_set: inner,
                        });
                    }
                }
            }
        }
        Ok(flattened)
    }

    fn include_selection(&self, directives: &ast::DirectiveList) -> Result<bool, PlanError> {
        if let Some(skip) = directives.get("skip") {
            if self.condition_value(skip)? {
                return Ok(false);
            }
        }
        if let Some(include) = directives.get("include") {
            if !self.condition_value(include)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn condition_value(&self, directive: &ast::Directive) -> Result<bool, PlanError> {
        let value = directive
            .arguments
            .iter()
            .find(|argument| argument.name == "if")
            .map(|argument| argument.value.as_ref());
        match value {
            Some(ast::Value::Boolean(b)) => Ok(*b),
            Some(ast::Value::Variable(variable)) => match self.variables.get(variable.as_str()) {
                Some(serde_json::Value::Bool(b)) => Ok(*b),
                Some(_) => Err(PlanError::MalformedConditionalDirective(
                    directive.name.clone(),
                )),
                None => Err(PlanError::UndefinedVariable(variable.clone())),
            },
            _ => Err(PlanError::MalformedConditionalDirective(
                directive.name.clone(),
            )),
        }
    }

    // ---- root and namespace routing ----

    /// Distributes the selections of a root or namespace type into
    /// per-service buckets. Namespace wrappers are re-emitted inside every
    /// bucket that selects through them.
    fn bucket_selection_set(
        &self,
        parent_type: &Name,
        at_root: bool,
        path: &[String],
        selection_set: &SelectionSet,
        buckets: &mut IndexMap<String, Bucket>,
        introspection_fields: &mut Vec<Node<Field>>,
    ) -> Result<(), PlanError> {
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    if at_root && (field.name == "__schema" || field.name == "__type") {
                        introspection_fields.push(field.clone());
                        continue;
                    }
                    self.bucket_field(parent_type, path, field, buckets)?;
                }
                Selection::InlineFragment(fragment) => {
                    let inner_type = fragment
                        .type_condition
                        .clone()
                        .unwrap_or_else(|| parent_type.clone());
                    let mut inner_buckets: IndexMap<String, Bucket> = IndexMap::default();
                    self.bucket_selection_set(
                        &inner_type,
                        at_root,
                        path,
                        &fragment.selection_set,
                        &mut inner_buckets,
                        introspection_fields,
                    )?;
                    for (url, inner) in inner_buckets {
                        let bucket = bucket_entry(buckets, &url, parent_type);
                        bucket.selection_set.push(InlineFragment {
                            type_condition: fragment.type_condition.clone(),
                            directives: fragment.directives.clone(),
                            selection_set: inner.selection_set,
                        });
                        bucket.then.extend(inner.then);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    return Err(PlanError::UnknownFragment(spread.fragment_name.clone()));
                }
            }
        }
        Ok(())
    }

    fn bucket_field(
        &self,
        parent_type: &Name,
        path: &[String],
        field: &Node<Field>,
        buckets: &mut IndexMap<String, Bucket>,
    ) -> Result<(), PlanError> {
        let mut field_path = path.to_vec();
        field_path.push(field.response_key().to_string());

        match self.merged.field_urls.get(parent_type, &field.name) {
            Some(url) => {
                let url = url.to_owned();
                let bucket = bucket_entry(buckets, &url, parent_type);
                let routed = self.route_field(field, &field_path, &url, &mut bucket.then)?;
                bucket.selection_set.push(routed);
                Ok(())
            }
            None if !field.selection_set.selections.is_empty() => {
                // Namespace descent: the field itself has no owner, so its
                // children pick the services and the wrapper is re-emitted
                // into each bucket.
                let inner_type = field.definition.ty.inner_named_type();
                let mut inner_buckets: IndexMap<String, Bucket> = IndexMap::default();
                let mut nested_introspection = Vec::new();
                self.bucket_selection_set(
                    inner_type,
                    false,
                    &field_path,
                    &field.selection_set,
                    &mut inner_buckets,
                    &mut nested_introspection,
                )?;
                if inner_buckets.is_empty() {
                    return Err(PlanError::UnroutableField {
                        ty: parent_type.clone(),
                        field: field.name.clone(),
                    });
                }
                for (url, inner) in inner_buckets {
                    let bucket = bucket_entry(buckets, &url, parent_type);
                    let mut wrapper = field.as_ref().clone();
                    wrapper.selection_set = inner.selection_set;
                    bucket.selection_set.push(wrapper);
                    bucket.then.extend(inner.then);
                }
                Ok(())
            }
            None => Err(PlanError::UnroutableField {
                ty: parent_type.clone(),
                field: field.name.clone(),
            }),
        }
    }

    // ---- per-service routing below the root ----

    /// Copies a field for the step running against `location`, routing its
    /// subtree. Fields owned elsewhere become child steps; if any child step
    /// joins directly under this field, the boundary id is injected into the
    /// kept selection.
    fn route_field(
        &self,
        field: &Node<Field>,
        field_path: &[String],
        location: &str,
        out_children: &mut Vec<PlanStep>,
    ) -> Result<Field, PlanError> {
        let inner_type = field.definition.ty.inner_named_type().clone();
        let mut routed = field.as_ref().clone();
        if !field.selection_set.selections.is_empty() {
            routed.selection_set = self.route_selection_set(
                &inner_type,
                location,
                field_path,
                &field.selection_set,
                out_children,
            )?;
            let joined_here = out_children
                .iter()
                .any(|child| child.insertion_point == field_path);
            if joined_here {
                if !self.merged.boundary_types.contains(&inner_type) {
                    return Err(PlanError::NotBoundaryType { ty: inner_type });
                }
                self.inject_id(&inner_type, &mut routed.selection_set)?;
            }
        }
        Ok(routed)
    }

    fn route_selection_set(
        &self,
        parent_type: &Name,
        location: &str,
        path: &[String],
        selection_set: &SelectionSet,
        out_children: &mut Vec<PlanStep>,
    ) -> Result<SelectionSet, PlanError> {
        let mut local = SelectionSet::new(selection_set.ty.clone());
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    // `__typename` and the boundary id are served by whichever
                    // service answers the surrounding selection.
                    let stays_local = field.name == "__typename"
                        || (self.merged.boundary_types.contains(parent_type)
                            && field.name == self.merged.id_field);
                    if stays_local {
                        local.push(field.as_ref().clone());
                        continue;
                    }

                    let mut field_path = path.to_vec();
                    field_path.push(field.response_key().to_string());

                    match self.merged.field_urls.get(parent_type, &field.name) {
                        Some(url) if url == location => {
                            let routed =
                                self.route_field(field, &field_path, location, out_children)?;
                            local.push(routed);
                        }
                        Some(url) => {
                            let url = url.to_owned();
                            self.route_to_child_step(
                                parent_type,
                                field,
                                &field_path,
                                path,
                                &url,
                                out_children,
                            )?;
                        }
                        None => {
                            return Err(PlanError::UnroutableField {
                                ty: parent_type.clone(),
                                field: field.name.clone(),
                            });
                        }
                    }
                }
                Selection::InlineFragment(fragment) => {
                    let inner_type = fragment
                        .type_condition
                        .clone()
                        .unwrap_or_else(|| parent_type.clone());
                    let inner = self.route_selection_set(
                        &inner_type,
                        location,
                        path,
                        &fragment.selection_set,
                        out_children,
                    )?;
                    if !inner.selections.is_empty() {
                        local.push(InlineFragment {
                            type_condition: fragment.type_condition.clone(),
                            directives: fragment.directives.clone(),
                            selection_set: inner,
                        });
                    }
                }
                Selection::FragmentSpread(spread) => {
                    return Err(PlanError::UnknownFragment(spread.fragment_name.clone()));
                }
            }
        }
        Ok(local)
    }

    /// A field owned by another service: fuse into the sibling step already
    /// targeting `(insertion point, service)` if one exists, otherwise open a
    /// new child step on the boundary type.
    fn route_to_child_step(
        &self,
        parent_type: &Name,
        field: &Node<Field>,
        field_path: &[String],
        parent_path: &[String],
        url: &str,
        out_children: &mut Vec<PlanStep>,
    ) -> Result<(), PlanError> {
        if let Some(existing) = out_children
            .iter_mut()
            .find(|step| step.insertion_point == parent_path && step.service_url == url)
        {
            let mut then = std::mem::take(&mut existing.then);
            let routed = self.route_field(field, field_path, url, &mut then)?;
            existing.then = then;
            existing.selection_set.push(routed);
            return Ok(());
        }

        if !self.merged.boundary_types.contains(parent_type) {
            return Err(PlanError::NotBoundaryType {
                ty: parent_type.clone(),
            });
        }

        let mut then = Vec::new();
        let routed = self.route_field(field, field_path, url, &mut then)?;
        let mut selection_set = SelectionSet::new(parent_type.clone());
        self.inject_id(parent_type, &mut selection_set)?;
        selection_set.push(routed);

        out_children.push(PlanStep {
            service_url: url.to_owned(),
            service_name: self.service_name(url),
            kind: OperationType::Query,
            parent_type: parent_type.clone(),
            selection_set,
            insertion_point: parent_path.to_vec(),
            variable_definitions: Vec::new(),
            then,
        });
        Ok(())
    }

    /// Adds `_id: <id field>` to a boundary selection unless it is already
    /// there.
    fn inject_id(&self, boundary_type: &Name, selection_set: &mut SelectionSet) -> Result<(), PlanError> {
        let already_there = selection_set.selections.iter().any(|selection| {
            matches!(
                selection,
                Selection::Field(field) if field.response_key() == ID_ALIAS
            )
        });
        if already_there {
            return Ok(());
        }

        let Some(ExtendedType::Object(object)) = self.merged.schema.types.get(boundary_type)
        else {
            return Err(PlanError::NotBoundaryType {
                ty: boundary_type.clone(),
            });
        };
        let definition = object
            .fields
            .get(&self.merged.id_field)
            .ok_or_else(|| PlanError::MissingIdField {
                ty: boundary_type.clone(),
                id_field: self.merged.id_field.to_string(),
            })?
            .node
            .clone();

        let id_selection = Field {
            definition,
            alias: Some(name!("_id")),
            name: self.merged.id_field.clone(),
            arguments: Vec::new(),
            directives: ast::DirectiveList::default(),
            selection_set: SelectionSet::new(name!("ID")),
        };
        selection_set.selections.insert(0, Selection::Field(Node::new(id_selection)));
        Ok(())
    }

    // ---- step metadata ----

    fn service_name(&self, url: &str) -> String {
        if url == GATEWAY_URL {
            return "bramble".to_owned();
        }
        self.merged
            .service_names
            .get(url)
            .cloned()
            .unwrap_or_else(|| url.to_owned())
    }

    /// Restricts the operation's variable definitions to the ones a step's
    /// selection actually references, recursively for its child steps.
    fn attach_variables(&self, operation: &Operation, step: &mut PlanStep) {
        let mut used: IndexSet<Name> = IndexSet::default();
        collect_variable_refs(&step.selection_set, &mut used);
        step.variable_definitions = operation
            .variables
            .iter()
            .filter(|definition| used.contains(&definition.name))
            .cloned()
            .collect();
        for child in &mut step.then {
            self.attach_variables(operation, child);
        }
    }
}

fn bucket_entry<'b>(
    buckets: &'b mut IndexMap<String, Bucket>,
    url: &str,
    parent_type: &Name,
) -> &'b mut Bucket {
    if !buckets.contains_key(url) {
        buckets.insert(
            url.to_owned(),
            Bucket {
                selection_set: SelectionSet::new(parent_type.clone()),
                then: Vec::new(),
            },
        );
    }
    buckets.get_mut(url).expect("bucket was just inserted")
}

fn strip_conditional_directives(directives: &ast::DirectiveList) -> ast::DirectiveList {
    ast::DirectiveList(
        directives
            .iter()
            .filter(|directive| directive.name != "skip" && directive.name != "include")
            .cloned()
            .collect(),
    )
}

fn collect_variable_refs(selection_set: &SelectionSet, used: &mut IndexSet<Name>) {
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => {
                for argument in &field.arguments {
                    collect_value_refs(&argument.value, used);
                }
                for directive in field.directives.iter() {
                    for argument in &directive.arguments {
                        collect_value_refs(&argument.value, used);
                    }
                }
                collect_variable_refs(&field.selection_set, used);
            }
            Selection::InlineFragment(fragment) => {
                collect_variable_refs(&fragment.selection_set, used);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn collect_value_refs(value: &ast::Value, used: &mut IndexSet<Name>) {
    match value {
        ast::Value::Variable(name) => {
            used.insert(name.clone());
        }
        ast::Value::List(items) => {
            for item in items {
                collect_value_refs(item, used);
            }
        }
        ast::Value::Object(fields) => {
            for (_, item) in fields {
                collect_value_refs(item, used);
            }
        }
        _ => {}
    }
}

//! Result stitching.
//!
//! Execution results are merged into a single tree (boundary entities are
//! matched to their targets by the injected `_id`), then the tree is walked
//! against the client's selection set: keys come out in selection order,
//! absent fields become explicit nulls, and nulls in non-null positions
//! bubble to the nearest nullable ancestor with exactly one error per
//! bubble.

use apollo_compiler::ast;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::OperationType;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::validation::Valid;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use indexmap::IndexMap;
use serde_json::Map;
use serde_json::Value;

use bramble_federation::plan::QueryPlan;
use bramble_federation::plan::ID_ALIAS;

use crate::executor::ExecutionResult;
use crate::graphql;
use crate::json_ext::deep_merge;
use crate::json_ext::values_at_path_mut;
use crate::json_ext::Path;

/// Merges all step results and formats the final `data` value. The returned
/// errors are the downstream step errors followed by any null-bubbling
/// errors.
pub fn stitch(
    schema: &Valid<Schema>,
    plan: &QueryPlan,
    results: Vec<ExecutionResult>,
    introspection: Option<Value>,
) -> (Value, Vec<graphql::Error>) {
    let (tree, mut errors) = merge_results(results, introspection);
    let root_type = match plan.kind {
        OperationType::Mutation => "Mutation",
        _ => "Query",
    };
    let data = format_response(schema, root_type, &plan.selection_set, &tree, &mut errors);
    (data, errors)
}

/// Builds the merged tree. Results are applied shallow-first so a child's
/// insertion point always exists by the time it is spliced; introspection
/// data goes in first so downstream data can never overwrite it.
pub fn merge_results(
    mut results: Vec<ExecutionResult>,
    introspection: Option<Value>,
) -> (Value, Vec<graphql::Error>) {
    let mut tree = Value::Object(Map::new());
    let mut errors = Vec::new();

    let mut gateway_keys: Vec<String> = Vec::new();
    if let Some(introspection) = introspection {
        if let Some(map) = introspection.as_object() {
            gateway_keys = map.keys().cloned().collect();
        }
        deep_merge(&mut tree, introspection);
    }

    results.sort_by_key(|result| result.insertion_point.len());
    for result in results {
        errors.extend(result.errors);
        // A failed step contributes errors but no data.
        if result.data.is_null() {
            continue;
        }
        if result.insertion_point.is_empty() {
            // Introspection is gateway-authoritative; a root result may not
            // overwrite its keys.
            let mut data = result.data;
            if let Value::Object(map) = &mut data {
                for key in &gateway_keys {
                    map.remove(key);
                }
            }
            deep_merge(&mut tree, data);
            continue;
        }
        let Value::Array(entities) = result.data else {
            continue;
        };
        for target in values_at_path_mut(&mut tree, &result.insertion_point) {
            let Some(target_id) = target.get(ID_ALIAS).and_then(Value::as_str) else {
                continue;
            };
            let matched = entities.iter().find(|entity| {
                entity.get(ID_ALIAS).and_then(Value::as_str) == Some(target_id)
            });
            if let Some(entity) = matched {
                deep_merge(target, entity.clone());
            }
        }
    }
    (tree, errors)
}

/// Formats the merged tree against the selection set. A bubble reaching the
/// root turns the whole `data` into `null`.
pub fn format_response(
    schema: &Valid<Schema>,
    root_type: &str,
    selection_set: &SelectionSet,
    tree: &Value,
    errors: &mut Vec<graphql::Error>,
) -> Value {
    let empty = Map::new();
    let data = tree.as_object().unwrap_or(&empty);
    let mut formatter = Formatter { schema, errors };
    match formatter.format_object(root_type, &[selection_set], data, &mut Path::default()) {
        Ok(map) => Value::Object(map),
        Err(Bubble) => Value::Null,
    }
}

/// A null is travelling up towards the nearest nullable ancestor. The error
/// was recorded where the null originated.
struct Bubble;

struct Formatter<'a> {
    schema: &'a Valid<Schema>,
    errors: &'a mut Vec<graphql::Error>,
}

impl<'a> Formatter<'a> {
    fn format_object(
        &mut self,
        static_type: &str,
        selection_sets: &[&SelectionSet],
        data: &Map<String, Value>,
        path: &mut Path,
    ) -> Result<Map<String, Value>, Bubble> {
        let concrete = data
            .get("__typename")
            .and_then(Value::as_str)
            .unwrap_or(static_type);

        let mut groups: IndexMap<String, Vec<&Node<Field>>> = IndexMap::new();
        for selection_set in selection_sets {
            self.collect_fields(selection_set, concrete, static_type, &mut groups);
        }

        let mut out = Map::new();
        for (key, fields) in groups {
            let first = fields[0];
            if first.name == "__typename" {
                let type_name = data
                    .get(&key)
                    .and_then(Value::as_str)
                    .unwrap_or(concrete);
                out.insert(key, Value::String(type_name.to_owned()));
                continue;
            }

            let subselections: Vec<&SelectionSet> =
                fields.iter().map(|field| &field.selection_set).collect();
            path.push_key(&key);
            let value = self.format_field(
                &first.definition.ty,
                &subselections,
                data.get(&key),
                path,
                static_type,
                first.name.as_str(),
            );
            path.pop();
            out.insert(key, value?);
        }
        Ok(out)
    }

    /// Formats one field position, enforcing its nullability: a null (or an
    /// inner bubble) in a non-null position starts/continues a bubble, in a
    /// nullable position it settles as an explicit null.
    fn format_field(
        &mut self,
        ty: &ast::Type,
        selection_sets: &[&SelectionSet],
        data: Option<&Value>,
        path: &mut Path,
        parent_type: &str,
        field_name: &str,
    ) -> Result<Value, Bubble> {
        let inner = self.format_nullable(ty, selection_sets, data, path, parent_type, field_name);
        match inner {
            Ok(Value::Null) if ty.is_non_null() => {
                self.errors.push(
                    graphql::Error::new(format!(
                        "Cannot return null for non-nullable field {parent_type}.{field_name}"
                    ))
                    .with_path(path.clone()),
                );
                Err(Bubble)
            }
            Ok(value) => Ok(value),
            Err(Bubble) if ty.is_non_null() => Err(Bubble),
            Err(Bubble) => Ok(Value::Null),
        }
    }

    fn format_nullable(
        &mut self,
        ty: &ast::Type,
        selection_sets: &[&SelectionSet],
        data: Option<&Value>,
        path: &mut Path,
        parent_type: &str,
        field_name: &str,
    ) -> Result<Value, Bubble> {
        let data = data.unwrap_or(&Value::Null);
        if data.is_null() {
            return Ok(Value::Null);
        }

        match ty {
            ast::Type::List(element) | ast::Type::NonNullList(element) => {
                let Some(items) = data.as_array() else {
                    return Ok(Value::Null);
                };
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    path.push_index(index);
                    let value = self.format_field(
                        element,
                        selection_sets,
                        Some(item),
                        path,
                        parent_type,
                        field_name,
                    );
                    path.pop();
                    out.push(value?);
                }
                Ok(Value::Array(out))
            }
            ast::Type::Named(name) | ast::Type::NonNullNamed(name) => {
                let composite = matches!(
                    self.schema.types.get(name),
                    Some(
                        ExtendedType::Object(_)
                            | ExtendedType::Interface(_)
                            | ExtendedType::Union(_)
                    )
                );
                if !composite {
                    return Ok(data.clone());
                }
                let Some(object) = data.as_object() else {
                    return Ok(Value::Null);
                };
                let map = self.format_object(name.as_str(), selection_sets, object, path)?;
                Ok(Value::Object(map))
            }
        }
    }

    /// Groups selections by response key in first-seen order, looking
    /// through inline fragments whose condition matches the concrete type.
    fn collect_fields<'s>(
        &self,
        selection_set: &'s SelectionSet,
        concrete: &str,
        static_type: &str,
        groups: &mut IndexMap<String, Vec<&'s Node<Field>>>,
    ) {
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    groups
                        .entry(field.response_key().to_string())
                        .or_default()
                        .push(field);
                }
                Selection::InlineFragment(fragment) => {
                    let matches = match &fragment.type_condition {
                        None => true,
                        Some(condition) => {
                            self.type_condition_matches(condition.as_str(), concrete, static_type)
                        }
                    };
                    if matches {
                        self.collect_fields(
                            &fragment.selection_set,
                            concrete,
                            static_type,
                            groups,
                        );
                    }
                }
                Selection::FragmentSpread(_) => {}
            }
        }
    }

    fn type_condition_matches(&self, condition: &str, concrete: &str, static_type: &str) -> bool {
        if condition == concrete || condition == static_type {
            return true;
        }
        match self.schema.types.get(condition) {
            Some(ExtendedType::Interface(_)) => {
                match self.schema.types.get(concrete) {
                    Some(ExtendedType::Object(object)) => object
                        .implements_interfaces
                        .iter()
                        .any(|interface| interface.name == condition),
                    _ => false,
                }
            }
            Some(ExtendedType::Union(union_)) => {
                union_.members.iter().any(|member| member.name == concrete)
            }
            _ => false,
        }
    }
}

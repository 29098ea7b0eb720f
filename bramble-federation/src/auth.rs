//! Field-level authorization.
//!
//! A permission tree either allows a whole subtree (`AllowAll`) or names the
//! subfields that stay visible. Operations are pruned before planning;
//! schemas are pruned before introspection so a caller can only see what it
//! could query.

use std::fmt;

use apollo_compiler::collections::IndexMap as SchemaIndexMap;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Fragment;
use apollo_compiler::executable::InlineFragment;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::OperationType;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::schema::ComponentName;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::validation::Valid;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use indexmap::IndexMap;
use indexmap::IndexSet;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// What a caller may select below one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Permission {
    AllowAll,
    AllowedSubfields(IndexMap<String, Permission>),
}

impl Permission {
    pub fn deny_all() -> Self {
        Permission::AllowedSubfields(IndexMap::new())
    }

    fn subfield(&self, name: &str) -> Option<&Permission> {
        match self {
            Permission::AllowAll => Some(&Permission::AllowAll),
            Permission::AllowedSubfields(map) => map.get(name),
        }
    }
}

/// Pointwise union of two permission trees. Commutative and associative;
/// `AllowAll` is the top element.
pub fn merge_permissions(left: &Permission, right: &Permission) -> Permission {
    match (left, right) {
        (Permission::AllowAll, _) | (_, Permission::AllowAll) => Permission::AllowAll,
        (Permission::AllowedSubfields(a), Permission::AllowedSubfields(b)) => {
            let mut merged = a.clone();
            for (name, permission) in b {
                let entry = match merged.get(name) {
                    Some(existing) => merge_permissions(existing, permission),
                    None => permission.clone(),
                };
                merged.insert(name.clone(), entry);
            }
            Permission::AllowedSubfields(merged)
        }
    }
}

/// Per-operation-kind permission roots. A missing root denies everything but
/// the meta fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OperationPermissions {
    pub query: Option<Permission>,
    pub mutation: Option<Permission>,
    pub subscription: Option<Permission>,
}

impl OperationPermissions {
    pub fn allow_all() -> Self {
        OperationPermissions {
            query: Some(Permission::AllowAll),
            mutation: Some(Permission::AllowAll),
            subscription: Some(Permission::AllowAll),
        }
    }

    pub fn merge(&self, other: &OperationPermissions) -> OperationPermissions {
        let merge_root = |a: &Option<Permission>, b: &Option<Permission>| match (a, b) {
            (Some(a), Some(b)) => Some(merge_permissions(a, b)),
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.clone(),
        };
        OperationPermissions {
            query: merge_root(&self.query, &other.query),
            mutation: merge_root(&self.mutation, &other.mutation),
            subscription: merge_root(&self.subscription, &other.subscription),
        }
    }

    fn root(&self, kind: OperationType) -> Permission {
        let root = match kind {
            OperationType::Query => &self.query,
            OperationType::Mutation => &self.mutation,
            OperationType::Subscription => &self.subscription,
        };
        root.clone().unwrap_or_else(Permission::deny_all)
    }
}

// In configuration a permission is written as `true` (allow everything),
// a list of field names, or a nested object.
impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PermissionVisitor;

        impl<'de> de::Visitor<'de> for PermissionVisitor {
            type Value = Permission;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("true, a list of field names, or a map of subfield permissions")
            }

            fn visit_bool<E: de::Error>(self, allowed: bool) -> Result<Permission, E> {
                if allowed {
                    Ok(Permission::AllowAll)
                } else {
                    Ok(Permission::deny_all())
                }
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Permission, A::Error> {
                let mut map = IndexMap::new();
                while let Some(name) = seq.next_element::<String>()? {
                    map.insert(name, Permission::AllowAll);
                }
                Ok(Permission::AllowedSubfields(map))
            }

            fn visit_map<A: de::MapAccess<'de>>(self, mut access: A) -> Result<Permission, A::Error> {
                let mut map = IndexMap::new();
                while let Some((name, permission)) =
                    access.next_entry::<String, Permission>()?
                {
                    map.insert(name, permission);
                }
                Ok(Permission::AllowedSubfields(map))
            }
        }

        deserializer.deserialize_any(PermissionVisitor)
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Permission::AllowAll => serializer.serialize_bool(true),
            Permission::AllowedSubfields(map) => {
                use serde::ser::SerializeMap;
                let mut state = serializer.serialize_map(Some(map.len()))?;
                for (name, permission) in map {
                    state.serialize_entry(name, permission)?;
                }
                state.end()
            }
        }
    }
}

/// The outcome of pruning one operation: the operation restricted to allowed
/// fields, plus one error per denied field.
pub struct FilteredOperation {
    pub operation: Operation,
    pub errors: Vec<String>,
}

/// Drops every selection the permission tree does not cover. Denied fields
/// each contribute a `<path> access disallowed` error but do not stop the
/// rest of the operation. Named fragment spreads are inlined so the shared
/// definition is never narrowed for other operations.
pub fn filter_operation(
    operation: &Operation,
    fragments: &SchemaIndexMap<Name, Node<Fragment>>,
    permissions: &OperationPermissions,
) -> FilteredOperation {
    let root = permissions.root(operation.operation_type);
    let mut errors = Vec::new();
    let path = operation_path_root(operation.operation_type);
    let selection_set = filter_selection_set(
        &root,
        fragments,
        path,
        &operation.selection_set,
        &mut errors,
    );

    let mut filtered = operation.clone();
    filtered.selection_set = selection_set;
    FilteredOperation {
        operation: filtered,
        errors,
    }
}

fn operation_path_root(kind: OperationType) -> String {
    match kind {
        OperationType::Query => "query".to_owned(),
        OperationType::Mutation => "mutation".to_owned(),
        OperationType::Subscription => "subscription".to_owned(),
    }
}

fn filter_selection_set(
    permission: &Permission,
    fragments: &SchemaIndexMap<Name, Node<Fragment>>,
    path: String,
    selection_set: &SelectionSet,
    errors: &mut Vec<String>,
) -> SelectionSet {
    let mut filtered = SelectionSet::new(selection_set.ty.clone());
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => {
                if let Some(kept) = filter_field(permission, fragments, &path, field, errors) {
                    filtered.push(kept);
                }
            }
            Selection::InlineFragment(fragment) => {
                let inner = filter_selection_set(
                    permission,
                    fragments,
                    path.clone(),
                    &fragment.selection_set,
                    errors,
                );
                if !inner.selections.is_empty() {
                    filtered.push(InlineFragment {
                        type_condition: fragment.type_condition.clone(),
                        directives: fragment.directives.clone(),
                        selection_set: inner,
                    });
                }
            }
            Selection::FragmentSpread(spread) => {
                let Some(fragment) = fragments.get(&spread.fragment_name) else {
                    continue;
                };
                let inner = filter_selection_set(
                    permission,
                    fragments,
                    path.clone(),
                    &fragment.selection_set,
                    errors,
                );
                if !inner.selections.is_empty() {
                    filtered.push(InlineFragment {
                        type_condition: Some(fragment.selection_set.ty.clone()),
                        directives: spread.directives.clone(),
                        selection_set: inner,
                    });
                }
            }
        }
    }
    filtered
}

fn filter_field(
    permission: &Permission,
    fragments: &SchemaIndexMap<Name, Node<Fragment>>,
    path: &str,
    field: &Node<Field>,
    errors: &mut Vec<String>,
) -> Option<Field> {
    // Meta fields are always visible; `__typename` carries no subfields to
    // expand, and the introspection fields are restricted by schema
    // filtering rather than operation filtering.
    if field.name == "__typename" || field.name == "__schema" || field.name == "__type" {
        return Some(field.as_ref().clone());
    }

    let field_path = format!("{path}.{}", field.name);
    match permission.subfield(&field.name) {
        None => {
            errors.push(format!("{field_path} access disallowed"));
            None
        }
        Some(Permission::AllowAll) => Some(field.as_ref().clone()),
        Some(subpermission) => {
            let mut kept = field.as_ref().clone();
            kept.selection_set = filter_selection_set(
                subpermission,
                fragments,
                field_path,
                &field.selection_set,
                errors,
            );
            Some(kept)
        }
    }
}

/// Returns a copy of the schema holding only the types and fields reachable
/// through the permission tree, plus transitively required argument and
/// abstract-member types. When a type is reachable along several paths its
/// allowed field sets union.
pub fn filter_schema(schema: &Valid<Schema>, permissions: &OperationPermissions) -> Valid<Schema> {
    let mut allowed: IndexMap<Name, Permission> = IndexMap::new();
    let mut worklist: Vec<(Name, Permission)> = Vec::new();
    let mut referenced: IndexSet<Name> = IndexSet::new();

    for (kind, root) in [
        (OperationType::Query, &permissions.query),
        (OperationType::Mutation, &permissions.mutation),
        (OperationType::Subscription, &permissions.subscription),
    ] {
        let Some(root) = root else { continue };
        if let Some(name) = root_type_name(schema, kind) {
            worklist.push((name.clone(), root.clone()));
        }
    }

    while let Some((type_name, permission)) = worklist.pop() {
        let merged = match allowed.get(&type_name) {
            Some(existing) => {
                let merged = merge_permissions(existing, &permission);
                if *existing == merged {
                    continue;
                }
                merged
            }
            None => permission,
        };
        allowed.insert(type_name.clone(), merged.clone());

        let Some(ty) = schema.types.get(&type_name) else {
            continue;
        };
        match ty {
            ExtendedType::Object(object) => {
                for (field_name, field) in &object.fields {
                    let Some(subpermission) = merged.subfield(field_name) else {
                        continue;
                    };
                    reference_field_types(schema, field, &mut referenced);
                    worklist.push((
                        field.ty.inner_named_type().clone(),
                        subpermission.clone(),
                    ));
                }
            }
            ExtendedType::Interface(interface) => {
                for (field_name, field) in &interface.fields {
                    let Some(subpermission) = merged.subfield(field_name) else {
                        continue;
                    };
                    reference_field_types(schema, field, &mut referenced);
                    worklist.push((
                        field.ty.inner_named_type().clone(),
                        subpermission.clone(),
                    ));
                }
                // Possible types stay visible with the same permission.
                for (name, ty) in &schema.types {
                    if let ExtendedType::Object(object) = ty {
                        let implements = object
                            .implements_interfaces
                            .iter()
                            .any(|implemented| implemented.name == type_name);
                        if implements {
                            worklist.push((name.clone(), merged.clone()));
                        }
                    }
                }
            }
            ExtendedType::Union(union_) => {
                for member in &union_.members {
                    worklist.push((member.name.clone(), merged.clone()));
                }
            }
            ExtendedType::Scalar(_) | ExtendedType::Enum(_) | ExtendedType::InputObject(_) => {
                referenced.insert(type_name.clone());
            }
        }
    }

    let mut filtered = Schema::clone(schema);
    filtered.types.retain(|name, _| {
        allowed.contains_key(name)
            || referenced.contains(name)
            || schema.types.get(name).is_some_and(ExtendedType::is_built_in)
    });

    for (type_name, ty) in filtered.types.iter_mut() {
        let Some(permission) = allowed.get(type_name) else {
            continue;
        };
        if matches!(permission, Permission::AllowAll) {
            continue;
        }
        match ty {
            ExtendedType::Object(object) => {
                let object = object.make_mut();
                object
                    .fields
                    .retain(|field_name, _| permission.subfield(field_name).is_some());
            }
            ExtendedType::Interface(interface) => {
                let interface = interface.make_mut();
                interface
                    .fields
                    .retain(|field_name, _| permission.subfield(field_name).is_some());
            }
            _ => {}
        }
    }

    // Drop union members and implemented interfaces that did not survive.
    let kept: IndexSet<Name> = filtered.types.keys().cloned().collect();
    for ty in filtered.types.values_mut() {
        match ty {
            ExtendedType::Union(union_) => {
                let union_ = union_.make_mut();
                union_.members = union_
                    .members
                    .iter()
                    .filter(|member| kept.contains(&member.name))
                    .cloned()
                    .collect();
            }
            ExtendedType::Object(object) => {
                retain_implements(&mut object.make_mut().implements_interfaces, &kept);
            }
            ExtendedType::Interface(interface) => {
                retain_implements(&mut interface.make_mut().implements_interfaces, &kept);
            }
            _ => {}
        }
    }

    // Filtering only removes definitions from an already-valid schema.
    Valid::assume_valid(filtered)
}

fn retain_implements(
    implements: &mut apollo_compiler::collections::IndexSet<ComponentName>,
    kept: &IndexSet<Name>,
) {
    *implements = implements
        .iter()
        .filter(|interface| kept.contains(&interface.name))
        .cloned()
        .collect();
}

/// Marks the leaf and argument types of one field as referenced, recursing
/// through input objects.
fn reference_field_types(
    schema: &Valid<Schema>,
    field: &apollo_compiler::schema::FieldDefinition,
    referenced: &mut IndexSet<Name>,
) {
    for argument in &field.arguments {
        reference_input_type(schema, argument.ty.inner_named_type(), referenced);
    }
    let inner = field.ty.inner_named_type();
    if matches!(
        schema.types.get(inner),
        Some(ExtendedType::Scalar(_) | ExtendedType::Enum(_))
    ) {
        referenced.insert(inner.clone());
    }
}

fn reference_input_type(
    schema: &Valid<Schema>,
    type_name: &Name,
    referenced: &mut IndexSet<Name>,
) {
    if !referenced.insert(type_name.clone()) {
        return;
    }
    if let Some(ExtendedType::InputObject(input)) = schema.types.get(type_name) {
        for field in input.fields.values() {
            reference_input_type(schema, field.ty.inner_named_type(), referenced);
        }
    }
}

fn root_type_name(schema: &Schema, kind: OperationType) -> Option<&Name> {
    let definition = &schema.schema_definition;
    let root = match kind {
        OperationType::Query => definition.query.as_ref(),
        OperationType::Mutation => definition.mutation.as_ref(),
        OperationType::Subscription => definition.subscription.as_ref(),
    };
    root.map(|component| &component.name)
}

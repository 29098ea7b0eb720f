//! Validation of a single service's schema against the gateway conventions.
//!
//! A schema that fails any rule here is excluded from merging; the service
//! keeps its previous snapshot and its status records the failure.

use apollo_compiler::ast;
use apollo_compiler::ast::DirectiveLocation;
use apollo_compiler::name;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::ObjectType;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;

use crate::directives::is_boundary_object;
use crate::directives::is_namespace_object;
use crate::directives::BOUNDARY_DIRECTIVE;
use crate::directives::NAMESPACE_DIRECTIVE;
use crate::error::SchemaError;
use crate::merge::merge_schemas;
use crate::merge::ServiceSchema;
use crate::merge::NODE_FIELD;
use crate::merge::NODE_INTERFACE;
use crate::merge::SERVICE_FIELD;
use crate::merge::SERVICE_TYPE;

const MINIMAL_PARTNER_SDL: &str = r#"
type Service { name: String! version: String! schema: String! }
type Query { service: Service! }
"#;

pub fn validate_service_schema(schema: &Schema, id_field: &str) -> Result<(), SchemaError> {
    validate_root_types(schema)?;
    validate_service_type(schema)?;
    validate_boundary_conventions(schema, id_field)?;
    validate_namespace_conventions(schema)?;

    schema
        .clone()
        .validate()
        .map_err(|with_errors| SchemaError::InvalidSchema(with_errors.errors.to_string()))?;

    // The schema must still merge once another service sits next to it.
    let candidate = ServiceSchema {
        name: "candidate".to_owned(),
        version: String::new(),
        url: "http://candidate.invalid/query".to_owned(),
        schema: schema.clone(),
    };
    let partner = ServiceSchema {
        name: "partner".to_owned(),
        version: String::new(),
        url: "http://partner.invalid/query".to_owned(),
        schema: Schema::parse(MINIMAL_PARTNER_SDL, "partner.graphql")
            .expect("the minimal partner schema always parses"),
    };
    merge_schemas(&[candidate, partner], id_field)?;
    Ok(())
}

/// Root operation types keep their default names; renaming them would defeat
/// the `(type, field)` routing table.
fn validate_root_types(schema: &Schema) -> Result<(), SchemaError> {
    let definition = &schema.schema_definition;
    let Some(query) = &definition.query else {
        return Err(SchemaError::MissingQueryType);
    };
    if query.name != "Query" {
        return Err(SchemaError::RenamedRootType {
            kind: "query",
            name: query.name.clone(),
        });
    }
    if let Some(mutation) = &definition.mutation {
        if mutation.name != "Mutation" {
            return Err(SchemaError::RenamedRootType {
                kind: "mutation",
                name: mutation.name.clone(),
            });
        }
    }
    if let Some(subscription) = &definition.subscription {
        if subscription.name != "Subscription" {
            return Err(SchemaError::RenamedRootType {
                kind: "subscription",
                name: subscription.name.clone(),
            });
        }
    }
    Ok(())
}

fn validate_service_type(schema: &Schema) -> Result<(), SchemaError> {
    let Some(ExtendedType::Object(service)) = schema.types.get(SERVICE_TYPE) else {
        return Err(SchemaError::InvalidServiceType);
    };
    let well_formed = service.fields.len() == 3
        && ["name", "version", "schema"].iter().all(|field| {
            service.fields.get(*field).is_some_and(|definition| {
                definition.ty == ast::Type::NonNullNamed(name!("String"))
            })
        });
    if !well_formed {
        return Err(SchemaError::InvalidServiceTypeFields);
    }

    let service_field = query_object(schema).and_then(|query| query.fields.get(SERVICE_FIELD));
    let Some(service_field) = service_field else {
        return Err(SchemaError::MissingServiceField);
    };
    if !service_field.arguments.is_empty()
        || service_field.ty != ast::Type::NonNullNamed(name!("Service"))
    {
        return Err(SchemaError::MissingServiceField);
    }
    Ok(())
}

fn validate_boundary_conventions(schema: &Schema, id_field: &str) -> Result<(), SchemaError> {
    let boundary_objects: Vec<(&Name, &Node<ObjectType>)> = schema
        .types
        .iter()
        .filter_map(|(name, ty)| match ty {
            ExtendedType::Object(object) if is_boundary_object(object) => Some((name, object)),
            _ => None,
        })
        .collect();

    let boundary_query_fields: Vec<&FieldDefinition> = query_object(schema)
        .map(|query| {
            query
                .fields
                .values()
                .filter(|field| field.directives.has(BOUNDARY_DIRECTIVE))
                .map(|field| &***field)
                .collect()
        })
        .unwrap_or_default();

    if boundary_objects.is_empty() && boundary_query_fields.is_empty() {
        return Ok(());
    }

    let Some(definition) = schema.directive_definitions.get(BOUNDARY_DIRECTIVE) else {
        return Err(SchemaError::InvalidBoundaryDirective);
    };
    let locations_ok = match definition.locations.as_slice() {
        [DirectiveLocation::Object] => true,
        [DirectiveLocation::Object, DirectiveLocation::FieldDefinition]
        | [DirectiveLocation::FieldDefinition, DirectiveLocation::Object] => true,
        _ => false,
    };
    if !locations_ok || !definition.arguments.is_empty() {
        return Err(SchemaError::InvalidBoundaryDirective);
    }

    for (name, object) in &boundary_objects {
        let id_ok = object
            .fields
            .get(id_field)
            .is_some_and(|field| field.ty == ast::Type::NonNullNamed(name!("ID")));
        if !id_ok {
            return Err(SchemaError::MissingBoundaryId {
                name: (*name).clone(),
                id_field: id_field.to_owned(),
            });
        }
    }

    let node_field = query_object(schema).and_then(|query| query.fields.get(NODE_FIELD));
    if node_field.is_none() && boundary_query_fields.is_empty() {
        return Err(SchemaError::MissingBoundaryLookup {
            id_field: id_field.to_owned(),
        });
    }

    if let Some(node_field) = node_field {
        validate_node_convention(schema, node_field, &boundary_objects, id_field)?;
    }
    for field in boundary_query_fields {
        validate_boundary_query(schema, field, id_field)?;
    }
    Ok(())
}

/// `Query.node(id: ID!): Node` with a single-field `Node` interface that
/// every boundary object implements.
fn validate_node_convention(
    schema: &Schema,
    node_field: &FieldDefinition,
    boundary_objects: &[(&Name, &Node<ObjectType>)],
    id_field: &str,
) -> Result<(), SchemaError> {
    let signature_ok = node_field.arguments.len() == 1
        && node_field.arguments[0].name == id_field
        && *node_field.arguments[0].ty == ast::Type::NonNullNamed(name!("ID"))
        && node_field.ty == ast::Type::Named(name!("Node"));
    if !signature_ok {
        return Err(SchemaError::InvalidNodeField {
            id_field: id_field.to_owned(),
        });
    }

    let Some(ExtendedType::Interface(node)) = schema.types.get(NODE_INTERFACE) else {
        return Err(SchemaError::InvalidNodeInterface {
            id_field: id_field.to_owned(),
        });
    };
    let interface_ok = node.fields.len() == 1
        && node
            .fields
            .get(id_field)
            .is_some_and(|field| field.ty == ast::Type::NonNullNamed(name!("ID")));
    if !interface_ok {
        return Err(SchemaError::InvalidNodeInterface {
            id_field: id_field.to_owned(),
        });
    }

    for (name, object) in boundary_objects {
        let implements = object
            .implements_interfaces
            .iter()
            .any(|interface| interface.name == NODE_INTERFACE);
        if !implements {
            return Err(SchemaError::BoundaryTypeMissingNode {
                name: (*name).clone(),
            });
        }
    }
    Ok(())
}

/// A field-level boundary query is either `field(id: ID!): T` or
/// `field(ids: [ID!]!): [T]!`, with `T` a boundary object.
fn validate_boundary_query(
    schema: &Schema,
    field: &FieldDefinition,
    id_field: &str,
) -> Result<(), SchemaError> {
    let invalid = || SchemaError::InvalidBoundaryQuery {
        name: field.name.clone(),
        id_field: id_field.to_owned(),
        ids_field: format!("{id_field}s"),
    };
    if field.arguments.len() != 1 {
        return Err(invalid());
    }
    let argument = &field.arguments[0];
    let id_type = ast::Type::NonNullNamed(name!("ID"));

    let shape_ok = if *argument.ty == id_type {
        // Single lookup: nullable object result.
        matches!(field.ty, ast::Type::Named(_))
    } else if *argument.ty == id_type.clone().list().non_null() {
        // Array lookup: non-null list of nullable objects.
        matches!(&field.ty, ast::Type::NonNullList(inner) if matches!(**inner, ast::Type::Named(_)))
    } else {
        false
    };
    if !shape_ok {
        return Err(invalid());
    }

    let returns_boundary = matches!(
        schema.types.get(field.ty.inner_named_type().as_str()),
        Some(ExtendedType::Object(object)) if is_boundary_object(object)
    );
    if !returns_boundary {
        return Err(SchemaError::BoundaryQueryReturnsNonBoundary {
            name: field.name.clone(),
        });
    }
    Ok(())
}

fn validate_namespace_conventions(schema: &Schema) -> Result<(), SchemaError> {
    let any_namespace = schema.types.values().any(|ty| {
        matches!(ty, ExtendedType::Object(object) if is_namespace_object(object))
    });
    if !any_namespace {
        return Ok(());
    }

    let Some(definition) = schema.directive_definitions.get(NAMESPACE_DIRECTIVE) else {
        return Err(SchemaError::InvalidNamespaceDirective);
    };
    if definition.locations.as_slice() != [DirectiveLocation::Object]
        || !definition.arguments.is_empty()
    {
        return Err(SchemaError::InvalidNamespaceDirective);
    }

    for (type_name, ty) in &schema.types {
        let ExtendedType::Object(object) = ty else {
            continue;
        };
        let parent_is_grouping = is_namespace_object(object)
            || schema
                .schema_definition
                .iter_root_operations()
                .any(|(_, root)| root.name == *type_name);

        for (field_name, field) in &object.fields {
            let inner = field.ty.inner_named_type();
            let returns_namespace = matches!(
                schema.types.get(inner.as_str()),
                Some(ExtendedType::Object(target)) if is_namespace_object(target)
            );
            if !returns_namespace {
                continue;
            }
            if !matches!(field.ty, ast::Type::NonNullNamed(_)) {
                return Err(SchemaError::NullableNamespaceField {
                    ty: type_name.clone(),
                    field: field_name.clone(),
                });
            }
            if !parent_is_grouping {
                return Err(SchemaError::MisplacedNamespaceType {
                    name: inner.clone(),
                    ty: type_name.clone(),
                    field: field_name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn query_object(schema: &Schema) -> Option<&Node<ObjectType>> {
    let query = schema.schema_definition.query.as_ref()?;
    match schema.types.get(&query.name) {
        Some(ExtendedType::Object(object)) => Some(object),
        _ => None,
    }
}

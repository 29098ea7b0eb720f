//! Gateway-side `__schema`/`__type` resolution.
//!
//! Introspection never reaches a downstream service: every field is resolved
//! alias-by-alias against the (permission-filtered) merged schema.

use apollo_compiler::ast;
use apollo_compiler::ast::DirectiveLocation;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::schema::DirectiveDefinition;
use apollo_compiler::schema::EnumValueDefinition;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::InputValueDefinition;
use apollo_compiler::validation::Valid;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::format::format_value;
use crate::merge::deprecation_reason;

type Variables = Map<String, Value>;

/// Resolves the root-level introspection fields of an operation. The result
/// is an object keyed by response key, ready to be spliced into the response
/// tree before any downstream data.
pub fn resolve_introspection(
    schema: &Valid<Schema>,
    fields: &[Node<Field>],
    variables: &Variables,
) -> Value {
    let mut out = Map::new();
    for field in fields {
        let value = match field.name.as_str() {
            "__schema" => resolve_schema(schema, &field.selection_set, variables),
            "__type" => match string_argument(field, "name", variables) {
                Some(name) => match schema.types.get(name.as_str()) {
                    Some(ty) => resolve_type_def(schema, ty, &field.selection_set, variables),
                    None => Value::Null,
                },
                None => Value::Null,
            },
            _ => continue,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Value::Object(out)
}

fn resolve_schema(schema: &Valid<Schema>, selection_set: &SelectionSet, variables: &Variables) -> Value {
    let mut out = Map::new();
    for field in fields_of(selection_set, "__Schema") {
        let value = match field.name.as_str() {
            "__typename" => json!("__Schema"),
            "description" => schema
                .schema_definition
                .description
                .as_ref()
                .map(|description| json!(description.as_ref()))
                .unwrap_or(Value::Null),
            "queryType" => resolve_root_type(
                schema,
                schema.schema_definition.query.as_ref(),
                &field.selection_set,
                variables,
            ),
            "mutationType" => resolve_root_type(
                schema,
                schema.schema_definition.mutation.as_ref(),
                &field.selection_set,
                variables,
            ),
            "subscriptionType" => resolve_root_type(
                schema,
                schema.schema_definition.subscription.as_ref(),
                &field.selection_set,
                variables,
            ),
            "types" => Value::Array(
                schema
                    .types
                    .values()
                    .map(|ty| resolve_type_def(schema, ty, &field.selection_set, variables))
                    .collect(),
            ),
            "directives" => Value::Array(
                schema
                    .directive_definitions
                    .values()
                    .map(|directive| {
                        resolve_directive(schema, directive, &field.selection_set, variables)
                    })
                    .collect(),
            ),
            _ => Value::Null,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Value::Object(out)
}

fn resolve_root_type(
    schema: &Valid<Schema>,
    root: Option<&apollo_compiler::schema::ComponentName>,
    selection_set: &SelectionSet,
    variables: &Variables,
) -> Value {
    match root.and_then(|root| schema.types.get(&root.name)) {
        Some(ty) => resolve_type_def(schema, ty, selection_set, variables),
        None => Value::Null,
    }
}

fn resolve_type_def(
    schema: &Valid<Schema>,
    ty: &ExtendedType,
    selection_set: &SelectionSet,
    variables: &Variables,
) -> Value {
    let mut out = Map::new();
    for field in fields_of(selection_set, "__Type") {
        let value = match field.name.as_str() {
            "__typename" => json!("__Type"),
            "kind" => json!(type_kind(ty)),
            "name" => json!(ty.name().as_str()),
            "description" => description_value(ty.description()),
            "fields" => {
                let include_deprecated = bool_argument(field, "includeDeprecated", variables);
                let definitions: Option<Vec<&Node<FieldDefinition>>> = match ty {
                    ExtendedType::Object(object) => Some(
                        object
                            .fields
                            .values()
                            .map(|component| &component.node)
                            .collect(),
                    ),
                    ExtendedType::Interface(interface) => Some(
                        interface
                            .fields
                            .values()
                            .map(|component| &component.node)
                            .collect(),
                    ),
                    _ => None,
                };
                match definitions {
                    Some(definitions) => Value::Array(
                        definitions
                            .into_iter()
                            .filter(|definition| !definition.name.starts_with("__"))
                            .filter(|definition| {
                                include_deprecated
                                    || deprecation_reason(&definition.directives).is_none()
                            })
                            .map(|definition| {
                                resolve_field_def(schema, definition, &field.selection_set, variables)
                            })
                            .collect(),
                    ),
                    None => Value::Null,
                }
            }
            "interfaces" => match ty {
                ExtendedType::Object(object) => resolve_named_types(
                    schema,
                    object.implements_interfaces.iter().map(|i| &i.name),
                    &field.selection_set,
                    variables,
                ),
                ExtendedType::Interface(interface) => resolve_named_types(
                    schema,
                    interface.implements_interfaces.iter().map(|i| &i.name),
                    &field.selection_set,
                    variables,
                ),
                _ => Value::Null,
            },
            "possibleTypes" => match ty {
                ExtendedType::Interface(interface) => {
                    let implementers: Vec<_> = schema
                        .types
                        .iter()
                        .filter_map(|(name, candidate)| match candidate {
                            ExtendedType::Object(object)
                                if object
                                    .implements_interfaces
                                    .iter()
                                    .any(|i| i.name == interface.name) =>
                            {
                                Some(name)
                            }
                            _ => None,
                        })
                        .collect();
                    resolve_named_types(
                        schema,
                        implementers.into_iter(),
                        &field.selection_set,
                        variables,
                    )
                }
                ExtendedType::Union(union_) => resolve_named_types(
                    schema,
                    union_.members.iter().map(|member| &member.name),
                    &field.selection_set,
                    variables,
                ),
                _ => Value::Null,
            },
            "enumValues" => match ty {
                ExtendedType::Enum(enum_) => {
                    let include_deprecated = bool_argument(field, "includeDeprecated", variables);
                    Value::Array(
                        enum_
                            .values
                            .values()
                            .filter(|value| {
                                include_deprecated
                                    || deprecation_reason(&value.directives).is_none()
                            })
                            .map(|value| {
                                resolve_enum_value(value, &field.selection_set)
                            })
                            .collect(),
                    )
                }
                _ => Value::Null,
            },
            "inputFields" => match ty {
                ExtendedType::InputObject(input) => Value::Array(
                    input
                        .fields
                        .values()
                        .map(|value| {
                            resolve_input_value(schema, value, &field.selection_set, variables)
                        })
                        .collect(),
                ),
                _ => Value::Null,
            },
            "ofType" => Value::Null,
            "specifiedByURL" => match ty {
                ExtendedType::Scalar(scalar) => scalar
                    .directives
                    .get("specifiedBy")
                    .and_then(|directive| {
                        crate::directives::directive_string_arg_value(directive, "url")
                    })
                    .map(|url| json!(url))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
            _ => Value::Null,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Value::Object(out)
}

/// A non-null or list type reference; named types delegate to
/// [`resolve_type_def`].
fn resolve_type_ref(
    schema: &Valid<Schema>,
    ty: &ast::Type,
    selection_set: &SelectionSet,
    variables: &Variables,
) -> Value {
    match ty {
        ast::Type::Named(name) => match schema.types.get(name) {
            Some(def) => resolve_type_def(schema, def, selection_set, variables),
            None => Value::Null,
        },
        _ => {
            let (kind, inner) = match ty {
                ast::Type::NonNullNamed(name) => ("NON_NULL", ast::Type::Named(name.clone())),
                ast::Type::NonNullList(inner) => ("NON_NULL", ast::Type::List(inner.clone())),
                ast::Type::List(inner) => ("LIST", (**inner).clone()),
                ast::Type::Named(_) => unreachable!("handled above"),
            };
            let mut out = Map::new();
            for field in fields_of(selection_set, "__Type") {
                let value = match field.name.as_str() {
                    "__typename" => json!("__Type"),
                    "kind" => json!(kind),
                    "ofType" => resolve_type_ref(schema, &inner, &field.selection_set, variables),
                    // name, description, fields, … are all null on wrappers.
                    _ => Value::Null,
                };
                out.insert(field.response_key().to_string(), value);
            }
            Value::Object(out)
        }
    }
}

fn resolve_named_types<'s>(
    schema: &Valid<Schema>,
    names: impl Iterator<Item = &'s apollo_compiler::Name>,
    selection_set: &SelectionSet,
    variables: &Variables,
) -> Value {
    Value::Array(
        names
            .filter_map(|name| schema.types.get(name))
            .map(|ty| resolve_type_def(schema, ty, selection_set, variables))
            .collect(),
    )
}

fn resolve_field_def(
    schema: &Valid<Schema>,
    definition: &FieldDefinition,
    selection_set: &SelectionSet,
    variables: &Variables,
) -> Value {
    let deprecation = deprecation_reason(&definition.directives);
    let mut out = Map::new();
    for field in fields_of(selection_set, "__Field") {
        let value = match field.name.as_str() {
            "__typename" => json!("__Field"),
            "name" => json!(definition.name.as_str()),
            "description" => description_value(definition.description.as_ref()),
            "args" => {
                let include_deprecated = bool_argument(field, "includeDeprecated", variables);
                Value::Array(
                    definition
                        .arguments
                        .iter()
                        .filter(|argument| {
                            include_deprecated
                                || deprecation_reason(&argument.directives).is_none()
                        })
                        .map(|argument| {
                            resolve_input_value(schema, argument, &field.selection_set, variables)
                        })
                        .collect(),
                )
            }
            "type" => resolve_type_ref(schema, &definition.ty, &field.selection_set, variables),
            "isDeprecated" => json!(deprecation.is_some()),
            "deprecationReason" => deprecation.map(|reason| json!(reason)).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Value::Object(out)
}

fn resolve_input_value(
    schema: &Valid<Schema>,
    definition: &InputValueDefinition,
    selection_set: &SelectionSet,
    variables: &Variables,
) -> Value {
    let deprecation = deprecation_reason(&definition.directives);
    let mut out = Map::new();
    for field in fields_of(selection_set, "__InputValue") {
        let value = match field.name.as_str() {
            "__typename" => json!("__InputValue"),
            "name" => json!(definition.name.as_str()),
            "description" => description_value(definition.description.as_ref()),
            "type" => resolve_type_ref(schema, &definition.ty, &field.selection_set, variables),
            "defaultValue" => match &definition.default_value {
                Some(default) => {
                    let mut rendered = String::new();
                    format_value(default, &mut rendered);
                    json!(rendered)
                }
                None => Value::Null,
            },
            "isDeprecated" => json!(deprecation.is_some()),
            "deprecationReason" => deprecation.map(|reason| json!(reason)).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Value::Object(out)
}

fn resolve_enum_value(definition: &EnumValueDefinition, selection_set: &SelectionSet) -> Value {
    let deprecation = deprecation_reason(&definition.directives);
    let mut out = Map::new();
    for field in fields_of(selection_set, "__EnumValue") {
        let value = match field.name.as_str() {
            "__typename" => json!("__EnumValue"),
            "name" => json!(definition.value.as_str()),
            "description" => description_value(definition.description.as_ref()),
            "isDeprecated" => json!(deprecation.is_some()),
            "deprecationReason" => deprecation.map(|reason| json!(reason)).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Value::Object(out)
}

fn resolve_directive(
    schema: &Valid<Schema>,
    definition: &DirectiveDefinition,
    selection_set: &SelectionSet,
    variables: &Variables,
) -> Value {
    let mut out = Map::new();
    for field in fields_of(selection_set, "__Directive") {
        let value = match field.name.as_str() {
            "__typename" => json!("__Directive"),
            "name" => json!(definition.name.as_str()),
            "description" => description_value(definition.description.as_ref()),
            "locations" => Value::Array(
                definition
                    .locations
                    .iter()
                    .map(|location| json!(location_name(location)))
                    .collect(),
            ),
            "args" => Value::Array(
                definition
                    .arguments
                    .iter()
                    .map(|argument| {
                        resolve_input_value(schema, argument, &field.selection_set, variables)
                    })
                    .collect(),
            ),
            "isRepeatable" => json!(definition.repeatable),
            _ => Value::Null,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Value::Object(out)
}

/// Fields of a selection set, looking through inline fragments whose type
/// condition matches the introspection type being resolved.
fn fields_of<'a>(selection_set: &'a SelectionSet, type_name: &str) -> Vec<&'a Node<Field>> {
    let mut fields = Vec::new();
    collect_fields(selection_set, type_name, &mut fields);
    fields
}

fn collect_fields<'a>(
    selection_set: &'a SelectionSet,
    type_name: &str,
    fields: &mut Vec<&'a Node<Field>>,
) {
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => fields.push(field),
            Selection::InlineFragment(fragment) => {
                let matches = fragment
                    .type_condition
                    .as_ref()
                    .is_none_or(|condition| condition == type_name);
                if matches {
                    collect_fields(&fragment.selection_set, type_name, fields);
                }
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn type_kind(ty: &ExtendedType) -> &'static str {
    match ty {
        ExtendedType::Scalar(_) => "SCALAR",
        ExtendedType::Object(_) => "OBJECT",
        ExtendedType::Interface(_) => "INTERFACE",
        ExtendedType::Union(_) => "UNION",
        ExtendedType::Enum(_) => "ENUM",
        ExtendedType::InputObject(_) => "INPUT_OBJECT",
    }
}

fn location_name(location: &DirectiveLocation) -> &'static str {
    match location {
        DirectiveLocation::Query => "QUERY",
        DirectiveLocation::Mutation => "MUTATION",
        DirectiveLocation::Subscription => "SUBSCRIPTION",
        DirectiveLocation::Field => "FIELD",
        DirectiveLocation::FragmentDefinition => "FRAGMENT_DEFINITION",
        DirectiveLocation::FragmentSpread => "FRAGMENT_SPREAD",
        DirectiveLocation::InlineFragment => "INLINE_FRAGMENT",
        DirectiveLocation::VariableDefinition => "VARIABLE_DEFINITION",
        DirectiveLocation::Schema => "SCHEMA",
        DirectiveLocation::Scalar => "SCALAR",
        DirectiveLocation::Object => "OBJECT",
        DirectiveLocation::FieldDefinition => "FIELD_DEFINITION",
        DirectiveLocation::ArgumentDefinition => "ARGUMENT_DEFINITION",
        DirectiveLocation::Interface => "INTERFACE",
        DirectiveLocation::Union => "UNION",
        DirectiveLocation::Enum => "ENUM",
        DirectiveLocation::EnumValue => "ENUM_VALUE",
        DirectiveLocation::InputObject => "INPUT_OBJECT",
        DirectiveLocation::InputFieldDefinition => "INPUT_FIELD_DEFINITION",
    }
}

fn description_value(description: Option<&Node<str>>) -> Value {
    match description {
        Some(description) => json!(description.as_ref()),
        None => Value::Null,
    }
}

fn bool_argument(field: &Field, name: &str, variables: &Variables) -> bool {
    match argument_value(field, name) {
        Some(ast::Value::Boolean(b)) => *b,
        Some(ast::Value::Variable(variable)) => variables
            .get(variable.as_str())
            .and_then(Value::as_bool)
            .unwrap_or(false),
        _ => false,
    }
}

fn string_argument(field: &Field, name: &str, variables: &Variables) -> Option<String> {
    match argument_value(field, name)? {
        ast::Value::String(s) => Some(s.clone()),
        ast::Value::Variable(variable) => variables
            .get(variable.as_str())
            .and_then(Value::as_str)
            .map(str::to_owned),
        _ => None,
    }
}

fn argument_value<'a>(field: &'a Field, name: &str) -> Option<&'a ast::Value> {
    field
        .arguments
        .iter()
        .find(|argument| argument.name == name)
        .map(|argument| argument.value.as_ref())
}

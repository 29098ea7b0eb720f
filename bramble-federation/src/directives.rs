//! Helpers for the two Bramble schema directives, `@boundary` and
//! `@namespace`, plus small directive-argument accessors.

use apollo_compiler::ast::DirectiveLocation;
use apollo_compiler::ast::Value;
use apollo_compiler::name;
use apollo_compiler::schema::Directive;
use apollo_compiler::schema::DirectiveDefinition;
use apollo_compiler::schema::ObjectType;
use apollo_compiler::Node;

pub const BOUNDARY_DIRECTIVE: &str = "boundary";
pub const NAMESPACE_DIRECTIVE: &str = "namespace";

/// Directives allowed to survive into the merged schema. Anything else is
/// stripped during merging.
pub const ALLOWED_DIRECTIVES: [&str; 5] =
    ["boundary", "namespace", "skip", "include", "deprecated"];

pub fn is_boundary_object(object: &ObjectType) -> bool {
    object.directives.has(BOUNDARY_DIRECTIVE)
}

pub fn is_namespace_object(object: &ObjectType) -> bool {
    object.directives.has(NAMESPACE_DIRECTIVE)
}

pub fn directive_arg_value<'a>(directive: &'a Directive, arg_name: &str) -> Option<&'a Value> {
    directive
        .arguments
        .iter()
        .find(|arg| arg.name == arg_name)
        .map(|arg| arg.value.as_ref())
}

pub fn directive_string_arg_value<'a>(directive: &'a Directive, arg_name: &str) -> Option<&'a str> {
    directive_arg_value(directive, arg_name).and_then(|value| value.as_str())
}

/// The canonical `@boundary` definition inserted into merged schemas.
pub fn boundary_directive_definition() -> Node<DirectiveDefinition> {
    Node::new(DirectiveDefinition {
        description: None,
        name: name!("boundary"),
        arguments: Vec::new(),
        repeatable: false,
        locations: vec![
            DirectiveLocation::Object,
            DirectiveLocation::FieldDefinition,
        ],
    })
}

/// The canonical `@namespace` definition inserted into merged schemas.
pub fn namespace_directive_definition() -> Node<DirectiveDefinition> {
    Node::new(DirectiveDefinition {
        description: None,
        name: name!("namespace"),
        arguments: Vec::new(),
        repeatable: false,
        locations: vec![DirectiveLocation::Object],
    })
}

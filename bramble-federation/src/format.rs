//! GraphQL text formatting for outbound documents.
//!
//! Plan-step selections are serialized back into query text before being
//! sent downstream, and the same rendering ends up in the `selectionSet`
//! extension of downstream errors.

use apollo_compiler::ast;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::InlineFragment;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::executable::VariableDefinition;
use apollo_compiler::Node;

/// Renders `{ field(arg: $x) { sub } ... }` on a single line.
pub fn format_selection_set(selection_set: &SelectionSet) -> String {
    let mut out = String::from("{");
    for selection in &selection_set.selections {
        out.push(' ');
        format_selection(selection, &mut out);
    }
    out.push_str(" }");
    out
}

fn format_selection(selection: &Selection, out: &mut String) {
    match selection {
        Selection::Field(field) => format_field(field, out),
        Selection::InlineFragment(fragment) => format_inline_fragment(fragment, out),
        Selection::FragmentSpread(spread) => {
            // Named fragments are inlined during planning; a spread can only
            // appear here if formatting is used on a raw operation.
            out.push_str("...");
            out.push_str(spread.fragment_name.as_str());
            format_directives(&spread.directives, out);
        }
    }
}

fn format_field(field: &Node<Field>, out: &mut String) {
    if let Some(alias) = &field.alias {
        out.push_str(alias.as_str());
        out.push_str(": ");
    }
    out.push_str(field.name.as_str());
    if !field.arguments.is_empty() {
        out.push('(');
        for (index, argument) in field.arguments.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            out.push_str(argument.name.as_str());
            out.push_str(": ");
            format_value(&argument.value, out);
        }
        out.push(')');
    }
    format_directives(&field.directives, out);
    if !field.selection_set.selections.is_empty() {
        out.push(' ');
        out.push_str(&format_selection_set(&field.selection_set));
    }
}

fn format_inline_fragment(fragment: &Node<InlineFragment>, out: &mut String) {
    out.push_str("...");
    if let Some(condition) = &fragment.type_condition {
        out.push_str(" on ");
        out.push_str(condition.as_str());
    }
    format_directives(&fragment.directives, out);
    out.push(' ');
    out.push_str(&format_selection_set(&fragment.selection_set));
}

fn format_directives(directives: &ast::DirectiveList, out: &mut String) {
    for directive in directives.iter() {
        out.push_str(" @");
        out.push_str(directive.name.as_str());
        if !directive.arguments.is_empty() {
            out.push('(');
            for (index, argument) in directive.arguments.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(argument.name.as_str());
                out.push_str(": ");
                format_value(&argument.value, out);
            }
            out.push(')');
        }
    }
}

pub fn format_value(value: &ast::Value, out: &mut String) {
    match value {
        ast::Value::Null => out.push_str("null"),
        ast::Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ast::Value::Enum(name) => out.push_str(name.as_str()),
        ast::Value::Variable(name) => {
            out.push('$');
            out.push_str(name.as_str());
        }
        ast::Value::Int(i) => out.push_str(&i.to_string()),
        ast::Value::Float(f) => out.push_str(&f.to_string()),
        ast::Value::String(s) => {
            // GraphQL string literals share JSON's escape rules.
            out.push_str(&serde_json::Value::String(s.clone()).to_string());
        }
        ast::Value::List(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                format_value(item, out);
            }
            out.push(']');
        }
        ast::Value::Object(fields) => {
            out.push('{');
            for (index, (name, item)) in fields.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(name.as_str());
                out.push_str(": ");
                format_value(item, out);
            }
            out.push('}');
        }
    }
}

/// Renders `($id: ID!, $first: Int = 10)`, or nothing without variables.
pub fn format_variable_definitions(definitions: &[Node<VariableDefinition>]) -> String {
    if definitions.is_empty() {
        return String::new();
    }
    let mut out = String::from("(");
    for (index, definition) in definitions.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        out.push('$');
        out.push_str(definition.name.as_str());
        out.push_str(": ");
        out.push_str(&definition.ty.to_string());
        if let Some(default) = &definition.default_value {
            out.push_str(" = ");
            format_value(default, &mut out);
        }
    }
    out.push(')');
    out
}

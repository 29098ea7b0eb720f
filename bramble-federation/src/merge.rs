//! Schema merging.
//!
//! Unifies the per-service schemas into one merged schema and derives the
//! routing artifacts the planner and executor consume: the field→service-URL
//! map, the boundary-type set and the boundary-query map.

use apollo_compiler::ast;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::collections::IndexSet;
use apollo_compiler::name;
use apollo_compiler::schema::Component;
use apollo_compiler::schema::ComponentName;
use apollo_compiler::schema::ComponentOrigin;
use apollo_compiler::schema::DirectiveList;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::InputValueDefinition;
use apollo_compiler::schema::ObjectType;
use apollo_compiler::validation::Valid;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use serde::Serialize;

use crate::directives::boundary_directive_definition;
use crate::directives::directive_string_arg_value;
use crate::directives::is_boundary_object;
use crate::directives::is_namespace_object;
use crate::directives::namespace_directive_definition;
use crate::directives::ALLOWED_DIRECTIVES;
use crate::directives::BOUNDARY_DIRECTIVE;
use crate::error::MergeError;

/// Sentinel service URL for fields the gateway resolves itself, such as
/// `__typename` on namespace objects.
pub const GATEWAY_URL: &str = "__bramble";

pub const SERVICE_TYPE: &str = "Service";
pub const NODE_INTERFACE: &str = "Node";
pub const SERVICE_FIELD: &str = "service";
pub const NODE_FIELD: &str = "node";

const ROOT_TYPES: [&str; 3] = ["Query", "Mutation", "Subscription"];

/// One downstream service's parsed schema, as fed into the merger.
#[derive(Debug, Clone)]
pub struct ServiceSchema {
    pub name: String,
    pub version: String,
    pub url: String,
    pub schema: Schema,
}

/// How a service looks up a boundary type by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundaryQuery {
    pub field: Name,
    pub argument: Name,
    /// `field(ids: [ID!]!): [T]!` rather than `field(id: ID!): T`.
    pub array: bool,
    /// The lookup goes through `Query.node` and needs an inline fragment on
    /// the concrete type.
    pub node_interface: bool,
}

/// `(parent type, field) → owning service URL`.
#[derive(Debug, Clone, Default)]
pub struct FieldUrlMap(IndexMap<Name, IndexMap<Name, String>>);

impl FieldUrlMap {
    pub fn get(&self, ty: &str, field: &str) -> Option<&str> {
        self.0.get(ty)?.get(field).map(String::as_str)
    }

    fn insert(&mut self, ty: Name, field: Name, url: String) -> Result<(), MergeError> {
        let fields = self.0.entry(ty.clone()).or_default();
        match fields.get(&field) {
            Some(existing) if *existing != url => Err(MergeError::FieldOwnershipConflict {
                ty,
                field,
                left: existing.clone(),
                right: url,
            }),
            Some(_) => Ok(()),
            None => {
                fields.insert(field, url);
                Ok(())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &Name, &str)> {
        self.0.iter().flat_map(|(ty, fields)| {
            fields
                .iter()
                .map(move |(field, url)| (ty, field, url.as_str()))
        })
    }
}

/// `(service URL, boundary type) → lookup query`.
#[derive(Debug, Clone, Default)]
pub struct BoundaryQueryMap(IndexMap<String, IndexMap<Name, BoundaryQuery>>);

impl BoundaryQueryMap {
    pub fn get(&self, url: &str, ty: &str) -> Option<&BoundaryQuery> {
        self.0.get(url)?.get(ty)
    }

    /// Array lookups are preferred over single lookups, and either typed form
    /// is preferred over going through `Query.node`.
    fn insert(&mut self, url: &str, ty: Name, query: BoundaryQuery) {
        let per_type = self.0.entry(url.to_owned()).or_default();
        match per_type.get(&ty) {
            Some(existing) if existing.array => {}
            Some(existing) if !existing.node_interface && query.node_interface => {}
            _ => {
                per_type.insert(ty, query);
            }
        }
    }
}

/// The merged schema plus every derived artifact, swapped in atomically by
/// the update supervisor.
#[derive(Debug, Clone)]
pub struct MergedSchema {
    pub schema: Valid<Schema>,
    pub field_urls: FieldUrlMap,
    pub boundary_types: IndexSet<Name>,
    pub boundary_queries: BoundaryQueryMap,
    /// Service URL → service name, for error extensions.
    pub service_names: IndexMap<String, String>,
    /// The boundary id field, injected from configuration.
    pub id_field: Name,
}

pub fn merge_schemas(
    services: &[ServiceSchema],
    id_field: &str,
) -> Result<MergedSchema, MergeError> {
    Merger::new(id_field)?.merge(services)
}

struct Merger {
    merged: Schema,
    field_urls: FieldUrlMap,
    boundary_types: IndexSet<Name>,
    boundary_queries: BoundaryQueryMap,
    id_field: Name,
}

impl Merger {
    fn new(id_field: &str) -> Result<Self, MergeError> {
        let id_field = Name::new(id_field)
            .map_err(|err| MergeError::InvalidMergedSchema(err.to_string()))?;
        Ok(Merger {
            merged: Schema::new(),
            field_urls: FieldUrlMap::default(),
            boundary_types: IndexSet::default(),
            boundary_queries: BoundaryQueryMap::default(),
            id_field,
        })
    }

    fn merge(mut self, services: &[ServiceSchema]) -> Result<MergedSchema, MergeError> {
        for service in services {
            self.merge_service(service)?;
        }

        self.merged
            .directive_definitions
            .entry(name!("boundary"))
            .or_insert_with(boundary_directive_definition);
        self.merged
            .directive_definitions
            .entry(name!("namespace"))
            .or_insert_with(namespace_directive_definition);

        let schema = self
            .merged
            .validate()
            .map_err(|with_errors| MergeError::InvalidMergedSchema(with_errors.errors.to_string()))?;

        Ok(MergedSchema {
            schema,
            field_urls: self.field_urls,
            boundary_types: self.boundary_types,
            boundary_queries: self.boundary_queries,
            service_names: services
                .iter()
                .map(|service| (service.url.clone(), service.name.clone()))
                .collect(),
            id_field: self.id_field,
        })
    }

    fn merge_service(&mut self, service: &ServiceSchema) -> Result<(), MergeError> {
        tracing::debug!(service = %service.name, url = %service.url, "merging service schema");
        for (type_name, ty) in &service.schema.types {
            if ty.is_built_in()
                || type_name == SERVICE_TYPE
                || type_name == NODE_INTERFACE
                || type_name.starts_with("__")
            {
                continue;
            }

            match ty {
                ExtendedType::Object(object) => {
                    if ROOT_TYPES.contains(&type_name.as_str()) {
                        self.merge_root_object(service, type_name, object)?;
                    } else if is_boundary_object(object) {
                        self.merge_boundary_object(service, type_name, object)?;
                    } else if is_namespace_object(object) {
                        self.merge_namespace_object(service, type_name, object)?;
                    } else {
                        self.insert_plain_object(service, type_name, object)?;
                    }
                }
                ExtendedType::Interface(interface) => {
                    if self.merged.types.contains_key(type_name) {
                        return Err(MergeError::DuplicateInterface {
                            name: type_name.clone(),
                        });
                    }
                    let mut interface = interface.as_ref().clone();
                    interface.directives = filter_directives(&interface.directives);
                    for field in interface.fields.values_mut() {
                        let field = field.make_mut();
                        field.directives = filter_ast_directives(&field.directives);
                    }
                    self.merged.types.insert(
                        type_name.clone(),
                        ExtendedType::Interface(Node::new(interface)),
                    );
                }
                ExtendedType::Union(union_) => {
                    if self.merged.types.contains_key(type_name) {
                        return Err(MergeError::ConflictingType {
                            name: type_name.clone(),
                        });
                    }
                    let mut union_ = union_.as_ref().clone();
                    union_.directives = filter_directives(&union_.directives);
                    self.merged
                        .types
                        .insert(type_name.clone(), ExtendedType::Union(Node::new(union_)));
                }
                ExtendedType::Enum(enum_) => {
                    if let Some(existing) = self.merged.types.get(type_name) {
                        let same = matches!(existing, ExtendedType::Enum(merged)
                            if merged.values.keys().eq(enum_.values.keys()));
                        if !same {
                            return Err(MergeError::ConflictingType {
                                name: type_name.clone(),
                            });
                        }
                        continue;
                    }
                    let mut enum_ = enum_.as_ref().clone();
                    enum_.directives = filter_directives(&enum_.directives);
                    for value in enum_.values.values_mut() {
                        let value = value.make_mut();
                        value.directives = filter_ast_directives(&value.directives);
                    }
                    self.merged
                        .types
                        .insert(type_name.clone(), ExtendedType::Enum(Node::new(enum_)));
                }
                ExtendedType::Scalar(scalar) => {
                    if self.merged.types.contains_key(type_name) {
                        // Same-named custom scalars are interchangeable.
                        continue;
                    }
                    let mut scalar = scalar.as_ref().clone();
                    scalar.directives = filter_directives(&scalar.directives);
                    self.merged
                        .types
                        .insert(type_name.clone(), ExtendedType::Scalar(Node::new(scalar)));
                }
                ExtendedType::InputObject(input) => {
                    if self.merged.types.contains_key(type_name) {
                        return Err(MergeError::ConflictingType {
                            name: type_name.clone(),
                        });
                    }
                    let mut input = input.as_ref().clone();
                    input.directives = filter_directives(&input.directives);
                    for field in input.fields.values_mut() {
                        let field = field.make_mut();
                        field.directives = filter_ast_directives(&field.directives);
                    }
                    self.merged.types.insert(
                        type_name.clone(),
                        ExtendedType::InputObject(Node::new(input)),
                    );
                }
            }
        }
        Ok(())
    }

    /// Root objects are merged like namespace objects: the per-service
    /// `service` and `node` fields and `@boundary` query fields are stripped,
    /// everything else unions with collisions rejected.
    fn merge_root_object(
        &mut self,
        service: &ServiceSchema,
        type_name: &Name,
        object: &Node<ObjectType>,
    ) -> Result<(), MergeError> {
        self.ensure_root(type_name);
        let is_query = type_name == "Query";

        for (field_name, field) in &object.fields {
            if is_query && (field_name == SERVICE_FIELD || field_name == NODE_FIELD) {
                if field_name == NODE_FIELD {
                    self.record_node_lookups(service);
                }
                continue;
            }
            if is_query && field.directives.has(BOUNDARY_DIRECTIVE) {
                self.record_boundary_query(service, field);
                continue;
            }
            self.merge_grouped_field(service, type_name, field_name, field)?;
        }
        self.field_urls
            .insert(type_name.clone(), name!("__typename"), GATEWAY_URL.to_owned())?;
        self.concat_description(type_name, &object.description);
        Ok(())
    }

    fn merge_namespace_object(
        &mut self,
        service: &ServiceSchema,
        type_name: &Name,
        object: &Node<ObjectType>,
    ) -> Result<(), MergeError> {
        match self.merged.types.get(type_name) {
            None => {
                self.merged.types.insert(
                    type_name.clone(),
                    ExtendedType::Object(Node::new(ObjectType {
                        description: object.description.clone(),
                        name: type_name.clone(),
                        implements_interfaces: IndexSet::default(),
                        directives: filter_directives(&object.directives),
                        fields: IndexMap::default(),
                    })),
                );
            }
            Some(ExtendedType::Object(existing)) if is_namespace_object(existing) => {
                self.concat_description(type_name, &object.description);
            }
            Some(_) => {
                return Err(MergeError::MixedNamespaceType {
                    name: type_name.clone(),
                })
            }
        }

        for (field_name, field) in &object.fields {
            self.merge_grouped_field(service, type_name, field_name, field)?;
        }
        self.field_urls
            .insert(type_name.clone(), name!("__typename"), GATEWAY_URL.to_owned())?;
        Ok(())
    }

    /// A field of a root or namespace object. Fields returning namespace
    /// objects merge transitively when both sides agree on the type;
    /// everything else must be unique and is mapped to the owning service.
    fn merge_grouped_field(
        &mut self,
        service: &ServiceSchema,
        type_name: &Name,
        field_name: &Name,
        field: &Component<FieldDefinition>,
    ) -> Result<(), MergeError> {
        let inner = field.ty.inner_named_type();
        let is_namespace_field = matches!(
            service.schema.types.get(inner.as_str()),
            Some(ExtendedType::Object(object)) if is_namespace_object(object)
        );

        let Some(ExtendedType::Object(merged_object)) = self.merged.types.get_mut(type_name)
        else {
            return Err(MergeError::MixedNamespaceType {
                name: type_name.clone(),
            });
        };

        match merged_object.fields.get(field_name) {
            Some(existing) => {
                let compatible = is_namespace_field
                    && existing.ty == field.ty
                    && field.ty.is_non_null()
                    && existing.arguments.is_empty()
                    && field.arguments.is_empty();
                if !compatible {
                    return Err(MergeError::OverlappingNamespaceFields {
                        ty: type_name.clone(),
                        field: field_name.clone(),
                    });
                }
            }
            None => {
                merged_object
                    .make_mut()
                    .fields
                    .insert(field_name.clone(), copy_field(field));
            }
        }

        if !is_namespace_field {
            self.field_urls
                .insert(type_name.clone(), field_name.clone(), service.url.clone())?;
        }
        Ok(())
    }

    fn merge_boundary_object(
        &mut self,
        service: &ServiceSchema,
        type_name: &Name,
        object: &Node<ObjectType>,
    ) -> Result<(), MergeError> {
        if !object.fields.contains_key(&self.id_field) {
            return Err(MergeError::MissingBoundaryId {
                name: type_name.clone(),
                id_field: self.id_field.to_string(),
            });
        }
        self.boundary_types.insert(type_name.clone());

        match self.merged.types.get(type_name) {
            None => {
                self.merged.types.insert(
                    type_name.clone(),
                    ExtendedType::Object(Node::new(ObjectType {
                        description: object.description.clone(),
                        name: type_name.clone(),
                        implements_interfaces: IndexSet::default(),
                        directives: filter_directives(&object.directives),
                        fields: IndexMap::default(),
                    })),
                );
            }
            Some(ExtendedType::Object(existing)) if is_boundary_object(existing) => {
                self.concat_description(type_name, &object.description);
            }
            Some(_) => {
                return Err(MergeError::MixedBoundaryType {
                    name: type_name.clone(),
                })
            }
        }

        let id_field = self.id_field.clone();
        let implements: Vec<Name> = object
            .implements_interfaces
            .iter()
            .filter(|interface| interface.name != NODE_INTERFACE)
            .map(|interface| interface.name.clone())
            .collect();

        let Some(ExtendedType::Object(merged_object)) = self.merged.types.get_mut(type_name)
        else {
            unreachable!("boundary object was just inserted");
        };
        let merged_object = merged_object.make_mut();
        for interface in implements {
            merged_object.implements_interfaces.insert(ComponentName {
                origin: ComponentOrigin::Definition,
                name: interface,
            });
        }

        for (field_name, field) in &object.fields {
            if field_name == &id_field {
                merged_object
                    .fields
                    .entry(field_name.clone())
                    .or_insert_with(|| copy_field(field));
                continue;
            }
            if merged_object.fields.contains_key(field_name) {
                return Err(MergeError::OverlappingFields {
                    ty: type_name.clone(),
                    field: field_name.clone(),
                });
            }
            merged_object
                .fields
                .insert(field_name.clone(), copy_field(field));
            self.field_urls
                .insert(type_name.clone(), field_name.clone(), service.url.clone())?;
        }
        Ok(())
    }

    fn insert_plain_object(
        &mut self,
        service: &ServiceSchema,
        type_name: &Name,
        object: &Node<ObjectType>,
    ) -> Result<(), MergeError> {
        if self.merged.types.contains_key(type_name) {
            return Err(MergeError::ConflictingType {
                name: type_name.clone(),
            });
        }

        let mut copy = ObjectType {
            description: object.description.clone(),
            name: type_name.clone(),
            implements_interfaces: object
                .implements_interfaces
                .iter()
                .filter(|interface| interface.name != NODE_INTERFACE)
                .cloned()
                .collect(),
            directives: filter_directives(&object.directives),
            fields: IndexMap::default(),
        };
        for (field_name, field) in &object.fields {
            copy.fields.insert(field_name.clone(), copy_field(field));
            self.field_urls
                .insert(type_name.clone(), field_name.clone(), service.url.clone())?;
        }
        self.merged
            .types
            .insert(type_name.clone(), ExtendedType::Object(Node::new(copy)));
        Ok(())
    }

    /// Makes sure a root object exists in the merged schema and is wired into
    /// the schema definition.
    fn ensure_root(&mut self, type_name: &Name) {
        if !self.merged.types.contains_key(type_name) {
            self.merged.types.insert(
                type_name.clone(),
                ExtendedType::Object(Node::new(ObjectType {
                    description: None,
                    name: type_name.clone(),
                    implements_interfaces: IndexSet::default(),
                    directives: DirectiveList::default(),
                    fields: IndexMap::default(),
                })),
            );
        }
        let root = ComponentName {
            origin: ComponentOrigin::Definition,
            name: type_name.clone(),
        };
        let definition = self.merged.schema_definition.make_mut();
        match type_name.as_str() {
            "Query" => definition.query = Some(root),
            "Mutation" => definition.mutation = Some(root),
            _ => definition.subscription = Some(root),
        }
    }

    /// A service exposing `Query.node` can look up any of its boundary types
    /// through the `Node` interface.
    fn record_node_lookups(&mut self, service: &ServiceSchema) {
        for (type_name, ty) in &service.schema.types {
            if let ExtendedType::Object(object) = ty {
                if is_boundary_object(object) {
                    self.boundary_queries.insert(
                        &service.url,
                        type_name.clone(),
                        BoundaryQuery {
                            field: name!("node"),
                            argument: self.id_field.clone(),
                            array: false,
                            node_interface: true,
                        },
                    );
                }
            }
        }
    }

    fn record_boundary_query(&mut self, service: &ServiceSchema, field: &FieldDefinition) {
        let Some(argument) = field.arguments.first() else {
            return;
        };
        self.boundary_queries.insert(
            &service.url,
            field.ty.inner_named_type().clone(),
            BoundaryQuery {
                field: field.name.clone(),
                argument: argument.name.clone(),
                array: matches!(
                    field.ty,
                    ast::Type::List(_) | ast::Type::NonNullList(_)
                ),
                node_interface: false,
            },
        );
    }

    /// Descriptions of boundary and namespace types contributed by several
    /// services are concatenated with a blank line between non-empty parts.
    fn concat_description(&mut self, type_name: &Name, addition: &Option<Node<str>>) {
        let Some(addition) = addition else { return };
        if addition.is_empty() {
            return;
        }
        let Some(ExtendedType::Object(object)) = self.merged.types.get_mut(type_name) else {
            return;
        };
        let object = object.make_mut();
        object.description = match object.description.take() {
            None => Some(addition.clone()),
            Some(existing) if existing.is_empty() => Some(addition.clone()),
            Some(existing) if existing.as_ref() == addition.as_ref() => Some(existing),
            Some(existing) => Some(Node::<str>::from(
                format!("{existing}\n\n{addition}").as_str(),
            )),
        };
    }
}

fn copy_field(field: &Component<FieldDefinition>) -> Component<FieldDefinition> {
    let arguments = field
        .arguments
        .iter()
        .map(|argument| {
            Node::new(InputValueDefinition {
                description: argument.description.clone(),
                name: argument.name.clone(),
                ty: argument.ty.clone(),
                default_value: argument.default_value.clone(),
                directives: filter_ast_directives(&argument.directives),
            })
        })
        .collect();
    Component::new(FieldDefinition {
        description: field.description.clone(),
        name: field.name.clone(),
        arguments,
        ty: field.ty.clone(),
        directives: filter_ast_directives(&field.directives),
    })
}

fn filter_directives(directives: &DirectiveList) -> DirectiveList {
    DirectiveList(
        directives
            .iter()
            .filter(|directive| ALLOWED_DIRECTIVES.contains(&directive.name.as_str()))
            .cloned()
            .collect(),
    )
}

fn filter_ast_directives(directives: &ast::DirectiveList) -> ast::DirectiveList {
    ast::DirectiveList(
        directives
            .iter()
            .filter(|directive| ALLOWED_DIRECTIVES.contains(&directive.name.as_str()))
            .cloned()
            .collect(),
    )
}

/// Reads the deprecation reason off a field or enum value definition.
pub fn deprecation_reason(directives: &ast::DirectiveList) -> Option<&str> {
    directives
        .get("deprecated")
        .map(|directive| directive_string_arg_value(directive, "reason").unwrap_or("No longer supported"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, url: &str, sdl: &str) -> ServiceSchema {
        ServiceSchema {
            name: name.to_owned(),
            version: "0.1.0".to_owned(),
            url: url.to_owned(),
            schema: Schema::parse(sdl, format!("{name}.graphql")).expect("valid test schema"),
        }
    }

    const MOVIES_SDL: &str = r#"
        directive @boundary on OBJECT | FIELD_DEFINITION
        type Service { name: String! version: String! schema: String! }
        interface Node { id: ID! }
        type Movie implements Node @boundary {
            id: ID!
            title: String!
        }
        type Query {
            service: Service!
            node(id: ID!): Node
            movie(id: ID!): Movie!
        }
    "#;

    const RELEASES_SDL: &str = r#"
        directive @boundary on OBJECT | FIELD_DEFINITION
        type Service { name: String! version: String! schema: String! }
        type Movie @boundary {
            id: ID!
            release: Int!
        }
        type Query {
            service: Service!
            movies(ids: [ID!]!): [Movie]! @boundary
        }
    "#;

    #[test]
    fn merges_boundary_types_field_by_field() {
        let merged = merge_schemas(
            &[
                service("movies", "http://movies/query", MOVIES_SDL),
                service("releases", "http://releases/query", RELEASES_SDL),
            ],
            "id",
        )
        .unwrap();

        let movie = merged.schema.types.get("Movie").unwrap();
        let ExtendedType::Object(movie) = movie else {
            panic!("Movie should be an object type")
        };
        assert!(movie.fields.contains_key("id"));
        assert!(movie.fields.contains_key("title"));
        assert!(movie.fields.contains_key("release"));
        assert!(
            movie.implements_interfaces.is_empty(),
            "Node must be removed from implements"
        );

        assert!(merged.boundary_types.contains("Movie"));
        assert_eq!(
            merged.field_urls.get("Movie", "title"),
            Some("http://movies/query")
        );
        assert_eq!(
            merged.field_urls.get("Movie", "release"),
            Some("http://releases/query")
        );
        assert_eq!(merged.field_urls.get("Movie", "id"), None);
        assert_eq!(
            merged.field_urls.get("Query", "movie"),
            Some("http://movies/query")
        );
        assert_eq!(merged.field_urls.get("Query", "__typename"), Some(GATEWAY_URL));
    }

    #[test]
    fn strips_service_machinery_from_merged_schema() {
        let merged = merge_schemas(
            &[service("movies", "http://movies/query", MOVIES_SDL)],
            "id",
        )
        .unwrap();

        assert!(merged.schema.types.get("Service").is_none());
        assert!(merged.schema.types.get("Node").is_none());
        let ExtendedType::Object(query) = merged.schema.types.get("Query").unwrap() else {
            panic!("Query should be an object type")
        };
        assert!(!query.fields.contains_key("service"));
        assert!(!query.fields.contains_key("node"));
    }

    #[test]
    fn prefers_array_lookups_over_node_lookups() {
        let merged = merge_schemas(
            &[
                service("movies", "http://movies/query", MOVIES_SDL),
                service("releases", "http://releases/query", RELEASES_SDL),
            ],
            "id",
        )
        .unwrap();

        let via_node = merged
            .boundary_queries
            .get("http://movies/query", "Movie")
            .unwrap();
        assert!(via_node.node_interface);
        assert!(!via_node.array);

        let via_field = merged
            .boundary_queries
            .get("http://releases/query", "Movie")
            .unwrap();
        assert_eq!(via_field.field, "movies");
        assert_eq!(via_field.argument, "ids");
        assert!(via_field.array);
        assert!(!via_field.node_interface);
    }

    #[test]
    fn rejects_conflicting_non_boundary_types() {
        let a = service(
            "a",
            "http://a/query",
            r#"
            type Service { name: String! version: String! schema: String! }
            type Widget { id: ID! }
            type Query { service: Service! widget: Widget }
            "#,
        );
        let b = service(
            "b",
            "http://b/query",
            r#"
            type Service { name: String! version: String! schema: String! }
            type Widget { weight: Int }
            type Query { service: Service! heaviest: Widget }
            "#,
        );
        let err = merge_schemas(&[a, b], "id").unwrap_err();
        assert!(matches!(err, MergeError::ConflictingType { name } if name == "Widget"));
    }

    #[test]
    fn rejects_root_field_collisions() {
        let a = service(
            "a",
            "http://a/query",
            r#"
            type Service { name: String! version: String! schema: String! }
            type Query { service: Service! thing: String }
            "#,
        );
        let b = service(
            "b",
            "http://b/query",
            r#"
            type Service { name: String! version: String! schema: String! }
            type Query { service: Service! thing: Int }
            "#,
        );
        let err = merge_schemas(&[a, b], "id").unwrap_err();
        assert!(matches!(
            err,
            MergeError::OverlappingNamespaceFields { ty, field } if ty == "Query" && field == "thing"
        ));
    }

    #[test]
    fn merges_namespaces_transitively() {
        let a = service(
            "a",
            "http://a/query",
            r#"
            directive @namespace on OBJECT
            type Service { name: String! version: String! schema: String! }
            type Search @namespace { movies(title: String!): [String!]! }
            type Query { service: Service! search: Search! }
            "#,
        );
        let b = service(
            "b",
            "http://b/query",
            r#"
            directive @namespace on OBJECT
            type Service { name: String! version: String! schema: String! }
            type Search @namespace { shows(title: String!): [String!]! }
            type Query { service: Service! search: Search! }
            "#,
        );
        let merged = merge_schemas(&[a, b], "id").unwrap();

        let ExtendedType::Object(search) = merged.schema.types.get("Search").unwrap() else {
            panic!("Search should be an object type")
        };
        assert!(search.fields.contains_key("movies"));
        assert!(search.fields.contains_key("shows"));
        // The namespace wrapper itself routes by descent.
        assert_eq!(merged.field_urls.get("Query", "search"), None);
        assert_eq!(merged.field_urls.get("Search", "movies"), Some("http://a/query"));
        assert_eq!(merged.field_urls.get("Search", "shows"), Some("http://b/query"));
        assert_eq!(merged.field_urls.get("Search", "__typename"), Some(GATEWAY_URL));
    }

    #[test]
    fn rejects_overlapping_namespace_leaf_fields() {
        let a = service(
            "a",
            "http://a/query",
            r#"
            directive @namespace on OBJECT
            type Service { name: String! version: String! schema: String! }
            type Search @namespace { movies: [String!]! }
            type Query { service: Service! search: Search! }
            "#,
        );
        let b = service(
            "b",
            "http://b/query",
            r#"
            directive @namespace on OBJECT
            type Service { name: String! version: String! schema: String! }
            type Search @namespace { movies: [String!]! }
            type Query { service: Service! search: Search! }
            "#,
        );
        let err = merge_schemas(&[a, b], "id").unwrap_err();
        assert!(matches!(
            err,
            MergeError::OverlappingNamespaceFields { ty, field } if ty == "Search" && field == "movies"
        ));
    }

    #[test]
    fn unions_are_imported_as_is() {
        let merged = merge_schemas(
            &[service(
                "content",
                "http://content/query",
                r#"
                type Service { name: String! version: String! schema: String! }
                type Movie { id: ID! }
                type Show { id: ID! }
                union Title = Movie | Show
                type Query { service: Service! titles: [Title!]! }
                "#,
            )],
            "id",
        )
        .unwrap();

        let ExtendedType::Union(title) = merged.schema.types.get("Title").unwrap() else {
            panic!("Title should be a union")
        };
        let members: Vec<&str> = title.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(members, vec!["Movie", "Show"]);
    }

    #[test]
    fn interfaces_may_not_span_services() {
        let a = service(
            "a",
            "http://a/query",
            r#"
            type Service { name: String! version: String! schema: String! }
            interface Titled { title: String! }
            type Movie implements Titled { id: ID! title: String! }
            type Query { service: Service! movie: Movie }
            "#,
        );
        let b = service(
            "b",
            "http://b/query",
            r#"
            type Service { name: String! version: String! schema: String! }
            interface Titled { title: String! }
            type Show implements Titled { id: ID! title: String! }
            type Query { service: Service! show: Show }
            "#,
        );
        let err = merge_schemas(&[a, b], "id").unwrap_err();
        assert!(matches!(err, MergeError::DuplicateInterface { name } if name == "Titled"));
    }

    #[test]
    fn boundary_field_overlap_is_rejected() {
        let a = service(
            "a",
            "http://a/query",
            r#"
            directive @boundary on OBJECT | FIELD_DEFINITION
            type Service { name: String! version: String! schema: String! }
            type Movie @boundary { id: ID! title: String! }
            type Query { service: Service! movie(id: ID!): Movie @boundary }
            "#,
        );
        let b = service(
            "b",
            "http://b/query",
            r#"
            directive @boundary on OBJECT | FIELD_DEFINITION
            type Service { name: String! version: String! schema: String! }
            type Movie @boundary { id: ID! title: String! }
            type Query { service: Service! movies(ids: [ID!]!): [Movie]! @boundary }
            "#,
        );
        let err = merge_schemas(&[a, b], "id").unwrap_err();
        assert!(matches!(
            err,
            MergeError::OverlappingFields { ty, field } if ty == "Movie" && field == "title"
        ));
    }

    #[test]
    fn boundary_descriptions_are_concatenated() {
        let a = service(
            "a",
            "http://a/query",
            r#"
            directive @boundary on OBJECT | FIELD_DEFINITION
            type Service { name: String! version: String! schema: String! }
            "A film."
            type Movie @boundary { id: ID! title: String! }
            type Query { service: Service! movie(id: ID!): Movie @boundary }
            "#,
        );
        let b = service(
            "b",
            "http://b/query",
            r#"
            directive @boundary on OBJECT | FIELD_DEFINITION
            type Service { name: String! version: String! schema: String! }
            "Release data."
            type Movie @boundary { id: ID! release: Int }
            type Query { service: Service! movies(ids: [ID!]!): [Movie]! @boundary }
            "#,
        );
        let merged = merge_schemas(&[a, b], "id").unwrap();
        let ExtendedType::Object(movie) = merged.schema.types.get("Movie").unwrap() else {
            panic!("Movie should be an object")
        };
        assert_eq!(
            movie.description.as_ref().map(|d| d.as_ref()),
            Some("A film.\n\nRelease data.")
        );
    }

    #[test]
    fn a_custom_id_field_is_honoured() {
        let merged = merge_schemas(
            &[service(
                "movies",
                "http://movies/query",
                r#"
                directive @boundary on OBJECT | FIELD_DEFINITION
                type Service { name: String! version: String! schema: String! }
                type Movie @boundary { uid: ID! title: String! }
                type Query { service: Service! movie(uid: ID!): Movie @boundary }
                "#,
            )],
            "uid",
        )
        .unwrap();
        assert!(merged.boundary_types.contains("Movie"));
        assert_eq!(merged.field_urls.get("Movie", "uid"), None);
        assert_eq!(
            merged.field_urls.get("Movie", "title"),
            Some("http://movies/query")
        );
    }

    #[test]
    fn merge_is_idempotent_with_an_empty_partner() {
        let minimal = service(
            "empty",
            "http://empty/query",
            r#"
            type Service { name: String! version: String! schema: String! }
            type Query { service: Service! }
            "#,
        );
        let alone = merge_schemas(
            &[service("movies", "http://movies/query", MOVIES_SDL)],
            "id",
        )
        .unwrap();
        let with_empty = merge_schemas(
            &[
                service("movies", "http://movies/query", MOVIES_SDL),
                minimal,
            ],
            "id",
        )
        .unwrap();

        let mut left: Vec<String> = alone.schema.types.keys().map(|k| k.to_string()).collect();
        let mut right: Vec<String> = with_empty.schema.types.keys().map(|k| k.to_string()).collect();
        left.sort();
        right.sort();
        assert_eq!(left, right);
    }

    #[test]
    fn strips_custom_directives() {
        let merged = merge_schemas(
            &[service(
                "movies",
                "http://movies/query",
                r#"
                directive @lowercase on FIELD_DEFINITION
                type Service { name: String! version: String! schema: String! }
                type Movie { id: ID! title: String! @lowercase @deprecated(reason: "renamed") }
                type Query { service: Service! movie(id: ID!): Movie! }
                "#,
            )],
            "id",
        )
        .unwrap();

        let ExtendedType::Object(movie) = merged.schema.types.get("Movie").unwrap() else {
            panic!("Movie should be an object type")
        };
        let title = movie.fields.get("title").unwrap();
        assert!(title.directives.get("lowercase").is_none());
        assert_eq!(deprecation_reason(&title.directives), Some("renamed"));
    }
}

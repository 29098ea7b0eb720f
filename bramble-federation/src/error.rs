use apollo_compiler::Name;

/// A convention violation found while validating a single service's schema.
///
/// A service whose schema fails validation is excluded from the merge cycle;
/// the error text ends up in the service's `Invalid (...)` status.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("schema has no query type")]
    MissingQueryType,
    #[error("the schema must not redefine the root {kind} type as {name}")]
    RenamedRootType { kind: &'static str, name: Name },
    #[error("the Service type must be defined as an object type")]
    InvalidServiceType,
    #[error("the Service type must have exactly the fields name, version and schema, of type String!")]
    InvalidServiceTypeFields,
    #[error("the schema must define a field service: Service! on the Query type, with no arguments")]
    MissingServiceField,
    #[error("the @boundary directive may only be declared on OBJECT, or on OBJECT and FIELD_DEFINITION, with no arguments")]
    InvalidBoundaryDirective,
    #[error("the @namespace directive may only be declared on OBJECT, with no arguments")]
    InvalidNamespaceDirective,
    #[error("boundary type {name} must have a field {id_field}: ID!")]
    MissingBoundaryId { name: Name, id_field: String },
    #[error("the Node interface must have a single field {id_field}: ID!")]
    InvalidNodeInterface { id_field: String },
    #[error("the node field must be declared as node({id_field}: ID!): Node on the Query type")]
    InvalidNodeField { id_field: String },
    #[error("boundary type {name} must implement the Node interface")]
    BoundaryTypeMissingNode { name: Name },
    #[error("boundary query {name} must accept a single argument {id_field}: ID! and return a nullable object, or accept {ids_field}: [ID!]! and return a non-nullable list of nullable objects")]
    InvalidBoundaryQuery {
        name: Name,
        id_field: String,
        ids_field: String,
    },
    #[error("boundary query {name} must return a boundary object type")]
    BoundaryQueryReturnsNonBoundary { name: Name },
    #[error("schema declares boundary types but exposes neither node({id_field}: ID!): Node nor any @boundary query field")]
    MissingBoundaryLookup { id_field: String },
    #[error("namespace field {ty}.{field} must be non-nullable")]
    NullableNamespaceField { ty: Name, field: Name },
    #[error("namespace type {name} may only be returned from a root type or another namespace type, found on {ty}.{field}")]
    MisplacedNamespaceType { name: Name, ty: Name, field: Name },
    #[error("schema does not merge cleanly: {0}")]
    MergeDryRun(#[from] MergeError),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

/// A reason the merged schema was rejected. The previous snapshot is kept
/// whenever merging fails.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MergeError {
    #[error("conflicting non-boundary type {name}")]
    ConflictingType { name: Name },
    #[error("interface {name} is defined by more than one service")]
    DuplicateInterface { name: Name },
    #[error("overlapping fields {ty}.{field}")]
    OverlappingFields { ty: Name, field: Name },
    #[error("overlapping namespace fields {ty}.{field}")]
    OverlappingNamespaceFields { ty: Name, field: Name },
    #[error("boundary type {name} joined with non-boundary type")]
    MixedBoundaryType { name: Name },
    #[error("namespace type {name} joined with non-namespace type")]
    MixedNamespaceType { name: Name },
    #[error("boundary type {name} is missing the {id_field} field")]
    MissingBoundaryId { name: Name, id_field: String },
    #[error("field {ty}.{field} is claimed by both {left} and {right}")]
    FieldOwnershipConflict {
        ty: Name,
        field: Name,
        left: String,
        right: String,
    },
    #[error("merged schema is invalid: {0}")]
    InvalidMergedSchema(String),
}

/// A reason an operation could not be planned. Planning failures produce a
/// single top-level GraphQL error with no partial data.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error("could not find location for {ty}.{field}")]
    UnroutableField { ty: Name, field: Name },
    #[error("{ty} is not a boundary type")]
    NotBoundaryType { ty: Name },
    #[error("boundary type {ty} has no {id_field} field")]
    MissingIdField { ty: Name, id_field: String },
    #[error("operation type {0} is not supported")]
    UnsupportedOperation(&'static str),
    #[error("unknown fragment {0}")]
    UnknownFragment(Name),
    #[error("variable {0} is not defined")]
    UndefinedVariable(Name),
    #[error("argument if of directive @{0} must be a boolean")]
    MalformedConditionalDirective(Name),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

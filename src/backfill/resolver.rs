//! Directory lookups used by the backfill engine.

use std::collections::HashMap;

/// Error raised by a resolver.
///
/// Resolver failures never abort a run; the engine logs them and treats the
/// batch as having no information.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resolver failed: {message}")]
pub struct ResolveError {
    /// Failure detail
    pub message: String,
}

impl ResolveError {
    /// Creates a resolve error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An object reference: type plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object type, e.g. `user`
    pub object_type: String,
    /// Object identifier
    pub object_id: String,
}

impl ObjectKey {
    /// Creates an object key.
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }
}

/// Descriptive fields for an actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorInfo {
    /// Human-readable name
    pub display: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Actor kind, e.g. `user` or `job`
    pub actor_type: Option<String>,
}

impl ActorInfo {
    /// Info carrying only a display name.
    pub fn display(display: impl Into<String>) -> Self {
        Self {
            display: Some(display.into()),
            ..Self::default()
        }
    }
}

/// Descriptive fields for an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Human-readable name
    pub display: Option<String>,
    /// Whether the object no longer exists
    pub deleted: Option<bool>,
}

impl ObjectInfo {
    /// Info carrying only a display name.
    pub fn display(display: impl Into<String>) -> Self {
        Self {
            display: Some(display.into()),
            ..Self::default()
        }
    }
}

/// Resolves actor identifiers within one tenant.
///
/// Called at most once per tenant per scanned page with the distinct,
/// sorted identifiers seen on that page. Unknown identifiers are simply
/// absent from the result.
pub trait ActorResolver: Send + Sync {
    /// Looks up a batch of actors.
    fn resolve_actors(
        &self,
        tenant_id: &str,
        actor_ids: &[String],
    ) -> Result<HashMap<String, ActorInfo>, ResolveError>;
}

/// Resolves object references within one tenant.
///
/// Called at most once per tenant per scanned page with the distinct,
/// sorted keys seen on that page, grouped by object type.
pub trait ObjectResolver: Send + Sync {
    /// Looks up a batch of objects.
    fn resolve_objects(
        &self,
        tenant_id: &str,
        objects: &[ObjectKey],
    ) -> Result<HashMap<ObjectKey, ObjectInfo>, ResolveError>;
}

/// Resolver that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl ActorResolver for NoopResolver {
    fn resolve_actors(
        &self,
        _tenant_id: &str,
        _actor_ids: &[String],
    ) -> Result<HashMap<String, ActorInfo>, ResolveError> {
        Ok(HashMap::new())
    }
}

impl ObjectResolver for NoopResolver {
    fn resolve_objects(
        &self,
        _tenant_id: &str,
        _objects: &[ObjectKey],
    ) -> Result<HashMap<ObjectKey, ObjectInfo>, ResolveError> {
        Ok(HashMap::new())
    }
}

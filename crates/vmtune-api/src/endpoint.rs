//! Read and action endpoints
//!
//! Endpoints are composed from two small capabilities, [`ReadHandler`] and
//! [`ActionHandler`], wrapped by explicit middleware:
//!
//! request → [`Authorize`] → [`ValidateBody`] → resource handler → [`ErrorTranslator`]

use crate::auth::AuthorizationService;
use crate::response::ApiResponse;
use crate::schema::ActionSchema;
use crate::translator::ErrorTranslator;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use vmtune_compute::ReconfigurationService;
use vmtune_core::{
    ComputeError, ConfigError, InstanceId, ReconfigurationRequest, RequestContext, ResourceKind,
    ResourceLimits,
};

/// Handles reads of one resource
#[async_trait]
pub trait ReadHandler: Send + Sync {
    /// Current value as a response body
    async fn handle_read(&self, ctx: &RequestContext, id: &InstanceId) -> Result<Value, ComputeError>;
}

/// Handles change requests of one resource
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Request the change described by `body`
    async fn handle_action(
        &self,
        ctx: &RequestContext,
        id: &InstanceId,
        body: &Value,
    ) -> Result<(), ComputeError>;
}

/// Reads `{ id, <field> }` verbatim from storage
#[derive(Debug, Clone)]
pub struct ResourceReader {
    kind: ResourceKind,
    service: ReconfigurationService,
}

impl ResourceReader {
    /// Create reader for `kind`
    #[inline]
    #[must_use]
    pub fn new(kind: ResourceKind, service: ReconfigurationService) -> Self {
        Self { kind, service }
    }
}

#[async_trait]
impl ReadHandler for ResourceReader {
    async fn handle_read(&self, _ctx: &RequestContext, id: &InstanceId) -> Result<Value, ComputeError> {
        let value = self.service.current_value(id, self.kind).await?;
        Ok(json!({ "id": id, self.kind.field(): value }))
    }
}

/// Requests a hot change of the value carried in `body`
#[derive(Debug, Clone)]
pub struct ResourceChanger {
    kind: ResourceKind,
    service: ReconfigurationService,
}

impl ResourceChanger {
    /// Create changer for `kind`
    #[inline]
    #[must_use]
    pub fn new(kind: ResourceKind, service: ReconfigurationService) -> Self {
        Self { kind, service }
    }
}

#[async_trait]
impl ActionHandler for ResourceChanger {
    async fn handle_action(
        &self,
        ctx: &RequestContext,
        id: &InstanceId,
        body: &Value,
    ) -> Result<(), ComputeError> {
        let value = body
            .get(self.kind.action())
            .and_then(|action| action.get(self.kind.field()))
            .and_then(Value::as_u64)
            .ok_or_else(|| ComputeError::Validation(format!("missing {}", self.kind.field())))?;

        let accepted = self
            .service
            .reconfigure(id, ReconfigurationRequest::new(self.kind, value))
            .await?;
        tracing::debug!(
            request = %ctx.request_id,
            instance = %accepted.instance,
            operation = %accepted.operation,
            "change accepted"
        );
        Ok(())
    }
}

/// Authorization middleware
pub struct Authorize<H> {
    inner: H,
    authz: Arc<dyn AuthorizationService>,
    alias: &'static str,
}

impl<H> Authorize<H> {
    /// Guard `inner` with the policy `alias`
    #[inline]
    #[must_use]
    pub fn new(inner: H, authz: Arc<dyn AuthorizationService>, alias: &'static str) -> Self {
        Self { inner, authz, alias }
    }
}

impl<H: std::fmt::Debug> std::fmt::Debug for Authorize<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorize")
            .field("alias", &self.alias)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<H: ReadHandler> ReadHandler for Authorize<H> {
    async fn handle_read(&self, ctx: &RequestContext, id: &InstanceId) -> Result<Value, ComputeError> {
        self.authz.authorize(ctx, self.alias).await?;
        self.inner.handle_read(ctx, id).await
    }
}

#[async_trait]
impl<H: ActionHandler> ActionHandler for Authorize<H> {
    async fn handle_action(
        &self,
        ctx: &RequestContext,
        id: &InstanceId,
        body: &Value,
    ) -> Result<(), ComputeError> {
        self.authz.authorize(ctx, self.alias).await?;
        self.inner.handle_action(ctx, id, body).await
    }
}

/// Schema validation middleware
#[derive(Debug)]
pub struct ValidateBody<H> {
    inner: H,
    schema: ActionSchema,
}

impl<H> ValidateBody<H> {
    /// Validate bodies against `schema` before `inner` sees them
    #[inline]
    #[must_use]
    pub fn new(inner: H, schema: ActionSchema) -> Self {
        Self { inner, schema }
    }
}

#[async_trait]
impl<H: ActionHandler> ActionHandler for ValidateBody<H> {
    async fn handle_action(
        &self,
        ctx: &RequestContext,
        id: &InstanceId,
        body: &Value,
    ) -> Result<(), ComputeError> {
        self.schema.validate(body)?;
        self.inner.handle_action(ctx, id, body).await
    }
}

/// Read and action endpoint of one resource kind
pub struct ReconfigurationEndpoint {
    kind: ResourceKind,
    reader: Box<dyn ReadHandler>,
    changer: Box<dyn ActionHandler>,
    translator: ErrorTranslator,
}

impl ReconfigurationEndpoint {
    /// Compose the standard middleware stack for `kind`
    ///
    /// # Errors
    /// `Invalid` if the action schema does not compile under `limits`
    pub fn new(
        kind: ResourceKind,
        service: ReconfigurationService,
        authz: Arc<dyn AuthorizationService>,
        limits: &ResourceLimits,
    ) -> Result<Self, ConfigError> {
        let schema = ActionSchema::new(kind, limits)?;
        let reader = Authorize::new(
            ResourceReader::new(kind, service.clone()),
            Arc::clone(&authz),
            kind.alias(),
        );
        let changer = Authorize::new(
            ValidateBody::new(ResourceChanger::new(kind, service), schema),
            authz,
            kind.alias(),
        );
        Ok(Self::from_handlers(kind, Box::new(reader), Box::new(changer)))
    }

    /// Endpoint over caller-supplied handlers
    #[must_use]
    pub fn from_handlers(
        kind: ResourceKind,
        reader: Box<dyn ReadHandler>,
        changer: Box<dyn ActionHandler>,
    ) -> Self {
        Self {
            kind,
            reader,
            changer,
            translator: ErrorTranslator::new(),
        }
    }

    /// Resource kind served
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// `GET` current value: 200 `{ id, <field> }` or a fault
    pub async fn read(&self, ctx: &RequestContext, id: &InstanceId) -> ApiResponse {
        match self.reader.handle_read(ctx, id).await {
            Ok(body) => ApiResponse::ok(body),
            Err(e) => self.translator.translate(&e),
        }
    }

    /// `POST` action: 202 with empty body or a fault
    pub async fn action(&self, ctx: &RequestContext, id: &InstanceId, body: &Value) -> ApiResponse {
        match self.changer.handle_action(ctx, id, body).await {
            Ok(()) => ApiResponse::accepted(),
            Err(e) => {
                tracing::info!(
                    request = %ctx.request_id,
                    instance = %id,
                    action = self.kind.action(),
                    error = %e,
                    "action refused"
                );
                self.translator.translate(&e)
            }
        }
    }
}

impl std::fmt::Debug for ReconfigurationEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurationEndpoint")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Both hot-reconfiguration endpoints behind one router
#[derive(Debug)]
pub struct ReconfigurationApi {
    vcpus: ReconfigurationEndpoint,
    memory: ReconfigurationEndpoint,
    service: ReconfigurationService,
}

impl ReconfigurationApi {
    /// Build endpoints for every resource kind
    ///
    /// # Errors
    /// `Invalid` if an action schema does not compile under `limits`
    pub fn new(
        service: ReconfigurationService,
        authz: Arc<dyn AuthorizationService>,
        limits: &ResourceLimits,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            vcpus: ReconfigurationEndpoint::new(
                ResourceKind::Vcpus,
                service.clone(),
                Arc::clone(&authz),
                limits,
            )?,
            memory: ReconfigurationEndpoint::new(ResourceKind::Memory, service.clone(), authz, limits)?,
            service,
        })
    }

    /// Endpoint for `kind`
    #[inline]
    #[must_use]
    pub fn endpoint(&self, kind: ResourceKind) -> &ReconfigurationEndpoint {
        match kind {
            ResourceKind::Vcpus => &self.vcpus,
            ResourceKind::Memory => &self.memory,
        }
    }

    /// Wait until no change of `id` is in flight
    pub async fn quiesce(&self, id: &InstanceId) {
        self.service.quiesce(id).await;
    }
}

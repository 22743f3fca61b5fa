// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settix Message Dispatcher
//!
//! Several contract kinds share one queue. The [`ContractRegistry`] maps every
//! known contract id to a function that decodes the body into the matching
//! contract, validates it and invokes the corresponding method of the
//! application's [`ConfigurationMessageHandler`]. The table is built once when
//! the registry is created.

use crate::contracts::{
    ConfigurationRemoved, ConfigureService, Contract, ContractError, ContractKind,
    RemoveConfiguration, SchemaVersion, ServiceConfigured,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("message has no contract header")]
    MissingContract,

    #[error("contract header is not valid utf-8")]
    InvalidContractHeader,

    #[error("unknown contract `{0}`")]
    UnknownContract(String),

    #[error("failure to decode `{0}`: {1}")]
    DecodeError(&'static str, String),

    #[error(transparent)]
    InvalidContract(#[from] ContractError),

    #[error("handler failure `{0}`")]
    HandlerError(String),
}

/// Application callbacks, one per message kind.
///
/// Only `configure_service` is mandatory; the other kinds are ignored unless
/// the service overrides them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigurationMessageHandler: Send + Sync {
    async fn configure_service(
        &self,
        ctx: &Context,
        message: ConfigureService,
    ) -> Result<(), HandlerError>;

    async fn service_configured(
        &self,
        _ctx: &Context,
        _message: ServiceConfigured,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn remove_configuration(
        &self,
        _ctx: &Context,
        _message: RemoveConfiguration,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn configuration_removed(
        &self,
        _ctx: &Context,
        _message: ConfigurationRemoved,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Binds a contract type to its handler method.
trait Handled: Contract {
    fn invoke<'a>(
        self,
        handler: &'a dyn ConfigurationMessageHandler,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

impl Handled for ConfigureService {
    fn invoke<'a>(
        self,
        handler: &'a dyn ConfigurationMessageHandler,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        handler.configure_service(ctx, self)
    }
}

impl Handled for ServiceConfigured {
    fn invoke<'a>(
        self,
        handler: &'a dyn ConfigurationMessageHandler,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        handler.service_configured(ctx, self)
    }
}

impl Handled for RemoveConfiguration {
    fn invoke<'a>(
        self,
        handler: &'a dyn ConfigurationMessageHandler,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        handler.remove_configuration(ctx, self)
    }
}

impl Handled for ConfigurationRemoved {
    fn invoke<'a>(
        self,
        handler: &'a dyn ConfigurationMessageHandler,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        handler.configuration_removed(ctx, self)
    }
}

type DispatchFn = for<'a> fn(
    &'a dyn ConfigurationMessageHandler,
    &'a Context,
    &'a [u8],
    SchemaVersion,
) -> BoxFuture<'a, Result<(), DispatchError>>;

fn decode_and_invoke<'a, C: Handled>(
    handler: &'a dyn ConfigurationMessageHandler,
    ctx: &'a Context,
    body: &'a [u8],
    version: SchemaVersion,
) -> BoxFuture<'a, Result<(), DispatchError>> {
    Box::pin(async move {
        let mut message: C = serde_json::from_slice(body).map_err(|err| {
            DispatchError::DecodeError(C::KIND.contract_id(version), err.to_string())
        })?;

        message.ensure_version(version)?;
        message.align_version(version);
        message.validate()?;

        message
            .invoke(handler, ctx)
            .await
            .map_err(|err| DispatchError::HandlerError(err.to_string()))
    })
}

struct Route {
    kind: ContractKind,
    version: SchemaVersion,
    dispatch: DispatchFn,
}

/// Routes raw deliveries to the handler by contract id.
pub struct ContractRegistry {
    handler: Arc<dyn ConfigurationMessageHandler>,
    routes: HashMap<&'static str, Route>,
}

impl ContractRegistry {
    pub fn new(handler: Arc<dyn ConfigurationMessageHandler>) -> Self {
        let mut registry = ContractRegistry {
            handler,
            routes: HashMap::new(),
        };

        registry.register::<ConfigureService>();
        registry.register::<ServiceConfigured>();
        registry.register::<RemoveConfiguration>();
        registry.register::<ConfigurationRemoved>();

        registry
    }

    fn register<C: Handled>(&mut self) {
        for version in [SchemaVersion::V1, SchemaVersion::V2] {
            self.routes.insert(
                C::KIND.contract_id(version),
                Route {
                    kind: C::KIND,
                    version,
                    dispatch: decode_and_invoke::<C>,
                },
            );
        }
    }

    pub fn contains(&self, contract_id: &str) -> bool {
        self.routes.contains_key(contract_id)
    }

    pub fn contract_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    /// Decodes `body` as the contract named by `contract_id` and hands it to
    /// the handler, returning the kind and version that were dispatched.
    pub async fn dispatch(
        &self,
        ctx: &Context,
        contract_id: &str,
        body: &[u8],
    ) -> Result<(ContractKind, SchemaVersion), DispatchError> {
        let route = self
            .routes
            .get(contract_id)
            .ok_or_else(|| DispatchError::UnknownContract(contract_id.to_owned()))?;

        (route.dispatch)(self.handler.as_ref(), ctx, body, route.version).await?;

        Ok((route.kind, route.version))
    }
}

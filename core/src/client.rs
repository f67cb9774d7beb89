use prism_proto::{EntityId, EntityName, FieldName, OperationKind, QueryKey, Record};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::connector::{Fetcher, SubscriptionSender};
use crate::error::{ConfigError, MutationError, RetrievalError};
use crate::executor::{FetchTerminal, Link, LinkChain, OperationContext, OperationResult};
use crate::muxer::SubscriptionMultiplexer;
use crate::optimistic::{MutationKind, OptimisticConfig, OptimisticEngine};
use crate::plugin::{PluginHost, PluginRegistration};
use crate::resolver::{EntityHandle, ListHandle, QueryResolver};

/// Builder for [`Client`]: an ordered link list (the fetch terminal is
/// appended automatically unless one is supplied), an optional subscription
/// transport, plugin entries, and the optimistic configuration.
pub struct ClientBuilder {
    links: Vec<Arc<dyn Link>>,
    terminal: Option<Arc<dyn Link>>,
    subscription_transport: Option<Arc<dyn SubscriptionSender>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    plugins: Vec<PluginRegistration>,
    optimistic: OptimisticConfig,
}

impl ClientBuilder {
    pub fn link(mut self, link: Arc<dyn Link>) -> Self {
        self.links.push(link);
        self
    }

    /// Replace the default fetch terminal.
    pub fn terminal(mut self, terminal: Arc<dyn Link>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn subscription_transport(mut self, transport: Arc<dyn SubscriptionSender>) -> Self {
        self.subscription_transport = Some(transport);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn plugin(mut self, registration: impl Into<PluginRegistration>) -> Self {
        self.plugins.push(registration.into());
        self
    }

    pub fn optimistic(mut self, config: OptimisticConfig) -> Self {
        self.optimistic = config;
        self
    }

    pub fn build(self) -> Result<Client, ConfigError> {
        let fetcher = self.fetcher.ok_or(ConfigError::MissingFetcher)?;

        let mut links = self.links;
        links.push(self.terminal.unwrap_or_else(|| Arc::new(FetchTerminal::new(fetcher.clone()))));
        let chain = LinkChain::new(links)?;

        let muxer = SubscriptionMultiplexer::new();
        let resolver = QueryResolver::new(muxer.clone(), chain.clone(), fetcher.clone());
        let optimistic = OptimisticEngine::new(muxer.clone(), self.optimistic);

        let plugins = PluginHost::new();
        for registration in self.plugins {
            plugins.register(registration)?;
        }
        plugins.initialize();

        if let Some(transport) = self.subscription_transport {
            muxer.set_transport(transport.clone());
            // The transport delivers incoming updates to this one callback
            let muxer_for_updates = muxer.clone();
            transport.connect_updates(Arc::new(move |message| {
                muxer_for_updates.apply_update(message);
            }));
        }

        Ok(Client(Arc::new(ClientInner { chain, muxer, resolver, optimistic, plugins })))
    }
}

struct ClientInner {
    chain: LinkChain,
    muxer: SubscriptionMultiplexer,
    resolver: QueryResolver,
    optimistic: OptimisticEngine,
    plugins: PluginHost,
}

/// One mutation invocation: the target, the operation kind, the validated
/// args, and the record to install speculatively.
pub struct MutationCall {
    pub entity: EntityName,
    pub id: EntityId,
    pub kind: MutationKind,
    /// Operation name; defaults to the kind's canonical name.
    pub operation: Option<String>,
    /// Validated argument record; defaults to `{id, data}`.
    pub args: Option<Value>,
    /// Record to apply optimistically. `None` skips the speculative write.
    pub optimistic: Option<Record>,
}

impl MutationCall {
    pub fn new(entity: impl Into<EntityName>, id: impl Into<EntityId>, kind: MutationKind) -> Self {
        Self { entity: entity.into(), id: id.into(), kind, operation: None, args: None, optimistic: None }
    }

    /// Set the mutation data, used both as args payload and speculative write.
    pub fn data(mut self, data: Record) -> Self {
        self.optimistic = Some(data);
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }
}

/// The assembled client core: operation executor, subscription multiplexer,
/// query resolver, optimistic engine, and plugin host.
#[derive(Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            links: Vec::new(),
            terminal: None,
            subscription_transport: None,
            fetcher: None,
            plugins: Vec::new(),
            optimistic: OptimisticConfig::default(),
        }
    }

    /// Resolve one entity; see [`QueryResolver::resolve_entity`].
    pub async fn get(
        &self,
        entity: impl Into<EntityName>,
        id: impl Into<EntityId>,
        fields: Option<&[FieldName]>,
    ) -> Result<EntityHandle, RetrievalError> {
        let entity = entity.into();
        let id = id.into();

        let hook_ctx =
            OperationContext::new(OperationKind::Query, entity.clone(), "get", json!({ "id": &id, "fields": fields }));
        self.0.plugins.dispatch("on_query_start", |p| p.on_query_start(&hook_ctx));

        let result = self.0.resolver.resolve_entity(&entity, &id, fields).await;

        let hook_result = match &result {
            Ok(_) => OperationResult::empty(),
            Err(e) => OperationResult::error(e.into()),
        };
        self.0.plugins.dispatch("on_query_end", |p| p.on_query_end(&hook_ctx, &hook_result));

        result
    }

    /// Resolve a list query; see [`QueryResolver::resolve_list`].
    pub async fn list(&self, entity: impl Into<EntityName>, options: Value) -> Result<ListHandle, RetrievalError> {
        let entity = entity.into();

        let hook_ctx = OperationContext::new(OperationKind::Query, entity.clone(), "list", json!({ "options": &options }));
        self.0.plugins.dispatch("on_query_start", |p| p.on_query_start(&hook_ctx));

        let result = self.0.resolver.resolve_list(&entity, options).await;

        let hook_result = match &result {
            Ok(_) => OperationResult::empty(),
            Err(e) => OperationResult::error(e.into()),
        };
        self.0.plugins.dispatch("on_query_end", |p| p.on_query_end(&hook_ctx, &hook_result));

        result
    }

    /// Enqueue a fetch for the next batching tick; see
    /// [`QueryResolver::queue_fetch`].
    pub fn queue_fetch(
        &self,
        entity: impl Into<EntityName>,
        id: impl Into<EntityId>,
        fields: Option<Vec<FieldName>>,
    ) -> impl std::future::Future<Output = Result<EntityHandle, RetrievalError>> {
        self.0.resolver.queue_fetch(entity.into(), id.into(), fields)
    }

    /// Run a mutation: apply the speculative write, execute the link chain,
    /// then confirm with the server record or roll back on any error.
    pub async fn mutate(&self, call: MutationCall) -> Result<Option<Record>, MutationError> {
        let operation = call.operation.unwrap_or_else(|| call.kind.operation().to_string());
        let optimistic_data = match call.kind {
            MutationKind::Delete => Some(Record::new()),
            _ => call.optimistic.clone(),
        };
        let args = match call.args {
            Some(args) => args,
            None => json!({ "id": &call.id, "data": call.optimistic.clone().unwrap_or_default() }),
        };

        let ctx = OperationContext::new(OperationKind::Mutation, call.entity.clone(), operation, args);
        self.0.plugins.dispatch("on_mutation_start", |p| p.on_mutation_start(&ctx));

        let opt_id = optimistic_data.and_then(|data| self.0.optimistic.apply(&call.entity, &call.id, call.kind, data));

        let result = self.0.chain.dispatch(ctx.clone()).await;

        match result.error.clone() {
            Some(error) => {
                if let Some(opt_id) = opt_id {
                    self.0.optimistic.rollback(opt_id);
                }
                self.0.plugins.dispatch("on_mutation_error", |p| p.on_mutation_error(&ctx, &result));
                self.0.plugins.dispatch("on_mutation_end", |p| p.on_mutation_end(&ctx, &result));
                Err(error.into())
            }
            None => {
                let server_record: Option<Record> = result.data.clone().and_then(|data| serde_json::from_value(data).ok());
                if let Some(opt_id) = opt_id {
                    self.0.optimistic.confirm(opt_id, server_record.clone());
                }
                self.0.plugins.dispatch("on_mutation_end", |p| p.on_mutation_end(&ctx, &result));
                Ok(server_record)
            }
        }
    }

    /// Release one query holder; see [`QueryResolver::release_query`].
    pub fn release(&self, key: &QueryKey) { self.0.resolver.release_query(key) }

    /// Transport lifecycle notifications, forwarded to plugin hooks.
    pub fn notify_connected(&self) { self.0.plugins.dispatch("on_connect", |p| p.on_connect()) }
    pub fn notify_disconnected(&self) { self.0.plugins.dispatch("on_disconnect", |p| p.on_disconnect()) }
    pub fn notify_reconnected(&self) { self.0.plugins.dispatch("on_reconnect", |p| p.on_reconnect()) }

    pub fn muxer(&self) -> &SubscriptionMultiplexer { &self.0.muxer }
    pub fn resolver(&self) -> &QueryResolver { &self.0.resolver }
    pub fn optimistic(&self) -> &OptimisticEngine { &self.0.optimistic }
    pub fn plugins(&self) -> &PluginHost { &self.0.plugins }
    pub fn chain(&self) -> &LinkChain { &self.0.chain }

    /// Tear down: plugin destroy hooks, then the multiplexer.
    pub fn destroy(&self) {
        debug!("client: destroy");
        self.0.plugins.dispatch("on_destroy", |p| p.on_destroy());
        self.0.muxer.destroy();
    }
}

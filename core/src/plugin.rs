use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use crate::error::ConfigError;
use crate::executor::{OperationContext, OperationResult};

/// A plugin's factory receives its merged configuration and returns the
/// instance whose hooks the host will dispatch.
pub type PluginFactory = Arc<dyn Fn(Value) -> Arc<dyn PluginInstance> + Send + Sync>;

/// Static description of a plugin.
#[derive(Clone)]
pub struct PluginDef {
    pub name: String,
    pub version: Option<String>,
    /// Names of plugins that must be registered before this one initializes.
    pub dependencies: Vec<String>,
    pub default_config: Option<Value>,
    pub factory: PluginFactory,
}

impl PluginDef {
    pub fn new(name: impl Into<String>, factory: PluginFactory) -> Self {
        Self { name: name.into(), version: None, dependencies: Vec::new(), default_config: None, factory }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn default_config(mut self, config: Value) -> Self {
        self.default_config = Some(config);
        self
    }
}

/// A registration entry: a bare definition, or a definition with caller
/// configuration merged over the default.
pub struct PluginRegistration {
    pub def: PluginDef,
    pub config: Option<Value>,
}

impl From<PluginDef> for PluginRegistration {
    fn from(def: PluginDef) -> Self { Self { def, config: None } }
}

/// The hook set a plugin instance may implement. Every hook has a default
/// empty body; errors returned from hooks are logged and isolated — one
/// plugin's failure never stops the others.
#[allow(unused_variables)]
pub trait PluginInstance: Send + Sync {
    fn on_query_start(&self, ctx: &OperationContext) -> anyhow::Result<()> { Ok(()) }
    fn on_query_end(&self, ctx: &OperationContext, result: &OperationResult) -> anyhow::Result<()> { Ok(()) }
    fn on_mutation_start(&self, ctx: &OperationContext) -> anyhow::Result<()> { Ok(()) }
    fn on_mutation_error(&self, ctx: &OperationContext, result: &OperationResult) -> anyhow::Result<()> { Ok(()) }
    fn on_mutation_end(&self, ctx: &OperationContext, result: &OperationResult) -> anyhow::Result<()> { Ok(()) }
    fn on_connect(&self) -> anyhow::Result<()> { Ok(()) }
    fn on_disconnect(&self) -> anyhow::Result<()> { Ok(()) }
    fn on_reconnect(&self) -> anyhow::Result<()> { Ok(()) }
    fn on_destroy(&self) -> anyhow::Result<()> { Ok(()) }

    /// Public API surface the plugin exposes to application code.
    fn api(&self) -> Option<Arc<dyn Any + Send + Sync>> { None }
}

struct Registered {
    def: PluginDef,
    config: Option<Value>,
    instance: Option<Arc<dyn PluginInstance>>,
}

struct Inner {
    /// Registration order; hooks dispatch in this order
    plugins: Mutex<Vec<Registered>>,
    initialized: Mutex<bool>,
}

/// Registers plugins, validates dependencies, initializes in registration
/// order, and dispatches lifecycle hooks with per-plugin error isolation.
#[derive(Clone)]
pub struct PluginHost(Arc<Inner>);

impl PluginHost {
    pub fn new() -> Self { Self(Arc::new(Inner { plugins: Mutex::new(Vec::new()), initialized: Mutex::new(false) })) }

    /// Register a plugin. Duplicate names are rejected with a warning and
    /// ignored; a missing declared dependency is a fatal registration error.
    /// After host initialization, registration initializes the plugin
    /// immediately.
    pub fn register(&self, registration: impl Into<PluginRegistration>) -> Result<(), ConfigError> {
        let registration = registration.into();
        let mut plugins = self.0.plugins.lock().expect("plugins lock poisoned");

        if plugins.iter().any(|p| p.def.name == registration.def.name) {
            warn!("plugins: duplicate registration of {} ignored", registration.def.name);
            return Ok(());
        }

        let known: HashSet<&str> = plugins.iter().map(|p| p.def.name.as_str()).collect();
        for dependency in &registration.def.dependencies {
            if !known.contains(dependency.as_str()) {
                return Err(ConfigError::MissingPluginDependency {
                    plugin: registration.def.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let mut registered = Registered { def: registration.def, config: registration.config, instance: None };
        if *self.0.initialized.lock().expect("initialized lock poisoned") {
            instantiate(&mut registered);
        }
        plugins.push(registered);
        Ok(())
    }

    /// Run factories for all pending plugins, in registration order.
    pub fn initialize(&self) {
        let mut initialized = self.0.initialized.lock().expect("initialized lock poisoned");
        let mut plugins = self.0.plugins.lock().expect("plugins lock poisoned");
        for registered in plugins.iter_mut() {
            if registered.instance.is_none() {
                instantiate(registered);
            }
        }
        *initialized = true;
    }

    /// A registered plugin's API surface, if it exposes one.
    pub fn api(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        let plugins = self.0.plugins.lock().expect("plugins lock poisoned");
        plugins.iter().find(|p| p.def.name == name).and_then(|p| p.instance.as_ref()).and_then(|i| i.api())
    }

    pub fn len(&self) -> usize { self.0.plugins.lock().expect("plugins lock poisoned").len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Dispatch one hook across all plugins in registration order, logging
    /// and swallowing individual failures.
    pub fn dispatch<F>(&self, hook: &str, f: F)
    where F: Fn(&dyn PluginInstance) -> anyhow::Result<()> {
        let instances: Vec<(String, Arc<dyn PluginInstance>)> = {
            let plugins = self.0.plugins.lock().expect("plugins lock poisoned");
            plugins
                .iter()
                .filter_map(|p| p.instance.as_ref().map(|i| (p.def.name.clone(), i.clone())))
                .collect()
        };
        for (name, instance) in instances {
            if let Err(e) = f(instance.as_ref()) {
                error!("plugins: {name}.{hook} failed: {e:#}");
            }
        }
    }
}

impl Default for PluginHost {
    fn default() -> Self { Self::new() }
}

fn instantiate(registered: &mut Registered) {
    let config = merge_config(registered.def.default_config.clone(), registered.config.clone());
    debug!("plugins: initializing {}", registered.def.name);
    registered.instance = Some((registered.def.factory)(config));
}

/// Shallow-merge caller config over the default: caller keys win.
fn merge_config(default: Option<Value>, config: Option<Value>) -> Value {
    match (default, config) {
        (Some(Value::Object(mut base)), Some(Value::Object(overlay))) => {
            for (key, value) in overlay {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, Some(config)) => config,
        (Some(default), None) => default,
        (None, None) => Value::Null,
    }
}

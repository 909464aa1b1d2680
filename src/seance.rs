//! Séances: named Spirits sharing one Loa registry.
//!
//! Every name moves through `absent -> summoned -> absent`. Operations check
//! their preconditions before touching the session, so a failed call leaves
//! it as it was. Calls into a summoned Spirit are synchronous and run to
//! completion; only summoning waits, on byte retrieval.

use std::collections::HashMap;
use std::ops::AsyncFnOnce;
use std::path::PathBuf;
use wasmtime::Val;

use crate::error::{Error, Result};
use crate::loa::{Loa, LoaRegistry};
use crate::loader::{SpiritSource, load_manifest};
use crate::spirit::{LoadOptions, Loader, Spirit, SummonOptions};

pub struct Seance {
    loader: Loader,
    defaults: LoadOptions,
    spirits: HashMap<String, Spirit>,
}

impl Seance {
    /// A séance with the built-in registry and default load options.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> SeanceBuilder {
        SeanceBuilder::new()
    }

    /// Load a Spirit under `name`. `options` is layered over the session
    /// defaults; the shared registry applies unless either carries its own.
    pub async fn summon(
        &mut self,
        name: &str,
        source: impl Into<SpiritSource>,
        options: Option<SummonOptions>,
    ) -> Result<()> {
        if self.spirits.contains_key(name) {
            return Err(Error::SpiritExists(name.to_string()));
        }
        let options = self.options_for(options.as_ref());
        let spirit = self.loader.load_from(&source.into(), &options).await?;
        self.spirits.insert(name.to_string(), spirit);
        tracing::debug!(spirit = name, "summoned spirit");
        Ok(())
    }

    /// Load a Spirit from bytes already in hand.
    pub fn summon_bytes(
        &mut self,
        name: &str,
        bytes: &[u8],
        options: Option<SummonOptions>,
    ) -> Result<()> {
        if self.spirits.contains_key(name) {
            return Err(Error::SpiritExists(name.to_string()));
        }
        let options = self.options_for(options.as_ref());
        let spirit = self.loader.load(bytes, &options)?;
        self.spirits.insert(name.to_string(), spirit);
        tracing::debug!(spirit = name, "summoned spirit");
        Ok(())
    }

    /// Summon every Spirit described by the manifests. Either all of them
    /// are summoned or none are.
    pub async fn summon_manifest(&mut self, paths: &[PathBuf]) -> Result<Vec<String>> {
        let definitions = load_manifest(paths)?;
        if let Some(taken) = definitions
            .iter()
            .find(|def| self.spirits.contains_key(&def.name))
        {
            return Err(Error::SpiritExists(taken.name.clone()));
        }

        let mut summoned: Vec<String> = Vec::new();
        for def in &definitions {
            let options = def.summon_options();
            if let Err(e) = self.summon(&def.name, def.source(), Some(options)).await {
                for name in &summoned {
                    let _ = self.release(name);
                }
                return Err(e);
            }
            summoned.push(def.name.clone());
        }
        Ok(summoned)
    }

    fn options_for(&self, overrides: Option<&SummonOptions>) -> LoadOptions {
        match overrides {
            Some(overrides) => overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// Call `function` on the Spirit named `name` with raw values.
    pub fn invoke(&mut self, name: &str, function: &str, args: &[Val]) -> Result<Vec<Val>> {
        self.spirit_mut(name)?.call(function, args)
    }

    /// Call `function` on the Spirit named `name` with JSON arguments.
    pub fn invoke_json(
        &mut self,
        name: &str,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.spirit_mut(name)?.call_json(function, args)
    }

    fn spirit_mut(&mut self, name: &str) -> Result<&mut Spirit> {
        self.spirits
            .get_mut(name)
            .ok_or_else(|| Error::SpiritNotFound(name.to_string()))
    }

    pub fn get_spirit(&self, name: &str) -> Option<&Spirit> {
        self.spirits.get(name)
    }

    pub fn get_spirit_mut(&mut self, name: &str) -> Option<&mut Spirit> {
        self.spirits.get_mut(name)
    }

    pub fn has_spirit(&self, name: &str) -> bool {
        self.spirits.contains_key(name)
    }

    /// Names of summoned Spirits, sorted.
    pub fn spirits(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.spirits.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.spirits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spirits.is_empty()
    }

    /// Reset the Spirit's memory and remove it from the séance.
    pub fn release(&mut self, name: &str) -> Result<()> {
        let spirit = self
            .spirits
            .remove(name)
            .ok_or_else(|| Error::SpiritNotFound(name.to_string()))?;
        spirit.release();
        tracing::debug!(spirit = name, "released spirit");
        Ok(())
    }

    /// Release every Spirit. Harmless on an empty séance.
    pub fn dismiss(&mut self) {
        for (name, spirit) in self.spirits.drain() {
            spirit.release();
            tracing::debug!(spirit = %name, "released spirit");
        }
    }

    /// Run `f` against this séance, then dismiss it whether `f` succeeded
    /// or failed.
    pub async fn scoped<R>(mut self, f: impl AsyncFnOnce(&mut Seance) -> Result<R>) -> Result<R> {
        let result = f(&mut self).await;
        self.dismiss();
        result
    }

    pub fn defaults(&self) -> &LoadOptions {
        &self.defaults
    }

    pub fn registry(&self) -> &LoaRegistry {
        self.loader.registry()
    }

    /// Registration belongs to session setup, before Spirits are summoned;
    /// Spirits already summoned keep the functions they were linked with.
    pub fn registry_mut(&mut self) -> &mut LoaRegistry {
        self.loader.registry_mut()
    }
}

impl Drop for Seance {
    fn drop(&mut self) {
        self.dismiss();
    }
}

impl std::fmt::Debug for Seance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seance")
            .field("spirits", &self.spirits())
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Builder for configuring and creating a Seance
pub struct SeanceBuilder {
    registry: LoaRegistry,
    defaults: LoadOptions,
}

impl SeanceBuilder {
    fn new() -> Self {
        Self {
            registry: LoaRegistry::new(),
            defaults: LoadOptions::default(),
        }
    }

    /// Register a Loa in the séance's shared registry.
    pub fn with_loa(mut self, loa: impl Loa + 'static) -> Result<Self> {
        self.registry.register(loa)?;
        Ok(self)
    }

    pub fn with_registry(mut self, registry: LoaRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Options every summon starts from.
    pub fn with_defaults(mut self, defaults: LoadOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn build(self) -> Result<Seance> {
        Ok(Seance {
            loader: Loader::with_registry(self.registry)?,
            defaults: self.defaults,
            spirits: HashMap::new(),
        })
    }
}

//! Loas: named bundles of host functions offered to Spirits.
//!
//! A [`Loa`] is a factory. When a Spirit is loaded, every Loa in the
//! registry is asked for its functions against a [`LoaContext`] bound to
//! that Spirit's store, and the results are merged into the `env` import
//! namespace. Host functions must stay synchronous with respect to the
//! Spirit's memory: a function that allocates must finish before returning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use wasmtime::{Caller, Func, IntoFunc, StoreContextMut};

use crate::error::{Abort, Error, Result};
use crate::memory::MemoryManager;
use crate::types::SpiritState;

/// Name of the built-in Loa. It cannot be unregistered.
pub const BUILTIN_LOA: &str = "vudo";

/// Host functions returned by one Loa, in the order they were declared.
pub type HostFunctions = Vec<(String, Func)>;

/// A named, versioned provider of host functions.
pub trait Loa: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Capabilities this Loa grants to the Spirits it is linked into.
    fn capabilities(&self) -> Vec<String>;

    /// Build the host functions for one Spirit.
    fn provides(&self, ctx: &mut LoaContext<'_>) -> anyhow::Result<HostFunctions>;
}

impl std::fmt::Debug for dyn Loa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loa")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

/// What a Loa sees while building functions for a Spirit.
pub struct LoaContext<'a> {
    store: StoreContextMut<'a, SpiritState>,
    debug: bool,
}

impl<'a> LoaContext<'a> {
    pub(crate) fn new(store: StoreContextMut<'a, SpiritState>) -> Self {
        let debug = store.data().debug();
        Self { store, debug }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Wrap a closure as a host function owned by the Spirit's store.
    pub fn wrap<Params, Results>(
        &mut self,
        func: impl IntoFunc<SpiritState, Params, Results>,
    ) -> Func {
        Func::wrap(&mut self.store, func)
    }

    /// The Spirit's store, for Loas that keep per-Spirit state in extensions.
    pub fn store(&mut self) -> &mut StoreContextMut<'a, SpiritState> {
        &mut self.store
    }
}

/// Memory manager for the Spirit making a host call.
pub fn caller_memory(caller: &Caller<'_, SpiritState>) -> Result<MemoryManager> {
    Ok(MemoryManager::new(caller.data().memory()?))
}

/// Registered Loas in registration order.
#[derive(Clone)]
pub struct LoaRegistry {
    loas: Vec<Arc<dyn Loa>>,
}

impl LoaRegistry {
    /// A registry holding only the built-in Loa.
    pub fn new() -> Self {
        Self {
            loas: vec![Arc::new(VudoLoa::default())],
        }
    }

    pub fn register(&mut self, loa: impl Loa + 'static) -> Result<()> {
        self.register_shared(Arc::new(loa))
    }

    pub fn register_shared(&mut self, loa: Arc<dyn Loa>) -> Result<()> {
        if self.has(loa.name()) {
            return Err(Error::LoaExists(loa.name().to_string()));
        }
        tracing::debug!(loa = loa.name(), version = loa.version(), "registered loa");
        self.loas.push(loa);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn Loa>> {
        if name == BUILTIN_LOA {
            return Err(Error::BuiltinLoa(name.to_string()));
        }
        let index = self
            .loas
            .iter()
            .position(|loa| loa.name() == name)
            .ok_or_else(|| Error::LoaNotFound(name.to_string()))?;
        Ok(self.loas.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Loa>> {
        self.loas.iter().find(|loa| loa.name() == name)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Loa>> {
        self.loas.iter()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.loas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loas.is_empty()
    }

    /// Merge the functions of every Loa, in registration order. A later Loa
    /// replaces an earlier one's function of the same name.
    pub fn build_imports(&self, ctx: &mut LoaContext<'_>) -> Result<HashMap<String, Func>> {
        let mut imports = HashMap::new();
        for loa in &self.loas {
            merge_provided(loa.as_ref(), ctx, &mut imports)?;
        }
        Ok(imports)
    }
}

impl Default for LoaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn merge_provided(
    loa: &dyn Loa,
    ctx: &mut LoaContext<'_>,
    imports: &mut HashMap<String, Func>,
) -> Result<()> {
    let provided = loa.provides(ctx).map_err(|e| {
        Error::Load(e.context(format!("loa '{}' failed to provide functions", loa.name())))
    })?;
    for (name, func) in provided {
        if imports.insert(name.clone(), func).is_some() {
            tracing::debug!(loa = loa.name(), function = %name, "host function overridden");
        }
    }
    Ok(())
}

/// The built-in Loa behind the reserved `vudo_*` imports.
#[derive(Debug, Clone, Default)]
pub struct VudoLoa;

impl Loa for VudoLoa {
    fn name(&self) -> &str {
        BUILTIN_LOA
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn capabilities(&self) -> Vec<String> {
        ["print", "alloc", "time", "random", "effects", "debug", "abort"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn provides(&self, ctx: &mut LoaContext<'_>) -> anyhow::Result<HostFunctions> {
        let debug = ctx.debug();
        let mut functions = HostFunctions::new();

        functions.push((
            "vudo_print".to_string(),
            ctx.wrap(
                |caller: Caller<'_, SpiritState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                    let text = caller_memory(&caller)?.read_str(&caller, ptr, len)?;
                    tracing::info!(target: "vudo::spirit", "{text}");
                    Ok(())
                },
            ),
        ));

        functions.push((
            "vudo_alloc".to_string(),
            ctx.wrap(
                |mut caller: Caller<'_, SpiritState>, size: u32| -> wasmtime::Result<u32> {
                    let memory = caller_memory(&caller)?;
                    Ok(memory.alloc(&mut caller, size)?)
                },
            ),
        ));

        functions.push((
            "vudo_now".to_string(),
            ctx.wrap(|| -> i64 {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_millis() as i64)
                    .unwrap_or(0)
            }),
        ));

        functions.push((
            "vudo_random".to_string(),
            ctx.wrap(|| -> f64 { rand::random::<f64>() }),
        ));

        // Effects are acknowledged and dropped unless another Loa overrides this.
        functions.push((
            "vudo_emit_effect".to_string(),
            ctx.wrap(|effect_id: u32, payload_ptr: u32| -> i32 {
                tracing::warn!(
                    target: "vudo::spirit",
                    effect_id,
                    payload_ptr,
                    "effect emitted with no handler installed"
                );
                0
            }),
        ));

        functions.push((
            "vudo_debug".to_string(),
            ctx.wrap(
                move |caller: Caller<'_, SpiritState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                    if debug {
                        let text = caller_memory(&caller)?.read_str(&caller, ptr, len)?;
                        tracing::debug!(target: "vudo::spirit", "{text}");
                    }
                    Ok(())
                },
            ),
        ));

        functions.push((
            "vudo_abort".to_string(),
            ctx.wrap(
                |caller: Caller<'_, SpiritState>,
                 msg_ptr: u32,
                 msg_len: u32,
                 file_ptr: u32,
                 file_len: u32,
                 line: u32|
                 -> wasmtime::Result<()> {
                    let memory = caller_memory(&caller)?;
                    let abort = Abort {
                        message: memory.read_str(&caller, msg_ptr, msg_len)?,
                        file: memory.read_str(&caller, file_ptr, file_len)?,
                        line,
                    };
                    tracing::error!(target: "vudo::spirit", "{abort}");
                    Err(Error::Abort(abort).into())
                },
            ),
        ));

        Ok(functions)
    }
}

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use wasmtime::{
    AsContextMut, Config, Engine, ExportType, Extern, ExternType, Func, FuncType, Instance,
    Linker, Memory, MemoryType, Module, Store, TypedFunc, Val, ValType, WasmParams, WasmResults,
};

use crate::error::{Error, Result};
use crate::loa::{Loa, LoaContext, LoaRegistry, merge_provided};
use crate::loader::{SpiritSource, read_bytes};
use crate::memory::{DEFAULT_HEAP_BASE, DEFAULT_INITIAL_PAGES, DEFAULT_MAXIMUM_PAGES, MemoryManager};
use crate::types::SpiritState;

/// Import module every host function and the linear memory are defined under.
pub const IMPORT_NAMESPACE: &str = "env";

/// Name of the linear memory, both as an import and as an export.
pub const MEMORY_NAME: &str = "memory";

/// Linear memory limits, in 64 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryOptions {
    #[serde(default = "default_initial_pages")]
    pub initial: u32,
    #[serde(default = "default_maximum_pages")]
    pub maximum: u32,
}

fn default_initial_pages() -> u32 {
    DEFAULT_INITIAL_PAGES
}

fn default_maximum_pages() -> u32 {
    DEFAULT_MAXIMUM_PAGES
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_PAGES,
            maximum: DEFAULT_MAXIMUM_PAGES,
        }
    }
}

/// Per-load configuration.
#[derive(Clone)]
pub struct LoadOptions {
    pub memory: MemoryOptions,
    pub heap_base: u32,
    pub debug: bool,
    /// Use this registry instead of the loader's.
    pub registry: Option<LoaRegistry>,
    /// Extra Loas applied after the registry; their functions win on collision.
    pub imports: Vec<Arc<dyn Loa>>,
}

impl LoadOptions {
    pub fn with_memory(mut self, initial: u32, maximum: u32) -> Self {
        self.memory = MemoryOptions { initial, maximum };
        self
    }

    pub fn with_heap_base(mut self, heap_base: u32) -> Self {
        self.heap_base = heap_base;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_registry(mut self, registry: LoaRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_import(mut self, loa: impl Loa + 'static) -> Self {
        self.imports.push(Arc::new(loa));
        self
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            memory: MemoryOptions::default(),
            heap_base: DEFAULT_HEAP_BASE,
            debug: false,
            registry: None,
            imports: Vec::new(),
        }
    }
}

impl std::fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOptions")
            .field("memory", &self.memory)
            .field("heap_base", &self.heap_base)
            .field("debug", &self.debug)
            .field(
                "registry",
                &self
                    .registry
                    .as_ref()
                    .map(|r| r.all().map(|loa| loa.name().to_string()).collect::<Vec<_>>()),
            )
            .field(
                "imports",
                &self.imports.iter().map(|loa| loa.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Per-summon settings layered over a séance's default [`LoadOptions`].
/// Unset fields keep the default; imports are appended after the default
/// imports, so they win on collision.
#[derive(Clone, Default)]
pub struct SummonOptions {
    pub initial_pages: Option<u32>,
    pub maximum_pages: Option<u32>,
    pub heap_base: Option<u32>,
    pub debug: Option<bool>,
    pub registry: Option<LoaRegistry>,
    pub imports: Vec<Arc<dyn Loa>>,
}

impl SummonOptions {
    pub fn with_memory(mut self, initial: u32, maximum: u32) -> Self {
        self.initial_pages = Some(initial);
        self.maximum_pages = Some(maximum);
        self
    }

    pub fn with_initial_pages(mut self, initial: u32) -> Self {
        self.initial_pages = Some(initial);
        self
    }

    pub fn with_maximum_pages(mut self, maximum: u32) -> Self {
        self.maximum_pages = Some(maximum);
        self
    }

    pub fn with_heap_base(mut self, heap_base: u32) -> Self {
        self.heap_base = Some(heap_base);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn with_registry(mut self, registry: LoaRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_import(mut self, loa: impl Loa + 'static) -> Self {
        self.imports.push(Arc::new(loa));
        self
    }

    /// The options a summon actually loads with.
    pub fn apply(&self, defaults: &LoadOptions) -> LoadOptions {
        let mut options = defaults.clone();
        if let Some(initial) = self.initial_pages {
            options.memory.initial = initial;
        }
        if let Some(maximum) = self.maximum_pages {
            options.memory.maximum = maximum;
        }
        if let Some(heap_base) = self.heap_base {
            options.heap_base = heap_base;
        }
        if let Some(debug) = self.debug {
            options.debug = debug;
        }
        if let Some(registry) = &self.registry {
            options.registry = Some(registry.clone());
        }
        options.imports.extend(self.imports.iter().cloned());
        options
    }
}

impl std::fmt::Debug for SummonOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummonOptions")
            .field("initial_pages", &self.initial_pages)
            .field("maximum_pages", &self.maximum_pages)
            .field("heap_base", &self.heap_base)
            .field("debug", &self.debug)
            .field("registry", &self.registry.as_ref().map(LoaRegistry::len))
            .field("imports", &self.imports)
            .finish()
    }
}

/// Compiles and instantiates Spirits against a Loa registry.
#[derive(Clone)]
pub struct Loader {
    engine: Engine,
    registry: LoaRegistry,
}

impl Loader {
    pub fn new() -> Result<Self> {
        Self::with_registry(LoaRegistry::new())
    }

    pub fn with_registry(registry: LoaRegistry) -> Result<Self> {
        let mut config = Config::new();
        config.parallel_compilation(true);
        config.memory_init_cow(true);
        let engine = Engine::new(&config).map_err(|e| Error::Load(e.into()))?;
        Ok(Self { engine, registry })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn registry(&self) -> &LoaRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut LoaRegistry {
        &mut self.registry
    }

    /// Instantiate a Spirit from Wasm binary bytes.
    pub fn load(&self, bytes: &[u8], options: &LoadOptions) -> Result<Spirit> {
        let module = Module::from_binary(&self.engine, bytes).map_err(|e| Error::Load(e.into()))?;

        let MemoryOptions { initial, maximum } = options.memory;
        if initial > maximum {
            return Err(Error::Load(anyhow::anyhow!(
                "initial memory ({initial} pages) exceeds maximum ({maximum} pages)"
            )));
        }

        let mut store = Store::new(
            &self.engine,
            SpiritState::new(options.heap_base, options.debug),
        );
        let memory = Memory::new(&mut store, MemoryType::new(initial, Some(maximum)))
            .map_err(|e| Error::Load(e.into()))?;
        store.data_mut().memory = Some(memory);

        let registry = options.registry.as_ref().unwrap_or(&self.registry);
        let imports = {
            let mut ctx = LoaContext::new(store.as_context_mut());
            let mut imports = registry.build_imports(&mut ctx)?;
            for loa in &options.imports {
                merge_provided(loa.as_ref(), &mut ctx, &mut imports)?;
            }
            imports
        };

        let mut linker = Linker::new(&self.engine);
        linker
            .define(&store, IMPORT_NAMESPACE, MEMORY_NAME, memory)
            .map_err(|e| Error::Load(e.into()))?;
        for (name, func) in imports {
            linker
                .define(&store, IMPORT_NAMESPACE, &name, func)
                .map_err(|e| Error::Load(e.into()))?;
        }

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| Error::Load(e.into()))?;

        // A Spirit that brings its own memory is served from it.
        let memory = match instance.get_memory(&mut store, MEMORY_NAME) {
            Some(exported) => {
                store.data_mut().memory = Some(exported);
                exported
            }
            None => memory,
        };

        let spirit = Spirit {
            store,
            instance,
            module,
            manager: MemoryManager::new(memory),
        };
        tracing::debug!(
            functions = ?spirit.list_functions(),
            "loaded spirit"
        );
        Ok(spirit)
    }

    /// Retrieve bytes from `source`, then load them.
    pub async fn load_from(&self, source: &SpiritSource, options: &LoadOptions) -> Result<Spirit> {
        let bytes = read_bytes(source).await?;
        tracing::debug!(source = %source, bytes = bytes.len(), "fetched spirit");
        self.load(&bytes, options)
    }
}

/// One instantiated Spirit and the memory it owns.
pub struct Spirit {
    store: Store<SpiritState>,
    instance: Instance,
    module: Module,
    manager: MemoryManager,
}

impl Spirit {
    /// Call an exported function with raw Wasm values.
    pub fn call(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>> {
        let func = self.func(name)?;
        let ty = func.ty(&self.store);
        check_args(name, &ty, args)?;

        let mut results = vec![Val::I32(0); ty.results().len()];
        func.call(&mut self.store, args, &mut results)
            .map_err(|e| Error::from_trap(e.into()))?;
        Ok(results)
    }

    /// Call an exported function with JSON arguments converted to its
    /// parameter types. No results yield `null`, one yields the value itself,
    /// several yield an array.
    pub fn call_json(
        &mut self,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let func = self.func(name)?;
        let ty = func.ty(&self.store);
        let params: Vec<ValType> = ty.params().collect();
        if args.len() != params.len() {
            return Err(Error::Signature {
                function: name.to_string(),
                reason: format!(
                    "wrong number of args: expected {}, got {}",
                    params.len(),
                    args.len()
                ),
            });
        }
        let mut arg_vals = Vec::with_capacity(args.len());
        for (index, (json_arg, param_type)) in args.iter().zip(&params).enumerate() {
            let val = json_to_val(json_arg, param_type).map_err(|reason| Error::Signature {
                function: name.to_string(),
                reason: format!("error converting parameter {index}: {reason}"),
            })?;
            arg_vals.push(val);
        }

        let results = self.call(name, &arg_vals)?;
        Ok(match results.len() {
            0 => serde_json::Value::Null,
            1 => val_to_json(&results[0]),
            _ => serde_json::Value::Array(results.iter().map(val_to_json).collect()),
        })
    }

    /// Statically typed access to an export, checked once against its signature.
    pub fn typed<Params, Results>(&mut self, name: &str) -> Result<SpiritFunc<'_, Params, Results>>
    where
        Params: WasmParams,
        Results: WasmResults,
    {
        let func = self.func(name)?;
        let typed = func
            .typed::<Params, Results>(&self.store)
            .map_err(|e| Error::Signature {
                function: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(SpiritFunc {
            store: &mut self.store,
            func: typed,
        })
    }

    fn func(&mut self, name: &str) -> Result<Func> {
        match self.instance.get_export(&mut self.store, name) {
            Some(Extern::Func(func)) => Ok(func),
            Some(_) => Err(Error::NotCallable(name.to_string())),
            None => Err(Error::FunctionNotFound(name.to_string())),
        }
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.function_type(name).is_some()
    }

    /// Exported function names in declaration order.
    pub fn list_functions(&self) -> Vec<String> {
        self.module
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect()
    }

    pub fn function_type(&self, name: &str) -> Option<FuncType> {
        self.module
            .exports()
            .find(|export| export.name() == name)
            .and_then(|export| export.ty().func().cloned())
    }

    /// `main` if exported, otherwise the first exported function.
    pub fn default_entry(&self) -> Option<String> {
        if self.has_function("main") {
            return Some("main".to_string());
        }
        self.list_functions().into_iter().next()
    }

    /// The raw export table.
    pub fn exports(&self) -> impl ExactSizeIterator<Item = ExportType<'_>> {
        self.module.exports()
    }

    /// Look up any export by name.
    pub fn export(&mut self, name: &str) -> Option<Extern> {
        self.instance.get_export(&mut self.store, name)
    }

    pub fn memory_manager(&self) -> MemoryManager {
        self.manager
    }

    /// The Spirit's memory-of-record.
    pub fn memory(&self) -> Memory {
        self.manager.memory()
    }

    pub fn store(&self) -> &Store<SpiritState> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<SpiritState> {
        &mut self.store
    }

    /// Encode `s` into the Spirit's memory, returning its address.
    pub fn write_string(&mut self, s: &str) -> Result<u32> {
        self.manager.encode_string(&mut self.store, s)
    }

    pub fn read_string(&self, address: u32) -> Result<String> {
        self.manager.decode_string(&self.store, address)
    }

    pub fn reset_memory(&mut self) {
        self.manager.reset(&mut self.store);
    }

    /// Reset memory and drop the instance.
    pub fn release(mut self) {
        self.reset_memory();
    }
}

impl std::fmt::Debug for Spirit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spirit")
            .field("functions", &self.list_functions())
            .field("allocator", self.store.data().allocator())
            .finish()
    }
}

/// A typed export bound to its Spirit's store.
pub struct SpiritFunc<'a, Params, Results> {
    store: &'a mut Store<SpiritState>,
    func: TypedFunc<Params, Results>,
}

impl<Params, Results> SpiritFunc<'_, Params, Results>
where
    Params: WasmParams,
    Results: WasmResults,
{
    pub fn call(&mut self, params: Params) -> Result<Results> {
        self.func
            .call(&mut *self.store, params)
            .map_err(|e| Error::from_trap(e.into()))
    }
}

fn check_args(name: &str, ty: &FuncType, args: &[Val]) -> Result<()> {
    let params: Vec<ValType> = ty.params().collect();
    if args.len() != params.len() {
        return Err(Error::Signature {
            function: name.to_string(),
            reason: format!(
                "wrong number of args: expected {}, got {}",
                params.len(),
                args.len()
            ),
        });
    }
    for (index, (arg, param)) in args.iter().zip(&params).enumerate() {
        let matches = match param {
            ValType::I32 => matches!(arg, Val::I32(_)),
            ValType::I64 => matches!(arg, Val::I64(_)),
            ValType::F32 => matches!(arg, Val::F32(_)),
            ValType::F64 => matches!(arg, Val::F64(_)),
            _ => true,
        };
        if !matches {
            return Err(Error::Signature {
                function: name.to_string(),
                reason: format!("parameter {index} expects {param}, got {arg:?}"),
            });
        }
    }
    Ok(())
}

fn json_to_val(json_value: &serde_json::Value, val_type: &ValType) -> Result<Val, String> {
    match (json_value, val_type) {
        (serde_json::Value::Bool(b), ValType::I32) => Ok(Val::I32(i32::from(*b))),
        (serde_json::Value::Number(n), ValType::I32) => {
            let val = n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| format!("Invalid number for i32: {n}"))?;
            Ok(Val::I32(val))
        }
        (serde_json::Value::Number(n), ValType::I64) => {
            let val = n
                .as_i64()
                .ok_or_else(|| format!("Invalid number for i64: {n}"))?;
            Ok(Val::I64(val))
        }
        (serde_json::Value::Number(n), ValType::F32) => {
            let val = n
                .as_f64()
                .ok_or_else(|| format!("Invalid number for f32: {n}"))? as f32;
            Ok(Val::F32(val.to_bits()))
        }
        (serde_json::Value::Number(n), ValType::F64) => {
            let val = n
                .as_f64()
                .ok_or_else(|| format!("Invalid number for f64: {n}"))?;
            Ok(Val::F64(val.to_bits()))
        }
        _ => Err(format!(
            "Type mismatch: cannot convert JSON {json_value} to Wasm type {val_type}"
        )),
    }
}

fn val_to_json(val: &Val) -> serde_json::Value {
    match val {
        Val::I32(n) => serde_json::Value::Number((*n).into()),
        Val::I64(n) => serde_json::Value::Number((*n).into()),
        Val::F32(bits) => serde_json::Number::from_f64(f32::from_bits(*bits) as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Val::F64(bits) => serde_json::Number::from_f64(f64::from_bits(*bits))
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

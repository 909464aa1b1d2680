//! Core type definitions shared across the crate.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use wasmtime::Memory;

use crate::error::{Error, Result};
use crate::memory::Allocator;

/// State carried by the store of every Spirit.
///
/// Host functions reach the Spirit's memory-of-record and allocator cursor
/// through this state, never through captured handles, so a Spirit that
/// exports its own memory is served from that memory once instantiated.
pub struct SpiritState {
    pub(crate) memory: Option<Memory>,
    pub(crate) allocator: Allocator,
    pub(crate) debug: bool,
    pub(crate) extensions: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl SpiritState {
    pub(crate) fn new(heap_base: u32, debug: bool) -> Self {
        Self {
            memory: None,
            allocator: Allocator::new(heap_base),
            debug,
            extensions: HashMap::new(),
        }
    }

    /// The linear memory host functions operate on.
    pub fn memory(&self) -> Result<Memory> {
        self.memory
            .ok_or_else(|| Error::Load(anyhow::anyhow!("spirit has no linear memory attached")))
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Get a reference to an extension by type.
    pub fn get_extension<T: 'static + Send>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Get a mutable reference to an extension by type.
    pub fn get_extension_mut<T: 'static + Send>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
    }

    /// Set an extension value by type.
    pub fn set_extension<T: 'static + Send>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }
}

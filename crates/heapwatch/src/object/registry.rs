//! Type Registry - Known method tables
//!
//! A method table word is only well formed if it was registered here.
//! Each registered type is kept alive by the registry, and the address of
//! its `TypeInfo` serves as the method table pointer stored in objects.

use super::{align_object, MethodIdentity, HEADER_SIZE, MIN_OBJECT_SIZE, WORD};
use crate::error::{HeapWatchError, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Method table pointer value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodTable(usize);

impl MethodTable {
    #[inline]
    pub fn address(self) -> usize {
        self.0
    }
}

/// Layout description for one managed type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Fully qualified type name
    pub name: String,
    /// Fixed part of the object size including the header word
    pub base_size: usize,
    /// Bytes per element for array-like types, 0 otherwise
    pub component_size: usize,
    /// Offsets (from the object address) of reference fields
    pub ref_offsets: Vec<usize>,
    /// Array elements are references
    pub component_is_ref: bool,
    /// Invoke method when the type is a delegate
    pub invoke_method: Option<MethodIdentity>,
}

impl TypeInfo {
    /// Plain object type
    pub fn new(name: impl Into<String>, base_size: usize) -> Self {
        Self {
            name: name.into(),
            base_size,
            component_size: 0,
            ref_offsets: Vec::new(),
            component_is_ref: false,
            invoke_method: None,
        }
    }

    /// Plain object with `words` payload words, the listed ones being references
    pub fn with_fields(name: impl Into<String>, words: usize, ref_fields: &[usize]) -> Self {
        let mut info = Self::new(name, HEADER_SIZE + WORD + words.max(1) * WORD);
        info.ref_offsets = ref_fields.iter().map(|i| WORD + i * WORD).collect();
        info
    }

    /// Array of `component_size`-byte elements
    pub fn array(name: impl Into<String>, component_size: usize) -> Self {
        let mut info = Self::new(name, HEADER_SIZE + 2 * WORD);
        info.component_size = component_size;
        info
    }

    /// Array of references
    pub fn reference_array(name: impl Into<String>) -> Self {
        let mut info = Self::array(name, WORD);
        info.component_is_ref = true;
        info
    }

    /// Mark as a delegate type with the given invoke method
    pub fn delegate(mut self, invoke: MethodIdentity) -> Self {
        self.invoke_method = Some(invoke);
        self
    }

    /// Array-like types carry a length word
    #[inline]
    pub fn is_array(&self) -> bool {
        self.component_size != 0
    }

    /// Object size for the given element count
    pub fn object_size(&self, length: usize) -> Option<usize> {
        let payload = self.component_size.checked_mul(length)?;
        align_object(self.base_size.checked_add(payload)?)
    }

    /// Offset of the first array element
    #[inline]
    pub fn first_element_offset(&self) -> usize {
        2 * WORD
    }

    fn check_layout(&self) -> Result<()> {
        if self.base_size < MIN_OBJECT_SIZE || self.base_size % WORD != 0 {
            return Err(HeapWatchError::InvalidArgument(format!(
                "type {} has invalid base size {}",
                self.name, self.base_size
            )));
        }
        for &offset in &self.ref_offsets {
            if offset < WORD || offset % WORD != 0 || offset + WORD > self.base_size - HEADER_SIZE {
                return Err(HeapWatchError::InvalidArgument(format!(
                    "type {} has reference field at invalid offset {}",
                    self.name, offset
                )));
            }
        }
        if self.component_is_ref && self.component_size != WORD {
            return Err(HeapWatchError::InvalidArgument(format!(
                "type {} has reference elements of size {}",
                self.name, self.component_size
            )));
        }
        Ok(())
    }
}

/// TypeRegistry - set of well-formed method tables
pub struct TypeRegistry {
    types: RwLock<IndexMap<usize, Arc<TypeInfo>>>,
    free: MethodTable,
}

impl TypeRegistry {
    /// Create a registry holding only the free-object type
    pub fn new() -> Self {
        let free_info = Arc::new(TypeInfo::array("Free", 1));
        let free = MethodTable(Arc::as_ptr(&free_info) as usize);

        let mut types = IndexMap::new();
        types.insert(free.0, free_info);

        Self {
            types: RwLock::new(types),
            free,
        }
    }

    /// Register a type and return its method table pointer
    pub fn register(&self, info: TypeInfo) -> Result<MethodTable> {
        info.check_layout()?;
        let info = Arc::new(info);
        let mt = MethodTable(Arc::as_ptr(&info) as usize);
        self.types.write().insert(mt.0, info);
        Ok(mt)
    }

    /// Look up a method table word
    pub fn lookup(&self, mt: usize) -> Option<Arc<TypeInfo>> {
        self.types.read().get(&mt).cloned()
    }

    /// Is this word a registered method table
    pub fn contains(&self, mt: usize) -> bool {
        self.types.read().contains_key(&mt)
    }

    /// Typed handle for a registered method table word
    pub fn method_table(&self, mt: usize) -> Option<MethodTable> {
        self.contains(mt).then_some(MethodTable(mt))
    }

    /// Method table used to fill free space
    #[inline]
    pub fn free_method_table(&self) -> MethodTable {
        self.free
    }

    #[inline]
    pub fn is_free(&self, mt: usize) -> bool {
        mt == self.free.0
    }

    /// Registered type count, including the free type
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

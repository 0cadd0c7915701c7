//! Object Validation - Structural checks on one object
//!
//! Checks, in order:
//! 1. Non-null, aligned, header and method table inside the heap
//! 2. Method table non-null, registered, not the free marker
//! 3. Size computable, at least the minimum, inside the allocated range
//! 4. Deep: every reference slot is null or points at an object with a
//!    registered method table
//! 5. Sync block: an index in the header is nonzero and below capacity

use super::{HeapInspector, ValidationError};
use crate::object::{
    ObjectRef, TypeInfo, BIT_SBLK_IS_HASHCODE, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX,
    MIN_OBJECT_SIZE, OBJECT_ALIGNMENT, SYNCBLOCK_INDEX_MASK, WORD,
};

/// Which checks to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidateOptions {
    /// Check reference slots
    pub deep: bool,
    /// Check the header's sync block index
    pub verify_sync_block: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            deep: true,
            verify_sync_block: true,
        }
    }
}

/// ObjectValidator - validates objects against a heap
pub struct ObjectValidator<'a> {
    inspector: &'a dyn HeapInspector,
}

impl<'a> ObjectValidator<'a> {
    pub fn new(inspector: &'a dyn HeapInspector) -> Self {
        Self { inspector }
    }

    /// Validate the object at `addr`
    pub fn validate(&self, addr: usize, options: ValidateOptions) -> Result<(), ValidationError> {
        let obj = self.locate(addr)?;
        // SAFETY: `locate` checked the method table word is readable.
        let mt = unsafe { obj.load_method_table() };
        self.validate_with_method_table(obj, mt, options)
    }

    /// Check that the header and method table words of `addr` are readable
    pub fn locate(&self, addr: usize) -> Result<ObjectRef, ValidationError> {
        let obj = ObjectRef::new(addr).ok_or(ValidationError::NullObject)?;
        if addr % OBJECT_ALIGNMENT != 0 {
            return Err(ValidationError::Misaligned(addr));
        }
        if !self.inspector.is_heap_pointer(obj.allocation_start())
            || !self.inspector.is_heap_pointer(addr)
        {
            return Err(ValidationError::OutsideHeap(addr));
        }

        let allocated_end = self
            .inspector
            .allocated_end(obj)
            .ok_or(ValidationError::OutsideHeap(addr))?;
        let min_end = obj.allocation_start() + MIN_OBJECT_SIZE;
        if min_end > allocated_end {
            return Err(ValidationError::ExtendsPastSegment {
                object: addr,
                end: min_end,
                allocated_end,
            });
        }
        Ok(obj)
    }

    /// Validate `obj` using a method table word the caller already read
    ///
    /// `obj` must have come from [`ObjectValidator::locate`] or from the
    /// inspector.
    pub fn validate_with_method_table(
        &self,
        obj: ObjectRef,
        mt: usize,
        options: ValidateOptions,
    ) -> Result<(), ValidationError> {
        let addr = obj.address();
        let registry = self.inspector.type_registry();

        if mt == 0 {
            return Err(ValidationError::NullMethodTable(addr));
        }
        if registry.is_free(mt) {
            return Err(ValidationError::FreeObject(addr));
        }
        let info = registry
            .lookup(mt)
            .ok_or(ValidationError::UnknownMethodTable {
                object: addr,
                method_table: mt,
            })?;

        // SAFETY: the length word lies within the minimum object size.
        let length = if info.is_array() {
            unsafe { obj.load_length() }
        } else {
            0
        };
        let size = info
            .object_size(length)
            .filter(|&size| size >= MIN_OBJECT_SIZE)
            .ok_or(ValidationError::BadSize {
                object: addr,
                size: None,
            })?;

        let allocated_end = self
            .inspector
            .allocated_end(obj)
            .ok_or(ValidationError::OutsideHeap(addr))?;
        let end = obj
            .allocation_start()
            .checked_add(size)
            .ok_or(ValidationError::BadSize {
                object: addr,
                size: Some(size),
            })?;
        if end > allocated_end {
            return Err(ValidationError::ExtendsPastSegment {
                object: addr,
                end,
                allocated_end,
            });
        }

        if options.deep {
            self.validate_references(obj, &info, length)?;
        }

        if options.verify_sync_block {
            self.validate_sync_block(obj)?;
        }

        Ok(())
    }

    fn validate_references(
        &self,
        obj: ObjectRef,
        info: &TypeInfo,
        length: usize,
    ) -> Result<(), ValidationError> {
        for &offset in &info.ref_offsets {
            self.validate_reference(obj, offset)?;
        }
        if info.component_is_ref {
            let first = info.first_element_offset();
            for i in 0..length {
                self.validate_reference(obj, first + i * WORD)?;
            }
        }
        Ok(())
    }

    fn validate_reference(&self, obj: ObjectRef, offset: usize) -> Result<(), ValidationError> {
        // SAFETY: `offset` lies inside the object, which lies inside the
        // allocated range.
        let value = unsafe { obj.load_word(offset) };
        if value == 0 {
            return Ok(());
        }

        let bad = ValidationError::BadReference {
            object: obj.address(),
            offset,
            value,
        };
        if value % OBJECT_ALIGNMENT != 0 || !self.inspector.is_heap_pointer(value) {
            return Err(bad);
        }
        let target = ObjectRef::new(value).ok_or(bad.clone())?;
        // SAFETY: heap pointers are readable and `value` is aligned.
        let mt = unsafe { target.load_method_table() };
        let registry = self.inspector.type_registry();
        if mt == 0 || registry.is_free(mt) || !registry.contains(mt) {
            return Err(bad);
        }
        Ok(())
    }

    fn validate_sync_block(&self, obj: ObjectRef) -> Result<(), ValidationError> {
        // SAFETY: the header word precedes a located object.
        let header = unsafe { obj.load_header() };
        if header & BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX == 0 || header & BIT_SBLK_IS_HASHCODE != 0 {
            return Ok(());
        }

        let index = header & SYNCBLOCK_INDEX_MASK;
        if index == 0 || index >= self.inspector.sync_block_capacity() {
            return Err(ValidationError::BadSyncBlock {
                object: obj.address(),
                header,
            });
        }
        Ok(())
    }
}

/// Size of a well-formed object, `None` if it cannot be computed
pub fn object_size(inspector: &dyn HeapInspector, addr: usize) -> Option<usize> {
    let obj = ObjectValidator::new(inspector).locate(addr).ok()?;
    // SAFETY: `locate` checked the method table and length words are readable.
    let mt = unsafe { obj.load_method_table() };
    let info = inspector.type_registry().lookup(mt)?;
    let length = if info.is_array() {
        unsafe { obj.load_length() }
    } else {
        0
    };
    info.object_size(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapSegment;
    use crate::object::{MethodTable, TypeInfo, TypeRegistry};
    use std::sync::Arc;

    struct Fixture {
        seg: HeapSegment,
        node: MethodTable,
        refs: MethodTable,
    }

    fn fixture() -> Fixture {
        let types = Arc::new(TypeRegistry::new());
        let node = types
            .register(TypeInfo::with_fields("App.Node", 2, &[0]))
            .unwrap();
        let refs = types
            .register(TypeInfo::reference_array("System.Object[]"))
            .unwrap();
        let seg = HeapSegment::new(64 * 1024, types).unwrap();
        seg.set_sync_block_capacity(16);
        Fixture { seg, node, refs }
    }

    fn deep() -> ValidateOptions {
        ValidateOptions::default()
    }

    #[test]
    fn test_valid_objects_pass() {
        let fx = fixture();
        let a = fx.seg.allocate(fx.node, 0).unwrap();
        let arr = fx.seg.allocate(fx.refs, 4).unwrap();
        fx.seg.write_word(a.address() + WORD, arr.address()).unwrap();
        fx.seg.write_word(arr.address() + 2 * WORD, a.address()).unwrap();

        let validator = ObjectValidator::new(&fx.seg);
        assert_eq!(validator.validate(a.address(), deep()), Ok(()));
        assert_eq!(validator.validate(arr.address(), deep()), Ok(()));
        assert_eq!(object_size(&fx.seg, arr.address()), Some(56));
    }

    #[test]
    fn test_basic_rejections() {
        let fx = fixture();
        let a = fx.seg.allocate(fx.node, 0).unwrap();
        let validator = ObjectValidator::new(&fx.seg);

        assert_eq!(validator.validate(0, deep()), Err(ValidationError::NullObject));
        assert_eq!(
            validator.validate(a.address() + 1, deep()),
            Err(ValidationError::Misaligned(a.address() + 1))
        );
        assert_eq!(
            validator.validate(fx.seg.base(), deep()),
            Err(ValidationError::OutsideHeap(fx.seg.base()))
        );
    }

    #[test]
    fn test_corrupted_method_table() {
        let fx = fixture();
        let a = fx.seg.allocate(fx.node, 0).unwrap();
        fx.seg.write_word(a.address(), 0xbad0).unwrap();

        let result = ObjectValidator::new(&fx.seg).validate(a.address(), deep());
        assert_eq!(
            result,
            Err(ValidationError::UnknownMethodTable {
                object: a.address(),
                method_table: 0xbad0
            })
        );
    }

    #[test]
    fn test_free_object_rejected() {
        let fx = fixture();
        let a = fx.seg.allocate(fx.node, 0).unwrap();
        fx.seg.make_free(a).unwrap();
        assert_eq!(
            ObjectValidator::new(&fx.seg).validate(a.address(), deep()),
            Err(ValidationError::FreeObject(a.address()))
        );
    }

    #[test]
    fn test_oversized_array() {
        let fx = fixture();
        let arr = fx.seg.allocate(fx.refs, 1).unwrap();
        fx.seg.write_word(arr.address() + WORD, 1 << 20).unwrap();
        assert!(matches!(
            ObjectValidator::new(&fx.seg).validate(arr.address(), deep()),
            Err(ValidationError::ExtendsPastSegment { .. })
        ));
    }

    #[test]
    fn test_dangling_reference() {
        let fx = fixture();
        let a = fx.seg.allocate(fx.node, 0).unwrap();
        fx.seg.write_word(a.address() + WORD, 0x10).unwrap();

        let validator = ObjectValidator::new(&fx.seg);
        assert_eq!(
            validator.validate(a.address(), deep()),
            Err(ValidationError::BadReference {
                object: a.address(),
                offset: WORD,
                value: 0x10
            })
        );

        let shallow = ValidateOptions {
            deep: false,
            ..deep()
        };
        assert_eq!(validator.validate(a.address(), shallow), Ok(()));
    }

    #[test]
    fn test_sync_block_index() {
        let fx = fixture();
        let a = fx.seg.allocate(fx.node, 0).unwrap();
        let validator = ObjectValidator::new(&fx.seg);

        fx.seg
            .set_header(a, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX | 3)
            .unwrap();
        assert_eq!(validator.validate(a.address(), deep()), Ok(()));

        fx.seg
            .set_header(a, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX | 99)
            .unwrap();
        assert!(matches!(
            validator.validate(a.address(), deep()),
            Err(ValidationError::BadSyncBlock { .. })
        ));

        // Hash codes carry no index
        fx.seg
            .set_header(a, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX | BIT_SBLK_IS_HASHCODE | 99)
            .unwrap();
        assert_eq!(validator.validate(a.address(), deep()), Ok(()));

        let no_sync = ValidateOptions {
            verify_sync_block: false,
            ..deep()
        };
        fx.seg
            .set_header(a, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX)
            .unwrap();
        assert_eq!(validator.validate(a.address(), no_sync), Ok(()));
    }
}

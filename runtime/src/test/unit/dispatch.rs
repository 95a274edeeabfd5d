use std::sync::Arc;

use kscript_device::{Allocation, DataType, Element, Extent, ObjectKind, ObjectRef};

use crate::dispatch::{ScriptScope, current_allocation_for_pointer, with_current_script};
use crate::symbols::RootEntry;
use crate::test::helpers::{BUMP, HANDLE, TABLE, counter, image_script};

fn current_name() -> Option<String> {
    with_current_script(|script| script.map(|s| s.name().to_string()))
}

#[test]
fn test_no_current_script_outside_invocations() {
    assert_eq!(current_name(), None);
    assert!(current_allocation_for_pointer(std::ptr::null()).is_none());
}

#[test]
fn test_scope_nests_and_restores() {
    let (outer, _) = image_script();
    let (inner, _) = image_script();
    {
        let _a = ScriptScope::enter(&outer);
        assert!(with_current_script(|s| s.is_some_and(|s| std::ptr::eq(s, &outer))));
        {
            let _b = ScriptScope::enter(&inner);
            assert!(with_current_script(|s| s.is_some_and(|s| std::ptr::eq(s, &inner))));
        }
        assert!(with_current_script(|s| s.is_some_and(|s| std::ptr::eq(s, &outer))));
    }
    assert_eq!(current_name(), None);
}

#[test]
fn test_scope_restored_on_unwind() {
    let (script, _) = image_script();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _scope = ScriptScope::enter(&script);
        panic!("kernel support failed");
    }));
    assert!(result.is_err());
    assert_eq!(current_name(), None);
}

#[test]
fn test_init_root_and_function() {
    let (script, _) = image_script();
    assert_eq!(script.invoke_root(), Some(0));

    script.invoke_init();
    assert_eq!(counter(&script), 1);

    unsafe { script.invoke_function(BUMP, &41i32.to_ne_bytes()) };
    assert_eq!(script.invoke_root(), Some(42));
    assert_eq!(current_name(), None);
}

#[test]
#[should_panic]
fn test_function_slot_out_of_range_panics() {
    let (script, _) = image_script();
    unsafe { script.invoke_function(1, &[]) };
}

#[test]
fn test_free_children_runs_script_destructor() {
    let (mut script, _) = image_script();
    let object = ObjectRef::new(ObjectKind::Script, "child");
    script.set_variable_object(HANDLE, Some(&object));
    assert_eq!(object.ref_count(), 2);

    script.invoke_free_children();
    assert_eq!(object.ref_count(), 1);
}

#[test]
fn test_current_allocation_lookup_during_invocation() {
    let (mut script, _) = image_script();
    let alloc = Allocation::new(Element::primitive(DataType::UInt8), Extent::d1(8)).unwrap();
    script.set_variable_bound_buffer(TABLE, Some(alloc.clone()));

    assert!(current_allocation_for_pointer(alloc.raw_ptr()).is_none());
    let _scope = ScriptScope::enter(&script);
    let found = current_allocation_for_pointer(alloc.raw_ptr()).unwrap();
    assert!(Arc::ptr_eq(&found, &alloc));
}

#[test]
fn test_info_reports_exports() {
    let (script, _) = image_script();
    let info = script.info();

    assert_eq!(info.exported_variable_count, 5);
    assert_eq!(info.exported_function_count, 1);
    assert_eq!(info.exported_kernel_count, 3);
    assert_eq!(info.object_slot_count, 1);
    assert!(info.pragmas.is_empty());
    assert!(matches!(info.root, Some(RootEntry::Plain(_))));
}

use std::sync::Arc;

use test_case::test_case;

use kscript_device::{Allocation, DataType, Element, Extent, ObjectKind, ObjectRef, ScriptObject};

use crate::dispatcher::SerialDispatcher;
use crate::error::Error;
use crate::loader::ModuleImage;
use crate::sink::ErrorKind;
use crate::test::helpers::{COUNTER, GAIN, HANDLE, OPTIMIZED_AWAY, TABLE, counter, driver_with, image_script, set_gain};

fn handle_bytes(objects: &[&ObjectRef]) -> Vec<u8> {
    objects.iter().flat_map(|o| (o.as_ptr() as usize).to_ne_bytes()).collect()
}

#[test]
fn test_set_and_get_variable() {
    let (mut script, _) = image_script();
    set_gain(&mut script, 2.5);

    let mut out = [0u8; 4];
    unsafe { script.get_variable(GAIN, &mut out) };
    assert_eq!(f32::from_ne_bytes(out), 2.5);
}

#[test]
fn test_optimized_away_slot_is_noop() {
    let (mut script, sink) = image_script();
    assert!(script.variable_address(OPTIMIZED_AWAY).is_null());

    unsafe { script.set_variable(OPTIMIZED_AWAY, &[1, 2, 3, 4]) };
    let mut out = [9u8; 4];
    unsafe { script.get_variable(OPTIMIZED_AWAY, &mut out) };
    assert_eq!(out, [9; 4]);

    let element = Element::primitive(DataType::Int32);
    unsafe { script.set_variable_with_element(OPTIMIZED_AWAY, &[0; 4], &element, &[1]) }.unwrap();
    script.set_variable_object(OPTIMIZED_AWAY, None);
    assert!(sink.reports().is_empty());
}

#[test]
#[should_panic(expected = "out of range")]
fn test_slot_out_of_range_panics() {
    let (mut script, _) = image_script();
    unsafe { script.set_variable(99, &[0; 4]) };
}

#[test]
fn test_set_variable_object_transfers_reference() {
    let (mut script, _) = image_script();
    let a = ObjectRef::new(ObjectKind::Sampler, "a");
    let b = ObjectRef::new(ObjectKind::Sampler, "b");

    script.set_variable_object(HANDLE, Some(&a));
    assert_eq!(a.ref_count(), 2);
    let slot = script.variable_address(HANDLE).cast::<*const ScriptObject>();
    assert_eq!(unsafe { slot.read_unaligned() }, a.as_ptr());

    script.set_variable_object(HANDLE, Some(&b));
    assert_eq!(a.ref_count(), 1);
    assert_eq!(b.ref_count(), 2);

    script.set_variable_object(HANDLE, None);
    assert_eq!(b.ref_count(), 1);
}

#[test]
fn test_set_variable_object_on_plain_slot_is_rejected() {
    let (mut script, sink) = image_script();
    let a = ObjectRef::new(ObjectKind::Element, "a");

    script.set_variable_object(GAIN, Some(&a));

    assert_eq!(a.ref_count(), 1);
    assert_eq!(sink.reports()[0].0, ErrorKind::BadValue);
}

#[test]
fn test_teardown_releases_object_slots() {
    let a = ObjectRef::new(ObjectKind::Allocation, "held");
    {
        let (mut script, _) = image_script();
        script.set_variable_object(HANDLE, Some(&a));
        assert_eq!(a.ref_count(), 2);
    }
    assert_eq!(a.ref_count(), 1);
}

#[test]
fn test_set_variable_with_element_counts_references() {
    let (mut script, _) = image_script();
    let element = Element::primitive(DataType::Object(ObjectKind::Element));
    let a = ObjectRef::new(ObjectKind::Element, "a");
    let b = ObjectRef::new(ObjectKind::Element, "b");

    unsafe { script.set_variable_with_element(HANDLE, &handle_bytes(&[&a]), &element, &[1]) }.unwrap();
    assert_eq!(a.ref_count(), 2);

    unsafe { script.set_variable_with_element(HANDLE, &handle_bytes(&[&b]), &element, &[1]) }.unwrap();
    assert_eq!(a.ref_count(), 1);
    assert_eq!(b.ref_count(), 2);

    drop(script);
    assert_eq!(b.ref_count(), 1);
}

#[test]
fn test_self_overwrite_keeps_counts() {
    let (mut script, _) = image_script();
    let element = Element::primitive(DataType::Object(ObjectKind::Element));
    let a = ObjectRef::new(ObjectKind::Element, "a");
    let bytes = handle_bytes(&[&a]);

    unsafe { script.set_variable_with_element(HANDLE, &bytes, &element, &[1]) }.unwrap();
    let before = a.ref_count();

    // Read the slot's own contents back and write them again.
    let mut current = [0u8; 8];
    unsafe { script.get_variable(HANDLE, &mut current) };
    unsafe { script.set_variable_with_element(HANDLE, &current, &element, &[1]) }.unwrap();

    assert_eq!(a.ref_count(), before);
    assert_eq!(a.label(), "a");
}

#[test]
fn test_struct_array_released_on_teardown() {
    // Two entries of { int32 id; object obj; } spanning 32 bytes.
    let element = Element::structure([
        ("id", Element::primitive(DataType::Int32), 1),
        ("obj", Element::primitive(DataType::Object(ObjectKind::Type)), 1),
    ]);
    let a = ObjectRef::new(ObjectKind::Type, "a");
    let b = ObjectRef::new(ObjectKind::Type, "b");

    let mut bytes = vec![0u8; element.size_bytes() * 2];
    let obj_offset = element.fields()[1].offset;
    bytes[obj_offset..obj_offset + 8].copy_from_slice(&handle_bytes(&[&a]));
    let second = element.size_bytes() + obj_offset;
    bytes[second..second + 8].copy_from_slice(&handle_bytes(&[&b]));

    let (driver, _) = driver_with(Arc::new(SerialDispatcher));
    let meta = "exportVarCount: 1\nrecords\nexportFuncCount: 0\nexportForEachCount: 0\nobjectSlotCount: 0\n";
    let image = ModuleImage::new(meta).with_variable("records", bytes.len());

    let mut script = unsafe { driver.create_script_from_image("records", image) }.unwrap();
    unsafe { script.set_variable_with_element(0, &bytes, &element, &[2]) }.unwrap();
    assert_eq!(a.ref_count(), 2);
    assert_eq!(b.ref_count(), 2);

    drop(script);
    assert_eq!(a.ref_count(), 1);
    assert_eq!(b.ref_count(), 1);
}

#[test_case(&[] ; "no dims")]
#[test_case(&[1, 1] ; "two dims")]
fn test_with_element_rejects_dimensionality(dims: &[usize]) {
    let (mut script, _) = image_script();
    let element = Element::primitive(DataType::Int32);
    let err = unsafe { script.set_variable_with_element(COUNTER, &[0; 4], &element, dims) }.unwrap_err();
    assert!(matches!(err, Error::UnsupportedDimensionality { dims: n } if n == dims.len()));
}

#[test]
fn test_with_element_rejects_short_data() {
    let (mut script, _) = image_script();
    let element = Element::primitive(DataType::Int32);
    let err = unsafe { script.set_variable_with_element(COUNTER, &[0; 4], &element, &[2]) }.unwrap_err();
    assert!(matches!(err, Error::TransferSize { expected: 8, actual: 4 }));
    assert_eq!(counter(&script), 0);
}

#[test]
fn test_bound_buffer_and_pointer_lookup() {
    let (mut script, _) = image_script();
    let alloc = Allocation::new(Element::primitive(DataType::Float32), Extent::d1(16)).unwrap();

    script.set_variable_bound_buffer(TABLE, Some(alloc.clone()));
    let slot = script.variable_address(TABLE).cast::<*mut u8>();
    assert_eq!(unsafe { slot.read_unaligned() }, alloc.raw_ptr());

    let found = script.allocation_for_pointer(alloc.raw_ptr()).unwrap();
    assert!(Arc::ptr_eq(&found, &alloc));
    assert!(script.allocation_for_pointer(std::ptr::null()).is_none());

    script.set_variable_bound_buffer(TABLE, None);
    assert!(unsafe { slot.read_unaligned() }.is_null());
    assert!(script.allocation_for_pointer(alloc.raw_ptr()).is_none());
}

#[test]
#[tracing_test::traced_test]
fn test_unknown_pointer_is_logged() {
    let (script, _) = image_script();
    let stray = [0u8; 4];
    assert!(script.allocation_for_pointer(stray.as_ptr()).is_none());
    assert!(logs_contain("no bound allocation for pointer"));
}

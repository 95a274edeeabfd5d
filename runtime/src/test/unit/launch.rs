use std::sync::Arc;

use kscript_device::{Allocation, DataType, Element, Extent};
use test_case::test_case;

use crate::dispatcher::{RayonDispatcher, SerialDispatcher};
use crate::launch::{BufferBinding, Domain, ScriptCall};
use crate::sink::ErrorKind;
use crate::symbols::SignatureFlag;
use crate::test::helpers::{FILL_KERNEL, ROOT_KERNEL, SCALE_KERNEL, counter, driver_with, image, image_script, set_gain};

fn ints(extent: Extent) -> Arc<Allocation> {
    Allocation::new(Element::primitive(DataType::Int32), extent).unwrap()
}

fn floats(extent: Extent) -> Arc<Allocation> {
    Allocation::new(Element::primitive(DataType::Float32), extent).unwrap()
}

fn expected_fill(extent: Extent) -> Vec<i32> {
    let [cx, cy, cz] = extent.cells();
    let mut values = Vec::new();
    for z in 0..cz {
        for y in 0..cy {
            for x in 0..cx {
                values.push((x + 1000 * y + 1_000_000 * z) as i32);
            }
        }
    }
    values
}

#[test_case([7, 0, 0], [7, 1, 1] ; "one dimensional")]
#[test_case([4, 3, 0], [4, 3, 1] ; "two dimensional")]
#[test_case([2, 2, 2], [2, 2, 2] ; "three dimensional")]
#[test_case([0, 0, 0], [1, 1, 1] ; "rank zero")]
fn test_unrestricted_domain(dims: [u32; 3], end: [u32; 3]) {
    let domain = Domain::compute(dims, None);
    assert_eq!(domain.start, [0; 3]);
    assert_eq!(domain.end, end);
}

#[test]
fn test_call_with_zero_ends_is_unrestricted() {
    let call = ScriptCall { x_start: 3, y_start: 5, ..Default::default() };
    assert_eq!(Domain::compute([8, 4, 0], Some(&call)), Domain::compute([8, 4, 0], None));
}

#[test]
fn test_sub_region_domain() {
    let call = ScriptCall::default().x(2, 6).y(1, 3);
    let domain = Domain::compute([8, 4, 0], Some(&call));
    assert_eq!(domain.start, [2, 1, 0]);
    assert_eq!(domain.end, [6, 3, 1]);
    assert_eq!(domain.rows(), 2);
    assert_eq!(domain.row(0), (1, 0));
    assert_eq!(domain.row(1), (2, 0));
}

#[test]
fn test_row_count_beyond_u32() {
    let domain = Domain::compute([1, 65536, 65537], None);
    let rows = domain.rows();
    assert_eq!(rows, 65536 * 65537);
    assert!(rows > u64::from(u32::MAX));
    assert_eq!(domain.row(65536), (0, 1));
    assert_eq!(domain.row(rows - 1), (65535, 65536));
}

#[test_case(ScriptCall::default().x(5, 5) ; "empty x")]
#[test_case(ScriptCall::default().x(6, 2) ; "inverted x")]
#[test_case(ScriptCall::default().x(9, 12) ; "x beyond extent")]
#[test_case(ScriptCall::default().y(4, 9) ; "y clamped to nothing")]
#[test_case(ScriptCall::default().z(0, 1) ; "absent z restricted")]
fn test_empty_domain(call: ScriptCall) {
    let domain = Domain::compute([8, 4, 0], Some(&call));
    assert!(domain.is_empty());
    assert_eq!(domain.rows(), 0);
}

#[test]
fn test_fill_covers_whole_extent() {
    let (script, sink) = image_script();
    let extent = Extent::new(5, 3, 2);
    let out = ints(extent);

    script.invoke_for_each(FILL_KERNEL, None, Some(&*out), &[], None);

    assert_eq!(out.read_cells::<i32>().unwrap(), expected_fill(extent));
    assert_eq!(counter(&script), 6, "one kernel call per row");
    assert!(sink.reports().is_empty());
}

#[test]
fn test_fill_respects_padded_rows() {
    let (script, _) = image_script();
    let extent = Extent::d2(3, 4);
    let out = Allocation::with_row_alignment(Element::primitive(DataType::Int32), extent, 64).unwrap();

    script.invoke_for_each(FILL_KERNEL, None, Some(&*out), &[], None);

    assert_eq!(out.read_cells::<i32>().unwrap(), expected_fill(extent));
}

#[test]
fn test_fill_sub_region_only() {
    let (script, _) = image_script();
    let out = ints(Extent::d2(4, 3));
    out.write_cells(&[-1; 12]).unwrap();

    script.invoke_for_each(FILL_KERNEL, None, Some(&*out), &[], Some(&ScriptCall::default().x(1, 3).y(1, 2)));

    let cells = out.read_cells::<i32>().unwrap();
    let mut expected = vec![-1; 12];
    expected[4 + 1] = 1001;
    expected[4 + 2] = 1002;
    assert_eq!(cells, expected);
    assert_eq!(counter(&script), 1);
}

#[test]
fn test_empty_launch_runs_nothing() {
    let (script, sink) = image_script();
    let out = ints(Extent::d1(8));

    script.invoke_for_each(FILL_KERNEL, None, Some(&*out), &[], Some(&ScriptCall::default().x(4, 4)));

    assert_eq!(counter(&script), 0);
    assert!(sink.reports().is_empty());
    assert_eq!(out.read_cells::<i32>().unwrap(), vec![0; 8]);
}

#[test]
fn test_scale_reads_input_and_global() {
    let (mut script, _) = image_script();
    set_gain(&mut script, 3.0);
    let input = floats(Extent::d1(6));
    let output = floats(Extent::d1(6));
    input.write_cells(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

    script.invoke_for_each(SCALE_KERNEL, Some(&*input), Some(&*output), &[], None);

    assert_eq!(output.read_cells::<f32>().unwrap(), [3.0, 6.0, 9.0, 12.0, 15.0, 18.0]);
}

#[test]
fn test_input_extent_takes_precedence() {
    let (mut script, _) = image_script();
    set_gain(&mut script, 1.0);
    let input = floats(Extent::d1(2));
    let output = floats(Extent::d1(4));
    input.write_cells(&[5.0f32, 6.0]).unwrap();

    script.invoke_for_each(SCALE_KERNEL, Some(&*input), Some(&*output), &[], None);

    assert_eq!(output.read_cells::<f32>().unwrap(), [5.0, 6.0, 0.0, 0.0]);
}

#[test]
fn test_rejects_missing_allocations() {
    let (script, sink) = image_script();

    script.invoke_for_each(FILL_KERNEL, None, None, &[], None);

    let reports = sink.take();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, ErrorKind::BadScript);
    assert_eq!(counter(&script), 0);
}

#[test_case(true ; "unbacked input")]
#[test_case(false ; "unbacked output")]
fn test_rejects_unbacked_allocations(unbacked_input: bool) {
    let (script, sink) = image_script();
    let backed = floats(Extent::d1(4));
    let deferred = Allocation::deferred(Element::primitive(DataType::Float32), Extent::d1(4));
    let (input, output) = if unbacked_input { (&*deferred, &*backed) } else { (&*backed, &*deferred) };

    script.invoke_for_each(SCALE_KERNEL, Some(input), Some(output), &[], None);

    assert_eq!(sink.take()[0].0, ErrorKind::BadScript);
}

#[test]
fn test_deferred_allocation_launches_once_backed() {
    let (script, sink) = image_script();
    let out = Allocation::deferred(Element::primitive(DataType::Int32), Extent::d1(3));
    out.ensure_backed().unwrap();

    script.invoke_for_each(FILL_KERNEL, None, Some(&*out), &[], None);

    assert!(sink.reports().is_empty());
    assert_eq!(out.read_cells::<i32>().unwrap(), [0, 1, 2]);
}

#[test]
fn test_descriptor_contents() {
    let (script, _) = image_script();
    let input = floats(Extent::d2(4, 2));
    let output = floats(Extent::d2(4, 2));
    let usr = [1u8, 2, 3];

    let desc = script.prepare_launch(SCALE_KERNEL, Some(&*input), Some(&*output), &usr, None).unwrap();

    assert_eq!(desc.dims, [4, 2, 0]);
    assert_eq!(desc.slice_size, 1);
    assert_eq!(desc.slice_count(), 2);
    assert_eq!(desc.signature, SignatureFlag::In | SignatureFlag::Out);
    assert_eq!(desc.slot, SCALE_KERNEL as u32);
    assert!(desc.threadable);

    let params = desc.row_params(1);
    assert_eq!((params.x, params.y, params.z), (0, 1, 0));
    assert_eq!(params.ptr_in, input.raw_ptr().cast_const());
    assert_eq!(params.input, input.raw_ptr().wrapping_add(input.row_stride()).cast_const());
    assert_eq!(params.output, output.raw_ptr().wrapping_add(output.row_stride()));
    assert_eq!(params.e_stride_in, 4);
    assert_eq!(params.y_stride_out, 16);
    assert_eq!(params.usr_len, 3);
    assert_eq!(params.usr, usr.as_ptr().cast::<std::ffi::c_void>());
}

#[test]
fn test_binding_rejects_strides_beyond_u32() {
    let packed = Allocation::deferred(Element::primitive(DataType::Float32), Extent::new(16, 2, 0));
    let binding = BufferBinding::of(&packed).unwrap();
    assert_eq!((binding.element_stride, binding.row_stride), (4, 64));

    // 2^31 floats per row is an 8 GiB stride; nothing is allocated while deferred.
    let wide = Allocation::deferred(Element::primitive(DataType::Float32), Extent::new(1 << 31, 0, 0));
    assert!(BufferBinding::of(&wide).is_none());
}

#[test]
fn test_output_only_binding_has_null_input() {
    let (script, _) = image_script();
    let out = ints(Extent::d1(4));
    let desc = script.prepare_launch(FILL_KERNEL, None, Some(&*out), &[], None).unwrap();
    let params = desc.row_params(0);

    assert!(params.input.is_null());
    assert!(params.ptr_in.is_null());
    assert_eq!(params.e_stride_in, 0);
    assert!(params.usr.is_null());
}

#[test]
#[should_panic(expected = "no entry point")]
fn test_kernel_without_entry_point_panics() {
    let (script, _) = image_script();
    let out = ints(Extent::d1(4));
    script.invoke_for_each(ROOT_KERNEL, None, Some(&*out), &[], None);
}

#[test]
#[should_panic]
fn test_kernel_slot_out_of_range_panics() {
    let (script, _) = image_script();
    let out = ints(Extent::d1(4));
    script.invoke_for_each(3, None, Some(&*out), &[], None);
}

#[test]
fn test_parallel_launch_matches_serial() {
    let extent = Extent::new(33, 17, 3);
    let (driver, _) = driver_with(Arc::new(RayonDispatcher));
    let script = unsafe { driver.create_script_from_image("parallel", image()) }.unwrap();
    let out = ints(extent);

    script.invoke_for_each(FILL_KERNEL, None, Some(&*out), &[], None);

    assert_eq!(out.read_cells::<i32>().unwrap(), expected_fill(extent));
    assert_eq!(counter(&script), 17 * 3);
}

#[test]
fn test_threadable_flag() {
    let (driver, _) = driver_with(Arc::new(SerialDispatcher));
    let mut script = unsafe { driver.create_script_from_image("threads", image()) }.unwrap();
    let out = ints(Extent::d2(2, 2));

    assert!(script.is_threadable());
    script.set_threadable(false);
    let desc = script.prepare_launch(FILL_KERNEL, None, Some(&*out), &[], None).unwrap();
    assert!(!desc.threadable);
}

#[test]
fn test_pragma_vetoes_threading() {
    let meta = "exportVarCount: 0\nexportFuncCount: 0\nexportForEachCount: 0\nobjectSlotCount: 0\n\
                pragmaCount: 1\nthreadable - false\n";
    let (driver, _) = driver_with(Arc::new(RayonDispatcher));
    let mut script = unsafe { driver.create_script_from_image("veto", crate::loader::ModuleImage::new(meta)) }.unwrap();

    assert!(!script.is_threadable());
    script.set_threadable(true);
    assert!(!script.is_threadable());
}

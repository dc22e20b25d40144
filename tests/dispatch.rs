use proptest::prelude::*;
use rs_harness::config::GpuConfig;
use rs_harness::gpu::GpuDevice;
use rs_harness::suite::single_source_script::{
    single_source_script, validate_expected, DIM_X, DIM_Y,
};
use rs_harness::{
    ComputeContext, HarnessConfig, HarnessError, Kernel, LaunchOptions, LifecycleState,
    MessageStatus, Script, Value,
};

fn quick_config() -> HarnessConfig {
    HarnessConfig {
        message_timeout_ms: 200,
        finish_timeout_ms: 20_000,
        worker_threads: 2,
        ..HarnessConfig::default()
    }
}

fn arithmetic() -> Script<i32> {
    Script::builder("arithmetic")
        .kernel("double", Kernel::map(|a: i32, _, _| a * 2))
        .kernel("add", Kernel::zip(|a: i32, b: i32, _, _| a + b))
        .kernel("index", Kernel::update(|_: i32, x: u32, y: u32| (y * 100 + x) as i32))
        .kernel("explode", Kernel::map(|_: i32, _, _| panic!("kernel blew up")))
        .kernel(
            "slow",
            Kernel::map(|a: i32, _, _| {
                std::thread::sleep(std::time::Duration::from_millis(100));
                a
            }),
        )
        .invokable("fail", |_, _| {
            Err(HarnessError::InvalidArgument("refusing to run".into()))
        })
        .invokable("report", |env, args| {
            env.send_to_client(args[0].as_i32()?);
            Ok(())
        })
        .invokable("report_twice", |env, args| {
            env.send_to_client(args[0].as_i32()?);
            env.send_to_client(args[0].as_i32()?);
            Ok(())
        })
        .build()
}

#[test]
fn single_source_scenario_reports_success_once() {
    let mut rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(single_source_script()).unwrap();
    rs.set_global(&script, "dimX", Value::Int(DIM_X as i32)).unwrap();
    rs.set_global(&script, "dimY", Value::Int(DIM_Y as i32)).unwrap();

    let a = rs.create_buffer::<i32>(DIM_X, DIM_Y).unwrap();
    let b = rs.create_buffer::<i32>(DIM_X, DIM_Y).unwrap();
    assert_eq!(a.shape(), (1024, 768));

    rs.invoke(&script, "entrypoint", &[Value::from(&a), Value::from(&b)]).unwrap();
    rs.for_each(&script, "oldFoo", &b, &b).unwrap();
    rs.for_each(&script, "oldGoo", &b, &b).unwrap();
    rs.invoke(&script, "validate", &[Value::from(&b)]).unwrap();

    rs.finish().unwrap();
    assert_eq!(rs.pending(), 0);
    let message = rs.wait_for_message().unwrap();
    assert_eq!(message.status(), MessageStatus::Passed);

    // spot-check the host view against the script's own expectation
    assert_eq!(b.get(3, 2).unwrap(), validate_expected(3 + 2 * DIM_X as i32, 2, DIM_Y));
    assert_eq!(
        b.get(DIM_X - 1, DIM_Y - 1).unwrap(),
        validate_expected((DIM_X * DIM_Y - 1) as i32, DIM_Y - 1, DIM_Y)
    );

    assert!(matches!(
        rs.wait_for_message(),
        Err(HarnessError::Timeout { .. })
    ));
    rs.destroy().unwrap();
}

#[test]
fn mismatched_shapes_fail_before_anything_runs() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let a = rs.create_buffer::<i32>(1024, 768).unwrap();
    let c = rs.create_buffer::<i32>(512, 512).unwrap();

    let err = rs.for_each(&script, "double", &a, &c).unwrap_err();
    assert!(matches!(err, HarnessError::ShapeMismatch { .. }));
    assert_eq!(rs.pending(), 0);

    rs.finish().unwrap();
    assert!(c.to_vec().unwrap().iter().all(|&v| v == 0));
}

#[test]
fn zip_kernel_checks_every_input() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let a = rs.create_buffer::<i32>(8, 8).unwrap();
    let b = rs.create_buffer::<i32>(8, 4).unwrap();
    let out = rs.create_buffer::<i32>(8, 8).unwrap();

    let err = rs
        .for_each_with(&script, "add", &[&a, &b], &out, None)
        .unwrap_err();
    assert!(matches!(err, HarnessError::ShapeMismatch { .. }));

    let err = rs.for_each_with(&script, "add", &[&a], &out, None).unwrap_err();
    assert!(matches!(err, HarnessError::InvalidArgument(_)));
}

#[test]
fn work_runs_in_submission_order() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(4, 3).unwrap();
    buf.copy_from(&[1; 12]).unwrap();

    // 1 -> 2 -> 4 -> 4 + 4 -> 16
    rs.for_each(&script, "double", &buf, &buf).unwrap();
    rs.for_each(&script, "double", &buf, &buf).unwrap();
    rs.for_each_with(&script, "add", &[&buf, &buf], &buf, None).unwrap();
    rs.for_each(&script, "double", &buf, &buf).unwrap();
    rs.finish().unwrap();

    assert_eq!(buf.to_vec().unwrap(), vec![16; 12]);
}

#[test]
fn launch_window_limits_the_update() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(5, 4).unwrap();

    let window = LaunchOptions {
        x_start: 1,
        x_end: 3,
        y_start: 2,
        y_end: 0,
    };
    rs.for_each_with(&script, "index", &[], &buf, Some(window)).unwrap();
    rs.finish().unwrap();

    assert_eq!(buf.get(1, 2).unwrap(), 201);
    assert_eq!(buf.get(2, 3).unwrap(), 302);
    assert_eq!(buf.get(0, 2).unwrap(), 0);
    assert_eq!(buf.get(3, 3).unwrap(), 0);
    assert_eq!(buf.get(1, 1).unwrap(), 0);

    let too_wide = LaunchOptions::columns(0, 6);
    assert!(matches!(
        rs.for_each_with(&script, "index", &[], &buf, Some(too_wide)),
        Err(HarnessError::ShapeMismatch { .. })
    ));
}

#[test]
fn unknown_entry_points_are_rejected_synchronously() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_sized::<i32>(16).unwrap();
    assert_eq!(buf.shape(), (16, 1));

    assert!(matches!(
        rs.invoke(&script, "missing", &[]),
        Err(HarnessError::UnknownEntryPoint { .. })
    ));
    assert!(matches!(
        rs.for_each(&script, "missing", &buf, &buf),
        Err(HarnessError::UnknownEntryPoint { .. })
    ));
    assert_eq!(rs.pending(), 0);
}

#[test]
fn failing_invokable_poisons_the_context() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(4, 4).unwrap();
    buf.copy_from(&[3; 16]).unwrap();

    rs.invoke(&script, "fail", &[]).unwrap();
    // queued behind the failure, or rejected if it has already been recorded
    for queued in [
        rs.for_each(&script, "double", &buf, &buf),
        rs.invoke(&script, "report", &[Value::Int(100)]),
    ] {
        assert!(matches!(queued, Ok(()) | Err(HarnessError::InvalidArgument(_))));
    }

    let err = rs.finish().unwrap_err();
    assert!(matches!(err, HarnessError::InvalidArgument(_)));
    assert_eq!(rs.wait_for_message().unwrap_err(), err);

    // later submissions are skipped, not executed
    let drained = std::time::Instant::now();
    while rs.pending() > 0 && drained.elapsed().as_secs() < 5 {
        std::thread::yield_now();
    }
    assert_eq!(buf.to_vec().unwrap(), vec![3; 16]);
}

#[test]
fn submissions_after_a_failure_return_that_failure() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(4, 4).unwrap();

    rs.invoke(&script, "fail", &[]).unwrap();
    let err = rs.finish().unwrap_err();

    assert_eq!(rs.invoke(&script, "report", &[Value::Int(100)]).unwrap_err(), err);
    assert_eq!(rs.for_each(&script, "double", &buf, &buf).unwrap_err(), err);
    assert_eq!(rs.set_global(&script, "k", Value::Int(1)).unwrap_err(), err);
    assert_eq!(rs.wait_for_message().unwrap_err(), err);
}

#[test]
fn finish_times_out_on_slow_work() {
    let config = HarnessConfig {
        finish_timeout_ms: 5,
        ..quick_config()
    };
    let rs = ComputeContext::create(config).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(2, 2).unwrap();

    rs.for_each(&script, "slow", &buf, &buf).unwrap();
    assert!(matches!(
        rs.finish(),
        Err(HarnessError::Timeout { waited_ms: 5, .. })
    ));
}

#[test]
fn second_message_poisons_the_run() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();

    rs.invoke(&script, "report_twice", &[Value::Int(100)]).unwrap();
    assert!(matches!(
        rs.finish(),
        Err(HarnessError::InvalidArgument(_))
    ));
}

#[test]
fn panicking_kernel_becomes_a_kernel_failure() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(2, 2).unwrap();

    rs.for_each(&script, "explode", &buf, &buf).unwrap();
    assert!(matches!(
        rs.finish(),
        Err(HarnessError::KernelFailed { .. })
    ));
}

#[test]
fn messages_other_than_pass_are_delivered_as_is() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    rs.invoke(&script, "report", &[Value::Int(101)]).unwrap();
    assert_eq!(rs.wait_for_message().unwrap().status(), MessageStatus::Failed);
}

#[test]
fn destroyed_context_rejects_everything() {
    let mut rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(4, 4).unwrap();
    rs.destroy().unwrap();
    assert_eq!(rs.state(), LifecycleState::Destroyed);

    let lifecycle = |r: Result<(), HarnessError>| matches!(r, Err(HarnessError::Lifecycle(_)));
    assert!(lifecycle(rs.create_buffer::<i32>(4, 4).map(|_| ())));
    assert!(lifecycle(rs.load_script(arithmetic()).map(|_| ())));
    assert!(lifecycle(rs.invoke(&script, "report", &[Value::Int(1)])));
    assert!(lifecycle(rs.for_each(&script, "double", &buf, &buf)));
    assert!(lifecycle(rs.set_global(&script, "dimX", Value::Int(1))));
    assert!(lifecycle(rs.finish()));
    assert!(lifecycle(rs.wait_for_message().map(|_| ())));
    assert!(lifecycle(buf.get(0, 0).map(|_| ())));
    assert!(lifecycle(buf.set(0, 0, 1)));
    assert!(lifecycle(buf.to_vec().map(|_| ())));
    assert!(lifecycle(script.global("dimX").map(|_| ())));
    assert!(lifecycle(rs.destroy()));
}

#[test]
fn destroy_drains_queued_work() {
    let mut rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs.load_script(arithmetic()).unwrap();
    let buf = rs.create_buffer::<i32>(64, 64).unwrap();
    rs.for_each_with(&script, "index", &[], &buf, None).unwrap();
    for _ in 0..8 {
        rs.for_each(&script, "double", &buf, &buf).unwrap();
    }
    rs.destroy().unwrap();
    assert_eq!(rs.pending(), 0);
}

#[test]
fn allocation_budget_is_enforced_and_released() {
    let config = HarnessConfig {
        max_allocation_bytes: 4 * 1024,
        ..quick_config()
    };
    let rs = ComputeContext::create(config).unwrap();

    let first = rs.create_buffer::<i32>(32, 16).unwrap();
    assert_eq!(rs.allocated_bytes(), 2048);
    let second = rs.create_buffer::<i32>(32, 16).unwrap();
    assert!(matches!(
        rs.create_buffer::<u8>(1, 1),
        Err(HarnessError::Allocation(_))
    ));

    drop(first);
    let clone = second.clone();
    drop(second);
    assert_eq!(rs.allocated_bytes(), 2048);
    drop(clone);
    assert_eq!(rs.allocated_bytes(), 0);
}

#[test]
fn invalid_buffer_requests_fail() {
    let rs = ComputeContext::create(quick_config()).unwrap();
    assert!(matches!(
        rs.create_buffer::<i32>(0, 768),
        Err(HarnessError::Allocation(_))
    ));
    assert!(matches!(
        rs.create_buffer::<f64>(u32::MAX, u32::MAX),
        Err(HarnessError::Allocation(_))
    ));

    let buf = rs.create_buffer::<i32>(4, 2).unwrap();
    assert!(matches!(buf.copy_from(&[1, 2, 3]), Err(HarnessError::Allocation(_))));
    assert!(matches!(buf.get(4, 0), Err(HarnessError::Allocation(_))));
}

#[test]
fn allocations_cannot_cross_contexts() {
    let first = ComputeContext::create(quick_config()).unwrap();
    let second = ComputeContext::create(quick_config()).unwrap();
    let script = first.load_script(arithmetic()).unwrap();
    let foreign = second.create_buffer::<i32>(4, 4).unwrap();

    assert!(matches!(
        first.for_each(&script, "double", &foreign, &foreign),
        Err(HarnessError::InvalidArgument(_))
    ));
    assert!(matches!(
        second.invoke(&script, "report", &[Value::Int(1)]),
        Err(HarnessError::InvalidArgument(_))
    ));
}

#[test]
fn wgsl_kernel_runs_on_gpu_when_available() {
    if GpuDevice::new(&GpuConfig::default()).is_err() {
        eprintln!("no GPU adapter available, skipping");
        return;
    }

    let rs = ComputeContext::create(quick_config()).unwrap();
    let script = rs
        .load_script(
            Script::builder("gpu")
                .kernel(
                    "triple",
                    Kernel::wgsl(
                        "fn triple(v: i32, x: u32, y: u32) -> i32 { return v * 3 + i32(x); }",
                        "triple",
                    ),
                )
                .build(),
        )
        .unwrap();

    let input = rs.create_buffer::<i32>(40, 4).unwrap();
    let output = rs.create_buffer::<i32>(40, 4).unwrap();
    input.copy_from(&vec![2; 160]).unwrap();
    output.copy_from(&vec![-1; 160]).unwrap();

    rs.for_each_with(&script, "triple", &[&input], &output, Some(LaunchOptions::rows(1, 3)))
        .unwrap();
    rs.finish().unwrap();

    assert_eq!(output.get(0, 0).unwrap(), -1);
    assert_eq!(output.get(5, 1).unwrap(), 11);
    assert_eq!(output.get(39, 2).unwrap(), 45);
    assert_eq!(output.get(5, 3).unwrap(), -1);
}

#[test]
fn disabled_gpu_fails_wgsl_launches() {
    let mut config = quick_config();
    config.gpu.enabled = false;
    let rs = ComputeContext::create(config).unwrap();
    let script = rs
        .load_script(
            Script::builder("gpu")
                .kernel("id", Kernel::wgsl("fn id(v: f32, x: u32, y: u32) -> f32 { return v; }", "id"))
                .build(),
        )
        .unwrap();
    let buf = rs.create_buffer::<f32>(4, 4).unwrap();
    rs.for_each(&script, "id", &buf, &buf).unwrap();
    assert!(matches!(rs.finish(), Err(HarnessError::Gpu(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_buffer_shape_matches_request(dim_x in 1u32..300, dim_y in 1u32..300) {
        let rs = ComputeContext::create(quick_config()).unwrap();
        let buf = rs.create_buffer::<i32>(dim_x, dim_y).unwrap();
        prop_assert_eq!(buf.shape(), (dim_x, dim_y));
        prop_assert_eq!(buf.len(), (dim_x * dim_y) as usize);
        prop_assert!(buf.to_vec().unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn prop_mismatched_shapes_always_rejected(
        a in (1u32..64, 1u32..64),
        b in (1u32..64, 1u32..64),
    ) {
        prop_assume!(a != b);
        let rs = ComputeContext::create(quick_config()).unwrap();
        let script = rs.load_script(arithmetic()).unwrap();
        let input = rs.create_buffer::<i32>(a.0, a.1).unwrap();
        let output = rs.create_buffer::<i32>(b.0, b.1).unwrap();
        let is_mismatch = matches!(
            rs.for_each(&script, "double", &input, &output),
            Err(HarnessError::ShapeMismatch { .. })
        );
        prop_assert!(is_mismatch);
        prop_assert_eq!(rs.pending(), 0);
    }
}

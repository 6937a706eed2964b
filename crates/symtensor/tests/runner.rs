use std::sync::Arc;

use anyhow::Result;
use symtensor::backend::spec::{GraphBackend, Output, StatusCode};
use symtensor::ops::Lowering;
use symtensor::{placeholder, Error, HostTensor, Session, Shape, Status};
use symtensor_backend_ref_cpu::{CpuBackend, CpuTensor};

fn feed_tensor(backend: &Arc<CpuBackend>, values: &[f32]) -> Result<CpuTensor> {
    let host = HostTensor::from_values(vec![values.len()], values)?;
    Ok(backend.materialize(&host.to_literal())?)
}

fn read_tensor(backend: &Arc<CpuBackend>, tensor: &CpuTensor) -> Result<Vec<f32>> {
    HostTensor::from_literal(&backend.to_literal(tensor)?)?.values()
}

/// Lowers `x + x` and returns the session plus the feed and fetch ports.
fn doubled_session(backend: &Arc<CpuBackend>) -> Result<(Session<CpuBackend>, Output, Output)> {
    let x = placeholder::<f32>(Shape::known(&[2]));
    let y = &x + &x;
    let mut lowering = Lowering::new();
    let input = lowering.lower(&x)?;
    let output = lowering.lower(&y)?;
    let session = Session::new(Arc::clone(backend), lowering.into_graph());
    Ok((session, Output::new(input), Output::new(output)))
}

#[test]
fn runner_feeds_and_fetches() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, input, output) = doubled_session(&backend)?;
    let mut runner = session
        .runner()
        .add_input(input, feed_tensor(&backend, &[1.0, 2.0])?)
        .fetch(output);
    let results = runner.run()?;
    assert_eq!(results.len(), 1);
    assert_eq!(read_tensor(&backend, &results[0])?, vec![2.0, 4.0]);
    Ok(())
}

#[test]
fn runner_resolves_named_ports() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, _, output) = doubled_session(&backend)?;
    let mut runner = session
        .runner()
        .add_input_named("Placeholder", feed_tensor(&backend, &[3.0, 4.0])?)?
        .fetch_named("Add:0")?;
    let results = runner.run()?;
    assert_eq!(read_tensor(&backend, &results[0])?, vec![6.0, 8.0]);
    // Ports resolved by name match the lowered ids.
    assert_eq!(session.graph().output_by_name("Add")?, output);
    Ok(())
}

#[test]
fn malformed_fetch_suffix_is_a_parse_error() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, _, _) = doubled_session(&backend)?;
    let err = session.graph().output_by_name("Add:first").unwrap_err();
    assert!(matches!(err, Error::Parse { .. }));
    Ok(())
}

#[test]
fn run_single_fetches_exactly_one_value() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, input, output) = doubled_session(&backend)?;
    let mut runner = session
        .runner()
        .add_input(input, feed_tensor(&backend, &[5.0, 6.0])?)
        .fetch(output);
    // run_single clears the accumulated fetches and fetches only its port.
    let single = runner.run_single(output)?;
    assert_eq!(read_tensor(&backend, &single)?, vec![10.0, 12.0]);
    Ok(())
}

#[test]
fn status_sink_captures_backend_failures() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, _, output) = doubled_session(&backend)?;
    // No feed for the placeholder: the run fails, the status records it.
    let mut runner = session.runner().fetch(output);
    let mut status = Status::ok();
    let results = runner.run_with_status(&mut status);
    assert!(results.is_none());
    assert!(!status.is_ok());
    assert_eq!(status.code(), StatusCode::Internal);
    assert!(status.message().contains("was not fed"));
    Ok(())
}

#[test]
fn fetching_a_secondary_output_is_rejected() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, input, output) = doubled_session(&backend)?;
    let bad = Output {
        node: output.node,
        index: 1,
    };
    let mut runner = session
        .runner()
        .add_input(input, feed_tensor(&backend, &[1.0, 1.0])?)
        .fetch(bad);
    assert!(runner.run().is_err());
    Ok(())
}

#[test]
fn closed_sessions_reject_every_operation() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, _, output) = doubled_session(&backend)?;
    session.close();
    let err = session.run(&[], &[output], &[]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::DisposedHandle { .. })
    ));
    assert!(session.devices().is_err());
    Ok(())
}

#[test]
fn backend_reports_a_cpu_device() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, _, _) = doubled_session(&backend)?;
    let devices = session.devices()?;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_type, "CPU");
    assert_eq!(devices[0].name, "/device:CPU:0");
    Ok(())
}

#[test]
fn partial_run_feeds_and_fetches_stepwise() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let x = placeholder::<f32>(Shape::known(&[2]));
    let doubled = &x + &x;
    let squared = doubled.try_mul(&doubled)?;
    let mut lowering = Lowering::new();
    let input = Output::new(lowering.lower(&x)?);
    let mid = Output::new(lowering.lower(&doubled)?);
    let out = Output::new(lowering.lower(&squared)?);
    let session = Session::new(Arc::clone(&backend), lowering.into_graph());

    let mut token = session.partial_run_setup(&[input], &[mid, out], &[])?;

    // Step one: feed the placeholder, fetch the intermediate.
    let step1 = session.partial_run(
        &mut token,
        &[(input, feed_tensor(&backend, &[1.0, 2.0])?)],
        &[mid],
    )?;
    assert_eq!(read_tensor(&backend, &step1[0])?, vec![2.0, 4.0]);

    // Step two: no new feeds; the cached intermediate drives the rest.
    let step2 = session.partial_run(&mut token, &[], &[out])?;
    assert_eq!(read_tensor(&backend, &step2[0])?, vec![4.0, 16.0]);

    token.close();
    Ok(())
}

#[test]
fn partial_run_rejects_undeclared_ports() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let (session, input, output) = doubled_session(&backend)?;
    let mut token = session.partial_run_setup(&[input], &[output], &[])?;
    let err = session
        .partial_run(&mut token, &[], &[input])
        .unwrap_err();
    assert!(err.to_string().contains("not declared"));
    Ok(())
}

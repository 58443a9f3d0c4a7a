use super::{colorize_status, json_pretty, CommandError, Context, EXIT_CRASHED, EXIT_SUCCESS};
use hostbridge_core::{
    bridges_for_session, load_input_profile, shutdown_requested, ExecutionHost, HostConfig,
    LaunchRequest, RuntimeState,
};
use hostbridge_runtime::{select_backend, HeadlessWindow, NullDevice};
use hostbridge_schema::Version;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const HEADLESS_WIDTH: u32 = 1280;
const HEADLESS_HEIGHT: u32 = 720;

pub fn run(
    ctx: &Context,
    bundle: &str,
    version: Option<Version>,
    backend: &str,
    args: &[String],
) -> Result<u8, CommandError> {
    let backend = select_backend(backend).map_err(hostbridge_core::CoreError::from)?;
    let profile = load_input_profile(&ctx.session)?;
    let window = HeadlessWindow::new(HEADLESS_WIDTH, HEADLESS_HEIGHT);
    let bridges = bridges_for_session(
        &ctx.session,
        profile,
        Some(Box::new(window)),
        None,
        Arc::new(NullDevice),
    )?;

    let host = ExecutionHost::new(
        Arc::new(ctx.manager()?),
        backend,
        HostConfig::from_session(&ctx.session),
    )
    .with_crash_dir(ctx.store().join("crashes"));

    let mut request = LaunchRequest::new(bundle, version);
    request.extra_args = args.to_vec();
    let handle = host.start(&request, bridges)?;
    if !ctx.json {
        println!(
            "{}@{} {}",
            handle.bundle_id(),
            handle.version(),
            colorize_status(&handle.state().to_string())
        );
    }

    let state = loop {
        if let Some(state) = handle.wait_terminal(Duration::from_millis(200)) {
            break state;
        }
        if shutdown_requested() {
            info!("interrupted, stopping {bundle}");
            break handle.terminate(ctx.session.termination_grace());
        }
    };

    let report = handle.crash_report();
    if ctx.json {
        let payload = serde_json::json!({
            "bundle": handle.bundle_id(),
            "version": handle.version(),
            "state": state,
            "termination": handle.termination(),
            "crash_report": report,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let how = handle
            .termination()
            .map(|t| format!(" ({t})"))
            .unwrap_or_default();
        println!("{} {}{how}", bundle, colorize_status(&state.to_string()));
        if let Some(ref report) = report {
            println!("last {} log line(s):", report.log_tail.len());
            for line in &report.log_tail {
                println!("  {line}");
            }
        }
    }

    Ok(if state == RuntimeState::Crashed {
        EXIT_CRASHED
    } else {
        EXIT_SUCCESS
    })
}

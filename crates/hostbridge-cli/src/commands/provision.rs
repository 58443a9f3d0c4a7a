use super::{colorize_status, json_pretty, spin_fail, spin_ok, spinner, transfer_bar};
use super::{CommandError, Context, EXIT_SUCCESS};
use hostbridge_core::{shutdown_requested, ProvisionOutcome, ProvisionPhase};
use hostbridge_fetch::CancelToken;
use hostbridge_schema::parse_manifest_file;
use indicatif::ProgressBar;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn run(ctx: &Context, manifest: &Path, bundle: Option<&str>) -> Result<u8, CommandError> {
    let manifest = parse_manifest_file(manifest).map_err(CommandError::input)?;

    let pb = (!ctx.json).then(|| spinner("provisioning..."));
    let mut mgr = ctx.manager()?;
    if let Some(ref pb) = pb {
        mgr = mgr.with_progress(progress_reporter(pb.clone()));
    }

    let cancel = CancelToken::new();
    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = cancel.clone();
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                if shutdown_requested() {
                    cancel.cancel();
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        })
    };

    let result = match bundle {
        Some(id) => manifest
            .entry(id)
            .map_err(CommandError::input)
            .and_then(|entry| Ok(vec![mgr.provision(&entry, &cancel)?])),
        None => mgr
            .provision_manifest(&manifest, &cancel)
            .map_err(CommandError::from),
    };
    done.store(true, Ordering::Relaxed);
    let _ = watcher.join();

    let outcomes = match result {
        Ok(outcomes) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, &format!("{} bundle(s) ready", outcomes.len()));
            }
            outcomes
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "provisioning failed");
            }
            return Err(e);
        }
    };

    if ctx.json {
        let payload: Vec<_> = outcomes.iter().map(outcome_json).collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for o in &outcomes {
            let how = if o.extracted {
                format!("{} bytes downloaded", o.downloaded_bytes)
            } else {
                "already present".to_owned()
            };
            println!(
                "{}@{} {} ({how})",
                o.bundle.id,
                o.bundle.version,
                colorize_status(&o.bundle.status.to_string())
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn outcome_json(o: &ProvisionOutcome) -> serde_json::Value {
    serde_json::json!({
        "bundle": o.bundle.id,
        "version": o.bundle.version,
        "status": o.bundle.status,
        "install_path": o.bundle.install_path,
        "downloaded_bytes": o.downloaded_bytes,
        "resumed": o.resumed,
        "extracted": o.extracted,
    })
}

fn progress_reporter(pb: ProgressBar) -> hostbridge_core::ProgressFn {
    Arc::new(move |id: &str, phase: ProvisionPhase| match phase {
        ProvisionPhase::Downloading { received, total } => {
            if let Some(total) = total {
                if pb.length() != Some(total) {
                    transfer_bar(&pb, total);
                }
            }
            pb.set_message(format!("downloading {id}"));
            pb.set_position(received);
        }
        ProvisionPhase::Extracting => pb.set_message(format!("extracting {id}")),
        ProvisionPhase::Verifying => pb.set_message(format!("verifying {id}")),
        ProvisionPhase::Installed => pb.println(format!("installed {id}")),
    })
}

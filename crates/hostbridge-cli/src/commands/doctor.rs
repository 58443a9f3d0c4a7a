use super::{json_pretty, CommandError, Context, EXIT_FAILURE, EXIT_INCOMPATIBLE, EXIT_SUCCESS};
use hostbridge_runtime::{check_bundle, format_problems, host_abi};
use hostbridge_store::{verify_bundle_tree, RecordStore, StoreLayout, WriteAheadLog};
use std::path::Path;

/// Read-only: never recovers the WAL or initializes the store.
pub fn run(ctx: &Context, bundle: Option<&str>) -> Result<u8, CommandError> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;
    let mut incompatible = false;

    let store_path = ctx.store();
    let layout = StoreLayout::new(store_path);
    if layout.store_dir().exists() {
        checks.push(Check::pass("store_exists", "Store directory exists"));
        check_store(&layout, &mut checks, &mut all_pass);
        check_disk_space(store_path, &mut checks);
    } else {
        checks.push(Check::info(
            "store_exists",
            "Store not initialized (will be created on first provision)",
        ));
    }

    if let Some(id) = bundle {
        if !check_bundle_runs(&layout, id, &mut checks) {
            all_pass = false;
            incompatible = true;
        }
    }

    print_results(&checks, all_pass, ctx.json)?;
    Ok(if all_pass {
        EXIT_SUCCESS
    } else if incompatible {
        EXIT_INCOMPATIBLE
    } else {
        EXIT_FAILURE
    })
}

fn check_store(layout: &StoreLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("store_version", "Store format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_version",
                &format!("Store version check failed: {e}"),
            ));
        }
    }

    let records = RecordStore::new(layout.clone());
    match records.list_with_errors() {
        Ok(results) => {
            let unreadable = results.iter().filter(|r| r.is_err()).count();
            if unreadable == 0 {
                checks.push(Check::pass(
                    "records",
                    &format!("{} bundle record(s) readable", results.len()),
                ));
            } else {
                *all_pass = false;
                checks.push(Check::fail(
                    "records",
                    &format!("{unreadable} of {} bundle records unreadable", results.len()),
                ));
            }
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("records", &format!("Cannot list records: {e}")));
        }
    }

    let wal = WriteAheadLog::new(layout);
    match wal.list_incomplete() {
        Ok(entries) if entries.is_empty() => {
            checks.push(Check::pass(
                "wal_clean",
                "WAL is clean (no incomplete entries)",
            ));
        }
        Ok(entries) => {
            checks.push(Check::warn(
                "wal_clean",
                &format!(
                    "WAL has {} incomplete entries (will recover on next start)",
                    entries.len()
                ),
            ));
        }
        Err(e) => checks.push(Check::warn("wal_clean", &format!("Cannot read WAL: {e}"))),
    }

    match hostbridge_core::StoreLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("store_lock", "Store lock is free")),
        Ok(None) => checks.push(Check::warn(
            "store_lock",
            "Store lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_lock",
                &format!("Cannot check store lock: {e}"),
            ));
        }
    }
}

/// Whether the installed version of `id` is intact and loadable on this host.
fn check_bundle_runs(layout: &StoreLayout, id: &str, checks: &mut Vec<Check>) -> bool {
    let name = format!("bundle_{id}");
    let installed = match RecordStore::new(layout.clone()).get(id) {
        Ok(index) => index.and_then(|i| i.installed().cloned()),
        Err(e) => {
            checks.push(Check::fail(&name, &format!("Cannot read record of '{id}': {e}")));
            return false;
        }
    };
    let Some(record) = installed else {
        checks.push(Check::fail(&name, &format!("'{id}' is not installed")));
        return false;
    };
    if let Err(reason) = verify_bundle_tree(&record) {
        checks.push(Check::fail(
            &name,
            &format!("{id}@{} is damaged: {reason}", record.version),
        ));
        return false;
    }
    let Some(ref root) = record.install_path else {
        return false;
    };
    let problems = check_bundle(
        root,
        &record.libraries,
        record.entry_point.as_deref(),
        host_abi(),
    );
    if problems.is_empty() {
        checks.push(Check::pass(
            &name,
            &format!(
                "{id}@{} can run here ({} native libraries checked)",
                record.version,
                record.libraries.len()
            ),
        ));
        true
    } else {
        checks.push(Check::fail(&name, &format_problems(&problems)));
        false
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<(), CommandError> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("hostbridge doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(())
}

struct Check {
    name: String,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &str, status: &'static str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

fn check_disk_space(store_path: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(store_path.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: the path is NUL-terminated and outlives the call; `stat` is only
    // read after the call reports success.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::useless_conversion)]
    let avail_mb = u64::from(stat.f_bavail) * u64::from(stat.f_frsize) / (1024 * 1024);

    // Runtime bundles are hundreds of megabytes once extracted.
    if avail_mb < 512 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 2048 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (a runtime upgrade may not fit)"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available", avail_mb / 1024),
        ));
    }
}

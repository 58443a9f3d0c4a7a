use super::{json_pretty, CommandError, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, bundle: &str) -> Result<u8, CommandError> {
    let report = ctx.manager()?.reset(bundle)?;
    if ctx.json {
        let payload = serde_json::json!({
            "bundle": bundle,
            "versions_removed": report.versions_removed,
            "paths_removed": report.paths_removed,
        });
        println!("{}", json_pretty(&payload)?);
    } else if report.versions_removed.is_empty() && report.paths_removed == 0 {
        println!("{bundle}: nothing to reset");
    } else {
        println!(
            "reset {bundle}: removed {} version(s), {} path(s)",
            report.versions_removed.len(),
            report.paths_removed
        );
    }
    Ok(EXIT_SUCCESS)
}

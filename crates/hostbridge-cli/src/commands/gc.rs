use super::{json_pretty, CommandError, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, dry_run: bool) -> Result<u8, CommandError> {
    let report = ctx.manager()?.gc(dry_run)?;
    if ctx.json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "stale_staging": report.stale_staging,
            "stale_downloads": report.stale_downloads,
            "orphaned_trees": report.orphaned_trees,
            "expired_versions": report.expired_versions,
            "removed": report.removed,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let prefix = if dry_run { "would remove" } else { "removed" };
        let found = report.stale_staging.len()
            + report.stale_downloads.len()
            + report.orphaned_trees.len()
            + report.expired_versions.len();
        let count = if dry_run { found } else { report.removed };
        println!("gc: {prefix} {count} item(s)");
        if dry_run && !report.expired_versions.is_empty() {
            println!("expired versions: {:?}", report.expired_versions);
        }
    }
    Ok(EXIT_SUCCESS)
}

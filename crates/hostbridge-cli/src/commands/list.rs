use super::{colorize_status, json_pretty, CommandError, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context) -> Result<u8, CommandError> {
    let bundles = ctx.manager()?.list()?;
    if ctx.json {
        println!("{}", json_pretty(&bundles)?);
    } else if bundles.is_empty() {
        println!("no bundles recorded");
    } else {
        println!("{:<16} {:<12} {:<12} UPDATED", "BUNDLE", "VERSION", "STATUS");
        for b in &bundles {
            println!(
                "{:<16} {:<12} {:<12} {}",
                b.id.as_str(),
                b.version.to_string(),
                colorize_status(&b.status.to_string()),
                b.updated_at
            );
            if let Some(ref failure) = b.failure {
                println!("  {failure}");
            }
        }
    }
    Ok(EXIT_SUCCESS)
}

use super::{json_pretty, CommandError, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, bundle: &str) -> Result<u8, CommandError> {
    let record = ctx.manager()?.rollback(bundle)?;
    if ctx.json {
        println!("{}", json_pretty(&record)?);
    } else {
        println!("rolled back {} to {}", record.id, record.version);
    }
    Ok(EXIT_SUCCESS)
}

use super::{json_pretty, CommandError, Context, EXIT_STORE_ERROR, EXIT_SUCCESS};

pub fn run(ctx: &Context) -> Result<u8, CommandError> {
    let report = ctx.manager()?.verify()?;

    if ctx.json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "bundle integrity: {}/{} trees passed",
            report.passed, report.checked
        );
        for f in &report.failures {
            match f.version {
                Some(ref v) => println!("  FAIL {}@{v}: {}", f.bundle, f.reason),
                None => println!("  FAIL {}: {}", f.bundle, f.reason),
            }
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}

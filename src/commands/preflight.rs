//! Preflight command - runs preflight checks.

use anyhow::{bail, Result};

use ramforge::config::Config;
use ramforge::preflight::{self, Outcome};

/// Execute the preflight command.
pub fn cmd_preflight(config: &Config, target: Option<&str>, strict: bool) -> Result<()> {
    let env = config.environment(target);
    let report = preflight::run_preflight(config, &env);
    println!("{}", report);

    if !report.is_ready() {
        if strict {
            bail!("{} preflight check(s) failed", report.count(Outcome::Blocked));
        }
        println!("Builds will fail on this host. Use --strict to exit with an error.");
    }
    Ok(())
}
